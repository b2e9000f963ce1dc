use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::{timeout, Instant};

use crate::queue::*;

const INTERVAL: Duration = Duration::from_secs(15);

fn new_queue() -> Arc<WorkQueue<String>> {
    Arc::new(WorkQueue::new(Box::new(FixedIntervalRateLimiter::new(INTERVAL))))
}

async fn must_get(queue: &WorkQueue<String>) -> Result<String> {
    must_get_within(queue, Duration::from_secs(1)).await
}

async fn must_get_within(queue: &WorkQueue<String>, limit: Duration) -> Result<String> {
    timeout(limit, queue.get())
        .await
        .map_err(|_| anyhow!("timeout waiting for an item"))?
        .ok_or_else(|| anyhow!("queue unexpectedly shut down"))
}

#[tokio::test(start_paused = true)]
async fn queue_deduplicates_pending_items() -> Result<()> {
    let queue = new_queue();
    queue.add("ns/a".into()).await;
    queue.add("ns/a".into()).await;
    queue.add("ns/b".into()).await;
    assert_eq!(queue.len().await, 2, "expected duplicate add to be a no-op");

    assert_eq!(must_get(&queue).await?, "ns/a");
    assert_eq!(must_get(&queue).await?, "ns/b");
    assert_eq!(queue.len().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn queue_holds_back_items_in_flight() -> Result<()> {
    let queue = new_queue();
    queue.add("ns/a".into()).await;
    let item = must_get(&queue).await?;

    // Re-added while processing: held back until done.
    queue.add(item.clone()).await;
    assert_eq!(queue.len().await, 0, "an item in flight must not be handed out again");
    let second = timeout(Duration::from_secs(1), queue.get()).await;
    assert!(second.is_err(), "expected no item while the only key is in flight");

    queue.done(&item).await;
    assert_eq!(queue.len().await, 1, "expected item to be re-queued on done");
    assert_eq!(must_get(&queue).await?, "ns/a");
    queue.done(&item).await;
    assert_eq!(queue.len().await, 0, "item must not be re-queued when not re-added");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn get_waits_for_add() -> Result<()> {
    let queue = new_queue();
    let getter = tokio::spawn({
        let queue = queue.clone();
        async move { queue.get().await }
    });
    tokio::task::yield_now().await;
    queue.add("ns/a".into()).await;

    let item = timeout(Duration::from_secs(1), getter).await??;
    assert_eq!(item.as_deref(), Some("ns/a"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_waiting_workers() -> Result<()> {
    let queue = new_queue();
    let getters: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        })
        .collect();
    tokio::task::yield_now().await;

    queue.shutdown().await;
    for getter in getters {
        let item = timeout(Duration::from_secs(1), getter).await??;
        assert!(item.is_none(), "expected None after shutdown, got {:?}", item);
    }

    queue.add("ns/a".into()).await;
    assert_eq!(queue.len().await, 0, "adds after shutdown must be ignored");
    assert!(queue.get().await.is_none());
    assert!(queue.is_shutting_down().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rate_limited_add_waits_for_interval() -> Result<()> {
    let queue = new_queue();
    let start = Instant::now();
    queue.add_rate_limited("ns/a".into()).await;
    assert_eq!(queue.len().await, 0, "rate limited item must not be ready immediately");
    assert_eq!(queue.num_requeues(&"ns/a".to_string()), 1);

    let item = timeout(INTERVAL * 2, queue.get()).await?;
    let elapsed = start.elapsed();
    assert_eq!(item.as_deref(), Some("ns/a"));
    assert!(elapsed >= INTERVAL, "item was ready after {:?}, before the interval", elapsed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn forget_cancels_pending_delay() -> Result<()> {
    let queue = new_queue();
    let key = "ns/a".to_string();
    queue.add_rate_limited(key.clone()).await;
    queue.add_rate_limited(key.clone()).await;
    assert_eq!(queue.num_requeues(&key), 2);

    queue.forget(&key).await;
    assert_eq!(queue.num_requeues(&key), 0, "forget must reset the requeue count");
    let res = timeout(INTERVAL * 4, queue.get()).await;
    assert!(res.is_err(), "expected forgotten item to never be re-added, got {:?}", res);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn earlier_delay_wins() -> Result<()> {
    let queue = new_queue();
    let start = Instant::now();
    queue.add_after("ns/a".into(), Duration::from_secs(30)).await;
    queue.add_after("ns/a".into(), Duration::from_secs(5)).await;
    queue.add_after("ns/a".into(), Duration::from_secs(20)).await;

    let item = must_get_within(&queue, Duration::from_secs(10)).await?;
    assert_eq!(item, "ns/a");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(10), "unexpected delay {:?}", elapsed);
    queue.done(&item).await;

    // The later delays were superseded.
    let res = timeout(Duration::from_secs(60), queue.get()).await;
    assert!(res.is_err(), "expected no further adds, got {:?}", res);
    Ok(())
}

#[test]
fn fixed_interval_limiter_never_backs_off() {
    let limiter = FixedIntervalRateLimiter::new(INTERVAL);
    let key = "ns/a".to_string();
    for attempt in 1..=10 {
        assert_eq!(limiter.when(&key), INTERVAL, "attempt {} was not delayed by the fixed interval", attempt);
        assert_eq!(limiter.num_requeues(&key), attempt);
    }
    limiter.forget(&key);
    assert_eq!(limiter.num_requeues(&key), 0);
}
