//! Label selectors.
//!
//! Selectors arrive in two shapes: the structured `LabelSelector` of a Balancer's spec, and the
//! string form published by a target's `Scale` subresource in `status.selector`. Both are
//! normalized into a `Selector`, which can match label sets and render its canonical string form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_LABEL_PREFIX_LEN: usize = 253;

lazy_static! {
    /// Regular expression used to validate the name segment of a label key, and label values.
    static ref RE_LABEL_NAME: Regex = Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("failed to compile RE_LABEL_NAME regex");
    /// Regular expression used to validate the DNS subdomain prefix of a label key.
    static ref RE_LABEL_PREFIX: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("failed to compile RE_LABEL_PREFIX regex");
}

/// Selector errors.
#[derive(Debug, Error, PartialEq)]
pub enum SelectorError {
    /// A label key is not a valid qualified name.
    #[error("invalid label key {0:?}")]
    InvalidKey(String),
    /// A label value is not valid.
    #[error("invalid label value {0:?}")]
    InvalidValue(String),
    /// An operator is not supported.
    #[error("operator {operator:?} is not supported for key {key:?}")]
    UnsupportedOperator { key: String, operator: String },
    /// A set-based operator was given an unexpected number of values.
    #[error("operator {operator} for key {key:?} {expectation}")]
    InvalidValueCount {
        key: String,
        operator: Operator,
        expectation: &'static str,
    },
    /// The selector string could not be parsed.
    #[error("unable to parse selector {input:?} at position {position}: {reason}")]
    Syntax { input: String, position: usize, reason: String },
}

/// The operator of a single requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equals => "=",
            Self::NotEquals => "!=",
            Self::In => "in",
            Self::NotIn => "notin",
            Self::Exists => "exists",
            Self::DoesNotExist => "!",
        })
    }
}

/// A single requirement on one label key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    /// Create a new validated requirement.
    pub fn new(key: impl Into<String>, operator: Operator, values: impl IntoIterator<Item = String>) -> Result<Self, SelectorError> {
        let key = key.into();
        validate_key(&key)?;
        let values: BTreeSet<String> = values.into_iter().collect();
        let expectation = match operator {
            Operator::Equals | Operator::NotEquals if values.len() != 1 => Some("requires exactly one value"),
            Operator::In | Operator::NotIn if values.is_empty() => Some("requires one or more values"),
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => Some("must not have values"),
            _ => None,
        };
        if let Some(expectation) = expectation {
            return Err(SelectorError::InvalidValueCount { key, operator, expectation });
        }
        for value in values.iter() {
            validate_value(value)?;
        }
        Ok(Self { key, operator, values })
    }

    /// Check if the given labels satisfy this requirement.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => value.map(|val| self.values.contains(val)).unwrap_or(false),
            Operator::NotEquals | Operator::NotIn => value.map(|val| !self.values.contains(val)).unwrap_or(true),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of requirements. An empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Build a selector from a set of requirements, normalizing their order.
    pub fn new(mut requirements: Vec<Requirement>) -> Self {
        requirements.sort();
        requirements.dedup();
        Self { requirements }
    }

    /// Build a selector from the structured form used by K8s API objects.
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements = vec![];
        for (key, value) in selector.match_labels.iter().flatten() {
            requirements.push(Requirement::new(key.clone(), Operator::Equals, Some(value.clone()))?);
        }
        for expr in selector.match_expressions.iter().flatten() {
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(SelectorError::UnsupportedOperator {
                        key: expr.key.clone(),
                        operator: other.into(),
                    })
                }
            };
            requirements.push(Requirement::new(expr.key.clone(), operator, expr.values.clone().unwrap_or_default())?);
        }
        Ok(Self::new(requirements))
    }

    /// Parse the string form of a selector, e.g. `app=web,tier in (a,b),!canary`.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        Parser::new(input).parse().map(Self::new)
    }

    /// Check if the given labels satisfy every requirement of this selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }

    /// Check if this selector matches everything.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, req) in self.requirements.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", req)?;
        }
        Ok(())
    }
}

/// Validate a qualified label key of the form `[prefix/]name`.
fn validate_key(key: &str) -> Result<(), SelectorError> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    let prefix_ok = prefix
        .map(|prefix| !prefix.is_empty() && prefix.len() <= MAX_LABEL_PREFIX_LEN && RE_LABEL_PREFIX.is_match(prefix))
        .unwrap_or(true);
    let name_ok = !name.is_empty() && name.len() <= MAX_LABEL_NAME_LEN && RE_LABEL_NAME.is_match(name);
    if prefix_ok && name_ok {
        Ok(())
    } else {
        Err(SelectorError::InvalidKey(key.into()))
    }
}

/// Validate a label value. Empty values are allowed.
fn validate_value(value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || (value.len() <= MAX_LABEL_NAME_LEN && RE_LABEL_NAME.is_match(value)) {
        Ok(())
    } else {
        Err(SelectorError::InvalidValue(value.into()))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Parser ////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Bang,
    Eq,
    DoubleEq,
    NotEq,
    In,
    NotIn,
    OpenParen,
    CloseParen,
    Comma,
    End,
}

/// A recursive descent parser over the selector grammar.
struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Vec<Requirement>, SelectorError> {
        let mut requirements = vec![];
        if self.peek()? == Token::End {
            return Ok(requirements);
        }
        loop {
            requirements.push(self.requirement()?);
            match self.next()? {
                Token::Comma => continue,
                Token::End => break,
                other => return Err(self.error(format!("expected ',' or end of input, found {:?}", other))),
            }
        }
        Ok(requirements)
    }

    fn requirement(&mut self) -> Result<Requirement, SelectorError> {
        if self.peek()? == Token::Bang {
            self.next()?;
            let key = self.ident()?;
            return Requirement::new(key, Operator::DoesNotExist, None::<String>);
        }
        let key = self.ident()?;
        match self.peek()? {
            Token::Comma | Token::End => Requirement::new(key, Operator::Exists, None::<String>),
            Token::Eq | Token::DoubleEq => {
                self.next()?;
                let value = self.value()?;
                Requirement::new(key, Operator::Equals, Some(value))
            }
            Token::NotEq => {
                self.next()?;
                let value = self.value()?;
                Requirement::new(key, Operator::NotEquals, Some(value))
            }
            Token::In => {
                self.next()?;
                let values = self.value_set()?;
                Requirement::new(key, Operator::In, values)
            }
            Token::NotIn => {
                self.next()?;
                let values = self.value_set()?;
                Requirement::new(key, Operator::NotIn, values)
            }
            other => Err(self.error(format!("expected an operator, found {:?}", other))),
        }
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        match self.next()? {
            Token::Ident(ident) => Ok(ident),
            other => Err(self.error(format!("expected a label key, found {:?}", other))),
        }
    }

    /// A value after `=` or `!=`, which may be empty.
    fn value(&mut self) -> Result<String, SelectorError> {
        match self.peek()? {
            Token::Comma | Token::End => Ok(String::new()),
            // Keywords are valid label values.
            Token::In => self.next().map(|_| "in".into()),
            Token::NotIn => self.next().map(|_| "notin".into()),
            _ => self.ident(),
        }
    }

    fn value_set(&mut self) -> Result<Vec<String>, SelectorError> {
        match self.next()? {
            Token::OpenParen => (),
            other => return Err(self.error(format!("expected '(', found {:?}", other))),
        }
        let mut values = vec![];
        if self.peek()? == Token::CloseParen {
            self.next()?;
            return Ok(values);
        }
        loop {
            match self.peek()? {
                Token::Comma | Token::CloseParen => values.push(String::new()),
                _ => values.push(self.value()?),
            }
            match self.next()? {
                Token::Comma => continue,
                Token::CloseParen => break,
                other => return Err(self.error(format!("expected ',' or ')', found {:?}", other))),
            }
        }
        Ok(values)
    }

    fn peek(&mut self) -> Result<Token, SelectorError> {
        let pos = self.pos;
        let token = self.next();
        self.pos = pos;
        token
    }

    fn next(&mut self) -> Result<Token, SelectorError> {
        while self.chars.get(self.pos).map(|c| c.is_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
        let c = match self.chars.get(self.pos) {
            Some(c) => *c,
            None => return Ok(Token::End),
        };
        let next_is = |expected: char| self.chars.get(self.pos + 1) == Some(&expected);
        let (token, width) = match c {
            ',' => (Token::Comma, 1),
            '(' => (Token::OpenParen, 1),
            ')' => (Token::CloseParen, 1),
            '!' if next_is('=') => (Token::NotEq, 2),
            '!' => (Token::Bang, 1),
            '=' if next_is('=') => (Token::DoubleEq, 2),
            '=' => (Token::Eq, 1),
            c if is_ident_char(c) => {
                let ident: String = self.chars[self.pos..].iter().take_while(|c| is_ident_char(**c)).collect();
                let width = ident.chars().count();
                let token = match ident.as_str() {
                    "in" => Token::In,
                    "notin" => Token::NotIn,
                    _ => Token::Ident(ident),
                };
                (token, width)
            }
            other => return Err(self.error(format!("unexpected character {:?}", other))),
        };
        self.pos += width;
        Ok(token)
    }

    fn error(&self, reason: String) -> SelectorError {
        SelectorError::Syntax {
            input: self.input.into(),
            position: self.pos,
            reason,
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}
