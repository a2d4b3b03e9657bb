//! # LDAP-style service filters
//!
//! A [`Filter`] is an immutable expression tree over [`Properties`], parsed
//! once from text and then matched against many property snapshots.
//!
//! ```text
//! filter     := '(' filtercomp ')'
//! filtercomp := '&' filter* | '|' filter* | '!' filter | item
//! item       := attr ('=' | '~=' | '>' | '>=' | '<' | '<=') value
//!             | attr '=*'                      (presence)
//!             | attr '=' [initial] '*' (any '*')* [final]   (substring)
//! ```
//!
//! Special characters in values (`\`, `(`, `)`, `*`) are escaped with `\`.
//! Comparisons coerce the filter operand to the stored type of the property;
//! when the operand cannot be read as that type the clause is false.
//! Substring and approximate matches ignore case.
//!
//! ```rust
//! use musubi::filter::Filter;
//! use musubi::properties::Properties;
//!
//! let filter: Filter = "(&(objectClass=greeter)(service.ranking>=5))".parse().unwrap();
//! let props = Properties::builder()
//!     .set("objectClass", "greeter")
//!     .set("service.ranking", 10)
//!     .build();
//! assert!(filter.matches(&props));
//! assert_eq!(filter.to_string(), "(&(objectClass=greeter)(service.ranking>=5))");
//! ```

mod matcher;
mod parser;

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{properties::SERVICE_NAME, version::Version};

pub use parser::parse;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Empty filter")]
    Empty,
    #[error("Invalid filter `{filter}` at position {position}: {message}")]
    Syntax {
        filter: String,
        position: usize,
        message: String,
    },
}

pub type FilterResult<T> = Result<T, FilterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Operator {
    #[strum(serialize = "=")]
    Equal,
    #[strum(serialize = "~=")]
    Approx,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = ">=")]
    GreaterEqual,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = "<=")]
    LessEqual,
}

/// Comparison operand, pre-converted to every type it can be read as.
#[derive(Debug, Clone)]
pub struct Operand {
    text: String,
    lowercase: String,
    long: Option<i64>,
    double: Option<f64>,
    boolean: Option<bool>,
    version: Option<Version>,
}

impl Operand {
    pub fn new<S: Into<String>>(text: S) -> Self {
        let text = text.into();
        let trimmed = text.trim();
        Self {
            lowercase: text.to_lowercase(),
            long: trimmed.parse().ok(),
            double: trimmed.parse().ok(),
            boolean: match trimmed.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            version: trimmed.parse().ok(),
            text,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present {
        attribute: String,
    },
    Compare {
        attribute: String,
        op: Operator,
        operand: Operand,
    },
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

impl Filter {
    pub fn parse(text: &str) -> FilterResult<Self> {
        parser::parse(text)
    }

    /// Matches every property set.
    pub fn match_all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn compare<A: Into<String>, V: Into<String>>(attribute: A, op: Operator, value: V) -> Self {
        Filter::Compare {
            attribute: attribute.into(),
            op,
            operand: Operand::new(value),
        }
    }

    pub fn equal<A: Into<String>, V: Into<String>>(attribute: A, value: V) -> Self {
        Self::compare(attribute, Operator::Equal, value)
    }

    /// `(objectClass=<name>)`
    pub fn for_service(name: &str) -> Self {
        Self::equal(SERVICE_NAME, name)
    }

    /// Value of the first equality clause on `attribute`, if any.
    pub fn find_attribute(&self, attribute: &str) -> Option<&str> {
        match self {
            Filter::And(children) | Filter::Or(children) => children
                .iter()
                .find_map(|child| child.find_attribute(attribute)),
            Filter::Not(child) => child.find_attribute(attribute),
            Filter::Compare {
                attribute: name,
                op: Operator::Equal,
                operand,
            } if name == attribute => Some(operand.as_str()),
            _ => None,
        }
    }

    /// Whether every match requires `attribute` to equal some value.
    pub fn has_mandatory_equals_value_attribute(&self, attribute: &str) -> bool {
        match self {
            Filter::And(children) => children
                .iter()
                .any(|child| child.has_mandatory_equals_value_attribute(attribute)),
            Filter::Compare {
                attribute: name,
                op: Operator::Equal,
                ..
            } => name == attribute,
            _ => false,
        }
    }

    /// Whether every match requires `attribute` to be absent.
    pub fn has_mandatory_negated_presence_attribute(&self, attribute: &str) -> bool {
        match self {
            Filter::And(children) => children
                .iter()
                .any(|child| child.has_mandatory_negated_presence_attribute(attribute)),
            Filter::Not(child) => {
                matches!(child.as_ref(), Filter::Present { attribute: name } if name == attribute)
            }
            _ => false,
        }
    }

    /// Conjunction of `self` and `other`, flattening nested ANDs.
    pub fn and(self, other: Filter) -> Filter {
        let mut children = match self {
            Filter::And(children) => children,
            single => vec![single],
        };
        match other {
            Filter::And(more) => children.extend(more),
            single => children.push(single),
        }
        Filter::And(children)
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> FilterResult<Self> {
        parser::parse(s)
    }
}

pub(crate) fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '(' | ')' | '*') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::Present { attribute } => write!(f, "({}=*)", attribute),
            Filter::Compare {
                attribute,
                op,
                operand,
            } => write!(f, "({}{}{})", attribute, op, escape_value(operand.as_str())),
            Filter::Substring {
                attribute,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape_value(initial))?;
                }
                for part in any {
                    write!(f, "*{}", escape_value(part))?;
                }
                write!(f, "*")?;
                if let Some(last) = last {
                    write!(f, "{}", escape_value(last))?;
                }
                write!(f, ")")
            }
        }
    }
}
