//! Semantic service versions and version ranges.
//!
//! Versions follow the `major.minor.micro[.qualifier]` form; omitted numeric
//! parts default to `0`. A [`VersionRange`] uses interval notation
//! (`[1.0.0,2.0.0)`) or a bare version meaning "at least".

use std::{cmp::Ordering, fmt, str::FromStr};

use crate::{Error, MusubiResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub qualifier: String,
}

impl Version {
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: String::new(),
        }
    }

    pub fn with_qualifier<S: Into<String>>(mut self, qualifier: S) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    /// Same major version and not older.
    pub fn is_compatible_with(&self, provided: &Version) -> bool {
        self.major == provided.major && self <= provided
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.micro.cmp(&other.micro))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> MusubiResult<Self> {
        let text = s.trim();
        if text.is_empty() {
            return Err(Error::illegal_argument("empty version"));
        }
        let mut parts = text.splitn(4, '.');
        let mut numeric = [0u32; 3];
        for (index, slot) in numeric.iter_mut().enumerate() {
            match parts.next() {
                Some(part) => {
                    *slot = part.parse().map_err(|_| {
                        Error::illegal_argument(format!(
                            "invalid version `{}`: part {} is not a number",
                            text, index
                        ))
                    })?;
                }
                None => break,
            }
        }
        let qualifier = parts.next().unwrap_or_default();
        if !qualifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::illegal_argument(format!(
                "invalid version `{}`: bad qualifier",
                text
            )));
        }
        Ok(Self {
            major: numeric[0],
            minor: numeric[1],
            micro: numeric[2],
            qualifier: qualifier.to_string(),
        })
    }
}

/// One end of a [`VersionRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub low: Bound,
    pub high: Option<Bound>,
}

impl VersionRange {
    pub fn at_least(version: Version) -> Self {
        Self {
            low: Bound {
                version,
                inclusive: true,
            },
            high: None,
        }
    }

    pub fn includes(&self, version: &Version) -> bool {
        let above = if self.low.inclusive {
            version >= &self.low.version
        } else {
            version > &self.low.version
        };
        let below = match &self.high {
            None => true,
            Some(high) if high.inclusive => version <= &high.version,
            Some(high) => version < &high.version,
        };
        above && below
    }

    /// Filter expression selecting values of `attribute` inside this range.
    pub fn to_filter(&self, attribute: &str) -> String {
        let low_op = if self.low.inclusive { ">=" } else { ">" };
        let low = format!("({}{}{})", attribute, low_op, self.low.version);
        match &self.high {
            None => low,
            Some(high) => {
                let high_op = if high.inclusive { "<=" } else { "<" };
                format!("(&{}({}{}{}))", low, attribute, high_op, high.version)
            }
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.high {
            None => write!(f, "{}", self.low.version),
            Some(high) => write!(
                f,
                "{}{},{}{}",
                if self.low.inclusive { '[' } else { '(' },
                self.low.version,
                high.version,
                if high.inclusive { ']' } else { ')' }
            ),
        }
    }
}

impl FromStr for VersionRange {
    type Err = Error;

    fn from_str(s: &str) -> MusubiResult<Self> {
        let text = s.trim();
        let low_inclusive = match text.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Ok(Self::at_least(text.parse()?)),
        };
        let high_inclusive = match text.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => {
                return Err(Error::illegal_argument(format!(
                    "invalid version range `{}`: missing closing bracket",
                    text
                )))
            }
        };
        let inner = &text[1..text.len() - 1];
        let (low, high) = inner.split_once(',').ok_or_else(|| {
            Error::illegal_argument(format!("invalid version range `{}`: missing comma", text))
        })?;
        let range = Self {
            low: Bound {
                version: low.parse()?,
                inclusive: low_inclusive,
            },
            high: Some(Bound {
                version: high.parse()?,
                inclusive: high_inclusive,
            }),
        };
        if let Some(high) = &range.high {
            if high.version < range.low.version {
                return Err(Error::illegal_argument(format!(
                    "invalid version range `{}`: low is above high",
                    text
                )));
            }
        }
        Ok(range)
    }
}
