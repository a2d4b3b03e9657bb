use std::cmp::Ordering;

use crate::properties::{Properties, PropertyValue};

use super::{Filter, Operand, Operator};

impl Filter {
    /// Evaluates this filter against a property snapshot.
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|child| child.matches(properties)),
            Filter::Or(children) => children.iter().any(|child| child.matches(properties)),
            Filter::Not(child) => !child.matches(properties),
            Filter::Present { attribute } => properties.contains(attribute),
            Filter::Compare {
                attribute,
                op,
                operand,
            } => properties
                .get(attribute)
                .is_some_and(|value| compare(*op, operand, value)),
            Filter::Substring {
                attribute,
                initial,
                any,
                last,
            } => properties.get(attribute).is_some_and(|value| {
                substring_match(
                    &value.to_string().to_lowercase(),
                    initial.as_deref(),
                    any,
                    last.as_deref(),
                )
            }),
        }
    }
}

fn compare(op: Operator, operand: &Operand, value: &PropertyValue) -> bool {
    if op == Operator::Approx {
        return value.to_string().to_lowercase().contains(&operand.lowercase);
    }
    let ordering = match value {
        PropertyValue::String(s) => Some(s.as_str().cmp(operand.text.as_str())),
        PropertyValue::Long(l) => operand.long.map(|o| l.cmp(&o)),
        PropertyValue::Double(d) => operand.double.and_then(|o| d.partial_cmp(&o)),
        PropertyValue::Bool(b) => operand.boolean.map(|o| b.cmp(&o)),
        PropertyValue::Version(v) => operand.version.as_ref().map(|o| v.cmp(o)),
    };
    let Some(ordering) = ordering else {
        // incomparable types fail only this clause
        return false;
    };
    match op {
        Operator::Equal => ordering == Ordering::Equal,
        Operator::Greater => ordering == Ordering::Greater,
        Operator::GreaterEqual => ordering != Ordering::Less,
        Operator::Less => ordering == Ordering::Less,
        Operator::LessEqual => ordering != Ordering::Greater,
        Operator::Approx => false,
    }
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut position = 0;
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        if !value.starts_with(&initial) {
            return false;
        }
        position = initial.len();
    }
    for part in any {
        let part = part.to_lowercase();
        match value[position..].find(&part) {
            Some(offset) => position += offset + part.len(),
            None => return false,
        }
    }
    match last {
        Some(last) => {
            let last = last.to_lowercase();
            value.len() >= position + last.len() && value.ends_with(&last)
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn props() -> Properties {
        Properties::builder()
            .set("objectClass", "Calculator")
            .set("rank", 10)
            .set("ratio", 0.75)
            .set("enabled", true)
            .set("service.version", Version::new(1, 2, 0))
            .set("path", "/usr/Local/bin")
            .build()
    }

    fn matches(text: &str) -> bool {
        Filter::parse(text).unwrap().matches(&props())
    }

    #[test]
    fn test_equal_and_presence() {
        assert!(matches("(objectClass=Calculator)"));
        assert!(!matches("(objectClass=calculator)"));
        assert!(matches("(rank=*)"));
        assert!(!matches("(missing=*)"));
        assert!(!matches("(missing=1)"));
    }

    #[test]
    fn test_numeric_comparisons_use_stored_type() {
        assert!(matches("(rank=10)"));
        assert!(matches("(rank<11)"));
        assert!(matches("(rank>=10)"));
        // numeric, not lexicographic
        assert!(matches("(rank>9)"));
        assert!(!matches("(rank<9)"));
        assert!(matches("(ratio<1)"));
        assert!(matches("(ratio>=0.75)"));
        assert!(matches("(service.version>=1.0.0)"));
        assert!(!matches("(service.version>=1.10)"));
        assert!(matches("(enabled=TRUE)"));
    }

    #[test]
    fn test_incomparable_types_fail_only_the_clause() {
        assert!(!matches("(rank=ten)"));
        assert!(matches("(|(rank=ten)(objectClass=Calculator))"));
        assert!(matches("(!(rank=ten))"));
        assert!(!matches("(enabled>maybe)"));
    }

    #[test]
    fn test_substring_and_approx_ignore_case() {
        assert!(matches("(path=/usr/local*)"));
        assert!(matches("(path=*LOCAL*)"));
        assert!(matches("(path=/usr*bin)"));
        assert!(!matches("(path=/usr*sbin)"));
        assert!(!matches("(path=*bin*bin)"));
        assert!(matches("(objectClass~=calc)"));
        assert!(!matches("(objectClass~=printer)"));
    }

    #[test]
    fn test_substring_parts_do_not_overlap() {
        let props = Properties::builder().set("a", "abc").build();
        let f = Filter::parse("(a=ab*bc)").unwrap();
        assert!(!f.matches(&props));
    }

    #[test]
    fn test_empty_composites() {
        assert!(matches("(&)"));
        assert!(!matches("(|)"));
    }
}
