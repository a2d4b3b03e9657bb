use musubi::{
    filter::Filter,
    properties::{Properties, PropertyValue},
    version::Version,
};
use proptest::prelude::*;

fn attribute() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "Name"]).prop_map(str::to_string)
}

fn value() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["1", "7", "-3", "x", "foo", "Foo Bar", "1.2.0", "true", "a(b)", "st*r"])
        .prop_map(str::to_string)
}

fn escape(value: &str) -> String {
    value
        .chars()
        .flat_map(|c| match c {
            '(' | ')' | '*' | '\\' => vec!['\\', c],
            c => vec![c],
        })
        .collect()
}

fn leaf() -> impl Strategy<Value = String> {
    let operator = prop::sample::select(vec!["=", "~=", ">=", "<=", ">", "<"]);
    prop_oneof![
        (attribute(), operator, value()).prop_map(|(a, op, v)| format!("({}{}{})", a, op, escape(&v))),
        attribute().prop_map(|a| format!("({}=*)", a)),
        (attribute(), "[a-z]{0,2}", "[a-z]{1,2}").prop_map(|(a, head, tail)| format!("({}={}*{})", a, head, tail)),
    ]
}

fn filter_text() -> impl Strategy<Value = String> {
    leaf().prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(|f| format!("(&{})", f.concat())),
            prop::collection::vec(inner.clone(), 1..4).prop_map(|f| format!("(|{})", f.concat())),
            inner.prop_map(|f| format!("(!{})", f)),
        ]
    })
}

fn property_value() -> impl Strategy<Value = PropertyValue> {
    prop_oneof![
        value().prop_map(PropertyValue::from),
        (-5i64..10).prop_map(PropertyValue::from),
        (-5.0f64..10.0).prop_map(PropertyValue::from),
        any::<bool>().prop_map(PropertyValue::from),
        (0u32..3, 0u32..3).prop_map(|(major, minor)| PropertyValue::from(Version::new(major, minor, 0))),
    ]
}

fn properties() -> impl Strategy<Value = Properties> {
    prop::collection::vec((attribute(), property_value()), 0..4)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_display_round_trip_matches_same_properties(
        text in filter_text(),
        samples in prop::collection::vec(properties(), 8),
    ) {
        let filter = Filter::parse(&text).unwrap();
        let reparsed = Filter::parse(&filter.to_string()).unwrap();
        for properties in &samples {
            prop_assert_eq!(filter.matches(properties), reparsed.matches(properties), "{} on {}", text, properties);
        }
    }
}

#[test]
fn test_substring_and_approx_are_case_insensitive() {
    let properties = Properties::new().with("name", "Musubi Registry");
    assert!(Filter::parse("(name=musubi*)").unwrap().matches(&properties));
    assert!(Filter::parse("(name~=REGISTRY)").unwrap().matches(&properties));
    assert!(!Filter::parse("(name=*tracker*)").unwrap().matches(&properties));
}

#[test]
fn test_incomparable_clause_fails_only_itself() {
    let properties = Properties::new().with("port", 8080).with("host", "local");
    let filter = Filter::parse("(|(port>=abc)(host=local))").unwrap();
    assert!(filter.matches(&properties));
    assert!(!Filter::parse("(port>=abc)").unwrap().matches(&properties));
}

#[test]
fn test_malformed_filters_are_rejected() {
    for text in ["", "(a=1", "a=1", "(a#1)", "((a=1)"] {
        assert!(Filter::parse(text).is_err(), "{:?} should not parse", text);
    }
}
