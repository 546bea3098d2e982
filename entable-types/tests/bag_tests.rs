use entable_types::{ETag, KeyPair, PropertyBag, PropertyValue, ValueKind};
use pretty_assertions::assert_eq;

// ── PropertyBag ─────────────────────────────────────────────────

#[test]
fn insert_and_get() {
    let mut bag = PropertyBag::new();
    bag.insert("Name", "alice");
    bag.insert("Age", 42i64);

    assert_eq!(bag.len(), 2);
    assert_eq!(bag.get("Name").and_then(PropertyValue::as_str), Some("alice"));
    assert_eq!(bag.get("Age").and_then(PropertyValue::as_i64), Some(42));
    assert!(bag.get("Missing").is_none());
}

#[test]
fn insert_returns_previous_value() {
    let mut bag = PropertyBag::new();
    assert!(bag.insert("X", 1i64).is_none());
    assert_eq!(bag.insert("X", 2i64), Some(PropertyValue::Int(1)));
}

#[test]
fn iteration_is_ordered_by_name() {
    let bag = PropertyBag::new().with("b", 1i64).with("a", 2i64).with("c", 3i64);
    let names: Vec<&str> = bag.names().collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn prefixed_yields_suffixes_only_for_matching_entries() {
    let bag = PropertyBag::new()
        .with("Login_google", "g")
        .with("Login_github", "h")
        .with("Loginx", "not a match")
        .with("Email", "e");

    let entries: Vec<(&str, &str)> = bag
        .prefixed("Login_")
        .map(|(suffix, value)| (suffix, value.as_str().unwrap()))
        .collect();
    assert_eq!(entries, vec![("github", "h"), ("google", "g")]);
}

#[test]
fn remove_prefixed_keeps_other_entries() {
    let mut bag = PropertyBag::new()
        .with("Tag_a", "1")
        .with("Tag_b", "2")
        .with("Title", "t");
    bag.remove_prefixed("Tag_");
    assert_eq!(bag.len(), 1);
    assert!(bag.contains("Title"));
}

#[test]
fn serialized_size_counts_names_and_payloads() {
    let bag = PropertyBag::new()
        .with("ab", "xyz")
        .with("n", 7i64)
        .with("f", true);
    // 2+3 + 1+8 + 1+1
    assert_eq!(bag.serialized_size(), 16);
}

#[test]
fn equal_content_is_equal_regardless_of_insertion_order() {
    let a = PropertyBag::new().with("x", 1i64).with("y", "two");
    let b = PropertyBag::new().with("y", "two").with("x", 1i64);
    assert_eq!(a, b);
    assert_eq!(a.serialized_size(), b.serialized_size());
}

#[test]
fn bag_serializes_as_plain_map() {
    let bag = PropertyBag::new().with("n", 1i64);
    let json = serde_json::to_value(&bag).unwrap();
    assert_eq!(json, serde_json::json!({"n": {"type": "int", "value": 1}}));
    let back: PropertyBag = serde_json::from_value(json).unwrap();
    assert_eq!(back, bag);
}

// ── Values ──────────────────────────────────────────────────────

#[test]
fn value_kinds() {
    assert_eq!(PropertyValue::from("s").kind(), ValueKind::String);
    assert_eq!(PropertyValue::from(1i32).kind(), ValueKind::Int);
    assert_eq!(PropertyValue::from(1.5).kind(), ValueKind::Double);
    assert_eq!(PropertyValue::from(false).kind(), ValueKind::Bool);
    assert_eq!(PropertyValue::from(vec![1u8]).kind(), ValueKind::Binary);
    assert_eq!(PropertyValue::from(uuid::Uuid::nil()).kind(), ValueKind::Guid);
}

#[test]
fn int_widens_to_double() {
    assert_eq!(PropertyValue::Int(3).as_f64(), Some(3.0));
    assert_eq!(PropertyValue::Bool(true).as_f64(), None);
}

#[test]
fn expect_kind_reports_mismatch() {
    let value = PropertyValue::from("text");
    assert!(value.expect_kind("Title", ValueKind::String).is_ok());

    let err = value.expect_kind("Title", ValueKind::Int).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Title"));
    assert!(msg.contains("int"));
    assert!(msg.contains("string"));
}

#[test]
fn key_string_forms_are_canonical() {
    let ts = chrono::DateTime::parse_from_rfc3339("2024-03-01T10:20:30.5Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    assert_eq!(PropertyValue::from(ts).to_key_string(), "2024-03-01T10:20:30.500000000Z");
    assert_eq!(PropertyValue::from(vec![0xabu8, 0x01]).to_key_string(), "ab01");
    assert_eq!(PropertyValue::from(-12i64).to_key_string(), "-12");
}

#[test]
fn sub_millisecond_timestamps_keep_distinct_key_strings() {
    let base = chrono::DateTime::parse_from_rfc3339("2024-03-01T10:20:30.123456Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let next = base + chrono::Duration::microseconds(1);

    let first = PropertyValue::from(base).to_key_string();
    let second = PropertyValue::from(next).to_key_string();
    assert_eq!(first, "2024-03-01T10:20:30.123456000Z");
    assert_eq!(second, "2024-03-01T10:20:30.123457000Z");

    let whole = chrono::DateTime::parse_from_rfc3339("2024-03-01T10:20:30Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let earlier = PropertyValue::from(whole).to_key_string();
    assert_eq!(earlier, "2024-03-01T10:20:30.000000000Z");
    assert!(earlier < first && first < second);
}

// ── Keys & ETags ────────────────────────────────────────────────

#[test]
fn key_pair_display() {
    let keys = KeyPair::new("A", "P1");
    assert_eq!(keys.to_string(), "(A, P1)");
}

#[test]
fn generated_etags_are_unique() {
    let a = ETag::generate();
    let b = ETag::generate();
    assert_ne!(a, b);
    assert_eq!(ETag::new(a.as_str()), a);
}
