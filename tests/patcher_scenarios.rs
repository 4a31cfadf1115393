//! End-to-end merge scenarios: multiple importers asserting, retracting, and
//! overriding each other's attribute values.

use custmaster::model::{Address, Customer, ImportState, OwnedAttribute};
use custmaster::patcher::Patcher;
use custmaster::phone::Normalizer;
use custmaster::priority::{PriorityResolver, StaticPriorityResolver};
use custmaster::{differ, AttributeKind};

/// The reference test policy: `test` always wins, everyone else may only
/// touch unowned values.
struct TestResolver;

impl PriorityResolver for TestResolver {
    fn is_allowed(&self, importer: &str, owners: &[String]) -> bool {
        if importer == "test" {
            return true;
        }
        owners.is_empty()
    }
}

fn customer(first: &str, last: &str, phones: &[&str]) -> Customer {
    Customer {
        first_name: first.into(),
        last_name: last.into(),
        phone_numbers: phones.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

fn import(importer: &str, reference: &str, imported: &Customer) -> (Customer, Vec<ImportState>) {
    let mut patcher = Patcher::new(importer, reference, &TestResolver, None, Vec::new());
    patcher.apply(imported).expect("apply should succeed");
    patcher.into_parts()
}

#[test]
fn first_insert_assigns_full_ownership() {
    let mut imported = customer("Alice", "Smith", &["1234"]);
    imported.email_addresses = vec!["alice@example.com".into()];

    let mut patcher = Patcher::new("test", "ref-1", &TestResolver, None, Vec::new());
    patcher.apply(&imported).expect("apply should succeed");

    assert_eq!(patcher.result(), &imported);

    let state = patcher.state();
    assert_eq!(state.importer, "test");
    assert_eq!(state.internal_reference, "ref-1");
    assert_eq!(
        state.owned_attributes,
        vec![
            OwnedAttribute::first_name("Alice"),
            OwnedAttribute::last_name("Smith"),
            OwnedAttribute::email("alice@example.com"),
            OwnedAttribute::phone("1234"),
        ]
    );
}

#[test]
fn same_importer_reimport_retracts_by_omission() {
    let (existing, states) = import("test", "ref", &customer("Alice", "Smith", &["1234"]));

    let mut update = customer("Alice", "", &["4321"]);
    update.email_addresses = vec!["a@x".into()];
    update.addresses = vec![Address::new("1", "City", "Street", "")];

    let mut patcher = Patcher::new("test", "ref", &TestResolver, Some(existing), states);
    patcher.apply(&update).expect("apply should succeed");

    let result = patcher.result();
    assert_eq!(result.first_name, "Alice");
    // Sole owner retracted the last name, so it is gone.
    assert_eq!(result.last_name, "");
    assert_eq!(result.phone_numbers, vec!["4321"]);
    assert_eq!(result.email_addresses, vec!["a@x"]);
    assert_eq!(result.addresses, vec![Address::new("1", "City", "Street", "")]);

    assert_eq!(
        patcher.state().owned_attributes,
        vec![
            OwnedAttribute::first_name("Alice"),
            OwnedAttribute::email("a@x"),
            OwnedAttribute::phone("4321"),
            OwnedAttribute::address(Address::new("1", "City", "Street", "")),
        ]
    );
}

#[test]
fn lower_priority_importer_accumulates_but_cannot_override() {
    let (existing, states) = import("test", "ref", &customer("Alice", "Smith", &["1234"]));

    let mut update = customer("Other", "", &["4321"]);
    update.email_addresses = vec!["a@x".into()];

    let mut patcher = Patcher::new("foo", "foo-ref", &TestResolver, Some(existing), states);
    patcher.apply(&update).expect("apply should succeed");

    let result = patcher.result();
    assert_eq!(result.first_name, "Alice", "lower priority must not override");
    assert_eq!(result.last_name, "Smith");
    assert_eq!(result.phone_numbers, vec!["1234", "4321"]);
    assert_eq!(result.email_addresses, vec!["a@x"]);
}

#[test]
fn ignored_attribute_blocks_imports_and_bookkeeping() {
    // A user-pinned first name.
    let mut user_state = ImportState::new("user", "");
    user_state
        .owned_attributes
        .push(OwnedAttribute::first_name("foo").with_ignore(true));
    let existing = customer("foo", "", &[]);

    let mut imported = customer("Firstname", "Lastname", &["1234"]);
    imported.email_addresses = vec!["a@x".into()];

    let mut patcher = Patcher::new("test", "ref", &TestResolver, Some(existing), vec![user_state]);
    patcher.apply(&imported).expect("apply should succeed");

    let result = patcher.result();
    assert_eq!(result.first_name, "foo");
    assert!(!patcher
        .state()
        .owned_attributes
        .iter()
        .any(|a| a.kind == AttributeKind::FirstName));

    // Everything else applies normally.
    assert_eq!(result.last_name, "Lastname");
    assert_eq!(result.phone_numbers, vec!["1234"]);
    assert_eq!(result.email_addresses, vec!["a@x"]);
}

#[test]
fn ownership_is_symmetric_across_importers() {
    let (existing, states) = import("test", "ref", &customer("", "", &["1234"]));

    // Importer b asserts the same number.
    let mut patcher = Patcher::new("other", "o-ref", &TestResolver, Some(existing), states);
    patcher
        .apply(&customer("", "", &["1234"]))
        .expect("apply should succeed");
    let (existing, states) = patcher.into_parts();

    let owners = states
        .iter()
        .filter(|s| s.owned_attributes.contains(&OwnedAttribute::phone("1234")))
        .count();
    assert_eq!(owners, 2);

    // test retracts; other still owns the number, so it stays.
    let mut patcher = Patcher::new("test", "ref", &TestResolver, Some(existing), states);
    patcher
        .apply(&customer("", "", &[]))
        .expect("apply should succeed");

    assert_eq!(patcher.result().phone_numbers, vec!["1234"]);
    let states = patcher.states();
    assert!(states
        .iter()
        .find(|s| s.importer == "other")
        .unwrap()
        .owned_attributes
        .contains(&OwnedAttribute::phone("1234")));
    assert!(!states
        .iter()
        .find(|s| s.importer == "test")
        .unwrap()
        .owned_attributes
        .contains(&OwnedAttribute::phone("1234")));
}

#[test]
fn differ_output_replayed_through_patcher_reproduces_target() {
    let normalizer = Normalizer::new("AT");
    let keep = normalizer.normalize("0664 1111111");
    let dropped = normalizer.normalize("0664 2222222");
    let added_a = normalizer.normalize("0664 3333333");
    let added_b = normalizer.normalize("0664 4444444");

    let old = customer("foo", "bar", &[&keep, &dropped]);
    let new = customer("foo", "bar", &[&keep, &added_a, &added_b]);

    let updates = differ::diff(&old, &new);
    assert_eq!(updates.len(), 3, "one delete and two adds expected");

    // Seed a patcher that owns the old snapshot, then replay the diff.
    let (existing, states) = import("test", "ref", &old);
    let mut patcher = Patcher::new("test", "ref", &TestResolver, Some(existing), states)
        .with_phone_normalizer(normalizer);
    for update in &updates {
        patcher.apply_update(update).expect("update should apply");
    }

    let mut result_phones = patcher.result().phone_numbers.clone();
    let mut expected_phones = new.phone_numbers.clone();
    result_phones.sort();
    expected_phones.sort();
    assert_eq!(result_phones, expected_phones);
    assert_eq!(patcher.result().first_name, new.first_name);
    assert_eq!(patcher.result().last_name, new.last_name);
}

#[test]
fn standard_priority_order_is_respected() {
    let resolver = StaticPriorityResolver::standard();

    let (existing, states) = {
        let mut patcher = Patcher::new("carddav", "c-ref", &resolver, None, Vec::new());
        patcher
            .apply(&customer("Karl", "Dav", &[]))
            .expect("apply should succeed");
        patcher.into_parts()
    };

    // vetinf outranks carddav and takes over the names.
    let mut patcher = Patcher::new("vetinf", "v-ref", &resolver, Some(existing), states);
    patcher
        .apply(&customer("Vera", "Inf", &[]))
        .expect("apply should succeed");
    let (existing, states) = patcher.into_parts();
    assert_eq!(existing.first_name, "Vera");
    assert_eq!(existing.last_name, "Inf");

    // carddav cannot take them back.
    let mut patcher = Patcher::new("carddav", "c-ref", &resolver, Some(existing), states);
    patcher
        .apply(&customer("Karl", "Dav", &[]))
        .expect("apply should succeed");
    assert_eq!(patcher.result().first_name, "Vera");
    assert_eq!(patcher.result().last_name, "Inf");
}
