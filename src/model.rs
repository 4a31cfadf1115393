//! # Data Model
//!
//! Core data structures for customer consolidation: the canonical customer
//! record, per-importer provenance, and the attribute-level change and query
//! vocabulary shared by the merge engine, the repository, and the wire layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A postal address. Equality covers all four fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Address {
    pub postal_code: String,
    pub city: String,
    pub street: String,
    pub extra: String,
}

impl Address {
    pub fn new(
        postal_code: impl Into<String>,
        city: impl Into<String>,
        street: impl Into<String>,
        extra: impl Into<String>,
    ) -> Self {
        Self {
            postal_code: postal_code.into(),
            city: city.into(),
            street: street.into(),
            extra: extra.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}, {}", self.postal_code, self.city, self.street)?;
        if !self.extra.is_empty() {
            write!(f, " ({})", self.extra)?;
        }
        Ok(())
    }
}

/// The canonical, consolidated customer record.
///
/// The list fields are insertion-ordered sets; use [`add_to_set`] or the
/// membership helpers to keep them duplicate-free.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Customer {
    /// Opaque store-assigned identifier. Empty until first stored.
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    /// Phone numbers, canonicalized to international format where parseable.
    pub phone_numbers: Vec<String>,
    pub email_addresses: Vec<String>,
    pub addresses: Vec<Address>,
}

impl Customer {
    /// The display name used for substring search: `"last first"`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }

    /// Whether the given owned-attribute value is present on this customer.
    ///
    /// Returns `None` when the kind/value shape does not line up (for example
    /// an ADDRESS kind carrying a text value).
    pub fn contains_value(&self, kind: AttributeKind, value: &AttributeValue) -> Option<bool> {
        match (kind, value) {
            (AttributeKind::FirstName, AttributeValue::Text(v)) => Some(self.first_name == *v),
            (AttributeKind::LastName, AttributeValue::Text(v)) => Some(self.last_name == *v),
            (AttributeKind::EmailAddress, AttributeValue::Text(v)) => {
                Some(self.email_addresses.iter().any(|m| m == v))
            }
            (AttributeKind::PhoneNumber, AttributeValue::Text(v)) => {
                Some(self.phone_numbers.iter().any(|p| p == v))
            }
            (AttributeKind::Address, AttributeValue::Address(v)) => {
                Some(self.addresses.iter().any(|a| a == v))
            }
            _ => None,
        }
    }
}

/// The attribute kinds tracked per importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeKind {
    FirstName,
    LastName,
    EmailAddress,
    PhoneNumber,
    Address,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeKind::FirstName => "first_name",
            AttributeKind::LastName => "last_name",
            AttributeKind::EmailAddress => "email_address",
            AttributeKind::PhoneNumber => "phone_number",
            AttributeKind::Address => "address",
        };
        f.write_str(name)
    }
}

/// The value side of an owned attribute: text for the scalar and list kinds,
/// a structured address for ADDRESS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Address(Address),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            AttributeValue::Address(_) => None,
        }
    }

    pub fn as_address(&self) -> Option<&Address> {
        match self {
            AttributeValue::Address(v) => Some(v),
            AttributeValue::Text(_) => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(v) => f.write_str(v),
            AttributeValue::Address(a) => a.fmt(f),
        }
    }
}

/// A (kind, value) fact asserted by one importer.
///
/// Two owned attributes are equal iff kind and value are structurally equal.
/// The ignore flag is carried alongside the fact and does not participate in
/// identity; ownership matching must see an ignored assertion as the same
/// fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedAttribute {
    pub kind: AttributeKind,
    pub value: AttributeValue,
    #[serde(default)]
    pub ignore: bool,
}

impl PartialEq for OwnedAttribute {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

impl OwnedAttribute {
    pub fn new(kind: AttributeKind, value: AttributeValue) -> Self {
        Self {
            kind,
            value,
            ignore: false,
        }
    }

    pub fn first_name(value: impl Into<String>) -> Self {
        Self::new(AttributeKind::FirstName, AttributeValue::Text(value.into()))
    }

    pub fn last_name(value: impl Into<String>) -> Self {
        Self::new(AttributeKind::LastName, AttributeValue::Text(value.into()))
    }

    pub fn email(value: impl Into<String>) -> Self {
        Self::new(
            AttributeKind::EmailAddress,
            AttributeValue::Text(value.into()),
        )
    }

    pub fn phone(value: impl Into<String>) -> Self {
        Self::new(
            AttributeKind::PhoneNumber,
            AttributeValue::Text(value.into()),
        )
    }

    pub fn address(value: Address) -> Self {
        Self::new(AttributeKind::Address, AttributeValue::Address(value))
    }

    pub fn with_ignore(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Per (customer, importer) provenance: which facts this importer asserted
/// and the importer's own stable reference for the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportState {
    pub importer: String,
    pub internal_reference: String,
    pub owned_attributes: Vec<OwnedAttribute>,
}

impl ImportState {
    pub fn new(importer: impl Into<String>, internal_reference: impl Into<String>) -> Self {
        Self {
            importer: importer.into(),
            internal_reference: internal_reference.into(),
            owned_attributes: Vec::new(),
        }
    }
}

/// The stored unit: a customer together with all provenance states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerRecord {
    pub customer: Customer,
    pub states: Vec<ImportState>,
}

impl CustomerRecord {
    pub fn new(customer: Customer, states: Vec<ImportState>) -> Self {
        Self { customer, states }
    }

    /// The state belonging to the given importer, if any.
    pub fn state_for(&self, importer: &str) -> Option<&ImportState> {
        self.states.iter().find(|s| s.importer == importer)
    }
}

/// The change operations emitted by the differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateOp {
    Set,
    Add,
    Delete,
}

/// A single attribute-level change operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeUpdate {
    pub kind: AttributeKind,
    pub op: UpdateOp,
    pub value: AttributeValue,
}

impl AttributeUpdate {
    pub fn new(kind: AttributeKind, op: UpdateOp, value: AttributeValue) -> Self {
        Self { kind, op, value }
    }

    /// The owned-attribute form of this update's (kind, value) pair.
    pub fn to_owned_attribute(&self) -> OwnedAttribute {
        OwnedAttribute::new(self.kind, self.value.clone())
    }
}

/// One of the supported customer lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CustomerQuery {
    Id(String),
    InternalReference { importer: String, reference: String },
    Name { last_name: String },
    PhoneNumber(String),
    EmailAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub field_name: String,
    pub direction: SortDirection,
}

/// Page selection for list-shaped lookups. A `page_size` of zero disables
/// pagination: all matches are returned and `total == len(results)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub page_size: usize,
    pub page: usize,
    pub sort_by: Vec<SortField>,
}

impl Pagination {
    pub fn new(page_size: usize, page: usize) -> Self {
        Self {
            page_size,
            page,
            sort_by: Vec::new(),
        }
    }
}

/// Append `value` unless an equal element is already present.
/// Returns true when the element was inserted.
pub fn add_to_set<T: PartialEq>(list: &mut Vec<T>, value: T) -> bool {
    if list.contains(&value) {
        return false;
    }
    list.push(value);
    true
}

/// Remove the first element equal to `value`. Returns true when removed.
pub fn remove_from_set<T: PartialEq>(list: &mut Vec<T>, value: &T) -> bool {
    if let Some(idx) = list.iter().position(|e| e == value) {
        list.remove(idx);
        return true;
    }
    false
}
