//! # Snapshot Differ
//!
//! Derives an ordered list of attribute-level change operations from an
//! old/new pair of customer snapshots. Importers that only see full records
//! use this to produce update streams; the differ itself never normalizes
//! values.

use crate::model::{
    Address, AttributeKind, AttributeUpdate, AttributeValue, Customer, UpdateOp, add_to_set,
    remove_from_set,
};

/// Compute the operations that transform `old` into `new`.
///
/// Scalar fields emit a SET whenever they differ, including a SET to the
/// empty string (meaning clear). List fields emit DELETEs for values that
/// disappeared (in old order) followed by ADDs for new values (in new order),
/// grouped as emails, then phones, then addresses.
pub fn diff(old: &Customer, new: &Customer) -> Vec<AttributeUpdate> {
    let mut result = Vec::new();

    if old.first_name != new.first_name {
        result.push(AttributeUpdate::new(
            AttributeKind::FirstName,
            UpdateOp::Set,
            AttributeValue::Text(new.first_name.clone()),
        ));
    }

    if old.last_name != new.last_name {
        result.push(AttributeUpdate::new(
            AttributeKind::LastName,
            UpdateOp::Set,
            AttributeValue::Text(new.last_name.clone()),
        ));
    }

    diff_text_list(
        &mut result,
        &old.email_addresses,
        &new.email_addresses,
        AttributeKind::EmailAddress,
    );
    diff_text_list(
        &mut result,
        &old.phone_numbers,
        &new.phone_numbers,
        AttributeKind::PhoneNumber,
    );
    diff_address_list(&mut result, &old.addresses, &new.addresses);

    result
}

fn diff_text_list(
    result: &mut Vec<AttributeUpdate>,
    old: &[String],
    new: &[String],
    kind: AttributeKind,
) {
    for entry in old {
        if !new.contains(entry) {
            result.push(AttributeUpdate::new(
                kind,
                UpdateOp::Delete,
                AttributeValue::Text(entry.clone()),
            ));
        }
    }

    for entry in new {
        if !old.contains(entry) {
            result.push(AttributeUpdate::new(
                kind,
                UpdateOp::Add,
                AttributeValue::Text(entry.clone()),
            ));
        }
    }
}

fn diff_address_list(result: &mut Vec<AttributeUpdate>, old: &[Address], new: &[Address]) {
    for entry in old {
        if !new.contains(entry) {
            result.push(AttributeUpdate::new(
                AttributeKind::Address,
                UpdateOp::Delete,
                AttributeValue::Address(entry.clone()),
            ));
        }
    }

    for entry in new {
        if !old.contains(entry) {
            result.push(AttributeUpdate::new(
                AttributeKind::Address,
                UpdateOp::Add,
                AttributeValue::Address(entry.clone()),
            ));
        }
    }
}

/// Replay a list of updates onto a base snapshot, producing the full record
/// an update-wise caller is describing. The inverse of [`diff`] in the sense
/// that `replay(a, diff(a, b)) == b` up to list ordering.
pub fn replay(base: &Customer, updates: &[AttributeUpdate]) -> Customer {
    let mut result = base.clone();

    for update in updates {
        match (update.kind, update.op, &update.value) {
            (AttributeKind::FirstName, UpdateOp::Set, AttributeValue::Text(v)) => {
                result.first_name = v.clone();
            }
            (AttributeKind::LastName, UpdateOp::Set, AttributeValue::Text(v)) => {
                result.last_name = v.clone();
            }
            (AttributeKind::EmailAddress, UpdateOp::Add, AttributeValue::Text(v)) => {
                add_to_set(&mut result.email_addresses, v.clone());
            }
            (AttributeKind::EmailAddress, UpdateOp::Delete, AttributeValue::Text(v)) => {
                remove_from_set(&mut result.email_addresses, v);
            }
            (AttributeKind::PhoneNumber, UpdateOp::Add, AttributeValue::Text(v)) => {
                add_to_set(&mut result.phone_numbers, v.clone());
            }
            (AttributeKind::PhoneNumber, UpdateOp::Delete, AttributeValue::Text(v)) => {
                remove_from_set(&mut result.phone_numbers, v);
            }
            (AttributeKind::Address, UpdateOp::Add, AttributeValue::Address(v)) => {
                add_to_set(&mut result.addresses, v.clone());
            }
            (AttributeKind::Address, UpdateOp::Delete, AttributeValue::Address(v)) => {
                remove_from_set(&mut result.addresses, v);
            }
            _ => {}
        }
    }

    result
}
