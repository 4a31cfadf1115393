//! # Merge Engine
//!
//! Applies an imported customer snapshot (or a single attribute operation)
//! to a stored record and its provenance. Each value is tracked per source:
//! additions accumulate owners, a retraction removes one owner, and a value
//! disappears only when its last owner is gone. Writes to the scalar fields
//! are gated by the injected [`PriorityResolver`].

use crate::model::{
    add_to_set, AttributeKind, AttributeUpdate, AttributeValue, Customer, ImportState,
    OwnedAttribute, UpdateOp,
};
use crate::phone;
use crate::priority::PriorityResolver;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{kind}: expected a {expected} value")]
    ValueShape {
        kind: AttributeKind,
        expected: &'static str,
    },
    #[error("unsupported operation {op:?} for attribute kind {kind}")]
    UnsupportedOperation { kind: AttributeKind, op: UpdateOp },
    #[error(transparent)]
    Phone(#[from] phone::PhoneError),
}

fn expected_shape(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Address => "address",
        _ => "text",
    }
}

/// Merges one importer's assertions into a customer record.
///
/// The patcher owns working copies of the customer and its states; callers
/// keep their snapshots. A state for `(importer, internal_reference)` is
/// ensured at construction. Note that nothing here deletes customers: a
/// source that retracts every fact leaves an empty record behind.
pub struct Patcher<'a> {
    importer: String,
    reference: String,
    resolver: &'a dyn PriorityResolver,
    phone: phone::Normalizer,
    set_ignore: bool,

    existing: Customer,
    result: Customer,
    states: Vec<ImportState>,
    /// Index of the `(importer, reference)` state within `states`.
    current: usize,
    changes: u64,
}

impl<'a> Patcher<'a> {
    pub fn new(
        importer: impl Into<String>,
        reference: impl Into<String>,
        resolver: &'a dyn PriorityResolver,
        existing: Option<Customer>,
        mut states: Vec<ImportState>,
    ) -> Self {
        let importer = importer.into();
        let reference = reference.into();

        let existing = existing.unwrap_or_default();
        let result = existing.clone();

        let current = match states
            .iter()
            .position(|s| s.importer == importer && s.internal_reference == reference)
        {
            Some(idx) => idx,
            None => {
                states.push(ImportState::new(importer.clone(), reference.clone()));
                states.len() - 1
            }
        };

        Self {
            importer,
            reference,
            resolver,
            phone: phone::Normalizer::default(),
            set_ignore: false,
            existing,
            result,
            states,
            current,
            changes: 0,
        }
    }

    /// Record new assertions with `ignore = true` so later imports cannot
    /// clobber them. Used for user-originated updates.
    pub fn with_set_ignore(mut self, set_ignore: bool) -> Self {
        self.set_ignore = set_ignore;
        self
    }

    pub fn with_phone_normalizer(mut self, normalizer: phone::Normalizer) -> Self {
        self.phone = normalizer;
        self
    }

    pub fn importer(&self) -> &str {
        &self.importer
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The starting snapshot the patcher was built from.
    pub fn existing(&self) -> &Customer {
        &self.existing
    }

    /// The merged customer.
    pub fn result(&self) -> &Customer {
        &self.result
    }

    pub fn states(&self) -> &[ImportState] {
        &self.states
    }

    /// This importer's provenance state.
    pub fn state(&self) -> &ImportState {
        &self.states[self.current]
    }

    /// Number of ownership mutations performed so far.
    pub fn change_count(&self) -> u64 {
        self.changes
    }

    pub fn into_parts(self) -> (Customer, Vec<ImportState>) {
        (self.result, self.states)
    }

    /// Apply a full snapshot from this importer.
    ///
    /// Phases, in order: scalar assertions, list additions, prune (this
    /// importer retracts by omission), cleanup (drop values whose last owner
    /// is gone). Values suppressed via another importer's ignore flag are
    /// neither written nor recorded as owned.
    pub fn apply(&mut self, imported: &Customer) -> Result<(), PatchError> {
        self.apply_first_name(imported);
        self.apply_last_name(imported);
        self.apply_text_list(AttributeKind::EmailAddress, &imported.email_addresses);
        self.apply_text_list(AttributeKind::PhoneNumber, &imported.phone_numbers);
        self.apply_addresses(imported);

        self.prune(imported)?;
        self.cleanup();

        Ok(())
    }

    /// Apply a single attribute operation from this importer.
    ///
    /// ADD and DELETE cover the list kinds, SET covers the scalar kinds;
    /// everything else is an error. Phone values are canonicalized here, and
    /// an unparseable phone number fails the operation.
    pub fn apply_update(&mut self, update: &AttributeUpdate) -> Result<(), PatchError> {
        let mut owned = update.to_owned_attribute();
        owned.ignore = self.set_ignore;

        if self.is_suppressed(&owned) {
            return Ok(());
        }

        match update.op {
            UpdateOp::Add => self.apply_add(owned),
            UpdateOp::Delete => self.apply_delete(owned),
            UpdateOp::Set => self.apply_set(owned),
        }
    }

    fn can_overwrite(&self, kind: AttributeKind, current_value: &str) -> bool {
        let owned = OwnedAttribute::new(kind, AttributeValue::Text(current_value.to_string()));
        let (owners, _) = self.find_owners(&owned);
        self.resolver.is_allowed(&self.importer, &owners)
    }

    fn apply_first_name(&mut self, imported: &Customer) {
        if imported.first_name.is_empty() {
            return;
        }

        let owned = OwnedAttribute::first_name(&imported.first_name).with_ignore(self.set_ignore);
        if self.is_suppressed(&owned) {
            return;
        }

        let (_, exists) = self.find_owners(&owned);
        if !exists {
            self.record_ownership(owned);
        }

        // first_name always fills an empty field, regardless of owners.
        // last_name is stricter; see apply_last_name.
        let current = self.result.first_name.clone();
        if current.is_empty() || self.can_overwrite(AttributeKind::FirstName, &current) {
            self.result.first_name = imported.first_name.clone();
        }
    }

    fn apply_last_name(&mut self, imported: &Customer) {
        if imported.last_name.is_empty() {
            return;
        }

        let owned = OwnedAttribute::last_name(&imported.last_name).with_ignore(self.set_ignore);
        if self.is_suppressed(&owned) {
            return;
        }

        let (owners, exists) = self.find_owners(&owned);
        if !exists {
            self.record_ownership(owned);
        }

        // An empty field is only filled when nobody else claims the value (or
        // priority clears the claim); an occupied field requires overwrite
        // permission against the current value's owners.
        let current = self.result.last_name.clone();
        let allowed = if current.is_empty() {
            owners.is_empty() || self.resolver.is_allowed(&self.importer, &owners)
        } else {
            self.can_overwrite(AttributeKind::LastName, &current)
        };
        if allowed {
            self.result.last_name = imported.last_name.clone();
        }
    }

    fn apply_text_list(&mut self, kind: AttributeKind, values: &[String]) {
        for value in values {
            let owned = OwnedAttribute::new(kind, AttributeValue::Text(value.clone()))
                .with_ignore(self.set_ignore);
            if self.is_suppressed(&owned) {
                continue;
            }

            let (owners, exists) = self.find_owners(&owned);
            if !exists {
                self.record_ownership(owned);
            }

            // Already-owned values are already present on the result; the new
            // importer just shares ownership.
            if owners.is_empty() {
                match kind {
                    AttributeKind::EmailAddress => {
                        self.result.email_addresses.push(value.clone());
                    }
                    AttributeKind::PhoneNumber => {
                        self.result.phone_numbers.push(value.clone());
                    }
                    _ => {}
                }
            }
        }
    }

    fn apply_addresses(&mut self, imported: &Customer) {
        for address in &imported.addresses {
            let owned = OwnedAttribute::address(address.clone()).with_ignore(self.set_ignore);
            if self.is_suppressed(&owned) {
                continue;
            }

            let (owners, exists) = self.find_owners(&owned);
            if !exists {
                self.record_ownership(owned);
            }

            if owners.is_empty() {
                self.result.addresses.push(address.clone());
            }
        }
    }

    /// Drop every assertion of this importer that the incoming snapshot no
    /// longer contains. This is how a source retracts a fact by omission.
    fn prune(&mut self, imported: &Customer) -> Result<(), PatchError> {
        let attributes = std::mem::take(&mut self.states[self.current].owned_attributes);
        let mut kept = Vec::with_capacity(attributes.len());

        for owned in attributes {
            let present = imported
                .contains_value(owned.kind, &owned.value)
                .ok_or(PatchError::ValueShape {
                    kind: owned.kind,
                    expected: expected_shape(owned.kind),
                })?;

            if present {
                kept.push(owned);
            } else {
                tracing::debug!(
                    importer = %self.importer,
                    kind = %owned.kind,
                    value = %owned.value,
                    "pruning retracted attribute"
                );
                self.changes += 1;
            }
        }

        self.states[self.current].owned_attributes = kept;
        Ok(())
    }

    /// Remove every value from the result that no state owns anymore.
    fn cleanup(&mut self) {
        if !self.result.first_name.is_empty() {
            let owned = OwnedAttribute::first_name(self.result.first_name.clone());
            if self.find_owners(&owned).0.is_empty() {
                self.result.first_name.clear();
            }
        }

        if !self.result.last_name.is_empty() {
            let owned = OwnedAttribute::last_name(self.result.last_name.clone());
            if self.find_owners(&owned).0.is_empty() {
                self.result.last_name.clear();
            }
        }

        let mails = std::mem::take(&mut self.result.email_addresses);
        self.result.email_addresses = mails
            .into_iter()
            .filter(|mail| {
                !self
                    .find_owners(&OwnedAttribute::email(mail.clone()))
                    .0
                    .is_empty()
            })
            .collect();

        let phones = std::mem::take(&mut self.result.phone_numbers);
        self.result.phone_numbers = phones
            .into_iter()
            .filter(|p| {
                !self
                    .find_owners(&OwnedAttribute::phone(p.clone()))
                    .0
                    .is_empty()
            })
            .collect();

        let addresses = std::mem::take(&mut self.result.addresses);
        self.result.addresses = addresses
            .into_iter()
            .filter(|a| {
                !self
                    .find_owners(&OwnedAttribute::address(a.clone()))
                    .0
                    .is_empty()
            })
            .collect();
    }

    fn apply_add(&mut self, owned: OwnedAttribute) -> Result<(), PatchError> {
        let owned = match owned.kind {
            AttributeKind::PhoneNumber => {
                let raw = owned.value.as_text().ok_or(PatchError::ValueShape {
                    kind: owned.kind,
                    expected: "text",
                })?;
                let formatted = self.phone.parse(raw)?;
                OwnedAttribute::new(owned.kind, AttributeValue::Text(formatted))
                    .with_ignore(owned.ignore)
            }
            AttributeKind::EmailAddress => {
                if owned.value.as_text().is_none() {
                    return Err(PatchError::ValueShape {
                        kind: owned.kind,
                        expected: "text",
                    });
                }
                owned
            }
            AttributeKind::Address => {
                if owned.value.as_address().is_none() {
                    return Err(PatchError::ValueShape {
                        kind: owned.kind,
                        expected: "address",
                    });
                }
                owned
            }
            kind => {
                return Err(PatchError::UnsupportedOperation {
                    kind,
                    op: UpdateOp::Add,
                })
            }
        };

        let (_, exists) = self.find_owners(&owned);
        if exists {
            return Ok(());
        }

        match (&owned.kind, &owned.value) {
            (AttributeKind::PhoneNumber, AttributeValue::Text(v)) => {
                add_to_set(&mut self.result.phone_numbers, v.clone());
            }
            (AttributeKind::EmailAddress, AttributeValue::Text(v)) => {
                add_to_set(&mut self.result.email_addresses, v.clone());
            }
            (AttributeKind::Address, AttributeValue::Address(v)) => {
                add_to_set(&mut self.result.addresses, v.clone());
            }
            _ => unreachable!("shape validated above"),
        }
        self.record_ownership(owned);

        Ok(())
    }

    fn apply_delete(&mut self, owned: OwnedAttribute) -> Result<(), PatchError> {
        let owned = match owned.kind {
            AttributeKind::PhoneNumber => {
                let raw = owned.value.as_text().ok_or(PatchError::ValueShape {
                    kind: owned.kind,
                    expected: "text",
                })?;
                // Deletes arrive in whatever form the source last saw; match
                // against the stored canonical form.
                let formatted = self.phone.normalize(raw);
                OwnedAttribute::new(owned.kind, AttributeValue::Text(formatted))
            }
            AttributeKind::EmailAddress | AttributeKind::Address => owned,
            kind => {
                return Err(PatchError::UnsupportedOperation {
                    kind,
                    op: UpdateOp::Delete,
                })
            }
        };

        let state = &mut self.states[self.current];
        let Some(idx) = state.owned_attributes.iter().position(|a| a == &owned) else {
            return Ok(());
        };
        state.owned_attributes.remove(idx);
        self.changes += 1;

        let (owners, _) = self.find_owners(&owned);
        if owners.is_empty() {
            match (&owned.kind, &owned.value) {
                (AttributeKind::PhoneNumber, AttributeValue::Text(v)) => {
                    self.result.phone_numbers.retain(|p| p != v);
                }
                (AttributeKind::EmailAddress, AttributeValue::Text(v)) => {
                    self.result.email_addresses.retain(|m| m != v);
                }
                (AttributeKind::Address, AttributeValue::Address(v)) => {
                    self.result.addresses.retain(|a| a != v);
                }
                _ => {
                    return Err(PatchError::ValueShape {
                        kind: owned.kind,
                        expected: expected_shape(owned.kind),
                    })
                }
            }
        }

        Ok(())
    }

    fn apply_set(&mut self, owned: OwnedAttribute) -> Result<(), PatchError> {
        let kind = owned.kind;
        if !matches!(kind, AttributeKind::FirstName | AttributeKind::LastName) {
            return Err(PatchError::UnsupportedOperation {
                kind,
                op: UpdateOp::Set,
            });
        }
        let value = owned
            .value
            .as_text()
            .ok_or(PatchError::ValueShape {
                kind,
                expected: "text",
            })?
            .to_string();

        // Setting the empty string is a retraction.
        if value.is_empty() {
            let state = &mut self.states[self.current];
            let before = state.owned_attributes.len();
            state.owned_attributes.retain(|a| a.kind != kind);
            let removed = before - state.owned_attributes.len();
            self.changes += removed as u64;

            let current_value = self.scalar(kind).to_string();
            if !current_value.is_empty() && !self.can_keep(kind, &current_value) {
                self.set_scalar(kind, String::new());
            }
            return Ok(());
        }

        let (owners, exists) = self.find_owners(&owned);
        if !exists {
            // A SET replaces this importer's previous assertion of the kind.
            let replaced = {
                let state = &mut self.states[self.current];
                let before = state.owned_attributes.len();
                state
                    .owned_attributes
                    .retain(|a| a.kind != kind || a.value == owned.value);
                (before - state.owned_attributes.len()) as u64
            };
            self.changes += replaced;
            self.record_ownership(owned);
        }

        let current_value = self.scalar(kind).to_string();
        let allowed = if current_value.is_empty() {
            match kind {
                AttributeKind::FirstName => true,
                _ => owners.is_empty() || self.resolver.is_allowed(&self.importer, &owners),
            }
        } else {
            self.can_overwrite(kind, &current_value)
        };

        if allowed {
            self.set_scalar(kind, value);
        }

        Ok(())
    }

    fn scalar(&self, kind: AttributeKind) -> &str {
        match kind {
            AttributeKind::FirstName => &self.result.first_name,
            AttributeKind::LastName => &self.result.last_name,
            _ => "",
        }
    }

    fn set_scalar(&mut self, kind: AttributeKind, value: String) {
        match kind {
            AttributeKind::FirstName => self.result.first_name = value,
            AttributeKind::LastName => self.result.last_name = value,
            _ => {}
        }
    }

    /// Whether the current scalar value is still owned by anyone.
    fn can_keep(&self, kind: AttributeKind, value: &str) -> bool {
        let owned = OwnedAttribute::new(kind, AttributeValue::Text(value.to_string()));
        !self.find_owners(&owned).0.is_empty()
    }

    fn record_ownership(&mut self, owned: OwnedAttribute) {
        self.states[self.current].owned_attributes.push(owned);
        self.changes += 1;
    }

    /// All importers asserting this fact, and whether the current state is
    /// among them.
    fn find_owners(&self, owned: &OwnedAttribute) -> (Vec<String>, bool) {
        let mut owners = Vec::new();
        let mut exists = false;

        for (idx, state) in self.states.iter().enumerate() {
            for attribute in &state.owned_attributes {
                if attribute == owned {
                    if idx == self.current {
                        exists = true;
                    }
                    owners.push(state.importer.clone());
                }
            }
        }

        (owners, exists)
    }

    /// Whether another importer has marked this fact as suppressed.
    ///
    /// Scalar kinds are suppressed kind-wide (a pinned first name blocks any
    /// imported first name); list kinds are suppressed per value.
    fn is_suppressed(&self, owned: &OwnedAttribute) -> bool {
        let kind_wide = matches!(
            owned.kind,
            AttributeKind::FirstName | AttributeKind::LastName
        );

        self.states.iter().any(|state| {
            state.importer != self.importer
                && state.owned_attributes.iter().any(|attribute| {
                    attribute.ignore
                        && attribute.kind == owned.kind
                        && (kind_wide || attribute.value == owned.value)
                })
        })
    }
}
