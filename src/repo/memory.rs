//! In-memory repository backend.
//!
//! A map store behind one coarse reader/writer lock. Data does not survive
//! restarts; the daemon uses this when no database path is configured.

use super::{paginate, Backend, LockGuard, Page, RepoError, RepoResult};
use crate::ids;
use crate::model::{Customer, CustomerRecord, ImportState, Pagination};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    /// Records by customer id. BTreeMap keeps listing order deterministic.
    customers: BTreeMap<String, CustomerRecord>,
    /// Advisory locks: customer id -> lock id.
    locks: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F>(&self, predicate: F, pagination: Option<&Pagination>) -> Page
    where
        F: Fn(&CustomerRecord) -> bool,
    {
        let inner = self.inner.read();
        let matches: Vec<CustomerRecord> = inner
            .customers
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect();
        paginate(matches, pagination)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn store(&self, mut customer: Customer, states: Vec<ImportState>) -> RepoResult<String> {
        let mut inner = self.inner.write();

        if customer.id.is_empty() {
            customer.id = ids::generate(32);
        }

        let id = customer.id.clone();
        inner
            .customers
            .insert(id.clone(), CustomerRecord::new(customer, states));

        Ok(id)
    }

    async fn lock(&self, id: &str) -> RepoResult<LockGuard> {
        let mut inner = self.inner.write();

        if inner.locks.contains_key(id) {
            return Err(RepoError::Locked { id: id.to_string() });
        }

        let lock_id = ids::generate(32);
        inner.locks.insert(id.to_string(), lock_id.clone());

        let shared = self.inner.clone();
        let id = id.to_string();
        Ok(LockGuard::new(move || {
            let mut inner = shared.write();
            match inner.locks.get(&id) {
                Some(stored) if *stored == lock_id => {
                    inner.locks.remove(&id);
                }
                _ => {
                    tracing::error!(customer_id = %id, "customer lock table is inconsistent");
                    debug_assert!(false, "customer lock table is inconsistent");
                }
            }
        }))
    }

    async fn list(&self, pagination: Option<&Pagination>) -> RepoResult<Page> {
        Ok(self.collect(|_| true, pagination))
    }

    async fn lookup_by_id(&self, id: &str) -> RepoResult<CustomerRecord> {
        let inner = self.inner.read();
        inner.customers.get(id).cloned().ok_or(RepoError::NotFound)
    }

    async fn lookup_by_ref(&self, importer: &str, reference: &str) -> RepoResult<CustomerRecord> {
        let inner = self.inner.read();
        inner
            .customers
            .values()
            .find(|record| {
                record
                    .states
                    .iter()
                    .any(|s| s.importer == importer && s.internal_reference == reference)
            })
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn lookup_by_name(
        &self,
        name: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        let needle = name.to_lowercase();
        Ok(self.collect(
            |record| record.customer.display_name().to_lowercase().contains(&needle),
            pagination,
        ))
    }

    async fn lookup_by_phone(
        &self,
        phone: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        Ok(self.collect(
            |record| record.customer.phone_numbers.iter().any(|p| p == phone),
            pagination,
        ))
    }

    async fn lookup_by_mail(
        &self,
        mail: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        Ok(self.collect(
            |record| record.customer.email_addresses.iter().any(|m| m == mail),
            pagination,
        ))
    }
}
