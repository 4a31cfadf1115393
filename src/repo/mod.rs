//! # Customer Repository
//!
//! The storage contract the merge engine and services consume: durable
//! customer records, multi-predicate lookups with pagination, and a
//! per-customer advisory lock. Two backends implement it, an in-memory map
//! store and a RocksDB-backed persistent store.

pub mod memory;
pub mod persistent;

use crate::model::{
    Customer, CustomerQuery, CustomerRecord, ImportState, Pagination, SortDirection,
};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("customer not found")]
    NotFound,
    #[error("customer {id} is already locked")]
    Locked { id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound)
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Releases an advisory customer lock when dropped.
///
/// Backends construct the guard with whatever release action they need; the
/// release runs exactly once.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A guard that releases nothing. Used where no lock was taken.
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("armed", &self.release.is_some())
            .finish()
    }
}

/// A page of results plus the total match count before paging.
pub type Page = (Vec<CustomerRecord>, usize);

/// Storage backend contract.
///
/// `store` is transactional with respect to any holder of `lock(id)`;
/// callers that mutate an existing customer must hold its lock through the
/// store call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Upsert a customer record. Assigns and returns a fresh id when the
    /// customer has none.
    async fn store(&self, customer: Customer, states: Vec<ImportState>) -> RepoResult<String>;

    /// Take the exclusive advisory lock for a customer id.
    /// Returns [`RepoError::Locked`] when already held.
    async fn lock(&self, id: &str) -> RepoResult<LockGuard>;

    async fn list(&self, pagination: Option<&Pagination>) -> RepoResult<Page>;

    async fn lookup_by_id(&self, id: &str) -> RepoResult<CustomerRecord>;

    async fn lookup_by_ref(&self, importer: &str, reference: &str) -> RepoResult<CustomerRecord>;

    /// Case-insensitive substring match over `"last_name first_name"`.
    async fn lookup_by_name(&self, name: &str, pagination: Option<&Pagination>)
        -> RepoResult<Page>;

    /// Exact match on the normalized phone number.
    async fn lookup_by_phone(
        &self,
        phone: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page>;

    async fn lookup_by_mail(&self, mail: &str, pagination: Option<&Pagination>)
        -> RepoResult<Page>;

    /// Native multi-query search, where the backend supports it. The default
    /// reports no support and the caller falls back to per-query union.
    async fn search_queries(
        &self,
        queries: &[CustomerQuery],
        pagination: Option<&Pagination>,
    ) -> Option<RepoResult<Page>> {
        let _ = (queries, pagination);
        None
    }
}

/// Sort records in place by the requested fields. Unknown field names are
/// skipped. Ties fall through to the next field.
pub(crate) fn sort_records(records: &mut [CustomerRecord], pagination: Option<&Pagination>) {
    let Some(pagination) = pagination else {
        return;
    };
    if pagination.sort_by.is_empty() {
        return;
    }

    records.sort_by(|a, b| {
        for field in &pagination.sort_by {
            let ordering = match field.field_name.as_str() {
                "lastName" | "last_name" => a.customer.last_name.cmp(&b.customer.last_name),
                "firstName" | "first_name" => a.customer.first_name.cmp(&b.customer.first_name),
                "id" | "_id" => a.customer.id.cmp(&b.customer.id),
                _ => std::cmp::Ordering::Equal,
            };
            let ordering = match field.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Slice one page out of the full match set. The returned total is the
/// pre-slice count; a page beyond the end yields an empty page.
pub(crate) fn paginate(mut records: Vec<CustomerRecord>, pagination: Option<&Pagination>) -> Page {
    sort_records(&mut records, pagination);

    let total = records.len();
    match pagination {
        Some(p) if p.page_size > 0 => {
            let start = p.page_size.saturating_mul(p.page).min(total);
            let end = start.saturating_add(p.page_size).min(total);
            (records[start..end].to_vec(), total)
        }
        _ => (records, total),
    }
}
