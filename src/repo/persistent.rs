//! RocksDB-backed repository backend.
//!
//! Layout: one column family per collection plus secondary index families.
//! `customers` holds the full record document keyed by id; `locks` holds
//! advisory lock documents with a TTL. Index families map phone numbers,
//! email addresses, `(importer, reference)` pairs, and lowercased display
//! names back to customer ids. Document and index writes share one
//! `WriteBatch` so a store is atomic.

use super::{paginate, Backend, LockGuard, Page, RepoError, RepoResult};
use crate::model::{Customer, CustomerQuery, CustomerRecord, ImportState, Pagination};
use crate::phone;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const CF_CUSTOMERS: &str = "customers";
const CF_LOCKS: &str = "locks";
const CF_INDEX_PHONE: &str = "index_phone";
const CF_INDEX_EMAIL: &str = "index_email";
const CF_INDEX_REF: &str = "index_ref";
const CF_INDEX_NAME: &str = "index_name";

/// Separates key components; never appears in phone numbers or mails.
const KEY_SEP: u8 = 0x1f;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize, Deserialize)]
struct LockDoc {
    id: String,
    lock_id: String,
    locked_at: u64,
}

pub struct PersistentBackend {
    db: Arc<DB>,
    /// Serializes lock check-and-set; RocksDB has no compare-and-swap.
    lock_table: Arc<Mutex<()>>,
    phone: phone::Normalizer,
    lock_ttl: Duration,
}

impl PersistentBackend {
    pub fn open(
        path: impl AsRef<Path>,
        normalizer: phone::Normalizer,
        lock_ttl: Duration,
    ) -> RepoResult<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let descriptors = [
            CF_CUSTOMERS,
            CF_LOCKS,
            CF_INDEX_PHONE,
            CF_INDEX_EMAIL,
            CF_INDEX_REF,
            CF_INDEX_NAME,
        ]
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&options, path.as_ref(), descriptors)
            .context("failed to open customer database")?;

        Ok(Self {
            db: Arc::new(db),
            lock_table: Arc::new(Mutex::new(())),
            phone: normalizer,
            lock_ttl,
        })
    }

    fn cf(&self, name: &str) -> RepoResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RepoError::Backend(anyhow::anyhow!("missing column family {name}")))
    }

    fn load(&self, id: &str) -> RepoResult<CustomerRecord> {
        let raw = self
            .db
            .get_cf(self.cf(CF_CUSTOMERS)?, id.as_bytes())
            .context("failed to read customer document")?
            .ok_or(RepoError::NotFound)?;

        let record: CustomerRecord =
            serde_json::from_slice(&raw).context("failed to decode customer document")?;
        Ok(record)
    }

    fn load_many(&self, ids: impl IntoIterator<Item = String>) -> RepoResult<Vec<CustomerRecord>> {
        let mut records = Vec::new();
        for id in ids {
            match self.load(&id) {
                Ok(record) => records.push(record),
                // A dangling index entry is not fatal for a search.
                Err(RepoError::NotFound) => {
                    tracing::warn!(customer_id = %id, "dangling index entry");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    fn index_key(value: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(value.len() + id.len() + 1);
        key.extend_from_slice(value.as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn ref_key(importer: &str, reference: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(importer.len() + reference.len() + 1);
        key.extend_from_slice(importer.as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(reference.as_bytes());
        key
    }

    /// Ids under `prefix` in a value-prefixed index family.
    fn scan_index(&self, cf_name: &str, value: &str) -> RepoResult<Vec<String>> {
        let cf = self.cf(cf_name)?;
        let mut prefix = value.as_bytes().to_vec();
        prefix.push(KEY_SEP);

        let mut ids = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry.context("index scan failed")?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(ids)
    }

    fn put_indexes(&self, batch: &mut WriteBatch, record: &CustomerRecord) -> RepoResult<()> {
        let id = &record.customer.id;

        for phone in &record.customer.phone_numbers {
            batch.put_cf(self.cf(CF_INDEX_PHONE)?, Self::index_key(phone, id), id);
        }
        for mail in &record.customer.email_addresses {
            batch.put_cf(self.cf(CF_INDEX_EMAIL)?, Self::index_key(mail, id), id);
        }
        for state in &record.states {
            if !state.internal_reference.is_empty() {
                batch.put_cf(
                    self.cf(CF_INDEX_REF)?,
                    Self::ref_key(&state.importer, &state.internal_reference),
                    id,
                );
            }
        }
        batch.put_cf(
            self.cf(CF_INDEX_NAME)?,
            id.as_bytes(),
            record.customer.display_name().to_lowercase(),
        );

        Ok(())
    }

    fn delete_indexes(&self, batch: &mut WriteBatch, record: &CustomerRecord) -> RepoResult<()> {
        let id = &record.customer.id;

        for phone in &record.customer.phone_numbers {
            batch.delete_cf(self.cf(CF_INDEX_PHONE)?, Self::index_key(phone, id));
        }
        for mail in &record.customer.email_addresses {
            batch.delete_cf(self.cf(CF_INDEX_EMAIL)?, Self::index_key(mail, id));
        }
        for state in &record.states {
            if !state.internal_reference.is_empty() {
                batch.delete_cf(
                    self.cf(CF_INDEX_REF)?,
                    Self::ref_key(&state.importer, &state.internal_reference),
                );
            }
        }
        batch.delete_cf(self.cf(CF_INDEX_NAME)?, id.as_bytes());

        Ok(())
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Substring match over the lowercased name index. The persistent
    /// rendition of the text index: any term hit qualifies.
    fn name_matches(&self, terms: &[String]) -> RepoResult<BTreeSet<String>> {
        let cf = self.cf(CF_INDEX_NAME)?;
        let needles: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();

        let mut ids = BTreeSet::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = entry.context("name index scan failed")?;
            let name = String::from_utf8_lossy(&value);
            if needles.iter().any(|needle| name.contains(needle.as_str())) {
                ids.insert(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl Backend for PersistentBackend {
    async fn store(&self, mut customer: Customer, states: Vec<ImportState>) -> RepoResult<String> {
        // Replacing a record that was never inserted is a caller bug and
        // surfaces as NotFound, matching lookup semantics.
        let previous = if customer.id.is_empty() {
            customer.id = Uuid::new_v4().simple().to_string();
            None
        } else {
            Some(self.load(&customer.id)?)
        };

        let id = customer.id.clone();
        let record = CustomerRecord::new(customer, states);

        // (importer, internal_reference) is unique across customers.
        for state in &record.states {
            if state.internal_reference.is_empty() {
                continue;
            }
            let key = Self::ref_key(&state.importer, &state.internal_reference);
            if let Some(raw) = self
                .db
                .get_cf(self.cf(CF_INDEX_REF)?, key)
                .context("failed to read reference index")?
            {
                let owner = String::from_utf8_lossy(&raw);
                if owner != id {
                    return Err(RepoError::InvalidArgument(format!(
                        "internal reference {}/{} already belongs to customer {}",
                        state.importer, state.internal_reference, owner
                    )));
                }
            }
        }

        let mut batch = WriteBatch::default();
        if let Some(previous) = &previous {
            self.delete_indexes(&mut batch, previous)?;
        }

        let document = serde_json::to_vec(&record).context("failed to encode customer")?;
        batch.put_cf(self.cf(CF_CUSTOMERS)?, id.as_bytes(), document);
        self.put_indexes(&mut batch, &record)?;

        self.db.write(batch).context("failed to write customer")?;
        Ok(id)
    }

    async fn lock(&self, id: &str) -> RepoResult<LockGuard> {
        let _table = self.lock_table.lock();

        let cf = self.cf(CF_LOCKS)?;
        if let Some(raw) = self
            .db
            .get_cf(cf, id.as_bytes())
            .context("failed to read lock")?
        {
            let doc: LockDoc = serde_json::from_slice(&raw).context("failed to decode lock")?;
            let age = Duration::from_secs(Self::now_secs().saturating_sub(doc.locked_at));
            if age < self.lock_ttl {
                return Err(RepoError::Locked { id: id.to_string() });
            }
            tracing::warn!(customer_id = %id, age_secs = age.as_secs(), "reclaiming expired lock");
        }

        let doc = LockDoc {
            id: id.to_string(),
            lock_id: Uuid::new_v4().simple().to_string(),
            locked_at: Self::now_secs(),
        };
        self.db
            .put_cf(
                cf,
                id.as_bytes(),
                serde_json::to_vec(&doc).context("failed to encode lock")?,
            )
            .context("failed to write lock")?;

        let db = self.db.clone();
        let table = self.lock_table.clone();
        let id = id.to_string();
        let lock_id = doc.lock_id;
        Ok(LockGuard::new(move || {
            let _table = table.lock();
            let Some(cf) = db.cf_handle(CF_LOCKS) else {
                return;
            };
            // Only delete our own lock; an expired lock may have been
            // reclaimed by another holder in the meantime.
            let ours = db
                .get_cf(cf, id.as_bytes())
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_slice::<LockDoc>(&raw).ok())
                .is_some_and(|doc| doc.lock_id == lock_id);
            if ours {
                if let Err(err) = db.delete_cf(cf, id.as_bytes()) {
                    tracing::error!(customer_id = %id, error = %err, "failed to release lock");
                }
            }
        }))
    }

    async fn list(&self, pagination: Option<&Pagination>) -> RepoResult<Page> {
        let cf = self.cf(CF_CUSTOMERS)?;
        let mut records = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry.context("customer scan failed")?;
            let record: CustomerRecord =
                serde_json::from_slice(&value).context("failed to decode customer document")?;
            records.push(record);
        }
        Ok(paginate(records, pagination))
    }

    async fn lookup_by_id(&self, id: &str) -> RepoResult<CustomerRecord> {
        self.load(id)
    }

    async fn lookup_by_ref(&self, importer: &str, reference: &str) -> RepoResult<CustomerRecord> {
        let raw = self
            .db
            .get_cf(self.cf(CF_INDEX_REF)?, Self::ref_key(importer, reference))
            .context("failed to read reference index")?
            .ok_or(RepoError::NotFound)?;

        self.load(&String::from_utf8_lossy(&raw))
    }

    async fn lookup_by_name(
        &self,
        name: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        let ids = self.name_matches(std::slice::from_ref(&name.to_string()))?;
        Ok(paginate(self.load_many(ids)?, pagination))
    }

    async fn lookup_by_phone(
        &self,
        phone: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        let ids = self.scan_index(CF_INDEX_PHONE, phone)?;
        Ok(paginate(self.load_many(dedupe(ids))?, pagination))
    }

    async fn lookup_by_mail(
        &self,
        mail: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        let ids = self.scan_index(CF_INDEX_EMAIL, mail)?;
        Ok(paginate(self.load_many(dedupe(ids))?, pagination))
    }

    /// Native multi-query search: union of id, reference, phone, and mail
    /// predicates, intersected with the name terms when present.
    async fn search_queries(
        &self,
        queries: &[CustomerQuery],
        pagination: Option<&Pagination>,
    ) -> Option<RepoResult<Page>> {
        Some(self.search_queries_impl(queries, pagination).await)
    }
}

impl PersistentBackend {
    async fn search_queries_impl(
        &self,
        queries: &[CustomerQuery],
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        if queries.is_empty() {
            return self.list(pagination).await;
        }

        let mut or_ids: BTreeSet<String> = BTreeSet::new();
        let mut has_or_predicates = false;
        let mut name_terms: Vec<String> = Vec::new();

        for query in queries {
            match query {
                CustomerQuery::Id(id) => {
                    has_or_predicates = true;
                    or_ids.insert(id.clone());
                }
                CustomerQuery::InternalReference {
                    importer,
                    reference,
                } => {
                    has_or_predicates = true;
                    if let Some(raw) = self
                        .db
                        .get_cf(self.cf(CF_INDEX_REF)?, Self::ref_key(importer, reference))
                        .context("failed to read reference index")?
                    {
                        or_ids.insert(String::from_utf8_lossy(&raw).into_owned());
                    }
                }
                CustomerQuery::PhoneNumber(value) => {
                    has_or_predicates = true;
                    let normalized = self.phone.normalize(value);
                    or_ids.extend(self.scan_index(CF_INDEX_PHONE, &normalized)?);
                }
                CustomerQuery::EmailAddress(value) => {
                    has_or_predicates = true;
                    or_ids.extend(self.scan_index(CF_INDEX_EMAIL, value)?);
                }
                CustomerQuery::Name { last_name } => {
                    if !last_name.is_empty() {
                        name_terms.push(last_name.clone());
                    }
                }
            }
        }

        let ids: BTreeSet<String> = if !name_terms.is_empty() {
            let by_name = self.name_matches(&name_terms)?;
            if has_or_predicates {
                or_ids.intersection(&by_name).cloned().collect()
            } else {
                by_name
            }
        } else {
            or_ids
        };

        let mut records = Vec::new();
        for id in ids {
            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(RepoError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(paginate(records, pagination))
    }
}

fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
