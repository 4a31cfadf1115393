//! # Query Execution
//!
//! Wraps a repository backend with query planning: single queries dispatch to
//! the matching lookup, multi-query searches delegate to the backend's native
//! capability when present and otherwise union the per-query results,
//! deduplicate by customer id, and paginate.

use crate::model::{Customer, CustomerQuery, CustomerRecord, ImportState, Pagination};
use crate::phone;
use crate::repo::{Backend, LockGuard, Page, RepoError, RepoResult};
use std::collections::HashSet;
use std::sync::Arc;

/// The repository handle used by services and sessions.
#[derive(Clone)]
pub struct Repo {
    backend: Arc<dyn Backend>,
    phone: phone::Normalizer,
}

impl Repo {
    pub fn new(backend: Arc<dyn Backend>, phone: phone::Normalizer) -> Self {
        Self { backend, phone }
    }

    pub fn phone_normalizer(&self) -> phone::Normalizer {
        self.phone
    }

    pub async fn store(&self, customer: Customer, states: Vec<ImportState>) -> RepoResult<String> {
        self.backend.store(customer, states).await
    }

    pub async fn lock(&self, id: &str) -> RepoResult<LockGuard> {
        self.backend.lock(id).await
    }

    pub async fn list(&self, pagination: Option<&Pagination>) -> RepoResult<Page> {
        self.backend.list(pagination).await
    }

    pub async fn lookup_by_id(&self, id: &str) -> RepoResult<CustomerRecord> {
        self.backend.lookup_by_id(id).await
    }

    pub async fn lookup_by_ref(
        &self,
        importer: &str,
        reference: &str,
    ) -> RepoResult<CustomerRecord> {
        self.backend.lookup_by_ref(importer, reference).await
    }

    /// Exact phone lookup; the input is canonicalized first.
    pub async fn lookup_by_phone(
        &self,
        phone: &str,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        let normalized = self.phone.normalize(phone);
        self.backend.lookup_by_phone(&normalized, pagination).await
    }

    /// Execute a single query. A missing query lists all customers; by-id and
    /// by-reference misses yield an empty result rather than an error.
    pub async fn search_query(
        &self,
        query: Option<&CustomerQuery>,
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        let Some(query) = query else {
            return self.backend.list(pagination).await;
        };

        match query {
            CustomerQuery::Id(id) => self.single_record(self.backend.lookup_by_id(id).await),
            CustomerQuery::InternalReference {
                importer,
                reference,
            } => self.single_record(self.backend.lookup_by_ref(importer, reference).await),
            CustomerQuery::Name { last_name } => {
                self.backend.lookup_by_name(last_name, pagination).await
            }
            CustomerQuery::PhoneNumber(value) => self.lookup_by_phone(value, pagination).await,
            CustomerQuery::EmailAddress(value) => {
                self.backend.lookup_by_mail(value, pagination).await
            }
        }
    }

    /// Execute a list of queries and return the deduplicated union.
    ///
    /// Prefers the backend's native multi-query search. The fallback runs
    /// each query unpaginated, keeps the first occurrence per customer id,
    /// and slices afterwards; result ordering is not guaranteed there.
    pub async fn search_queries(
        &self,
        queries: &[CustomerQuery],
        pagination: Option<&Pagination>,
    ) -> RepoResult<Page> {
        if let Some(native) = self.backend.search_queries(queries, pagination).await {
            return native;
        }

        if queries.is_empty() {
            return self.backend.list(pagination).await;
        }

        let mut results: Vec<CustomerRecord> = Vec::new();
        for query in queries {
            let (records, _) = self.search_query(Some(query), None).await?;
            results.extend(records);
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(results.len());
        let deduplicated: Vec<CustomerRecord> = results
            .into_iter()
            .filter(|record| seen.insert(record.customer.id.clone()))
            .collect();

        let total = deduplicated.len();
        match pagination {
            Some(p) if p.page_size > 0 => {
                let start = p.page_size.saturating_mul(p.page).min(total);
                let end = start.saturating_add(p.page_size).min(total);
                Ok((deduplicated[start..end].to_vec(), total))
            }
            _ => Ok((deduplicated, total)),
        }
    }

    fn single_record(&self, result: RepoResult<CustomerRecord>) -> RepoResult<Page> {
        match result {
            Ok(record) => Ok((vec![record], 1)),
            Err(RepoError::NotFound) => Ok((Vec::new(), 0)),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Customer;
    use crate::repo::memory::MemoryBackend;

    fn repo() -> Repo {
        Repo::new(
            Arc::new(MemoryBackend::new()),
            phone::Normalizer::default(),
        )
    }

    async fn seed(repo: &Repo, first: &str, last: &str, phone: &str, mail: &str) -> String {
        repo.store(
            Customer {
                first_name: first.into(),
                last_name: last.into(),
                phone_numbers: vec![phone.into()],
                email_addresses: vec![mail.into()],
                ..Default::default()
            },
            Vec::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_query_dispatch() {
        let repo = repo();
        let id = seed(&repo, "Alice", "Smith", "+43 1 1111111", "a@x").await;

        let (hits, total) = repo
            .search_query(Some(&CustomerQuery::Id(id.clone())), None)
            .await
            .unwrap();
        assert_eq!((hits.len(), total), (1, 1));

        let (hits, _) = repo
            .search_query(Some(&CustomerQuery::Id("missing".into())), None)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let (hits, _) = repo
            .search_query(
                Some(&CustomerQuery::Name {
                    last_name: "smi".into(),
                }),
                None,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        // No query means list-all.
        let (hits, _) = repo.search_query(None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].customer.id, id);
    }

    #[tokio::test]
    async fn test_phone_query_is_normalized() {
        let repo = repo();
        let normalized = repo.phone_normalizer().normalize("0664 1234567");
        seed(&repo, "Alice", "Smith", &normalized, "a@x").await;

        // A differently formatted input should still hit the stored form.
        let (hits, _) = repo
            .search_query(
                Some(&CustomerQuery::PhoneNumber("+43 664 1234567".into())),
                None,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_search_queries_deduplicates_by_id() {
        let repo = repo();
        seed(&repo, "Alice", "Smith", "+43 1 1111111", "a@x").await;

        // Both queries match the same customer.
        let (hits, total) = repo
            .search_queries(
                &[
                    CustomerQuery::EmailAddress("a@x".into()),
                    CustomerQuery::Name {
                        last_name: "Smith".into(),
                    },
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_search_queries_pagination_slices_after_dedup() {
        let repo = repo();
        for i in 0..5 {
            seed(
                &repo,
                &format!("F{i}"),
                "Common",
                &format!("+43 1 000{i}"),
                &format!("{i}@x"),
            )
            .await;
        }

        let queries = [CustomerQuery::Name {
            last_name: "Common".into(),
        }];

        let (page, total) = repo
            .search_queries(&queries, Some(&Pagination::new(2, 1)))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);

        // Out-of-range pages are empty, not a panic.
        let (page, total) = repo
            .search_queries(&queries, Some(&Pagination::new(2, 9)))
            .await
            .unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_empty_query_list_lists_all() {
        let repo = repo();
        seed(&repo, "Alice", "Smith", "+43 1 1111111", "a@x").await;
        seed(&repo, "Bob", "Jones", "+43 1 2222222", "b@x").await;

        let (hits, total) = repo.search_queries(&[], None).await.unwrap();
        assert_eq!((hits.len(), total), (2, 2));
    }
}
