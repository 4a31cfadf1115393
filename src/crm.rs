//! # CRM Phone Lookup
//!
//! A small HTTP sidecar for telephony integrations: `GET /crm/lookup?phone=…`
//! resolves a caller id to the consolidated customer. Phone numbers in the
//! response are stripped of spaces, the way the PBX expects them.

use crate::query::Repo;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
struct CrmState {
    repo: Repo,
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    phone: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    id: String,
    first_name: String,
    last_name: String,
    phone_numbers: Vec<String>,
}

/// The CRM lookup routes on top of the shared repository.
pub fn router(repo: Repo) -> Router {
    Router::new()
        .route("/crm/lookup", get(lookup))
        .with_state(CrmState { repo })
}

async fn lookup(State(state): State<CrmState>, Query(params): Query<LookupParams>) -> Response {
    let Some(phone) = params.phone.filter(|p| !p.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing phone number").into_response();
    };

    // lookup_by_phone canonicalizes the input with the configured region.
    let hits = match state.repo.lookup_by_phone(&phone, None).await {
        Ok((hits, _)) => hits,
        Err(err) => {
            tracing::error!(error = %err, "crm lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let Some(record) = hits.into_iter().next() else {
        return (StatusCode::NOT_FOUND, "customer not found").into_response();
    };

    let customer = record.customer;
    Json(LookupResponse {
        id: customer.id,
        first_name: customer.first_name,
        last_name: customer.last_name,
        phone_numbers: customer
            .phone_numbers
            .iter()
            .map(|p| p.replace(' ', ""))
            .collect(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Customer;
    use crate::phone;
    use crate::repo::memory::MemoryBackend;
    use std::sync::Arc;

    fn test_repo() -> Repo {
        Repo::new(
            Arc::new(MemoryBackend::new()),
            phone::Normalizer::default(),
        )
    }

    async fn call(repo: Repo, phone: Option<&str>) -> Response {
        lookup(
            State(CrmState { repo }),
            Query(LookupParams {
                phone: phone.map(str::to_string),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn test_missing_phone_is_bad_request() {
        let response = call(test_repo(), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call(test_repo(), Some("")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_phone_is_not_found() {
        let response = call(test_repo(), Some("+43 664 9999999")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lookup_strips_spaces_from_numbers() {
        let repo = test_repo();
        let stored = repo.phone_normalizer().normalize("0664 1234567");
        repo.store(
            Customer {
                first_name: "Alice".into(),
                last_name: "Smith".into(),
                phone_numbers: vec![stored.clone()],
                ..Default::default()
            },
            Vec::new(),
        )
        .await
        .unwrap();

        let response = call(repo, Some("0664 1234567")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(parsed["firstName"], "Alice");
        let number = parsed["phoneNumbers"][0].as_str().unwrap();
        assert!(!number.contains(' '), "got {number}");
        assert_eq!(number, stored.replace(' ', ""));
    }
}
