//! Import session protocol tests, driven through the client dispatcher over
//! in-process channels.

use custmaster::dispatcher::ImportClient;
use custmaster::model::{Customer, CustomerQuery, ImportState};
use custmaster::phone::Normalizer;
use custmaster::priority::StaticPriorityResolver;
use custmaster::query::Repo;
use custmaster::repo::memory::MemoryBackend;
use custmaster::session::{ImportSession, RequestMessage, ResponseMessage, SessionError, SessionRequest, SessionResponse};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn test_repo() -> Repo {
    Repo::new(Arc::new(MemoryBackend::new()), Normalizer::new("AT"))
}

/// Spawn a session over channels and connect a client to it.
async fn connect(
    repo: &Repo,
    importer: &str,
) -> (ImportClient, JoinHandle<Result<(), SessionError>>) {
    let (request_tx, request_rx) = mpsc::channel(16);
    let (response_tx, response_rx) = mpsc::channel(16);

    let session = ImportSession::new(repo.clone(), Arc::new(StaticPriorityResolver::standard()));
    let handle = tokio::spawn(session.handle(request_rx, response_tx, CancellationToken::new()));

    let client = ImportClient::connect(importer, request_tx, response_rx)
        .await
        .expect("handshake should succeed");

    (client, handle)
}

fn customer(first: &str, last: &str, phones: &[&str]) -> Customer {
    Customer {
        first_name: first.into(),
        last_name: last.into(),
        phone_numbers: phones.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn upsert_creates_customer_and_session_drains_on_stop() {
    let repo = test_repo();
    let (client, handle) = connect(&repo, "vetinf").await;

    let id = client
        .upsert("v-1", customer("Alice", "Smith", &["0664 1234567"]))
        .await
        .expect("upsert should succeed");
    assert!(!id.is_empty());

    let record = repo.lookup_by_id(&id).await.expect("stored record");
    assert_eq!(record.customer.first_name, "Alice");
    // Phones are canonicalized on the way in.
    assert!(record.customer.phone_numbers[0].starts_with("+43"));
    let state = record.state_for("vetinf").expect("vetinf state");
    assert_eq!(state.internal_reference, "v-1");

    client.stop().await;
    handle
        .await
        .expect("session task should not panic")
        .expect("session should complete cleanly");
}

#[tokio::test]
async fn second_upsert_with_same_reference_updates_in_place() {
    let repo = test_repo();
    let (client, handle) = connect(&repo, "vetinf").await;

    let first = client
        .upsert("v-1", customer("Alice", "Smith", &[]))
        .await
        .unwrap();
    let second = client
        .upsert("v-1", customer("Alice", "Smythe", &[]))
        .await
        .unwrap();

    assert_eq!(first, second, "the reference must resolve to one customer");
    let record = repo.lookup_by_id(&first).await.unwrap();
    assert_eq!(record.customer.last_name, "Smythe");

    let (all, _) = repo.list(None).await.unwrap();
    assert_eq!(all.len(), 1);

    client.stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_reference_adopts_unique_phone_match() {
    let repo = test_repo();
    let normalized = Normalizer::new("AT").normalize("0664 1234567");

    // An existing customer from another source with the same number.
    let existing_id = repo
        .store(
            customer("Alice", "Smith", &[&normalized]),
            vec![ImportState::new("carddav", "c-1")],
        )
        .await
        .unwrap();

    let (client, handle) = connect(&repo, "vetinf").await;
    let id = client
        .upsert("v-9", customer("Alice", "Smith", &["0664 1234567"]))
        .await
        .unwrap();

    assert_eq!(id, existing_id, "should adopt the unique phone match");

    let record = repo.lookup_by_id(&id).await.unwrap();
    let importers: Vec<_> = record.states.iter().map(|s| s.importer.clone()).collect();
    assert!(importers.contains(&"carddav".to_string()));
    assert!(importers.contains(&"vetinf".to_string()));

    client.stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn ambiguous_phone_match_creates_a_new_customer() {
    let repo = test_repo();
    let normalized = Normalizer::new("AT").normalize("0664 1234567");

    for reference in ["c-1", "c-2"] {
        repo.store(
            customer("Alice", "Smith", &[&normalized]),
            vec![ImportState::new("carddav", reference)],
        )
        .await
        .unwrap();
    }

    let (client, handle) = connect(&repo, "vetinf").await;
    let id = client
        .upsert("v-9", customer("Alice", "Smith", &["0664 1234567"]))
        .await
        .unwrap();

    let (all, _) = repo.list(None).await.unwrap();
    assert_eq!(all.len(), 3, "ambiguous matches must not be adopted");
    assert!(all.iter().any(|r| r.customer.id == id));

    client.stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn lookup_defaults_reference_importer_to_session_identity() {
    let repo = test_repo();
    let (client, handle) = connect(&repo, "vetinf").await;

    client
        .upsert("v-1", customer("Alice", "Smith", &[]))
        .await
        .unwrap();

    let matched = client
        .lookup(CustomerQuery::InternalReference {
            importer: String::new(),
            reference: "v-1".into(),
        })
        .await
        .unwrap();

    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].customer.first_name, "Alice");
    let state = matched[0].state.as_ref().expect("own state should be attached");
    assert_eq!(state.importer, "vetinf");

    // A lookup that misses returns an empty match list, not an error.
    let matched = client
        .lookup(CustomerQuery::PhoneNumber("+43 664 999999".into()))
        .await
        .unwrap();
    assert!(matched.is_empty());

    client.stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn locked_customer_yields_error_response_and_session_survives() {
    let repo = test_repo();
    let id = repo
        .store(customer("Alice", "Smith", &[]), vec![ImportState::new("vetinf", "v-1")])
        .await
        .unwrap();

    let guard = repo.lock(&id).await.unwrap();

    let (client, handle) = connect(&repo, "vetinf").await;
    let err = client
        .upsert("v-1", customer("Alicia", "Smith", &[]))
        .await
        .expect_err("locked customer must fail the upsert");
    assert!(err.to_string().contains("locked"), "got: {err}");

    // The session keeps serving after an error response.
    drop(guard);
    client
        .upsert("v-1", customer("Alicia", "Smith", &[]))
        .await
        .expect("upsert should succeed after unlock");

    let record = repo.lookup_by_id(&id).await.unwrap();
    assert_eq!(record.customer.first_name, "Alicia");

    client.stop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_upserts_resolve_by_correlation_id() {
    let repo = test_repo();
    let (client, handle) = connect(&repo, "vetinf").await;
    let client = Arc::new(client);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .upsert(
                    format!("v-{i}"),
                    customer(&format!("F{i}"), &format!("L{i}"), &[]),
                )
                .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().expect("upsert should succeed"));
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20, "every reference creates its own customer");

    let (all, total) = repo.list(None).await.unwrap();
    assert_eq!((all.len(), total), (20, 20));

    Arc::try_unwrap(client)
        .unwrap_or_else(|_| panic!("client still shared"))
        .stop()
        .await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn session_rejects_missing_or_invalid_start() {
    let repo = test_repo();

    // First message is not StartSession.
    let (request_tx, request_rx) = mpsc::channel::<SessionRequest>(4);
    let (response_tx, _response_rx) = mpsc::channel::<SessionResponse>(4);
    let session = ImportSession::new(repo.clone(), Arc::new(StaticPriorityResolver::standard()));
    let handle = tokio::spawn(session.handle(request_rx, response_tx, CancellationToken::new()));

    request_tx
        .send(SessionRequest {
            correlation_id: "x".into(),
            message: RequestMessage::Complete,
        })
        .await
        .unwrap();
    assert!(matches!(
        handle.await.unwrap(),
        Err(SessionError::InvalidArgument(_))
    ));

    // Empty importer fails too.
    let (request_tx, request_rx) = mpsc::channel::<SessionRequest>(4);
    let (response_tx, _response_rx) = mpsc::channel::<SessionResponse>(4);
    let session = ImportSession::new(repo, Arc::new(StaticPriorityResolver::standard()));
    let handle = tokio::spawn(session.handle(request_rx, response_tx, CancellationToken::new()));

    request_tx
        .send(SessionRequest {
            correlation_id: "y".into(),
            message: RequestMessage::StartSession {
                importer: String::new(),
            },
        })
        .await
        .unwrap();
    assert!(matches!(
        handle.await.unwrap(),
        Err(SessionError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn eof_without_complete_still_drains() {
    let repo = test_repo();

    let (request_tx, request_rx) = mpsc::channel::<SessionRequest>(4);
    let (response_tx, mut response_rx) = mpsc::channel::<SessionResponse>(4);
    let session = ImportSession::new(repo.clone(), Arc::new(StaticPriorityResolver::standard()));
    let handle = tokio::spawn(session.handle(request_rx, response_tx, CancellationToken::new()));

    request_tx
        .send(SessionRequest {
            correlation_id: "start".into(),
            message: RequestMessage::StartSession {
                importer: "vetinf".into(),
            },
        })
        .await
        .unwrap();
    request_tx
        .send(SessionRequest {
            correlation_id: "u-1".into(),
            message: RequestMessage::UpsertCustomer {
                internal_reference: "v-1".into(),
                customer: customer("Alice", "Smith", &[]),
            },
        })
        .await
        .unwrap();

    // Hang up without Complete.
    drop(request_tx);

    handle.await.unwrap().expect("EOF is a clean termination");

    // Ack plus the upsert result must have been flushed before shutdown.
    let ack = response_rx.recv().await.expect("ack");
    assert_eq!(ack.message, ResponseMessage::StartSessionAck);
    let upsert = response_rx.recv().await.expect("upsert response");
    assert_eq!(upsert.correlation_id, "u-1");
    assert!(matches!(upsert.message, ResponseMessage::UpsertSuccess { .. }));

    let (all, _) = repo.list(None).await.unwrap();
    assert_eq!(all.len(), 1);
}
