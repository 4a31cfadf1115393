//! # Import Session
//!
//! Server side of the bidirectional import protocol. After a `StartSession`
//! handshake pins the importer identity, every lookup and upsert request is
//! handled in its own task; responses are funneled through one bounded send
//! queue and correlated back to their requests by id. `Complete` or end of
//! stream drains in-flight work before the session returns.
//!
//! The session is transport-agnostic: the gRPC layer adapts its stream to
//! [`RequestStream`] / [`ResponseSink`], and tests drive the protocol over
//! plain channels.

use crate::model::{Customer, CustomerQuery, CustomerRecord, ImportState};
use crate::patcher::Patcher;
use crate::priority::PriorityResolver;
use crate::query::Repo;
use crate::repo::{LockGuard, RepoError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-session response queue. A slow receiver eventually
/// stalls the handlers, which is the intended backpressure.
const SEND_QUEUE_CAPACITY: usize = 100;

/// A request received from the importer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub correlation_id: String,
    pub message: RequestMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    StartSession {
        importer: String,
    },
    LookupCustomer {
        query: CustomerQuery,
    },
    UpsertCustomer {
        internal_reference: String,
        customer: Customer,
    },
    Complete,
}

/// A response sent back to the importer, correlated to its request.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResponse {
    pub correlation_id: String,
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    StartSessionAck,
    LookupResult { matched: Vec<ImportedCustomer> },
    UpsertSuccess { id: String },
    Error { messages: Vec<String> },
}

/// A matched customer plus the session importer's own state, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedCustomer {
    pub customer: Customer,
    pub state: Option<ImportState>,
}

/// Inbound half of the session transport. `Ok(None)` is a clean end of
/// stream; errors are decode/transport failures and terminate the session.
#[async_trait]
pub trait RequestStream: Send {
    async fn next(&mut self) -> anyhow::Result<Option<SessionRequest>>;
}

/// Outbound half of the session transport.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send(&mut self, response: SessionResponse) -> anyhow::Result<()>;
}

#[async_trait]
impl RequestStream for mpsc::Receiver<SessionRequest> {
    async fn next(&mut self) -> anyhow::Result<Option<SessionRequest>> {
        Ok(self.recv().await)
    }
}

#[async_trait]
impl ResponseSink for mpsc::Sender<SessionResponse> {
    async fn send(&mut self, response: SessionResponse) -> anyhow::Result<()> {
        mpsc::Sender::send(self, response)
            .await
            .map_err(|_| anyhow::anyhow!("response channel closed"))
    }
}

/// Errors that terminate a session before it becomes active.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to receive start_session request: {0}")]
    Handshake(anyhow::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to send start_session response: {0}")]
    Ack(anyhow::Error),
}

#[derive(Default)]
struct Counters {
    upserts: AtomicU64,
    lookups: AtomicU64,
    attribute_updates: AtomicU64,
}

pub struct ImportSession {
    repo: Repo,
    resolver: Arc<dyn PriorityResolver>,
}

impl ImportSession {
    pub fn new(repo: Repo, resolver: Arc<dyn PriorityResolver>) -> Self {
        Self { repo, resolver }
    }

    /// Drive the session until `Complete`, end of stream, or cancellation.
    ///
    /// The first message must be `StartSession` with a non-empty importer;
    /// anything else fails the session. Afterwards each request is handled
    /// concurrently and any handler error is converted into an `Error`
    /// response without terminating the session.
    pub async fn handle<R, S>(
        self,
        mut requests: R,
        responses: S,
        cancel: CancellationToken,
    ) -> Result<(), SessionError>
    where
        R: RequestStream,
        S: ResponseSink + 'static,
    {
        let first = requests
            .next()
            .await
            .map_err(SessionError::Handshake)?
            .ok_or_else(|| {
                SessionError::Handshake(anyhow::anyhow!("stream closed before start_session"))
            })?;

        let RequestMessage::StartSession { importer } = first.message else {
            return Err(SessionError::InvalidArgument(
                "expected a start_session request".into(),
            ));
        };
        if importer.is_empty() {
            return Err(SessionError::InvalidArgument(
                "invalid importer field in start_session request".into(),
            ));
        }

        let (queue, queue_rx) = mpsc::channel::<SessionResponse>(SEND_QUEUE_CAPACITY);
        let send_task = tokio::spawn(send_loop(queue_rx, responses, cancel.clone()));

        queue
            .send(SessionResponse {
                correlation_id: first.correlation_id,
                message: ResponseMessage::StartSessionAck,
            })
            .await
            .map_err(|_| SessionError::Ack(anyhow::anyhow!("send queue closed")))?;

        let shared = Arc::new(SessionShared {
            repo: self.repo,
            resolver: self.resolver,
            importer: importer.clone(),
            counters: Counters::default(),
        });

        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = requests.next() => match received {
                    Ok(Some(request)) => {
                        if matches!(request.message, RequestMessage::Complete) {
                            break;
                        }
                        let handled = matches!(
                            request.message,
                            RequestMessage::LookupCustomer { .. }
                                | RequestMessage::UpsertCustomer { .. }
                        );
                        if !handled {
                            tracing::error!(message = ?request.message, "unsupported request message");
                            continue;
                        }

                        let shared = shared.clone();
                        let queue = queue.clone();
                        let cancel = cancel.clone();
                        handlers.spawn(async move {
                            shared.handle_request(request, queue, cancel).await;
                        });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to receive message");
                        break;
                    }
                },
            }
        }

        // Drain in-flight handlers, then close the queue so the send loop
        // flushes what is buffered and exits.
        while handlers.join_next().await.is_some() {}
        drop(queue);
        let _ = send_task.await;

        tracing::info!(
            importer = %importer,
            upserts = shared.counters.upserts.load(Ordering::Relaxed),
            lookups = shared.counters.lookups.load(Ordering::Relaxed),
            attribute_updates = shared.counters.attribute_updates.load(Ordering::Relaxed),
            "import session complete"
        );

        Ok(())
    }
}

struct SessionShared {
    repo: Repo,
    resolver: Arc<dyn PriorityResolver>,
    importer: String,
    counters: Counters,
}

impl SessionShared {
    async fn handle_request(
        &self,
        request: SessionRequest,
        queue: mpsc::Sender<SessionResponse>,
        cancel: CancellationToken,
    ) {
        let correlation_id = request.correlation_id.clone();

        let response = match request.message {
            RequestMessage::LookupCustomer { query } => self.handle_lookup(query).await,
            RequestMessage::UpsertCustomer {
                internal_reference,
                customer,
            } => match self.handle_upsert(internal_reference, customer).await {
                Ok(id) => ResponseMessage::UpsertSuccess { id },
                Err(err) => ResponseMessage::Error {
                    messages: vec![err],
                },
            },
            _ => return,
        };

        tokio::select! {
            result = queue.send(SessionResponse { correlation_id, message: response }) => {
                if result.is_err() {
                    tracing::error!("send queue closed before response could be queued");
                }
            }
            _ = cancel.cancelled() => {}
        }
    }

    async fn handle_lookup(&self, mut query: CustomerQuery) -> ResponseMessage {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        // A reference query without an importer means "my own reference".
        if let CustomerQuery::InternalReference { importer, .. } = &mut query {
            if importer.is_empty() {
                *importer = self.importer.clone();
            }
        }

        let results = match self.repo.search_queries(std::slice::from_ref(&query), None).await {
            Ok((records, _)) => records,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => {
                tracing::error!(error = %err, "failed to search customers");
                Vec::new()
            }
        };

        let matched = results
            .into_iter()
            .map(|record| {
                let state = record.state_for(&self.importer).cloned();
                ImportedCustomer {
                    customer: record.customer,
                    state,
                }
            })
            .collect();

        ResponseMessage::LookupResult { matched }
    }

    async fn handle_upsert(
        &self,
        internal_reference: String,
        mut incoming: Customer,
    ) -> Result<String, String> {
        // Canonicalize before matching or merging; unparseable numbers are
        // kept raw.
        let normalizer = self.repo.phone_normalizer();
        for number in &mut incoming.phone_numbers {
            *number = normalizer.normalize(number);
        }

        let mut existing: Option<CustomerRecord> = None;

        if !internal_reference.is_empty() {
            existing = match self
                .repo
                .lookup_by_ref(&self.importer, &internal_reference)
                .await
            {
                Ok(record) => Some(record),
                Err(RepoError::NotFound) => None,
                Err(err) => return Err(err.to_string()),
            };
        }

        // Adopt an existing customer when exactly one record carries the
        // first incoming phone number. Only the first number is consulted;
        // ambiguous matches fall through to creation.
        if existing.is_none() {
            if let Some(phone) = incoming.phone_numbers.first() {
                let (matches, _) = self
                    .repo
                    .lookup_by_phone(phone, None)
                    .await
                    .map_err(|err| err.to_string())?;
                if matches.len() == 1 {
                    existing = matches.into_iter().next();
                }
            }
        }

        let mut guard = LockGuard::noop();
        let (customer, states) = match existing {
            Some(record) if !record.customer.id.is_empty() => {
                guard = self
                    .repo
                    .lock(&record.customer.id)
                    .await
                    .map_err(|err| err.to_string())?;
                (Some(record.customer), record.states)
            }
            Some(record) => (Some(record.customer), record.states),
            None => (None, Vec::new()),
        };

        let mut patcher = Patcher::new(
            &self.importer,
            &internal_reference,
            self.resolver.as_ref(),
            customer,
            states,
        )
        .with_phone_normalizer(normalizer);

        patcher
            .apply(&incoming)
            .map_err(|err| format!("failed to apply updates: {err}"))?;

        self.counters
            .attribute_updates
            .fetch_add(patcher.change_count(), Ordering::Relaxed);

        let (result, states) = patcher.into_parts();
        let id = self
            .repo
            .store(result, states)
            .await
            .map_err(|err| format!("failed to store customer: {err}"))?;

        // The lock is held through the store call.
        drop(guard);

        self.counters.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }
}

async fn send_loop<S: ResponseSink>(
    mut queue: mpsc::Receiver<SessionResponse>,
    mut sink: S,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = queue.recv() => match message {
                Some(message) => {
                    if let Err(err) = sink.send(message).await {
                        tracing::error!(error = %err, "failed to send response");
                        return;
                    }
                }
                None => return,
            },
        }
    }
}
