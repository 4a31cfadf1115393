//! # Import Dispatcher
//!
//! Client side of the import protocol: multiplexes concurrent requests over
//! one bidirectional stream by tagging each request with a random correlation
//! id and routing responses back through per-request one-shot channels.
//! [`ImportClient`] layers the session handshake and typed calls on top.

use crate::ids;
use crate::model::{Customer, CustomerQuery};
use crate::session::{ImportedCustomer, RequestMessage, ResponseMessage, SessionRequest, SessionResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const SEND_QUEUE_CAPACITY: usize = 100;
const CORRELATION_ID_LENGTH: usize = 32;

/// Outbound half of the client transport.
#[async_trait]
pub trait RequestSink: Send {
    async fn send(&mut self, request: SessionRequest) -> anyhow::Result<()>;

    /// Close the request half after the terminal `Complete` was sent. The
    /// default relies on the sink being dropped.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Inbound half of the client transport. `Ok(None)` is end of stream.
#[async_trait]
pub trait ResponseStream: Send {
    async fn next(&mut self) -> anyhow::Result<Option<SessionResponse>>;
}

#[async_trait]
impl RequestSink for mpsc::Sender<SessionRequest> {
    async fn send(&mut self, request: SessionRequest) -> anyhow::Result<()> {
        mpsc::Sender::send(self, request)
            .await
            .map_err(|_| anyhow::anyhow!("request stream closed"))
    }
}

#[async_trait]
impl ResponseStream for mpsc::Receiver<SessionResponse> {
    async fn next(&mut self) -> anyhow::Result<Option<SessionResponse>> {
        Ok(self.recv().await)
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<SessionResponse>>>>;

/// Correlation-id multiplexer over one import stream.
pub struct Dispatcher {
    send_queue: mpsc::Sender<SessionRequest>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    send_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the send and receive loops over the given transport halves.
    pub fn start<T, R>(sink: T, stream: R) -> Self
    where
        T: RequestSink + 'static,
        R: ResponseStream + 'static,
    {
        let (send_queue, queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let send_task = tokio::spawn(send_loop(queue_rx, sink));
        let receive_task = tokio::spawn(receive_loop(stream, pending.clone(), closed.clone()));

        Self {
            send_queue,
            pending,
            closed,
            send_task,
            receive_task,
        }
    }

    /// Queue a request and return the channel its response will arrive on.
    pub async fn send(
        &self,
        message: RequestMessage,
    ) -> anyhow::Result<oneshot::Receiver<SessionResponse>> {
        let correlation_id = ids::generate(CORRELATION_ID_LENGTH);
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(correlation_id.clone(), tx);

        let request = SessionRequest {
            correlation_id: correlation_id.clone(),
            message,
        };

        if self.send_queue.send(request).await.is_err() {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&correlation_id);
            anyhow::bail!("stream already closed");
        }

        Ok(rx)
    }

    /// Send the terminal `Complete`, close the request half, and wait for
    /// both loops to finish. Outstanding requests resolve with a closed
    /// channel error.
    pub async fn stop(self) {
        self.closed.store(true, Ordering::SeqCst);

        let _ = self
            .send_queue
            .send(SessionRequest {
                correlation_id: ids::generate(CORRELATION_ID_LENGTH),
                message: RequestMessage::Complete,
            })
            .await;
        drop(self.send_queue);

        let _ = self.send_task.await;
        let _ = self.receive_task.await;
    }
}

async fn send_loop<T: RequestSink>(mut queue: mpsc::Receiver<SessionRequest>, mut sink: T) {
    while let Some(request) = queue.recv().await {
        let terminal = matches!(request.message, RequestMessage::Complete);

        if let Err(err) = sink.send(request).await {
            tracing::error!(error = %err, "failed to send message to import stream");
            return;
        }

        if terminal {
            if let Err(err) = sink.close().await {
                tracing::error!(error = %err, "failed to close request stream");
            }
            return;
        }
    }
}

async fn receive_loop<R: ResponseStream>(
    mut stream: R,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    loop {
        let response = match stream.next().await {
            Ok(Some(response)) => response,
            Ok(None) => {
                // End of stream after stop() is the expected shutdown path.
                if !closed.load(Ordering::SeqCst) {
                    tracing::error!("import stream closed unexpectedly");
                }
                return;
            }
            Err(err) => {
                if !closed.load(Ordering::SeqCst) {
                    tracing::error!(error = %err, "failed to receive from import stream");
                }
                return;
            }
        };

        let waiter = pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&response.correlation_id);

        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::warn!(
                    correlation_id = %response.correlation_id,
                    "response without a pending request"
                );
            }
        }
    }
}

/// Typed client over a dispatcher: performs the session handshake and maps
/// responses to results.
pub struct ImportClient {
    dispatcher: Dispatcher,
    importer: String,
}

impl ImportClient {
    /// Open a session as `importer` over the given transport halves.
    pub async fn connect<T, R>(importer: impl Into<String>, sink: T, stream: R) -> anyhow::Result<Self>
    where
        T: RequestSink + 'static,
        R: ResponseStream + 'static,
    {
        let importer = importer.into();
        let dispatcher = Dispatcher::start(sink, stream);

        let response = dispatcher
            .send(RequestMessage::StartSession {
                importer: importer.clone(),
            })
            .await?
            .await
            .map_err(|_| anyhow::anyhow!("session closed during handshake"))?;

        match response.message {
            ResponseMessage::StartSessionAck => Ok(Self {
                dispatcher,
                importer,
            }),
            other => anyhow::bail!("invalid response for start_session request: {other:?}"),
        }
    }

    pub fn importer(&self) -> &str {
        &self.importer
    }

    /// Upsert one customer under this importer's reference. Returns the
    /// stored customer id.
    pub async fn upsert(
        &self,
        internal_reference: impl Into<String>,
        customer: Customer,
    ) -> anyhow::Result<String> {
        let response = self
            .dispatcher
            .send(RequestMessage::UpsertCustomer {
                internal_reference: internal_reference.into(),
                customer,
            })
            .await?
            .await
            .map_err(|_| anyhow::anyhow!("session closed while waiting for upsert response"))?;

        match response.message {
            ResponseMessage::UpsertSuccess { id } => Ok(id),
            ResponseMessage::Error { messages } => {
                anyhow::bail!("failed to upsert customer: {}", messages.join("; "))
            }
            other => anyhow::bail!("unexpected upsert response: {other:?}"),
        }
    }

    /// Look up customers matching `query`, including this importer's own
    /// state per match.
    pub async fn lookup(&self, query: CustomerQuery) -> anyhow::Result<Vec<ImportedCustomer>> {
        let response = self
            .dispatcher
            .send(RequestMessage::LookupCustomer { query })
            .await?
            .await
            .map_err(|_| anyhow::anyhow!("session closed while waiting for lookup response"))?;

        match response.message {
            ResponseMessage::LookupResult { matched } => Ok(matched),
            ResponseMessage::Error { messages } => {
                anyhow::bail!("failed to look up customer: {}", messages.join("; "))
            }
            other => anyhow::bail!("unexpected lookup response: {other:?}"),
        }
    }

    /// Terminate the session cleanly.
    pub async fn stop(self) {
        self.dispatcher.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A hand-rolled peer that answers requests out of order.
    async fn echo_peer(
        mut rx: mpsc::Receiver<SessionRequest>,
        tx: mpsc::Sender<SessionResponse>,
    ) {
        let mut held: Option<SessionRequest> = None;

        while let Some(request) = rx.recv().await {
            match &request.message {
                RequestMessage::StartSession { .. } => {
                    tx.send(SessionResponse {
                        correlation_id: request.correlation_id,
                        message: ResponseMessage::StartSessionAck,
                    })
                    .await
                    .unwrap();
                }
                RequestMessage::UpsertCustomer { .. } => {
                    // Hold the first upsert back to force out-of-order
                    // delivery.
                    if held.is_none() {
                        held = Some(request);
                        continue;
                    }
                    tx.send(SessionResponse {
                        correlation_id: request.correlation_id,
                        message: ResponseMessage::UpsertSuccess { id: "second".into() },
                    })
                    .await
                    .unwrap();

                    let first = held.take().unwrap();
                    tx.send(SessionResponse {
                        correlation_id: first.correlation_id,
                        message: ResponseMessage::UpsertSuccess { id: "first".into() },
                    })
                    .await
                    .unwrap();
                }
                RequestMessage::Complete => return,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_routed_by_correlation_id() {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = mpsc::channel(16);
        let peer = tokio::spawn(echo_peer(req_rx, resp_tx));

        let client = ImportClient::connect("test", req_tx, resp_rx).await.unwrap();

        let first = client.upsert("r1", Customer::default());
        let second = client.upsert("r2", Customer::default());
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), "first");
        assert_eq!(second.unwrap(), "second");

        client.stop().await;
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_sends_complete_and_joins_loops() {
        let (req_tx, mut req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = mpsc::channel::<SessionResponse>(16);

        let peer = tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                if matches!(request.message, RequestMessage::Complete) {
                    return true;
                }
            }
            false
        });

        let dispatcher = Dispatcher::start(req_tx, resp_rx);
        drop(resp_tx);
        dispatcher.stop().await;

        assert!(peer.await.unwrap(), "peer never saw the Complete message");
    }
}
