//! # gRPC Services
//!
//! The wire surface of the consolidation service: the unary
//! `CustomerService` (search, direct user updates), the streaming
//! `ImportService`, and the conversions between proto messages and the
//! internal model. Client-side adapters at the bottom let the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) run over a tonic channel.

use crate::dispatcher;
use crate::model::{
    Address, AttributeKind, AttributeUpdate, AttributeValue, Customer, CustomerQuery,
    CustomerRecord, ImportState, OwnedAttribute, Pagination, SortDirection, SortField, UpdateOp,
};
use crate::patcher::Patcher;
use crate::priority::PriorityResolver;
use crate::query::Repo;
use crate::repo::RepoError;
use crate::session::{
    ImportSession, RequestMessage, ResponseMessage, SessionError, SessionRequest, SessionResponse,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};

// Generated protocol types.
pub mod proto {
    tonic::include_proto!("custmaster.v1");
}

pub use proto::customer_service_server::CustomerServiceServer;
pub use proto::import_service_server::ImportServiceServer;

/// The identity used for interactive updates.
pub const USER_IMPORTER: &str = "user";

fn status_from_repo(err: RepoError) -> Status {
    match err {
        RepoError::NotFound => Status::not_found("customer not found"),
        RepoError::Locked { .. } => Status::aborted(err.to_string()),
        RepoError::InvalidArgument(message) => Status::invalid_argument(message),
        RepoError::Backend(err) => Status::internal(err.to_string()),
    }
}

/// Unary customer search and update endpoints.
pub struct CustomerGrpcService {
    repo: Repo,
    resolver: Arc<dyn PriorityResolver>,
}

impl CustomerGrpcService {
    pub fn new(repo: Repo, resolver: Arc<dyn PriorityResolver>) -> Self {
        Self { repo, resolver }
    }
}

#[tonic::async_trait]
impl proto::customer_service_server::CustomerService for CustomerGrpcService {
    async fn search_customer(
        &self,
        request: Request<proto::SearchCustomerRequest>,
    ) -> Result<Response<proto::SearchCustomerResponse>, Status> {
        let request = request.into_inner();

        let queries = request
            .queries
            .into_iter()
            .map(CustomerQuery::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let pagination = request.pagination.map(Pagination::from);

        let (records, total) = self
            .repo
            .search_queries(&queries, pagination.as_ref())
            .await
            .map_err(status_from_repo)?;

        Ok(Response::new(proto::SearchCustomerResponse {
            results: records.into_iter().map(proto::CustomerResponse::from).collect(),
            total_results: total as i64,
        }))
    }

    async fn update_customer(
        &self,
        request: Request<proto::UpdateCustomerRequest>,
    ) -> Result<Response<proto::UpdateCustomerResponse>, Status> {
        let request = request.into_inner();

        let customer = Customer::from(
            request
                .customer
                .ok_or_else(|| Status::invalid_argument("customer is required"))?,
        );

        let (existing, states, _guard) = if customer.id.is_empty() {
            (None, Vec::new(), None)
        } else {
            let record = self
                .repo
                .lookup_by_id(&customer.id)
                .await
                .map_err(status_from_repo)?;
            let guard = self
                .repo
                .lock(&customer.id)
                .await
                .map_err(status_from_repo)?;
            (Some(record.customer), record.states, Some(guard))
        };

        let normalizer = self.repo.phone_normalizer();
        let mut patcher = Patcher::new(
            USER_IMPORTER,
            "",
            self.resolver.as_ref(),
            existing,
            states,
        )
        .with_set_ignore(true)
        .with_phone_normalizer(normalizer);

        if request.updates.is_empty() {
            let mut snapshot = customer;
            for number in &mut snapshot.phone_numbers {
                *number = normalizer.normalize(number);
            }
            patcher
                .apply(&snapshot)
                .map_err(|err| Status::internal(err.to_string()))?;
        } else {
            for update in request.updates {
                let update = AttributeUpdate::try_from(update)
                    .map_err(|err| Status::invalid_argument(err.to_string()))?;
                patcher
                    .apply_update(&update)
                    .map_err(|err| Status::invalid_argument(err.to_string()))?;
            }
        }

        let (result, states) = patcher.into_parts();
        let record = CustomerRecord::new(result, states);
        let id = self
            .repo
            .store(record.customer.clone(), record.states.clone())
            .await
            .map_err(status_from_repo)?;

        let mut record = record;
        record.customer.id = id;

        Ok(Response::new(proto::UpdateCustomerResponse {
            response: Some(proto::CustomerResponse::from(record)),
        }))
    }
}

/// The bidirectional import stream endpoint.
pub struct ImportGrpcService {
    repo: Repo,
    resolver: Arc<dyn PriorityResolver>,
    shutdown: CancellationToken,
}

impl ImportGrpcService {
    pub fn new(repo: Repo, resolver: Arc<dyn PriorityResolver>, shutdown: CancellationToken) -> Self {
        Self {
            repo,
            resolver,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl proto::import_service_server::ImportService for ImportGrpcService {
    type ImportSessionStream = ReceiverStream<Result<proto::ImportSessionResponse, Status>>;

    async fn import_session(
        &self,
        request: Request<Streaming<proto::ImportSessionRequest>>,
    ) -> Result<Response<Self::ImportSessionStream>, Status> {
        let stream = request.into_inner();
        let (tx, rx) = mpsc::channel(16);

        let session = ImportSession::new(self.repo.clone(), self.resolver.clone());
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let requests = GrpcRequestStream { inner: stream };
            let responses = GrpcResponseSink { tx: tx.clone() };

            if let Err(err) = session.handle(requests, responses, cancel).await {
                let status = match err {
                    SessionError::InvalidArgument(message) => Status::invalid_argument(message),
                    other => Status::internal(other.to_string()),
                };
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

struct GrpcRequestStream {
    inner: Streaming<proto::ImportSessionRequest>,
}

#[async_trait::async_trait]
impl crate::session::RequestStream for GrpcRequestStream {
    async fn next(&mut self) -> anyhow::Result<Option<SessionRequest>> {
        match self.inner.message().await {
            Ok(Some(message)) => Ok(Some(SessionRequest::try_from(message)?)),
            Ok(None) => Ok(None),
            Err(status) => Err(anyhow::Error::new(status)),
        }
    }
}

struct GrpcResponseSink {
    tx: mpsc::Sender<Result<proto::ImportSessionResponse, Status>>,
}

#[async_trait::async_trait]
impl crate::session::ResponseSink for GrpcResponseSink {
    async fn send(&mut self, response: SessionResponse) -> anyhow::Result<()> {
        self.tx
            .send(Ok(proto::ImportSessionResponse::from(response)))
            .await
            .map_err(|_| anyhow::anyhow!("response stream closed"))
    }
}

// ── Client-side stream adapters ─────────────────────────────────────────────

/// Outbound request half of a client import stream.
pub struct GrpcRequestSink {
    tx: Option<mpsc::Sender<proto::ImportSessionRequest>>,
}

#[async_trait::async_trait]
impl dispatcher::RequestSink for GrpcRequestSink {
    async fn send(&mut self, request: SessionRequest) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("request stream already closed"))?;
        tx.send(proto::ImportSessionRequest::from(request))
            .await
            .map_err(|_| anyhow::anyhow!("request stream closed"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Inbound response half of a client import stream.
pub struct GrpcResponseStream {
    inner: Streaming<proto::ImportSessionResponse>,
}

#[async_trait::async_trait]
impl dispatcher::ResponseStream for GrpcResponseStream {
    async fn next(&mut self) -> anyhow::Result<Option<SessionResponse>> {
        match self.inner.message().await {
            Ok(Some(message)) => Ok(Some(SessionResponse::try_from(message)?)),
            Ok(None) => Ok(None),
            Err(status) => Err(anyhow::Error::new(status)),
        }
    }
}

/// Open an import stream on an established channel and return the transport
/// halves for a [`Dispatcher`](crate::dispatcher::Dispatcher).
pub async fn open_import_stream(
    channel: Channel,
) -> anyhow::Result<(GrpcRequestSink, GrpcResponseStream)> {
    let mut client = proto::import_service_client::ImportServiceClient::new(channel);
    let (tx, rx) = mpsc::channel(100);

    let response = client.import_session(ReceiverStream::new(rx)).await?;

    Ok((
        GrpcRequestSink { tx: Some(tx) },
        GrpcResponseStream {
            inner: response.into_inner(),
        },
    ))
}

// ── Proto conversions ───────────────────────────────────────────────────────

impl From<proto::Address> for Address {
    fn from(value: proto::Address) -> Self {
        Address {
            postal_code: value.postal_code,
            city: value.city,
            street: value.street,
            extra: value.extra,
        }
    }
}

impl From<Address> for proto::Address {
    fn from(value: Address) -> Self {
        proto::Address {
            postal_code: value.postal_code,
            city: value.city,
            street: value.street,
            extra: value.extra,
        }
    }
}

impl From<proto::Customer> for Customer {
    fn from(value: proto::Customer) -> Self {
        Customer {
            id: value.id,
            first_name: value.first_name,
            last_name: value.last_name,
            phone_numbers: value.phone_numbers,
            email_addresses: value.email_addresses,
            addresses: value.addresses.into_iter().map(Address::from).collect(),
        }
    }
}

impl From<Customer> for proto::Customer {
    fn from(value: Customer) -> Self {
        proto::Customer {
            id: value.id,
            first_name: value.first_name,
            last_name: value.last_name,
            phone_numbers: value.phone_numbers,
            email_addresses: value.email_addresses,
            addresses: value.addresses.into_iter().map(proto::Address::from).collect(),
        }
    }
}

fn kind_from_proto(kind: i32) -> anyhow::Result<AttributeKind> {
    match proto::AttributeKind::try_from(kind) {
        Ok(proto::AttributeKind::FirstName) => Ok(AttributeKind::FirstName),
        Ok(proto::AttributeKind::LastName) => Ok(AttributeKind::LastName),
        Ok(proto::AttributeKind::EmailAddress) => Ok(AttributeKind::EmailAddress),
        Ok(proto::AttributeKind::PhoneNumber) => Ok(AttributeKind::PhoneNumber),
        Ok(proto::AttributeKind::Address) => Ok(AttributeKind::Address),
        Ok(proto::AttributeKind::Unspecified) | Err(_) => {
            anyhow::bail!("unknown or unspecified attribute kind: {kind}")
        }
    }
}

fn kind_to_proto(kind: AttributeKind) -> proto::AttributeKind {
    match kind {
        AttributeKind::FirstName => proto::AttributeKind::FirstName,
        AttributeKind::LastName => proto::AttributeKind::LastName,
        AttributeKind::EmailAddress => proto::AttributeKind::EmailAddress,
        AttributeKind::PhoneNumber => proto::AttributeKind::PhoneNumber,
        AttributeKind::Address => proto::AttributeKind::Address,
    }
}

impl TryFrom<proto::OwnedAttribute> for OwnedAttribute {
    type Error = anyhow::Error;

    fn try_from(value: proto::OwnedAttribute) -> anyhow::Result<Self> {
        let kind = kind_from_proto(value.kind)?;
        let attr_value = match value.value {
            Some(proto::owned_attribute::Value::Text(text)) => AttributeValue::Text(text),
            Some(proto::owned_attribute::Value::Address(address)) => {
                AttributeValue::Address(address.into())
            }
            None => anyhow::bail!("owned attribute value is required"),
        };

        Ok(OwnedAttribute::new(kind, attr_value).with_ignore(value.ignore))
    }
}

impl From<OwnedAttribute> for proto::OwnedAttribute {
    fn from(value: OwnedAttribute) -> Self {
        proto::OwnedAttribute {
            kind: kind_to_proto(value.kind) as i32,
            value: Some(match value.value {
                AttributeValue::Text(text) => proto::owned_attribute::Value::Text(text),
                AttributeValue::Address(address) => {
                    proto::owned_attribute::Value::Address(address.into())
                }
            }),
            ignore: value.ignore,
        }
    }
}

impl TryFrom<proto::ImportState> for ImportState {
    type Error = anyhow::Error;

    fn try_from(value: proto::ImportState) -> anyhow::Result<Self> {
        Ok(ImportState {
            importer: value.importer,
            internal_reference: value.internal_reference,
            owned_attributes: value
                .owned_attributes
                .into_iter()
                .map(OwnedAttribute::try_from)
                .collect::<anyhow::Result<Vec<_>>>()?,
        })
    }
}

impl From<ImportState> for proto::ImportState {
    fn from(value: ImportState) -> Self {
        proto::ImportState {
            importer: value.importer,
            internal_reference: value.internal_reference,
            owned_attributes: value
                .owned_attributes
                .into_iter()
                .map(proto::OwnedAttribute::from)
                .collect(),
        }
    }
}

impl TryFrom<proto::AttributeUpdate> for AttributeUpdate {
    type Error = anyhow::Error;

    fn try_from(value: proto::AttributeUpdate) -> anyhow::Result<Self> {
        let kind = kind_from_proto(value.kind)?;
        let op = match proto::UpdateOperation::try_from(value.operation) {
            Ok(proto::UpdateOperation::Set) => UpdateOp::Set,
            Ok(proto::UpdateOperation::Add) => UpdateOp::Add,
            Ok(proto::UpdateOperation::Delete) => UpdateOp::Delete,
            Ok(proto::UpdateOperation::Unspecified) | Err(_) => {
                anyhow::bail!("unknown or unspecified update operation: {}", value.operation)
            }
        };
        let attr_value = match value.value {
            Some(proto::attribute_update::Value::Text(text)) => AttributeValue::Text(text),
            Some(proto::attribute_update::Value::Address(address)) => {
                AttributeValue::Address(address.into())
            }
            None => anyhow::bail!("attribute update value is required"),
        };

        Ok(AttributeUpdate::new(kind, op, attr_value))
    }
}

impl From<AttributeUpdate> for proto::AttributeUpdate {
    fn from(value: AttributeUpdate) -> Self {
        proto::AttributeUpdate {
            kind: kind_to_proto(value.kind) as i32,
            operation: match value.op {
                UpdateOp::Set => proto::UpdateOperation::Set,
                UpdateOp::Add => proto::UpdateOperation::Add,
                UpdateOp::Delete => proto::UpdateOperation::Delete,
            } as i32,
            value: Some(match value.value {
                AttributeValue::Text(text) => proto::attribute_update::Value::Text(text),
                AttributeValue::Address(address) => {
                    proto::attribute_update::Value::Address(address.into())
                }
            }),
        }
    }
}

impl TryFrom<proto::CustomerQuery> for CustomerQuery {
    type Error = anyhow::Error;

    fn try_from(value: proto::CustomerQuery) -> anyhow::Result<Self> {
        match value.query {
            Some(proto::customer_query::Query::Id(id)) => Ok(CustomerQuery::Id(id)),
            Some(proto::customer_query::Query::InternalReference(reference)) => {
                Ok(CustomerQuery::InternalReference {
                    importer: reference.importer,
                    reference: reference.r#ref,
                })
            }
            Some(proto::customer_query::Query::Name(name)) => Ok(CustomerQuery::Name {
                last_name: name.last_name,
            }),
            Some(proto::customer_query::Query::PhoneNumber(phone)) => {
                Ok(CustomerQuery::PhoneNumber(phone))
            }
            Some(proto::customer_query::Query::EmailAddress(mail)) => {
                Ok(CustomerQuery::EmailAddress(mail))
            }
            None => anyhow::bail!("query is required"),
        }
    }
}

impl From<CustomerQuery> for proto::CustomerQuery {
    fn from(value: CustomerQuery) -> Self {
        let query = match value {
            CustomerQuery::Id(id) => proto::customer_query::Query::Id(id),
            CustomerQuery::InternalReference {
                importer,
                reference,
            } => proto::customer_query::Query::InternalReference(proto::InternalReferenceQuery {
                importer,
                r#ref: reference,
            }),
            CustomerQuery::Name { last_name } => {
                proto::customer_query::Query::Name(proto::NameQuery { last_name })
            }
            CustomerQuery::PhoneNumber(phone) => proto::customer_query::Query::PhoneNumber(phone),
            CustomerQuery::EmailAddress(mail) => proto::customer_query::Query::EmailAddress(mail),
        };
        proto::CustomerQuery { query: Some(query) }
    }
}

impl From<proto::Pagination> for Pagination {
    fn from(value: proto::Pagination) -> Self {
        Pagination {
            page_size: value.page_size.max(0) as usize,
            page: value.page.max(0) as usize,
            sort_by: value
                .sort_by
                .into_iter()
                .map(|field| SortField {
                    field_name: field.field_name,
                    direction: match proto::SortDirection::try_from(field.direction) {
                        Ok(proto::SortDirection::Desc) => SortDirection::Desc,
                        _ => SortDirection::Asc,
                    },
                })
                .collect(),
        }
    }
}

impl From<CustomerRecord> for proto::CustomerResponse {
    fn from(value: CustomerRecord) -> Self {
        proto::CustomerResponse {
            customer: Some(value.customer.into()),
            states: value.states.into_iter().map(proto::ImportState::from).collect(),
        }
    }
}

impl TryFrom<proto::ImportSessionRequest> for SessionRequest {
    type Error = anyhow::Error;

    fn try_from(value: proto::ImportSessionRequest) -> anyhow::Result<Self> {
        let message = match value.message {
            Some(proto::import_session_request::Message::StartSession(start)) => {
                RequestMessage::StartSession {
                    importer: start.importer,
                }
            }
            Some(proto::import_session_request::Message::LookupCustomer(lookup)) => {
                RequestMessage::LookupCustomer {
                    query: lookup
                        .query
                        .ok_or_else(|| anyhow::anyhow!("lookup query is required"))?
                        .try_into()?,
                }
            }
            Some(proto::import_session_request::Message::UpsertCustomer(upsert)) => {
                RequestMessage::UpsertCustomer {
                    internal_reference: upsert.internal_reference,
                    customer: upsert
                        .customer
                        .map(Customer::from)
                        .unwrap_or_default(),
                }
            }
            Some(proto::import_session_request::Message::Complete(_)) => RequestMessage::Complete,
            None => anyhow::bail!("import session request without a message"),
        };

        Ok(SessionRequest {
            correlation_id: value.correlation_id,
            message,
        })
    }
}

impl From<SessionRequest> for proto::ImportSessionRequest {
    fn from(value: SessionRequest) -> Self {
        let message = match value.message {
            RequestMessage::StartSession { importer } => {
                proto::import_session_request::Message::StartSession(proto::StartSessionRequest {
                    importer,
                })
            }
            RequestMessage::LookupCustomer { query } => {
                proto::import_session_request::Message::LookupCustomer(
                    proto::LookupCustomerRequest {
                        query: Some(query.into()),
                    },
                )
            }
            RequestMessage::UpsertCustomer {
                internal_reference,
                customer,
            } => proto::import_session_request::Message::UpsertCustomer(
                proto::UpsertCustomerRequest {
                    internal_reference,
                    customer: Some(customer.into()),
                    extra_data: None,
                },
            ),
            RequestMessage::Complete => {
                proto::import_session_request::Message::Complete(proto::CompleteRequest {})
            }
        };

        proto::ImportSessionRequest {
            correlation_id: value.correlation_id,
            message: Some(message),
        }
    }
}

impl TryFrom<proto::ImportSessionResponse> for SessionResponse {
    type Error = anyhow::Error;

    fn try_from(value: proto::ImportSessionResponse) -> anyhow::Result<Self> {
        let message = match value.message {
            Some(proto::import_session_response::Message::StartSession(_)) => {
                ResponseMessage::StartSessionAck
            }
            Some(proto::import_session_response::Message::LookupCustomer(lookup)) => {
                ResponseMessage::LookupResult {
                    matched: lookup
                        .matched_customers
                        .into_iter()
                        .map(|imported| {
                            Ok(crate::session::ImportedCustomer {
                                customer: imported
                                    .customer
                                    .map(Customer::from)
                                    .unwrap_or_default(),
                                state: imported
                                    .state
                                    .map(ImportState::try_from)
                                    .transpose()?,
                            })
                        })
                        .collect::<anyhow::Result<Vec<_>>>()?,
                }
            }
            Some(proto::import_session_response::Message::UpsertSuccess(success)) => {
                ResponseMessage::UpsertSuccess { id: success.id }
            }
            Some(proto::import_session_response::Message::Error(error)) => ResponseMessage::Error {
                messages: error.errors,
            },
            None => anyhow::bail!("import session response without a message"),
        };

        Ok(SessionResponse {
            correlation_id: value.correlation_id,
            message,
        })
    }
}

impl From<SessionResponse> for proto::ImportSessionResponse {
    fn from(value: SessionResponse) -> Self {
        let message = match value.message {
            ResponseMessage::StartSessionAck => {
                proto::import_session_response::Message::StartSession(proto::StartSessionAck {})
            }
            ResponseMessage::LookupResult { matched } => {
                proto::import_session_response::Message::LookupCustomer(
                    proto::LookupCustomerResponse {
                        matched_customers: matched
                            .into_iter()
                            .map(|imported| proto::ImportedCustomer {
                                customer: Some(imported.customer.into()),
                                state: imported.state.map(proto::ImportState::from),
                            })
                            .collect(),
                    },
                )
            }
            ResponseMessage::UpsertSuccess { id } => {
                proto::import_session_response::Message::UpsertSuccess(
                    proto::UpsertCustomerSuccess { id },
                )
            }
            ResponseMessage::Error { messages } => {
                proto::import_session_response::Message::Error(proto::SessionError {
                    errors: messages,
                })
            }
        };

        proto::ImportSessionResponse {
            correlation_id: value.correlation_id,
            message: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_round_trip() {
        let customer = Customer {
            id: "c-1".into(),
            first_name: "Alice".into(),
            last_name: "Smith".into(),
            phone_numbers: vec!["+43 1 234".into()],
            email_addresses: vec!["a@x".into()],
            addresses: vec![Address::new("1010", "Wien", "Graben 1", "")],
        };

        let round_tripped = Customer::from(proto::Customer::from(customer.clone()));
        assert_eq!(round_tripped, customer);
    }

    #[test]
    fn test_owned_attribute_rejects_unspecified_kind() {
        let attr = proto::OwnedAttribute {
            kind: 0,
            value: Some(proto::owned_attribute::Value::Text("x".into())),
            ignore: false,
        };

        assert!(OwnedAttribute::try_from(attr).is_err());
    }

    #[test]
    fn test_owned_attribute_preserves_ignore() {
        let attr = proto::OwnedAttribute {
            kind: proto::AttributeKind::FirstName as i32,
            value: Some(proto::owned_attribute::Value::Text("x".into())),
            ignore: true,
        };

        let converted = OwnedAttribute::try_from(attr).unwrap();
        assert!(converted.ignore);
        assert!(proto::OwnedAttribute::from(converted).ignore);
    }

    #[test]
    fn test_query_requires_a_variant() {
        assert!(CustomerQuery::try_from(proto::CustomerQuery { query: None }).is_err());

        let query = proto::CustomerQuery {
            query: Some(proto::customer_query::Query::PhoneNumber("+43".into())),
        };
        assert_eq!(
            CustomerQuery::try_from(query).unwrap(),
            CustomerQuery::PhoneNumber("+43".into())
        );
    }

    #[test]
    fn test_pagination_clamps_negative_values() {
        let pagination = Pagination::from(proto::Pagination {
            page_size: -5,
            page: -1,
            sort_by: vec![],
        });

        assert_eq!(pagination.page_size, 0);
        assert_eq!(pagination.page, 0);
    }

    #[test]
    fn test_session_request_round_trip() {
        let request = SessionRequest {
            correlation_id: "abc".into(),
            message: RequestMessage::UpsertCustomer {
                internal_reference: "r-1".into(),
                customer: Customer {
                    first_name: "Alice".into(),
                    ..Default::default()
                },
            },
        };

        let round_tripped =
            SessionRequest::try_from(proto::ImportSessionRequest::from(request.clone())).unwrap();
        assert_eq!(round_tripped, request);
    }
}
