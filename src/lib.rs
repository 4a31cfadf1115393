//! # Custmaster
//!
//! A customer record consolidation service. External source systems (a
//! veterinary database, a CardDAV address book, interactive user edits) feed
//! partially overlapping customer records over a correlated bidirectional
//! stream; the service keeps one canonical record per customer by tracking,
//! per attribute, which source asserted which value and resolving
//! disagreements through a configurable priority order.
//!
//! The core pieces:
//! - [`patcher::Patcher`] merges an imported snapshot into the stored record
//!   and its provenance,
//! - [`session::ImportSession`] drives the server side of the import stream,
//! - [`dispatcher::ImportClient`] is its client counterpart,
//! - [`repo`] defines the storage contract with in-memory and RocksDB
//!   backends, and [`query::Repo`] layers query planning on top.

pub mod config;
pub mod crm;
pub mod differ;
pub mod dispatcher;
pub mod ids;
pub mod model;
pub mod patcher;
pub mod phone;
pub mod priority;
pub mod query;
pub mod repo;
pub mod service;
pub mod session;

// Re-export the main types for convenience.
pub use config::Config;
pub use model::{
    Address, AttributeKind, AttributeUpdate, AttributeValue, Customer, CustomerQuery,
    CustomerRecord, ImportState, OwnedAttribute, Pagination, UpdateOp,
};
pub use patcher::Patcher;
pub use priority::{PriorityResolver, StaticPriorityResolver};
pub use query::Repo;
pub use repo::{Backend, RepoError};
pub use session::ImportSession;
