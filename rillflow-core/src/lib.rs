//! Core traits and types for the Rillflow event-sourcing storage layer.
//!
//! This crate provides the foundational abstractions for an
//! optimistic-concurrency event store tailed by a change-feed subscription
//! engine:
//!
//! - [`envelope`] - Event envelope record and codec (`EventEnvelope`, `JsonCodec`)
//! - [`condition`] - Composable write conditions over stream versions
//! - [`store`] - The optimistic event store (`EventStore`)
//! - [`log`] - Append-log collaborator contract and an in-memory reference
//!   implementation
//! - [`filter`] - Change-feed filter specifications and compilation
//! - [`retry`] - Retry strategies, delay sequences and the retry wrapper
//! - [`subscription`] - Change-feed subscription engine (`SubscriptionEngine`)
//!
//! # Example
//!
//! ```
//! use rillflow_core::{
//!     envelope::JsonCodec,
//!     log::inmemory::InMemoryLog,
//!     store::{ConsistencyGuarantee, EventStore},
//! };
//!
//! let store = EventStore::new(
//!     InMemoryLog::new(),
//!     JsonCodec,
//!     ConsistencyGuarantee::VersionTracked,
//! );
//! # let _ = store;
//! ```
//!
//! Most users should depend on the [`rillflow`](https://docs.rs/rillflow)
//! crate, which re-exports these types with a cleaner API surface.

pub mod condition;
pub mod envelope;
pub mod filter;
pub mod log;
pub mod retry;
pub mod store;
pub mod subscription;
