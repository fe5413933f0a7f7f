//! Contract for the underlying append log with change notifications.
//!
//! The store and the subscription engine are generic over [`AppendLog`], the
//! durable, ordered log they collaborate with. The log owns the only shared
//! mutable state in the system: the event records and the per-stream version
//! counters. Cross-writer coordination goes exclusively through
//! [`AppendLog::increment_version`], the atomic conditional increment.
//!
//! Documents and predicates cross this boundary as [`serde_json::Value`];
//! the log is free to map them onto whatever native representation it
//! stores.

use std::{future::Future, pin::Pin};

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod inmemory;

/// Opaque marker identifying a point in the change feed.
///
/// Returned with every change so a consumer can persist its last processed
/// position externally and resume after a restart. The core never interprets
/// the value; only the log that issued it can.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken(Value);

impl ResumeToken {
    /// Wrap a log-issued position value.
    #[must_use]
    pub const fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// The underlying position value, for external persistence.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Outcome of the atomic conditional version increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionUpdate {
    /// A counter record matched the predicate and was incremented.
    Matched,
    /// No counter record matched; nothing was mutated.
    Unmatched,
}

/// A single mutation observed on the change feed.
#[derive(Clone, Debug)]
pub struct ChangeRecord {
    /// The full stored document the mutation produced.
    pub full_document: Value,
    /// Resumable position of this change.
    pub resume_token: ResumeToken,
}

/// Options applied when opening a change feed.
#[derive(Clone, Debug, Default)]
pub struct FeedOptions {
    /// Resume the feed strictly after this token instead of from "now".
    pub resume_after: Option<ResumeToken>,
}

impl FeedOptions {
    /// Resume strictly after the given token.
    #[must_use]
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }
}

/// Boxed change-feed cursor returned by [`AppendLog::watch`].
///
/// Ordered by the log's global append order. The cursor is closed by
/// dropping it.
pub type ChangeFeed<E> = Pin<Box<dyn Stream<Item = Result<ChangeRecord, E>> + Send + 'static>>;

/// Durable, ordered append log with change notifications.
///
/// Requirements on an implementation:
///
/// - [`increment_version`](Self::increment_version) must be atomic: of two
///   concurrent calls for the same stream whose predicates match the same
///   current version, at most one may observe [`VersionUpdate::Matched`].
/// - [`insert_events`](Self::insert_events) must append all records in the
///   given order and enforce a global uniqueness constraint on the
///   `(id, source)` attribute pair.
/// - [`watch`](Self::watch) must yield mutations in global append order,
///   filtered by the declarative `$match`-stage pipeline, each paired with
///   a resumable position token.
pub trait AppendLog: Send + Sync + 'static {
    /// Log-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically increment the version counter of `stream_id`, subject to
    /// the native predicate (`None` means "counter record exists").
    fn increment_version<'a>(
        &'a self,
        stream_id: &'a str,
        predicate: Option<&'a Value>,
    ) -> impl Future<Output = Result<VersionUpdate, Self::Error>> + Send + 'a;

    /// Current version of `stream_id`, `None` when no counter record
    /// exists.
    fn current_version<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// Create the counter record for `stream_id` with version 1.
    ///
    /// Fails if a record already exists (stream ids are unique in the
    /// counter collection).
    fn initialize_version<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Atomically append the documents, preserving order.
    fn insert_events(
        &self,
        documents: Vec<Value>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Read the documents tagged with `stream_id` in append order, honoring
    /// position-based pagination.
    fn read_stream<'a>(
        &'a self,
        stream_id: &'a str,
        skip: usize,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Value>, Self::Error>> + Send + 'a;

    /// Whether any document is tagged with `stream_id`.
    fn stream_exists<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Open a change feed over the event collection, filtered by
    /// `pipeline`.
    ///
    /// Without a resume token the feed observes mutations from "now"
    /// onwards; with one it replays strictly after the token first.
    fn watch<'a>(
        &'a self,
        pipeline: &'a [Value],
        options: FeedOptions,
    ) -> impl Future<Output = Result<ChangeFeed<Self::Error>, Self::Error>> + Send + 'a;
}
