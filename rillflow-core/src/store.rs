//! The optimistic event store.
//!
//! [`EventStore`] owns append and read operations per stream and enforces the
//! write-condition protocol on top of an [`AppendLog`] collaborator. Streams
//! carry a monotonically increasing version that counts successful append
//! operations (not individual events); all cross-writer coordination goes
//! through the log's atomic conditional increment.

pub use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    condition::WriteCondition,
    envelope::{CodecError, EnvelopeCodec, EventEnvelope, JsonCodec},
    log::{AppendLog, VersionUpdate},
};

/// Stream consistency guarantee, chosen at construction time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsistencyGuarantee {
    /// No version tracking. Write conditions are rejected with
    /// [`AppendError::Configuration`]; reads report version 0.
    None,
    /// Per-stream version counters with conditional appends. Every append
    /// increments the stream version by exactly one.
    ///
    /// The store does not manage transactions itself; when the log
    /// participates in an ambient transaction supplied by the surrounding
    /// call context, the version bump and the insert share its atomicity.
    #[default]
    VersionTracked,
}

/// Optimistic concurrency conflict: the write condition did not hold against
/// the stream's current version. The append was aborted with no mutation of
/// the event log; the caller must re-read and retry at a higher level.
#[derive(Debug, Error)]
#[error(
    "write condition was not fulfilled for stream `{stream_id}`. Expected {condition} but was {actual_version}"
)]
pub struct WriteConditionNotFulfilled {
    /// Stream the append targeted.
    pub stream_id: String,
    /// Version the stream actually had.
    pub actual_version: u64,
    /// Condition that failed.
    pub condition: WriteCondition,
}

/// Error from [`EventStore::append`].
#[derive(Debug, Error)]
pub enum AppendError<LogError>
where
    LogError: std::error::Error + 'static,
{
    /// Optimistic concurrency conflict; never retried by the store.
    #[error(transparent)]
    ConditionNotFulfilled(#[from] WriteConditionNotFulfilled),
    /// A write condition was supplied but the store was configured with
    /// [`ConsistencyGuarantee::None`].
    #[error("cannot use a write condition when the consistency guarantee is `None`")]
    Configuration,
    /// An envelope could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Underlying log failure. Includes uniqueness-constraint violations on
    /// `(id, source)`, which surface here raw after the version counter has
    /// already been incremented; see the note on [`EventStore::append`].
    #[error("log error: {0}")]
    Log(#[source] LogError),
}

/// Result of reading a stream: its id, current version and events.
pub struct EventStream {
    id: String,
    version: u64,
    events: Vec<serde_json::Value>,
    decode: Box<dyn Fn(&serde_json::Value) -> Result<EventEnvelope, CodecError> + Send>,
}

/// Lazily decoded events, in append order.
pub type EventIter = Box<dyn Iterator<Item = Result<EventEnvelope, CodecError>> + Send>;

impl EventStream {
    /// Stream id this result describes.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current stream version; 0 means no events have been written.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Number of stored documents in this result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the result carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consume the result, decoding events on demand.
    #[must_use]
    pub fn events(self) -> EventIter {
        let decode = self.decode;
        Box::new(self.events.into_iter().map(move |document| decode(&document)))
    }
}

/// Event store with optimistic concurrency control.
///
/// Generic over the [`AppendLog`] collaborator `L` and the envelope codec
/// `C`.
#[derive(Clone)]
pub struct EventStore<L, C = JsonCodec> {
    log: L,
    codec: C,
    consistency: ConsistencyGuarantee,
}

impl<L, C> EventStore<L, C>
where
    L: AppendLog,
    C: EnvelopeCodec,
{
    /// Create a store over the given log with the given consistency
    /// guarantee.
    #[must_use]
    pub const fn new(log: L, codec: C, consistency: ConsistencyGuarantee) -> Self {
        Self {
            log,
            codec,
            consistency,
        }
    }

    /// The underlying log handle.
    #[must_use]
    pub const fn log(&self) -> &L {
        &self.log
    }

    /// The configured consistency guarantee.
    #[must_use]
    pub const fn consistency(&self) -> ConsistencyGuarantee {
        self.consistency
    }

    /// Read a stream's current version and events.
    ///
    /// `skip`/`limit` paginate by position within the stream; `limit: None`
    /// is unbounded. A stream with no events yields version 0 and an empty
    /// sequence, never an error.
    ///
    /// # Errors
    ///
    /// Returns the log's error when the underlying reads fail.
    #[tracing::instrument(skip(self))]
    pub async fn read(
        &self,
        stream_id: &str,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<EventStream, L::Error> {
        let version = match self.consistency {
            ConsistencyGuarantee::None => 0,
            ConsistencyGuarantee::VersionTracked => {
                match self.log.current_version(stream_id).await? {
                    Some(version) => version,
                    // No counter record: the stream was never written.
                    None => {
                        return Ok(self.event_stream(stream_id, 0, Vec::new()));
                    }
                }
            }
        };
        let documents = self.log.read_stream(stream_id, skip, limit).await?;
        tracing::debug!(version, events = documents.len(), "stream read");
        Ok(self.event_stream(stream_id, version, documents))
    }

    /// Whether at least one event has ever been appended to the stream.
    ///
    /// # Errors
    ///
    /// Returns the log's error when the underlying query fails.
    pub async fn exists(&self, stream_id: &str) -> Result<bool, L::Error> {
        self.log.stream_exists(stream_id).await
    }

    /// Append events to a stream, optionally guarded by a write condition.
    ///
    /// Under [`ConsistencyGuarantee::VersionTracked`] the stream version is
    /// atomically test-and-incremented first; this is the single
    /// linearization point for the stream. Of two concurrent appends
    /// expecting the same
    /// version, at most one increment succeeds; the loser fails with
    /// [`WriteConditionNotFulfilled`] and performs no mutation.
    ///
    /// The subsequent multi-record insert is not retried or rolled back if
    /// it fails after the version bump succeeded: a duplicate `(id, source)`
    /// pair surfaces as a raw [`AppendError::Log`] and leaves the version
    /// counter ahead of the event log. Known gap, kept deliberately; a
    /// future reconciliation pass is required to close it.
    ///
    /// # Errors
    ///
    /// [`AppendError::ConditionNotFulfilled`] on an optimistic-concurrency
    /// conflict, [`AppendError::Configuration`] when a condition is supplied
    /// under [`ConsistencyGuarantee::None`], [`AppendError::Codec`] when an
    /// envelope cannot be encoded, [`AppendError::Log`] on log failures.
    #[tracing::instrument(
        skip(self, condition, events),
        fields(conditional = condition.is_some())
    )]
    pub async fn append(
        &self,
        stream_id: &str,
        condition: Option<&WriteCondition>,
        events: NonEmpty<EventEnvelope>,
    ) -> Result<(), AppendError<L::Error>> {
        if self.consistency == ConsistencyGuarantee::None && condition.is_some() {
            return Err(AppendError::Configuration);
        }

        let documents = events
            .iter()
            .map(|event| self.codec.encode(event, stream_id))
            .collect::<Result<Vec<_>, _>>()?;
        let event_count = documents.len();

        if self.consistency == ConsistencyGuarantee::VersionTracked {
            self.guard_version(stream_id, condition).await?;
        }

        self.log
            .insert_events(documents)
            .await
            .map_err(AppendError::Log)?;
        tracing::debug!(events_appended = event_count, "events appended");
        Ok(())
    }

    /// Test-and-increment the stream version, initializing the counter for
    /// a stream that does not exist yet.
    async fn guard_version(
        &self,
        stream_id: &str,
        condition: Option<&WriteCondition>,
    ) -> Result<(), AppendError<L::Error>> {
        let predicate = condition.map(WriteCondition::compile);
        let update = self
            .log
            .increment_version(stream_id, predicate.as_ref())
            .await
            .map_err(AppendError::Log)?;
        if update == VersionUpdate::Matched {
            return Ok(());
        }

        match self
            .log
            .current_version(stream_id)
            .await
            .map_err(AppendError::Log)?
        {
            // Counter exists but the condition did not hold.
            Some(actual_version) => {
                let condition = condition.cloned().unwrap_or_else(|| {
                    // Unconditional increments only miss when the counter
                    // record is created concurrently between the increment
                    // and this read; report it as a conflict against the
                    // bare existence expectation.
                    WriteCondition::version_eq(actual_version)
                });
                tracing::debug!(actual_version, %condition, "write condition rejected");
                Err(WriteConditionNotFulfilled {
                    stream_id: stream_id.to_string(),
                    actual_version,
                    condition,
                }
                .into())
            }
            // Stream does not exist yet: the condition must permit the
            // "no events written" version before the counter is created.
            None => {
                if let Some(condition) = condition
                    && !condition.condition().holds(0)
                {
                    tracing::debug!(%condition, "write condition rejected for new stream");
                    return Err(WriteConditionNotFulfilled {
                        stream_id: stream_id.to_string(),
                        actual_version: 0,
                        condition: condition.clone(),
                    }
                    .into());
                }
                self.log
                    .initialize_version(stream_id)
                    .await
                    .map_err(AppendError::Log)
            }
        }
    }

    fn event_stream(
        &self,
        stream_id: &str,
        version: u64,
        documents: Vec<serde_json::Value>,
    ) -> EventStream {
        let codec = self.codec.clone();
        EventStream {
            id: stream_id.to_string(),
            version,
            events: documents,
            decode: Box::new(move |document| codec.decode(document)),
        }
    }
}
