//! In-memory append log for testing.
//!
//! This module provides [`InMemoryLog`], a thread-safe in-memory
//! implementation of [`AppendLog`](super::AppendLog) suitable for unit tests
//! and examples. It keeps event records in an append-only vector with global
//! positions, version counters in a hash map, and fans committed records out
//! to live change-feed cursors over a broadcast channel.
//!
//! The native predicate and pipeline dialect is a small subset of document
//! operators: `$eq`, `$ne`, `$lt`, `$lte`, `$gt`, `$gte`, bare-value
//! equality, `$and`, `$or`, `$nor`, and dotted field paths.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::log::{AppendLog, ChangeFeed, ChangeRecord, FeedOptions, ResumeToken, VersionUpdate};

/// Buffered changes per live cursor before a slow subscriber lags out.
const FEED_BUFFER: usize = 256;

/// In-memory append log with broadcast change notifications.
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<RwLock<Inner>>,
    feed_tx: broadcast::Sender<Arc<StoredRecord>>,
}

#[derive(Debug)]
struct StoredRecord {
    position: u64,
    document: Value,
}

struct Inner {
    records: Vec<Arc<StoredRecord>>,
    versions: HashMap<String, u64>,
    event_identities: HashSet<(String, String)>,
    next_position: u64,
}

/// Error type for the in-memory log.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryLogError {
    /// Uniqueness-constraint violation on the `(id, source)` pair.
    #[error("duplicate event: id `{id}` from source `{source}` already exists")]
    DuplicateEvent {
        /// Offending event id.
        id: String,
        /// Offending event source.
        source: String,
    },
    /// A counter record for the stream already exists.
    #[error("version record for stream `{0}` already exists")]
    DuplicateVersionRecord(String),
    /// The native predicate document was not recognized.
    #[error("unrecognized native condition document: {0}")]
    InvalidCondition(Value),
    /// A pipeline stage was not a `$match` document.
    #[error("unrecognized pipeline stage: {0}")]
    InvalidPipeline(Value),
    /// The resume token was not issued by this log.
    #[error("unrecognized resume token: {0}")]
    InvalidResumeToken(Value),
    /// A live cursor fell behind the broadcast buffer.
    #[error("change feed lagged behind the log by {0} changes")]
    FeedLagged(u64),
}

impl InMemoryLog {
    #[must_use]
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(FEED_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                records: Vec::new(),
                versions: HashMap::new(),
                event_identities: HashSet::new(),
                next_position: 0,
            })),
            feed_tx,
        }
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AppendLog for InMemoryLog {
    type Error = InMemoryLogError;

    #[tracing::instrument(skip(self, predicate))]
    fn increment_version<'a>(
        &'a self,
        stream_id: &'a str,
        predicate: Option<&'a Value>,
    ) -> impl Future<Output = Result<VersionUpdate, Self::Error>> + Send + 'a {
        let result = (|| {
            let mut inner = self.inner.write().expect("in-memory log lock poisoned");
            let Some(version) = inner.versions.get_mut(stream_id) else {
                return Ok(VersionUpdate::Unmatched);
            };
            let matched = match predicate {
                None => true,
                Some(predicate) => {
                    let record = json!({ "version": *version });
                    eval_predicate(predicate, &record)?
                }
            };
            if matched {
                *version += 1;
                tracing::trace!(version = *version, "stream version incremented");
                Ok(VersionUpdate::Matched)
            } else {
                Ok(VersionUpdate::Unmatched)
            }
        })();
        std::future::ready(result)
    }

    fn current_version<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        let inner = self.inner.read().expect("in-memory log lock poisoned");
        std::future::ready(Ok(inner.versions.get(stream_id).copied()))
    }

    #[tracing::instrument(skip(self))]
    fn initialize_version<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let result = {
            let mut inner = self.inner.write().expect("in-memory log lock poisoned");
            if inner.versions.contains_key(stream_id) {
                Err(InMemoryLogError::DuplicateVersionRecord(
                    stream_id.to_string(),
                ))
            } else {
                inner.versions.insert(stream_id.to_string(), 1);
                Ok(())
            }
        };
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, documents), fields(document_count = documents.len()))]
    fn insert_events(
        &self,
        documents: Vec<Value>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = (|| {
            let mut inner = self.inner.write().expect("in-memory log lock poisoned");

            // All-or-nothing: check the whole batch against the uniqueness
            // constraint (and against itself) before committing anything.
            let mut staged_identities = Vec::with_capacity(documents.len());
            for document in &documents {
                if let Some(identity) = event_identity(document) {
                    if inner.event_identities.contains(&identity)
                        || staged_identities.contains(&identity)
                    {
                        return Err(InMemoryLogError::DuplicateEvent {
                            id: identity.0,
                            source: identity.1,
                        });
                    }
                    staged_identities.push(identity);
                }
            }

            let mut committed = Vec::with_capacity(documents.len());
            for document in documents {
                let record = Arc::new(StoredRecord {
                    position: inner.next_position,
                    document,
                });
                inner.next_position += 1;
                inner.records.push(Arc::clone(&record));
                committed.push(record);
            }
            inner.event_identities.extend(staged_identities);
            drop(inner);

            tracing::debug!(records_appended = committed.len(), "documents appended");
            for record in committed {
                // No receivers is fine; cursors attach lazily.
                let _ = self.feed_tx.send(record);
            }
            Ok(())
        })();
        std::future::ready(result)
    }

    fn read_stream<'a>(
        &'a self,
        stream_id: &'a str,
        skip: usize,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Value>, Self::Error>> + Send + 'a {
        let inner = self.inner.read().expect("in-memory log lock poisoned");
        let documents = inner
            .records
            .iter()
            .filter(|record| record_stream_id(&record.document) == Some(stream_id))
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .map(|record| record.document.clone())
            .collect();
        std::future::ready(Ok(documents))
    }

    fn stream_exists<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let inner = self.inner.read().expect("in-memory log lock poisoned");
        let exists = inner
            .records
            .iter()
            .any(|record| record_stream_id(&record.document) == Some(stream_id));
        std::future::ready(Ok(exists))
    }

    fn watch<'a>(
        &'a self,
        pipeline: &'a [Value],
        options: FeedOptions,
    ) -> impl Future<Output = Result<ChangeFeed<Self::Error>, Self::Error>> + Send + 'a {
        let result = (|| {
            let stages = validate_pipeline(pipeline)?;

            let resume_position = match &options.resume_after {
                None => None,
                Some(token) => Some(token.as_value().as_u64().ok_or_else(|| {
                    InMemoryLogError::InvalidResumeToken(token.as_value().clone())
                })?),
            };

            // Register the live receiver before snapshotting the backlog so
            // nothing committed in between is missed; the position watermark
            // deduplicates the overlap.
            let rx = self.feed_tx.subscribe();
            let backlog: Vec<Arc<StoredRecord>> = match resume_position {
                None => Vec::new(),
                Some(after) => {
                    let inner = self.inner.read().expect("in-memory log lock poisoned");
                    inner
                        .records
                        .iter()
                        .filter(|record| record.position > after)
                        .cloned()
                        .collect()
                }
            };

            Ok(feed_stream(stages, backlog, rx, resume_position))
        })();
        std::future::ready(result)
    }
}

fn feed_stream(
    stages: Vec<Value>,
    backlog: Vec<Arc<StoredRecord>>,
    mut rx: broadcast::Receiver<Arc<StoredRecord>>,
    resume_position: Option<u64>,
) -> ChangeFeed<InMemoryLogError> {
    Box::pin(async_stream::stream! {
        let mut last_position = resume_position;

        for record in backlog {
            last_position = Some(record.position);
            match admits(&stages, &record.document) {
                Ok(false) => {}
                Ok(true) => yield Ok(change_record(&record)),
                Err(error) => {
                    yield Err(error);
                    return;
                }
            }
        }

        loop {
            match rx.recv().await {
                Ok(record) => {
                    // Skip changes already replayed from the backlog.
                    if last_position.is_some_and(|last| record.position <= last) {
                        continue;
                    }
                    last_position = Some(record.position);
                    match admits(&stages, &record.document) {
                        Ok(false) => {}
                        Ok(true) => yield Ok(change_record(&record)),
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    yield Err(InMemoryLogError::FeedLagged(skipped));
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn change_record(record: &StoredRecord) -> ChangeRecord {
    ChangeRecord {
        full_document: record.document.clone(),
        resume_token: ResumeToken::from_value(json!(record.position)),
    }
}

fn record_stream_id(document: &Value) -> Option<&str> {
    document
        .get(crate::envelope::STREAM_ID_ATTRIBUTE)
        .and_then(Value::as_str)
}

fn event_identity(document: &Value) -> Option<(String, String)> {
    let id = document.get("id")?.as_str()?;
    let source = document.get("source")?.as_str()?;
    Some((id.to_string(), source.to_string()))
}

/// Check the pipeline shape up front so a malformed filter fails at watch
/// time rather than on the first matching change.
fn validate_pipeline(pipeline: &[Value]) -> Result<Vec<Value>, InMemoryLogError> {
    for stage in pipeline {
        let valid = stage
            .as_object()
            .is_some_and(|fields| fields.len() == 1 && fields.get("$match").is_some_and(Value::is_object));
        if !valid {
            return Err(InMemoryLogError::InvalidPipeline(stage.clone()));
        }
    }
    Ok(pipeline.to_vec())
}

/// Whether the pipeline admits the stored document. The feed wraps each
/// record in the `fullDocument` namespace before matching, as the filter
/// compiler expects.
fn admits(stages: &[Value], document: &Value) -> Result<bool, InMemoryLogError> {
    let wrapped = json!({ (crate::filter::FULL_DOCUMENT): document });
    for stage in stages {
        let predicate = &stage["$match"];
        if !eval_predicate(predicate, &wrapped)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_predicate(predicate: &Value, document: &Value) -> Result<bool, InMemoryLogError> {
    let Some(fields) = predicate.as_object() else {
        return Err(InMemoryLogError::InvalidCondition(predicate.clone()));
    };
    for (key, expected) in fields {
        let holds = match key.as_str() {
            "$and" => eval_children(expected, document)?
                .iter()
                .all(|matched| *matched),
            "$or" => eval_children(expected, document)?
                .iter()
                .any(|matched| *matched),
            "$nor" => !eval_children(expected, document)?
                .iter()
                .any(|matched| *matched),
            path => eval_field(document, path, expected)?,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_children(children: &Value, document: &Value) -> Result<Vec<bool>, InMemoryLogError> {
    let Some(children) = children.as_array() else {
        return Err(InMemoryLogError::InvalidCondition(children.clone()));
    };
    children
        .iter()
        .map(|child| eval_predicate(child, document))
        .collect()
}

fn eval_field(document: &Value, path: &str, expected: &Value) -> Result<bool, InMemoryLogError> {
    let actual = lookup(document, path);
    match expected.as_object() {
        // Operator document: {"$lt": 3} and friends, all must hold.
        Some(operators) if operators.keys().any(|key| key.starts_with('$')) => {
            for (operator, operand) in operators {
                if !compare(operator, actual, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        // Bare value: equality.
        _ => Ok(actual == Some(expected)),
    }
}

fn compare(
    operator: &str,
    actual: Option<&Value>,
    operand: &Value,
) -> Result<bool, InMemoryLogError> {
    match operator {
        "$eq" => Ok(actual == Some(operand)),
        "$ne" => Ok(actual != Some(operand)),
        "$lt" | "$lte" | "$gt" | "$gte" => {
            let Some(ordering) = actual.and_then(|value| compare_values(value, operand)) else {
                return Ok(false);
            };
            Ok(match operator {
                "$lt" => ordering == CmpOrdering::Less,
                "$lte" => ordering != CmpOrdering::Greater,
                "$gt" => ordering == CmpOrdering::Greater,
                _ => ordering != CmpOrdering::Less,
            })
        }
        unrecognized => Err(InMemoryLogError::InvalidCondition(
            json!({ (unrecognized): operand }),
        )),
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |value, segment| value.get(segment))
}
