//! Event envelope record and codec.
//!
//! An [`EventEnvelope`] is the immutable wire representation of a domain
//! event: the standard attributes (`id`, `type`, `source`, `time`, `subject`,
//! `datacontenttype`, `data`) plus arbitrary named extensions. The store
//! treats envelopes as opaque payloads; (de)serialization to the log's
//! document representation goes through an [`EnvelopeCodec`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope spec version written by [`EventEnvelope::new`].
pub const SPEC_VERSION: &str = "1.0";

/// Name of the synthetic stream-id attribute the store tags every persisted
/// envelope with. Stored alongside the envelope, not part of its identity.
pub const STREAM_ID_ATTRIBUTE: &str = "streamid";

/// Immutable event envelope.
///
/// Identity is the `(id, source)` pair, which must be globally unique across
/// the whole store. Unknown document fields round-trip through
/// [`EventEnvelope::extensions`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event identifier, unique per `source`.
    pub id: String,
    /// Event type name.
    #[serde(rename = "type")]
    pub ty: String,
    /// Context in which the event happened.
    pub source: String,
    /// Envelope format version.
    pub specversion: String,
    /// Subject of the event in the context of the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Timestamp of when the occurrence happened, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Content type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Domain payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Extension attributes, flattened into the document top level.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl EventEnvelope {
    /// Create an envelope with the mandatory attributes set.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        ty: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ty: ty.into(),
            source: source.into(),
            specversion: SPEC_VERSION.to_string(),
            subject: None,
            time: None,
            datacontenttype: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Set the subject attribute.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the time attribute (RFC 3339).
    #[must_use]
    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    /// Attach a payload with its content type.
    #[must_use]
    pub fn with_data(mut self, content_type: impl Into<String>, data: Value) -> Self {
        self.datacontenttype = Some(content_type.into());
        self.data = Some(data);
        self
    }

    /// Attach a named extension attribute.
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }
}

/// Error from envelope (de)serialization.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope could not be encoded to a document.
    #[error("failed to encode event envelope: {0}")]
    Encode(#[source] serde_json::Error),
    /// The document could not be decoded into an envelope.
    #[error("failed to decode event envelope: {0}")]
    Decode(#[source] serde_json::Error),
    /// The encoded envelope was not a JSON object.
    #[error("encoded event envelope is not a document")]
    NotADocument,
}

/// Opaque codec between envelopes and the log's document representation.
///
/// `encode` tags the document with the owning stream id (under
/// [`STREAM_ID_ATTRIBUTE`]); `decode` maps a stored document back into an
/// envelope, with the stream-id tag surviving as an extension attribute.
pub trait EnvelopeCodec: Clone + Send + Sync + 'static {
    /// Encode an envelope to the log document layout.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when serialization fails.
    fn encode(&self, event: &EventEnvelope, stream_id: &str) -> Result<Value, CodecError>;

    /// Decode a stored document back into an envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the document does not describe an
    /// envelope.
    fn decode(&self, document: &Value) -> Result<EventEnvelope, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, event: &EventEnvelope, stream_id: &str) -> Result<Value, CodecError> {
        let mut document = serde_json::to_value(event).map_err(CodecError::Encode)?;
        let Some(fields) = document.as_object_mut() else {
            return Err(CodecError::NotADocument);
        };
        fields.insert(
            STREAM_ID_ATTRIBUTE.to_string(),
            Value::String(stream_id.to_string()),
        );
        Ok(document)
    }

    fn decode(&self, document: &Value) -> Result<EventEnvelope, CodecError> {
        serde_json::from_value(document.clone()).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builder_sets_all_attributes() {
        let event = EventEnvelope::new("e1", "order-placed", "urn:orders")
            .with_subject("order/42")
            .with_time("2020-08-12T14:00:00Z")
            .with_data("application/json", json!({"total": 99}))
            .with_extension("tenant", "acme");

        assert_eq!(event.id, "e1");
        assert_eq!(event.ty, "order-placed");
        assert_eq!(event.specversion, SPEC_VERSION);
        assert_eq!(event.subject.as_deref(), Some("order/42"));
        assert_eq!(event.datacontenttype.as_deref(), Some("application/json"));
        assert_eq!(event.extensions["tenant"], json!("acme"));
    }

    #[test]
    fn encode_tags_document_with_stream_id() {
        let event = EventEnvelope::new("e1", "order-placed", "urn:orders");
        let document = JsonCodec.encode(&event, "order-42").unwrap();

        assert_eq!(document["streamid"], json!("order-42"));
        assert_eq!(document["type"], json!("order-placed"));
    }

    #[test]
    fn decode_roundtrips_and_keeps_stream_tag_as_extension() {
        let event = EventEnvelope::new("e1", "order-placed", "urn:orders")
            .with_data("application/json", json!({"total": 99}));
        let document = JsonCodec.encode(&event, "order-42").unwrap();

        let decoded = JsonCodec.decode(&document).unwrap();
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.data, event.data);
        assert_eq!(decoded.extensions[STREAM_ID_ATTRIBUTE], json!("order-42"));
    }

    #[test]
    fn decode_rejects_foreign_document() {
        let result = JsonCodec.decode(&json!({"not": "an envelope"}));
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn decode_rejects_non_object() {
        let result = JsonCodec.decode(&json!(42));
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
