//! Change-feed filter specifications and their compilation to native
//! pipeline stages.
//!
//! A [`FilterSpecification`] narrows a subscription to the changes it cares
//! about. Three forms are supported: raw native query text, structured match
//! documents, and a fluent field-matcher composition. All three compile to
//! an ordered sequence of `$match` stages consumed by the underlying feed.
//!
//! The feed wraps every stored record in a `fullDocument` namespace, so the
//! field-matcher form prefixes each field reference accordingly.

use serde_json::{Value, json};
use thiserror::Error;

use crate::{condition::ComparisonOp, envelope::STREAM_ID_ATTRIBUTE};

/// Namespace the underlying feed wraps each stored record in.
pub const FULL_DOCUMENT: &str = "fullDocument";

/// A filter specification that could not be compiled.
#[derive(Debug, Error)]
pub enum InvalidFilterSpecification {
    /// Raw query text was not valid JSON.
    #[error("filter query text is not valid JSON: {0}")]
    Query(#[source] serde_json::Error),
    /// A stage or match document was not a JSON object.
    #[error("filter stage must be a document, got `{0}`")]
    NotADocument(Value),
}

/// Declarative filter over change-feed mutations.
#[derive(Clone, Debug)]
pub enum FilterSpecification {
    /// Raw native query text, parsed as a single pipeline stage.
    Query(String),
    /// Structured match documents; each becomes one `$match` stage.
    Documents(Vec<Value>),
    /// Fluent field-matcher composition, see [`FieldFilters`].
    Fields(FieldFilters),
}

impl FilterSpecification {
    /// Filter from raw native query text.
    #[must_use]
    pub fn query(text: impl Into<String>) -> Self {
        Self::Query(text.into())
    }

    /// Filter from structured match documents.
    #[must_use]
    pub fn documents(documents: impl IntoIterator<Item = Value>) -> Self {
        Self::Documents(documents.into_iter().collect())
    }

    /// Filter from a fluent field-matcher composition.
    #[must_use]
    pub fn fields(filters: FieldFilters) -> Self {
        Self::Fields(filters)
    }
}

/// Fluent composition of per-field comparisons.
///
/// Each entry pairs a named envelope field with a comparison operator and an
/// operand; entries compile to consecutive `$match` stages, all of which
/// must admit a change for it to be delivered.
///
/// ```
/// use rillflow_core::{condition::ComparisonOp, filter::FieldFilters};
///
/// let filters = FieldFilters::new()
///     .event_type(ComparisonOp::Eq, "order-placed")
///     .and()
///     .data("total", ComparisonOp::Gt, 100);
/// # let _ = filters;
/// ```
#[derive(Clone, Debug, Default)]
pub struct FieldFilters {
    entries: Vec<(String, ComparisonOp, Value)>,
}

impl FieldFilters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reading aid; returns `self` unchanged.
    #[must_use]
    pub fn and(self) -> Self {
        self
    }

    /// Match on the envelope `id` attribute.
    #[must_use]
    pub fn id(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("id", op, value)
    }

    /// Match on the envelope `type` attribute.
    #[must_use]
    pub fn event_type(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("type", op, value)
    }

    /// Match on the envelope `source` attribute.
    #[must_use]
    pub fn source(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("source", op, value)
    }

    /// Match on the envelope `subject` attribute.
    #[must_use]
    pub fn subject(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("subject", op, value)
    }

    /// Match on the envelope `specversion` attribute.
    #[must_use]
    pub fn spec_version(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("specversion", op, value)
    }

    /// Match on the envelope `datacontenttype` attribute.
    #[must_use]
    pub fn data_content_type(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("datacontenttype", op, value)
    }

    /// Match on the envelope `time` attribute.
    #[must_use]
    pub fn time(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field("time", op, value)
    }

    /// Match on the synthetic stream-id attribute the store tags events
    /// with.
    #[must_use]
    pub fn stream_id(self, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field(STREAM_ID_ATTRIBUTE, op, value)
    }

    /// Match on a payload field, addressed relative to the envelope `data`
    /// attribute.
    #[must_use]
    pub fn data(self, property: &str, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field(format!("data.{property}"), op, value)
    }

    /// Match on a named extension attribute.
    #[must_use]
    pub fn extension(self, name: &str, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.field(name.to_string(), op, value)
    }

    fn field(mut self, path: impl Into<String>, op: ComparisonOp, value: impl Into<Value>) -> Self {
        self.entries.push((path.into(), op, value.into()));
        self
    }
}

/// Compile a filter specification into native pipeline stages.
///
/// `None` compiles to the empty stage sequence (match everything).
///
/// # Errors
///
/// Returns [`InvalidFilterSpecification`] for unparseable query text or a
/// stage that is not a document.
pub fn compile(
    filter: Option<&FilterSpecification>,
) -> Result<Vec<Value>, InvalidFilterSpecification> {
    match filter {
        None => Ok(Vec::new()),
        Some(FilterSpecification::Query(text)) => {
            let stage: Value =
                serde_json::from_str(text).map_err(InvalidFilterSpecification::Query)?;
            ensure_document(&stage)?;
            Ok(vec![stage])
        }
        Some(FilterSpecification::Documents(documents)) => documents
            .iter()
            .map(|document| {
                ensure_document(document)?;
                Ok(json!({ "$match": document }))
            })
            .collect(),
        Some(FilterSpecification::Fields(filters)) => Ok(filters
            .entries
            .iter()
            .map(|(path, op, value)| {
                json!({
                    "$match": {
                        (format!("{FULL_DOCUMENT}.{path}")): { (op.native_operator()): value }
                    }
                })
            })
            .collect()),
    }
}

fn ensure_document(value: &Value) -> Result<(), InvalidFilterSpecification> {
    if value.is_object() {
        Ok(())
    } else {
        Err(InvalidFilterSpecification::NotADocument(value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_filter_compiles_to_empty_pipeline() {
        assert!(compile(None).unwrap().is_empty());
    }

    #[test]
    fn query_text_becomes_single_stage() {
        let filter = FilterSpecification::query(r#"{"$match": {"fullDocument.type": "A"}}"#);
        let stages = compile(Some(&filter)).unwrap();
        assert_eq!(
            stages,
            vec![json!({"$match": {"fullDocument.type": "A"}})]
        );
    }

    #[test]
    fn invalid_query_text_is_rejected() {
        let filter = FilterSpecification::query("{not json");
        assert!(matches!(
            compile(Some(&filter)),
            Err(InvalidFilterSpecification::Query(_))
        ));
    }

    #[test]
    fn non_document_query_is_rejected() {
        let filter = FilterSpecification::query("[1, 2]");
        assert!(matches!(
            compile(Some(&filter)),
            Err(InvalidFilterSpecification::NotADocument(_))
        ));
    }

    #[test]
    fn match_documents_are_wrapped_in_match_stages() {
        let filter = FilterSpecification::documents([
            json!({"fullDocument.type": "A"}),
            json!({"fullDocument.source": "urn:x"}),
        ]);
        let stages = compile(Some(&filter)).unwrap();
        assert_eq!(
            stages,
            vec![
                json!({"$match": {"fullDocument.type": "A"}}),
                json!({"$match": {"fullDocument.source": "urn:x"}}),
            ]
        );
    }

    #[test]
    fn non_document_match_document_is_rejected() {
        let filter = FilterSpecification::documents([json!("not a document")]);
        assert!(matches!(
            compile(Some(&filter)),
            Err(InvalidFilterSpecification::NotADocument(_))
        ));
    }

    #[test]
    fn field_filters_prefix_the_full_document_namespace() {
        let filter = FilterSpecification::fields(
            FieldFilters::new()
                .event_type(ComparisonOp::Eq, "order-placed")
                .and()
                .data("total", ComparisonOp::Gt, 100),
        );
        let stages = compile(Some(&filter)).unwrap();
        assert_eq!(
            stages,
            vec![
                json!({"$match": {"fullDocument.type": {"$eq": "order-placed"}}}),
                json!({"$match": {"fullDocument.data.total": {"$gt": 100}}}),
            ]
        );
    }

    #[test]
    fn stream_id_and_extension_fields_compile() {
        let filter = FilterSpecification::fields(
            FieldFilters::new()
                .stream_id(ComparisonOp::Eq, "order-42")
                .extension("tenant", ComparisonOp::Ne, "acme"),
        );
        let stages = compile(Some(&filter)).unwrap();
        assert_eq!(
            stages,
            vec![
                json!({"$match": {"fullDocument.streamid": {"$eq": "order-42"}}}),
                json!({"$match": {"fullDocument.tenant": {"$ne": "acme"}}}),
            ]
        );
    }

    #[test]
    fn every_named_field_maps_to_its_attribute() {
        let filter = FilterSpecification::fields(
            FieldFilters::new()
                .id(ComparisonOp::Eq, "e1")
                .source(ComparisonOp::Eq, "urn:x")
                .subject(ComparisonOp::Eq, "s")
                .spec_version(ComparisonOp::Eq, "1.0")
                .data_content_type(ComparisonOp::Eq, "application/json")
                .time(ComparisonOp::Gte, "2020-01-01T00:00:00Z"),
        );
        let stages = compile(Some(&filter)).unwrap();
        let paths: Vec<&str> = stages
            .iter()
            .map(|stage| {
                stage["$match"]
                    .as_object()
                    .unwrap()
                    .keys()
                    .next()
                    .unwrap()
                    .as_str()
            })
            .collect();
        assert_eq!(
            paths,
            vec![
                "fullDocument.id",
                "fullDocument.source",
                "fullDocument.subject",
                "fullDocument.specversion",
                "fullDocument.datacontenttype",
                "fullDocument.time",
            ]
        );
    }
}
