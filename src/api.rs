use crate::model::{LogEntry, Reference, Span, Tag, TraceDetail};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{Map, Value};

// Jaeger sends `null` for empty collections, e.g. `"data": null` on a 404.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Envelope of every Jaeger query API response.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty")]
    pub data: Vec<T>,
    #[serde(default)]
    pub errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl<T> ApiResponse<T> {
    /// The `errors` list as one line, e.g. `trace not found (404)`.
    pub fn error_message(&self) -> Option<String> {
        let errors = self.errors.as_ref().filter(|e| !e.is_empty())?;
        Some(
            errors
                .iter()
                .map(|e| format!("{} ({})", e.msg, e.code))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// One trace as sent by Jaeger. Spans stay raw JSON until `into_detail` so a
/// bad span cannot fail the whole trace.
#[derive(Debug, Deserialize)]
pub struct RawTrace {
    #[serde(rename = "traceID", default)]
    pub trace_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub spans: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
pub struct RawLog {
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    fields: Value,
}

#[derive(Debug, Deserialize)]
pub struct RawReference {
    #[serde(rename = "refType", default)]
    ref_type: String,
    #[serde(rename = "traceID", default)]
    trace_id: String,
    #[serde(rename = "spanID", default)]
    span_id: String,
}

// Tag values arrive typed; the detector only compares strings.
fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl From<RawKeyValue> for Tag {
    fn from(kv: RawKeyValue) -> Self {
        Tag {
            key: kv.key,
            value: value_to_string(kv.value),
        }
    }
}

impl From<RawLog> for LogEntry {
    fn from(log: RawLog) -> Self {
        LogEntry {
            timestamp: log.timestamp,
            fields: decode_list::<RawKeyValue>(log.fields)
                .map(|(fields, _)| fields.into_iter().map(Tag::from).collect())
                .unwrap_or_default(),
        }
    }
}

impl From<RawReference> for Reference {
    fn from(r: RawReference) -> Self {
        Reference {
            ref_type: r.ref_type,
            trace_id: r.trace_id,
            span_id: r.span_id,
        }
    }
}

/// Decode a JSON array item by item: the items that fit `T`, and how many did not.
/// Anything other than an array is `None`.
fn decode_list<T: DeserializeOwned>(value: Value) -> Option<(Vec<T>, usize)> {
    let items = match value {
        Value::Array(items) => items,
        _ => return None,
    };
    let total = items.len();
    let decoded: Vec<T> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    let skipped = total - decoded.len();
    Some((decoded, skipped))
}

fn take<T: DeserializeOwned>(fields: &mut Map<String, Value>, key: &str) -> Option<T> {
    fields
        .remove(key)
        .and_then(|value| serde_json::from_value(value).ok())
}

fn take_list<T: DeserializeOwned>(fields: &mut Map<String, Value>, key: &str) -> Vec<T> {
    fields
        .remove(key)
        .and_then(decode_list::<T>)
        .map(|(items, _)| items)
        .unwrap_or_default()
}

/// Build a `Span` from its JSON object. Required fields that are absent or of the
/// wrong type become `None`; tags without a key are skipped and counted.
fn decode_span(mut fields: Map<String, Value>) -> (Span, usize) {
    let (tags, skipped_tags) = match fields.remove("tags").and_then(decode_list::<RawKeyValue>) {
        Some((tags, skipped)) => (Some(tags.into_iter().map(Tag::from).collect()), skipped),
        None => (None, 0),
    };
    let span = Span {
        span_id: take::<String>(&mut fields, "spanID").filter(|id| !id.is_empty()),
        operation_name: take(&mut fields, "operationName").unwrap_or_default(),
        duration: take(&mut fields, "duration"),
        start_time: take(&mut fields, "startTime"),
        tags,
        logs: take_list::<RawLog>(&mut fields, "logs")
            .into_iter()
            .map(LogEntry::from)
            .collect(),
        references: take_list::<RawReference>(&mut fields, "references")
            .into_iter()
            .map(Reference::from)
            .collect(),
    };
    (span, skipped_tags)
}

impl RawTrace {
    /// Convert into a `TraceDetail`.
    ///
    /// Spans missing a required field are kept and counted as malformed. Entries that
    /// are not JSON objects are dropped and counted too.
    pub fn into_detail(self) -> TraceDetail {
        let trace_id = self.trace_id;
        let mut malformed_spans = 0;
        let mut spans = Vec::with_capacity(self.spans.len());

        for (position, raw) in self.spans.into_iter().enumerate() {
            let fields = match raw {
                Value::Object(fields) => fields,
                other => {
                    warn!(
                        "Dropping span #{} of trace {}: expected an object, got {}",
                        position, trace_id, other
                    );
                    malformed_spans += 1;
                    continue;
                }
            };

            let (span, skipped_tags) = decode_span(fields);
            if skipped_tags > 0 {
                warn!(
                    "Skipped {} unreadable tags of span #{} of trace {}",
                    skipped_tags, position, trace_id
                );
            }
            if let Some(field) = span.missing_field() {
                warn!(
                    "Span #{} of trace {} is missing {}",
                    position, trace_id, field
                );
                malformed_spans += 1;
            }
            spans.push(span);
        }

        TraceDetail {
            trace_id,
            spans,
            malformed_spans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_trace_detail() {
        let body = json!({
            "data": [{
                "traceID": "abc",
                "spans": [
                    {
                        "traceID": "abc",
                        "spanID": "1",
                        "operationName": "GET /pets",
                        "references": [],
                        "startTime": 1000,
                        "duration": 500,
                        "tags": [
                            {"key": "http.status_code", "type": "int64", "value": 200},
                            {"key": "error", "type": "bool", "value": false}
                        ],
                        "logs": [
                            {"timestamp": 1001, "fields": [{"key": "event", "type": "string", "value": "start"}]}
                        ],
                        "processID": "p1",
                        "warnings": null
                    },
                    {
                        "traceID": "abc",
                        "spanID": "2",
                        "operationName": "SELECT pets",
                        "references": [{"refType": "CHILD_OF", "traceID": "abc", "spanID": "1"}],
                        "startTime": 1010,
                        "duration": 12,
                        "tags": [{"key": "db.statement", "type": "string", "value": "SELECT * FROM pets"}]
                    }
                ],
                "processes": {}
            }],
            "total": 0,
            "limit": 0,
            "offset": 0,
            "errors": null
        });

        let resp: ApiResponse<RawTrace> = serde_json::from_value(body).unwrap();
        let detail = resp.data.into_iter().next().unwrap().into_detail();

        assert_eq!(detail.trace_id, "abc");
        assert_eq!(detail.malformed_spans, 0);
        assert_eq!(detail.spans.len(), 2);

        let root = &detail.spans[0];
        assert_eq!(root.tag("http.status_code"), Some("200"));
        assert_eq!(root.tag("error"), Some("false"));
        assert_eq!(root.logs[0].fields[0].value, "start");
        assert_eq!(root.parent_span_id(), None);

        let child = &detail.spans[1];
        assert_eq!(child.parent_span_id(), Some("1"));
        assert_eq!(child.tag("db.statement"), Some("SELECT * FROM pets"));
    }

    #[test]
    fn test_incomplete_spans_are_kept_and_counted() {
        let body = json!({
            "traceID": "abc",
            "spans": [
                {"spanID": "1", "startTime": 0, "duration": 5, "tags": []},
                {"spanID": "2", "startTime": 1, "tags": []},
                {"startTime": 1, "duration": 3, "tags": []},
                {"spanID": "4", "startTime": 2, "duration": 3},
                {"spanID": "", "startTime": 2, "duration": 3, "tags": []}
            ]
        });

        let raw: RawTrace = serde_json::from_value(body).unwrap();
        let detail = raw.into_detail();

        assert_eq!(detail.malformed_spans, 4);
        assert_eq!(detail.spans.len(), 5);
        assert_eq!(detail.spans[0].missing_field(), None);
        assert_eq!(detail.spans[1].missing_field(), Some("duration"));
        assert_eq!(detail.spans[1].start_time, Some(1));
        assert_eq!(detail.spans[2].missing_field(), Some("spanID"));
        assert_eq!(detail.spans[3].missing_field(), Some("tags"));
        assert_eq!(detail.spans[4].span_id, None);
    }

    #[test]
    fn test_bad_parts_do_not_fail_the_trace() {
        let body = json!({
            "data": [{
                "traceID": "abc",
                "spans": [
                    {
                        "spanID": "1",
                        "startTime": 0,
                        "duration": 5,
                        "tags": [
                            {"value": "no key"},
                            {"key": "db.statement", "type": "string", "value": "SELECT 1"}
                        ],
                        "logs": [
                            {
                                "timestamp": 3,
                                "fields": [{"value": "x"}, {"key": "event", "value": "y"}]
                            },
                            "not a log"
                        ]
                    },
                    {"spanID": "2", "startTime": 1, "duration": "abc", "tags": []},
                    {"spanID": 3, "startTime": 1, "duration": 5, "tags": [], "references": "none"},
                    "not a span",
                    null
                ]
            }]
        });

        let resp: ApiResponse<RawTrace> = serde_json::from_value(body).unwrap();
        let detail = resp.data.into_iter().next().unwrap().into_detail();

        // Two entries are dropped, two spans kept with a missing field.
        assert_eq!(detail.spans.len(), 3);
        assert_eq!(detail.malformed_spans, 4);

        let first = &detail.spans[0];
        assert_eq!(first.missing_field(), None);
        assert_eq!(first.tag_list().len(), 1);
        assert_eq!(first.tag("db.statement"), Some("SELECT 1"));
        assert_eq!(first.logs.len(), 1);
        assert_eq!(first.logs[0].fields, vec![Tag::new("event", "y")]);

        assert_eq!(detail.spans[1].span_id.as_deref(), Some("2"));
        assert_eq!(detail.spans[1].duration, None);
        assert_eq!(detail.spans[2].span_id, None);
        assert!(detail.spans[2].references.is_empty());
    }

    #[test]
    fn test_null_data_is_empty() {
        let resp: ApiResponse<RawTrace> = serde_json::from_value(json!({
            "data": null,
            "errors": [{"code": 404, "msg": "trace not found"}]
        }))
        .unwrap();
        assert!(resp.data.is_empty());
        assert_eq!(resp.error_message().as_deref(), Some("trace not found (404)"));
    }

    #[test]
    fn test_error_message() {
        let resp: ApiResponse<Value> = serde_json::from_value(json!({
            "data": [],
            "errors": [
                {"code": 500, "msg": "storage down"},
                {"code": 503, "msg": "retry later"}
            ]
        }))
        .unwrap();
        assert_eq!(
            resp.error_message().as_deref(),
            Some("storage down (500); retry later (503)")
        );

        let none: ApiResponse<Value> =
            serde_json::from_value(json!({"data": [], "errors": []})).unwrap();
        assert_eq!(none.error_message(), None);
    }
}
