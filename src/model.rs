use serde::{Deserialize, Serialize};

pub const DB_STATEMENT: &str = "db.statement";
pub const CODE_FUNCTION: &str = "code.function";
pub const CODE_NAMESPACE: &str = "code.namespace";

pub const N_PLUS_ONE_DESCRIPTION: &str = "Potential N+1 query detected";

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub ref_type: String,
    pub trace_id: String,
    pub span_id: String,
}

impl Reference {
    pub fn child_of(span_id: &str) -> Self {
        Reference {
            ref_type: "CHILD_OF".to_string(),
            trace_id: String::new(),
            span_id: span_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: u64,
    pub fields: Vec<Tag>,
}

/// One timed operation of a trace. Times are in microseconds.
///
/// The required fields are optional here: a span the tracer sent incomplete stays in its trace
/// so it can still precede other spans or sit on an ancestry chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub span_id: Option<String>,
    pub operation_name: String,
    pub duration: Option<u64>,
    pub start_time: Option<u64>,
    pub tags: Option<Vec<Tag>>,
    pub logs: Vec<LogEntry>,
    pub references: Vec<Reference>,
}

impl Span {
    /// First required field this span lacks, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.span_id.is_none() {
            Some("spanID")
        } else if self.duration.is_none() {
            Some("duration")
        } else if self.start_time.is_none() {
            Some("startTime")
        } else if self.tags.is_none() {
            Some("tags")
        } else {
            None
        }
    }

    pub fn tag_list(&self) -> &[Tag] {
        self.tags.as_deref().unwrap_or(&[])
    }

    /// Value of the last tag named `key`; later tags shadow earlier ones.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tag_list()
            .iter()
            .rev()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// The span named by the first reference. An empty id counts as no parent.
    pub fn parent_span_id(&self) -> Option<&str> {
        self.references
            .first()
            .map(|r| r.span_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// `namespace.function` when both code tags are present and non-empty.
    pub fn code_method(&self) -> Option<String> {
        let function = self.tag(CODE_FUNCTION).filter(|f| !f.is_empty())?;
        let namespace = self.tag(CODE_NAMESPACE).filter(|n| !n.is_empty())?;
        Some(format!("{}.{}", namespace, function))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TraceSummary {
    #[serde(rename = "traceID")]
    pub trace_id: String,
}

impl TraceSummary {
    pub fn new(trace_id: &str) -> Self {
        TraceSummary {
            trace_id: trace_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceDetail {
    pub trace_id: String,
    pub spans: Vec<Span>,
    /// Spans lacking a required field. They are kept in `spans` but never extracted.
    pub malformed_spans: usize,
}

/// A span carrying a non-empty `db.statement` tag, borrowed from its trace.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSpan<'a> {
    pub span_id: &'a str,
    pub operation_name: &'a str,
    pub statement: &'a str,
    pub duration: u64,
    pub start_time: u64,
    pub tags: &'a [Tag],
    pub parent_span_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub trace_id: String,
    pub query: String,
    pub count: usize,
    pub total_duration: u64,
    pub description: String,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub n_plus_one_issues: Vec<Issue>,
}
