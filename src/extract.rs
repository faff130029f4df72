use crate::model::{DatabaseSpan, LogEntry, Span, DB_STATEMENT};

/// Project every span carrying a non-empty `db.statement` tag, in span order.
///
/// Spans lacking a required field are skipped.
pub fn extract_database_spans(spans: &[Span]) -> Vec<DatabaseSpan<'_>> {
    spans
        .iter()
        .filter_map(|span| {
            let statement = span.tag(DB_STATEMENT).filter(|s| !s.is_empty())?;
            Some(DatabaseSpan {
                span_id: span.span_id.as_deref()?,
                operation_name: &span.operation_name,
                statement,
                duration: span.duration?,
                start_time: span.start_time?,
                tags: span.tags.as_deref()?,
                parent_span_id: span.parent_span_id(),
            })
        })
        .collect()
}

/// All log entries of a trace, span by span.
pub fn extract_logs(spans: &[Span]) -> Vec<&LogEntry> {
    spans.iter().flat_map(|span| span.logs.iter()).collect()
}
