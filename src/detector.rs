//! N+1 query detection.
//!
//! A statement is flagged when, within one trace, it runs more than `count_threshold` times,
//! its occurrences add up to more than `duration_threshold` microseconds, some other span
//! started before its first occurrence, and its text was not truncated by the tracer.

use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use std::{
    collections::{HashMap, HashSet},
    thread,
    time::{Duration, Instant},
};

use crate::{
    client::TraceSource,
    error::{Error, Result},
    extract::extract_database_spans,
    logger::with_trace_id,
    model::{
        AnalysisReport, DatabaseSpan, Issue, Span, TraceDetail, TraceSummary,
        N_PLUS_ONE_DESCRIPTION,
    },
};

/// Tracers cut long statements and append this marker.
const TRUNCATION_MARKER: &str = "...";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// A statement must run strictly more often than this.
    pub count: i64,
    /// Its summed duration must be strictly greater than this.
    pub duration: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            count: 5,
            duration: 50,
        }
    }
}

// Counts and durations are never negative, so a negative threshold always passes.
fn exceeds(value: u64, threshold: i64) -> bool {
    threshold < 0 || value > threshold as u64
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub thresholds: Thresholds,
    /// Traces requested per service.
    pub limit: usize,
    /// Traces analyzed concurrently; 1 keeps everything on the calling thread.
    pub workers: usize,
    /// Extra attempts for a trace fetch that failed on transport.
    pub retries: u32,
    /// Sleep before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// Budget for a whole `detect` call; traces not yet fetched when it runs out fail.
    pub deadline: Option<Duration>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            thresholds: Thresholds::default(),
            limit: 20,
            workers: 1,
            retries: 2,
            retry_backoff: Duration::from_millis(100),
            deadline: None,
        }
    }
}

/// Occurrences of one statement within a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementGroup<'a> {
    pub statement: &'a str,
    pub count: usize,
    pub total_duration: u64,
    pub first_start: u64,
    /// Earliest record of the statement in span order.
    pub first: DatabaseSpan<'a>,
}

/// Group records by exact statement text, in order of first appearance.
pub fn group_by_statement<'a>(db_spans: &[DatabaseSpan<'a>]) -> Vec<StatementGroup<'a>> {
    let mut index: HashMap<&'a str, usize> = HashMap::new();
    let mut groups: Vec<StatementGroup<'a>> = Vec::new();

    for db_span in db_spans {
        match index.get(db_span.statement).copied() {
            Some(i) => {
                let group = &mut groups[i];
                group.count += 1;
                group.total_duration = group.total_duration.saturating_add(db_span.duration);
                group.first_start = group.first_start.min(db_span.start_time);
            }
            None => {
                index.insert(db_span.statement, groups.len());
                groups.push(StatementGroup {
                    statement: db_span.statement,
                    count: 1,
                    total_duration: db_span.duration,
                    first_start: db_span.start_time,
                    first: db_span.clone(),
                });
            }
        }
    }
    groups
}

/// Walk up from `parent_span_id` to the nearest span tagged with both
/// `code.namespace` and `code.function`.
///
/// Returns `None` when the chain ends, names a span outside the trace, or loops.
pub fn find_method(spans: &[Span], parent_span_id: Option<&str>) -> Option<String> {
    let mut by_id: HashMap<&str, &Span> = HashMap::with_capacity(spans.len());
    for span in spans {
        if let Some(id) = span.span_id.as_deref() {
            by_id.entry(id).or_insert(span);
        }
    }

    let mut visited = HashSet::new();
    let mut next = parent_span_id.filter(|id| !id.is_empty());
    while let Some(id) = next {
        if !visited.insert(id) {
            debug!("Reference cycle through span {}", id);
            return None;
        }
        let span = by_id.get(id)?;
        if let Some(method) = span.code_method() {
            return Some(method);
        }
        next = span.parent_span_id();
    }
    None
}

fn is_flagged(group: &StatementGroup, spans: &[Span], thresholds: &Thresholds) -> bool {
    if group.statement.ends_with(TRUNCATION_MARKER) {
        return false;
    }
    if !exceeds(group.count as u64, thresholds.count)
        || !exceeds(group.total_duration, thresholds.duration)
    {
        return false;
    }
    spans
        .iter()
        .filter_map(|s| s.start_time)
        .any(|start| start < group.first_start)
}

/// Find N+1 statements among the spans of one already fetched trace.
pub fn detect_in_trace(trace_id: &str, spans: &[Span], thresholds: &Thresholds) -> Vec<Issue> {
    let db_spans = extract_database_spans(spans);
    let groups = group_by_statement(&db_spans);

    groups
        .iter()
        .filter(|group| is_flagged(group, spans, thresholds))
        .map(|group| Issue {
            trace_id: trace_id.to_string(),
            query: group.statement.to_string(),
            count: group.count,
            total_duration: group.total_duration,
            description: N_PLUS_ONE_DESCRIPTION.to_string(),
            method: find_method(spans, group.first.parent_span_id),
        })
        .collect()
}

/// Outcome of analyzing one trace.
#[derive(Debug)]
pub struct TraceReport {
    pub trace_id: String,
    pub outcome: Result<Vec<Issue>>,
}

pub struct Detector<S> {
    source: S,
    config: DetectorConfig,
}

impl<S: TraceSource + Sync> Detector<S> {
    pub fn new(source: S, config: DetectorConfig) -> Self {
        Detector { source, config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn load_traces(&self, service: &str) -> Result<Vec<TraceSummary>> {
        self.source.load_traces(service, self.config.limit)
    }

    /// Issues of every trace, in trace order. Stops at the first trace that could not be
    /// analyzed.
    pub fn detect(&self, traces: &[TraceSummary]) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        if self.config.workers <= 1 {
            let deadline = self.deadline();
            for summary in traces {
                issues.extend(self.analyze_trace(summary, deadline).outcome?);
            }
        } else {
            for report in self.detect_each(traces) {
                issues.extend(report.outcome?);
            }
        }
        Ok(issues)
    }

    /// One report per trace, in trace order; failures do not stop the others.
    pub fn detect_each(&self, traces: &[TraceSummary]) -> Vec<TraceReport> {
        let deadline = self.deadline();
        let workers = self.config.workers.max(1).min(traces.len());

        if workers <= 1 {
            return traces
                .iter()
                .map(|summary| self.analyze_trace(summary, deadline))
                .collect();
        }

        let (job_sender, job_receiver) = unbounded::<(usize, &TraceSummary)>();
        let (report_sender, report_receiver) = unbounded::<(usize, TraceReport)>();
        for job in traces.iter().enumerate() {
            // The receiver is still held here, so this cannot fail.
            let _ = job_sender.send(job);
        }
        drop(job_sender);

        thread::scope(|scope| {
            for _ in 0..workers {
                let jobs = job_receiver.clone();
                let reports = report_sender.clone();
                scope.spawn(move || {
                    for (index, summary) in jobs.iter() {
                        let report = self.analyze_trace(summary, deadline);
                        if reports.send((index, report)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(report_sender);

        let mut slots: Vec<Option<TraceReport>> = traces.iter().map(|_| None).collect();
        for (index, report) in report_receiver.iter() {
            slots[index] = Some(report);
        }
        slots.into_iter().flatten().collect()
    }

    /// Load the service's traces and detect over all of them.
    pub fn analyze(&self, service: &str) -> Result<AnalysisReport> {
        let traces = self.load_traces(service)?;
        info!("Analyzing {} traces of service {}", traces.len(), service);
        let n_plus_one_issues = self.detect(&traces)?;
        info!(
            "Found {} potential N+1 queries in service {}",
            n_plus_one_issues.len(),
            service
        );
        Ok(AnalysisReport { n_plus_one_issues })
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.deadline.map(|d| Instant::now() + d)
    }

    fn analyze_trace(&self, summary: &TraceSummary, deadline: Option<Instant>) -> TraceReport {
        let trace_id = summary.trace_id.as_str();
        let outcome = with_trace_id(trace_id, || -> Result<Vec<Issue>> {
            let detail = self.fetch(trace_id, deadline)?;
            let issues = detect_in_trace(trace_id, &detail.spans, &self.config.thresholds);
            for issue in &issues {
                info!(
                    "{}: {} x{} ({}us) from {}",
                    issue.description,
                    issue.query,
                    issue.count,
                    issue.total_duration,
                    issue.method.as_deref().unwrap_or("unknown method")
                );
            }
            Ok(issues)
        });
        if let Err(ref e) = outcome {
            warn!("Could not analyze trace {}: {}", trace_id, e);
        }
        TraceReport {
            trace_id: trace_id.to_string(),
            outcome,
        }
    }

    fn fetch(&self, trace_id: &str, deadline: Option<Instant>) -> Result<TraceDetail> {
        let mut attempt = 0;
        loop {
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Err(Error::DeadlineExceeded(trace_id.to_string()));
            }
            match self.source.get_trace_details(trace_id) {
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!("Fetch attempt {} failed: {}, retrying", attempt, e);
                    thread::sleep(self.config.retry_backoff * attempt);
                }
                other => return other,
            }
        }
    }
}
