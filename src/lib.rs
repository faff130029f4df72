pub mod api;
pub mod client;
pub mod detector;
pub mod error;
pub mod extract;
pub mod logger;
pub mod model;

pub use crate::{
    client::{Config, JaegerClient, LoggingConfig, TraceSource},
    detector::{detect_in_trace, Detector, DetectorConfig, Thresholds, TraceReport},
    error::{Error, Result},
    extract::{extract_database_spans, extract_logs},
    model::{AnalysisReport, DatabaseSpan, Issue, Span, Tag, TraceDetail, TraceSummary},
};
