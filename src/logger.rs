use chrono::{DateTime, Utc};
use log::{Log, Metadata, Record, SetLoggerError};
use std::cell::RefCell;

use crate::client::LoggingConfig;

thread_local! {
    static TRACE_ID: RefCell<Option<String>> = RefCell::new(None);
}

/// Trace currently being analyzed on this thread, if any.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.with(|id| id.borrow().clone())
}

/// Run `f` with `trace_id` attached to every log line emitted on this thread.
pub fn with_trace_id<R>(trace_id: &str, f: impl FnOnce() -> R) -> R {
    let previous = TRACE_ID.with(|id| id.replace(Some(trace_id.to_string())));
    let result = f();
    TRACE_ID.with(|id| *id.borrow_mut() = previous);
    result
}

pub struct Logger {
    config: LoggingConfig,
}

impl Logger {
    pub fn new(config: LoggingConfig) -> Self {
        Logger { config }
    }

    /// Install as the global logger. Fails if another logger was set first.
    pub fn init(config: LoggingConfig) -> Result<(), SetLoggerError> {
        let level = config.level.to_level_filter();
        log::set_boxed_logger(Box::new(Logger::new(config)))?;
        log::set_max_level(level);
        Ok(())
    }

    fn skip(&self, module: Option<&str>, body: &str) -> bool {
        let mod_skip = module
            .map(|m| self.config.mod_filter.iter().any(|f| m.contains(*f)))
            .unwrap_or(false);
        let body_skip = self.config.body_filter.iter().any(|f| body.contains(*f));
        mod_skip || body_skip
    }

    /// Render a record, or `None` if it is filtered out.
    pub fn format(
        &self,
        record: &Record,
        time: DateTime<Utc>,
        trace_id: Option<&str>,
    ) -> Option<String> {
        if record.level() > self.config.level {
            return None;
        }
        let body = format!("{}", record.args());
        if self.skip(record.module_path(), &body) {
            return None;
        }
        let time = time.format(self.config.time_format.as_str());
        let module = record.module_path().unwrap_or("-");
        Some(match trace_id {
            Some(tr) => format!(
                "{time} {level} [trace-id:{traceid}] [{module}] {body}",
                time = time,
                level = record.level(),
                traceid = tr,
                module = module,
                body = body
            ),
            None => format!(
                "{time} {level} [{module}] {body}",
                time = time,
                level = record.level(),
                module = module,
                body = body
            ),
        })
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        let trace_id = current_trace_id();
        if let Some(line) = self.format(record, Utc::now(), trace_id.as_deref()) {
            println!("{}", line);
        }
    }

    fn flush(&self) {}
}
