use log::{debug, trace, Level as LogLevel};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::{
    api::{ApiResponse, RawTrace},
    error::{Error, Result},
    logger::Logger,
    model::{TraceDetail, TraceSummary},
};

/// Configuration settings for the client.
#[derive(Clone, Debug)]
pub struct Config {
    /// Jaeger query host/ip, defaults to `localhost`.
    pub host: String,
    /// Jaeger query port, defaults to `16686`.
    pub port: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Optional Logging Config to also set up the crate logger
    pub logging_config: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: "16686".to_string(),
            timeout: Duration::from_secs(10),
            logging_config: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub time_format: String,
    pub mod_filter: Vec<&'static str>,
    pub body_filter: Vec<&'static str>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            time_format: "%Y-%m-%d %H:%M:%S%z".to_string(),
            mod_filter: Vec::new(),
            body_filter: Vec::new(),
        }
    }
}

/// Where traces come from.
pub trait TraceSource {
    /// Up to `limit` recent traces of `service`, in the source's order.
    fn load_traces(&self, service: &str, limit: usize) -> Result<Vec<TraceSummary>>;

    /// Every span of one trace.
    fn get_trace_details(&self, trace_id: &str) -> Result<TraceDetail>;
}

impl<'a, S: TraceSource + ?Sized> TraceSource for &'a S {
    fn load_traces(&self, service: &str, limit: usize) -> Result<Vec<TraceSummary>> {
        (**self).load_traces(service, limit)
    }

    fn get_trace_details(&self, trace_id: &str) -> Result<TraceDetail> {
        (**self).get_trace_details(trace_id)
    }
}

/// Blocking client for the Jaeger query HTTP API.
#[derive(Debug, Clone)]
pub struct JaegerClient {
    endpoint: String,
    timeout: Duration,
}

impl JaegerClient {
    pub fn new(config: Config) -> JaegerClient {
        if let Some(lc) = config.logging_config {
            let _ = Logger::init(lc);
        }
        JaegerClient {
            endpoint: format!("http://{}:{}/api/traces", config.host, config.port),
            timeout: config.timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Option<ApiResponse<T>>> {
        trace!("GET {} {:?}", url, params);
        let resp = attohttpc::get(url)
            .params(params.iter().map(|(k, v)| (*k, v.as_str())))
            .timeout(self.timeout)
            .send()?;

        let status = resp.status();
        let body = resp.bytes()?;
        if status.is_success() {
            return Ok(Some(serde_json::from_slice(&body)?));
        }

        // Error bodies carry Jaeger's own explanation in `errors`, when they parse at all.
        let reason = serde_json::from_slice::<ApiResponse<Value>>(&body)
            .ok()
            .and_then(|resp| resp.error_message());
        if status == attohttpc::StatusCode::NOT_FOUND {
            debug!(
                "{} answered {}: {}",
                url,
                status,
                reason.as_deref().unwrap_or("no details")
            );
            return Ok(None);
        }
        Err(Error::SourceUnavailable(match reason {
            Some(reason) => format!("{} answered {}: {}", url, status, reason),
            None => format!("{} answered {}", url, status),
        }))
    }
}

impl TraceSource for JaegerClient {
    fn load_traces(&self, service: &str, limit: usize) -> Result<Vec<TraceSummary>> {
        let params = [("service", service.to_string()), ("limit", limit.to_string())];
        let traces = self
            .get::<TraceSummary>(&self.endpoint, &params)?
            .map(|resp| resp.data)
            .unwrap_or_default();
        debug!("Loaded {} traces for service {}", traces.len(), service);
        Ok(traces)
    }

    fn get_trace_details(&self, trace_id: &str) -> Result<TraceDetail> {
        let url = format!("{}/{}", self.endpoint, trace_id);
        let raw = self
            .get::<RawTrace>(&url, &[])?
            .and_then(|resp| resp.data.into_iter().next())
            .ok_or_else(|| Error::TraceNotFound(trace_id.to_string()))?;

        let mut detail = raw.into_detail();
        if detail.trace_id.is_empty() {
            detail.trace_id = trace_id.to_string();
        }
        debug!(
            "Fetched {} spans for trace {} ({} malformed)",
            detail.spans.len(),
            trace_id,
            detail.malformed_spans
        );
        Ok(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_config() {
        let client = JaegerClient::new(Config {
            host: "jaeger.internal".to_string(),
            port: "8080".to_string(),
            ..Default::default()
        });
        assert_eq!(client.endpoint(), "http://jaeger.internal:8080/api/traces");

        let default = JaegerClient::new(Config::default());
        assert_eq!(default.endpoint(), "http://localhost:16686/api/traces");
    }
}
