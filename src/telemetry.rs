//! Logging and metrics bootstrap for processes embedding tenantstore.
//!
//! Library code only emits `tracing` events and records through
//! `opentelemetry::global::meter`. [`Telemetry::init`] wires both to a
//! subscriber and a meter provider; without it, events and metrics are
//! dropped.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    pub resource_attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    /// Environment variables:
    /// - OTEL_SERVICE_NAME (default: `default_service_name`)
    /// - OTEL_RESOURCE_ATTRIBUTES: comma separated key=value pairs
    /// - TENANTSTORE_LOG_FORMAT: "json" (default) or "text"
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "OTEL_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let log_format = match std::env::var("TENANTSTORE_LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw)?,
            Err(_) => LogFormat::Json,
        };

        let mut attrs: BTreeMap<String, String> = BTreeMap::new();
        if let Ok(raw) = std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            attrs.extend(parse_resource_attributes(&raw)?);
        }
        attrs.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
        attrs
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| "tenantstore".to_string());

        Ok(Self {
            service_name: service_name.to_string(),
            log_format,
            resource_attributes: attrs
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
        })
    }
}

/// Keeps the meter provider alive; flushes it on drop.
pub struct Telemetry {
    config: TelemetryConfig,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Install the global subscriber and meter provider.
    ///
    /// `RUST_LOG` overrides `log_level` when set. Fails if a global
    /// subscriber is already installed.
    pub fn init(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true);
        let installed = match config.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        let resource =
            Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());

        info!(
            service_name = %config.service_name,
            log_format = config.log_format.as_str(),
            "Telemetry bootstrap initialized"
        );

        Ok(Self {
            config,
            meter_provider,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.meter_provider
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" | "plain" => Ok(LogFormat::Text),
        other => Err(Error::Config(format!(
            "TENANTSTORE_LOG_FORMAT must be one of [json, text], got '{other}'"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
            ));
        }
        attrs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level(" INFO ").unwrap(), Level::INFO);
        let err = parse_log_level("loud").unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("Text").unwrap(), LogFormat::Text);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_parse_resource_attributes() {
        let attrs = parse_resource_attributes("service.instance.id=abc, zone = a ,").unwrap();
        assert_eq!(
            attrs,
            vec![
                ("service.instance.id".to_string(), "abc".to_string()),
                ("zone".to_string(), "a".to_string())
            ]
        );
        assert!(parse_resource_attributes("broken").is_err());
        assert!(parse_resource_attributes("=x").is_err());
    }
}
