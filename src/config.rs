//! Configuration management for the instrumentation middleware

use crate::error::{InstrumentError, Result};
use crate::options::TransformOptions;
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Header value that forbids any caching of an instrumented response
pub const NO_CACHE_DIRECTIVES: &str =
    "no-cache, private, no-store, must-revalidate, max-stale=0, post-check=0, pre-check=0";

/// Configuration for the instrumentation middleware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Options forwarded verbatim to the instrumenter
    ///
    /// Explicitly-set fields take precedence over the per-request `path` and
    /// `include_prefix` defaults.
    #[serde(default)]
    pub transform: TransformOptions,

    /// Content-type substring selecting the JavaScript path
    #[serde(default = "default_javascript_content_type")]
    pub javascript_content_type: String,

    /// Content-type substring selecting the HTML path
    #[serde(default = "default_html_content_type")]
    pub html_content_type: String,

    /// Cache-Control value set on every intercepted response
    #[serde(default = "default_cache_control")]
    pub cache_control: String,

    /// Upstream server address
    #[serde(default = "default_upstream")]
    pub upstream_address: String,

    /// Address the proxy listens on
    #[serde(default = "default_listen")]
    pub listen_address: String,

    /// Command implementing the instrumenter (program followed by arguments)
    #[serde(default)]
    pub instrumenter_command: Option<Vec<String>>,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_javascript_content_type() -> String {
    "application/javascript".to_string()
}

fn default_html_content_type() -> String {
    "text/html".to_string()
}

fn default_cache_control() -> String {
    NO_CACHE_DIRECTIVES.to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:6188".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        InstrumentConfig {
            transform: TransformOptions::default(),
            javascript_content_type: default_javascript_content_type(),
            html_content_type: default_html_content_type(),
            cache_control: default_cache_control(),
            upstream_address: default_upstream(),
            listen_address: default_listen(),
            instrumenter_command: None,
            metrics_endpoint: None,
        }
    }
}

impl InstrumentConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(InstrumentConfig)` if loading and validation succeed
    /// * `Err(InstrumentError)` if the file cannot be read or is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            InstrumentError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: InstrumentConfig = serde_yaml::from_str(content).map_err(|e| {
            InstrumentError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - content-type patterns must not be empty
    /// - cache_control must be a valid header value
    /// - listen_address must be a socket address, upstream_address non-empty
    /// - instrumenter_command, when present, must name a program
    /// - an enabled metrics endpoint needs a valid socket address
    pub fn validate(&self) -> Result<()> {
        if self.javascript_content_type.is_empty() {
            return Err(InstrumentError::ConfigError(
                "javascript_content_type must not be empty".to_string(),
            ));
        }

        if self.html_content_type.is_empty() {
            return Err(InstrumentError::ConfigError(
                "html_content_type must not be empty".to_string(),
            ));
        }

        self.cache_control_value()?;

        if self.upstream_address.trim().is_empty() {
            return Err(InstrumentError::ConfigError(
                "upstream_address must not be empty".to_string(),
            ));
        }

        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            InstrumentError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })?;

        if let Some(command) = &self.instrumenter_command {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(InstrumentError::ConfigError(
                    "instrumenter_command must start with a program name".to_string(),
                ));
            }
        }

        if let Some(endpoint) = &self.metrics_endpoint {
            if endpoint.enabled {
                endpoint.address.parse::<SocketAddr>().map_err(|e| {
                    InstrumentError::ConfigError(format!(
                        "Invalid metrics_endpoint address '{}': {}",
                        endpoint.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// The configured Cache-Control directive as a header value
    pub fn cache_control_value(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&self.cache_control).map_err(|e| {
            InstrumentError::ConfigError(format!("Invalid cache_control value: {}", e))
        })
    }

    /// Upstream `(host, port)`, defaulting the port to 80
    pub fn upstream_host_port(&self) -> (String, u16) {
        let upstream = self.upstream_address.trim();
        match upstream.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (upstream.to_string(), 80),
            },
            None => (upstream.to_string(), 80),
        }
    }
}
