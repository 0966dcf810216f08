//! Metrics scraping for resource-bound assertions.
//!
//! Exposition text is line oriented: `<series><whitespace><value>`, with
//! `#` lines for help and type metadata. Lookups match the series token
//! exactly, so `mz_compute_command_history_size` never matches
//! `mz_compute_command_history_size_bytes`. Line order carries no meaning.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// No line carries this exact series name.
    #[error("metric not found: {metric}")]
    NotFound {
        /// Requested series.
        metric: String,
    },

    /// Endpoint could not be reached.
    #[error("metrics endpoint {url} unreachable: {source}")]
    Unreachable {
        /// Scraped URL.
        url: String,
        /// Underlying HTTP error.
        source: reqwest::Error,
    },

    /// Endpoint answered with a non-success status.
    #[error("metrics endpoint {url} returned {status}")]
    Status {
        /// Scraped URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Value token is not a number.
    #[error("invalid value for {metric}: {value:?}")]
    InvalidValue {
        /// Series name.
        metric: String,
        /// Raw value token.
        value: String,
    },
}

/// One parsed exposition line.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Series token, including any `{label="..."}` block.
    pub name: String,
    /// Sample value.
    pub value: f64,
}

impl MetricSample {
    /// Parse one line. Comments and blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Result<Self, MetricsError>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (name, rest) = split_series(line)?;
        let value = rest.split_whitespace().next()?;
        Some(
            parse_value(value)
                .map(|value| MetricSample {
                    name: name.to_string(),
                    value,
                })
                .ok_or_else(|| MetricsError::InvalidValue {
                    metric: name.to_string(),
                    value: value.to_string(),
                }),
        )
    }
}

/// All samples from one scrape.
///
/// A line with an unparseable value is kept aside and only reported when
/// its own series is requested.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    samples: HashMap<String, f64>,
    invalid: HashMap<String, String>,
}

impl MetricsSnapshot {
    /// Parse exposition text.
    pub fn parse(text: &str) -> Self {
        let mut snapshot = Self::default();
        for sample in text.lines().filter_map(MetricSample::parse_line) {
            match sample {
                Ok(sample) => {
                    snapshot.invalid.remove(&sample.name);
                    snapshot.samples.insert(sample.name, sample.value);
                }
                Err(MetricsError::InvalidValue { metric, value }) => {
                    snapshot.samples.remove(&metric);
                    snapshot.invalid.insert(metric, value);
                }
                Err(_) => {}
            }
        }
        if !snapshot.invalid.is_empty() {
            tracing::debug!(lines = snapshot.invalid.len(), "skipped invalid sample lines");
        }
        snapshot
    }

    /// Value of the series named exactly `metric`.
    ///
    /// # Errors
    ///
    /// - `InvalidValue` if the series' value is not numeric
    /// - `NotFound` if no line carries the series
    pub fn get(&self, metric: &str) -> Result<f64, MetricsError> {
        if let Some(value) = self.samples.get(metric) {
            return Ok(*value);
        }
        match self.invalid.get(metric) {
            Some(value) => Err(MetricsError::InvalidValue {
                metric: metric.to_string(),
                value: value.clone(),
            }),
            None => Err(MetricsError::NotFound {
                metric: metric.to_string(),
            }),
        }
    }

    /// Number of valid samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the scrape had no valid samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Find `metric` in exposition text by exact series name.
pub fn parse(text: &str, metric: &str) -> Result<f64, MetricsError> {
    for sample in text.lines().filter_map(MetricSample::parse_line) {
        match sample {
            Ok(sample) if sample.name == metric => return Ok(sample.value),
            Err(MetricsError::InvalidValue { metric: name, value }) if name == metric => {
                return Err(MetricsError::InvalidValue { metric: name, value });
            }
            _ => {}
        }
    }
    Err(MetricsError::NotFound {
        metric: metric.to_string(),
    })
}

/// HTTP client for metrics endpoints.
#[derive(Debug, Clone)]
pub struct MetricsScraper {
    client: reqwest::Client,
}

impl MetricsScraper {
    /// Scraper whose requests time out after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| MetricsError::Unreachable {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }

    /// GET `url` and return the body.
    pub async fn scrape(&self, url: &str) -> Result<String, MetricsError> {
        tracing::debug!("scraping {}", url);
        let unreachable = |source| MetricsError::Unreachable {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(unreachable)
    }
}

/// Split a sample line into its series token and the rest.
///
/// Label values may contain spaces and braces, so a label block ends at the
/// first `}` outside a quoted value.
fn split_series(line: &str) -> Option<(&str, &str)> {
    let space = line.find(char::is_whitespace)?;
    let open = match line.find('{') {
        Some(open) if open < space => open,
        _ => return Some((&line[..space], &line[space..])),
    };

    let mut quoted = false;
    let mut escaped = false;
    for (offset, c) in line[open..].char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '}' if !quoted => {
                let close = open + offset;
                return Some((&line[..=close], &line[close + 1..]));
            }
            _ => {}
        }
    }
    None
}

fn parse_value(token: &str) -> Option<f64> {
    match token {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => token.parse().ok(),
    }
}
