//! InfluxDB 1.x time-series sink.
//!
//! Only two operations are needed: write a batch of points in line protocol
//! and run a provisioning query.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::server::config::InfluxConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A field value in line protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
}

/// A single time-series point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Start a point with no tags or fields.
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    /// Look up a field by key.
    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a tag by key.
    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Render in line protocol with a nanosecond timestamp.
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(128);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            line.push(if i == 0 { ' ' } else { ',' });
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            match value {
                FieldValue::Str(s) => {
                    line.push('"');
                    escape_into(&mut line, s, &['"', '\\']);
                    line.push('"');
                }
                FieldValue::Int(n) => {
                    let _ = write!(line, "{}i", n);
                }
            }
        }

        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let _ = write!(line, " {}", nanos);
        line
    }
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Storage boundary used by the metrics pipeline.
#[async_trait]
pub trait PointWriter: Send + Sync {
    /// Write one batch of points.
    async fn write(&self, points: Vec<Point>) -> Result<()>;

    /// Run an administrative query.
    async fn query(&self, query: &str) -> Result<()>;
}

/// HTTP client for the InfluxDB 1.x API.
pub struct InfluxClient {
    http: reqwest::Client,
    write_url: Url,
    query_url: Url,
    user: String,
    password: String,
}

impl InfluxClient {
    /// Build a client from configuration. No request is made.
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let base = Url::parse(&config.addr)
            .map_err(|e| Error::config(format!("invalid influxdb.addr {:?}: {}", config.addr, e)))?;

        // Writes go to the database's default retention policy, which is
        // ours only when provisioning succeeded.
        let mut write_url = base
            .join("write")
            .map_err(|e| Error::config(format!("invalid influxdb.addr: {}", e)))?;
        write_url
            .query_pairs_mut()
            .append_pair("db", &config.database)
            .append_pair("precision", "ns");

        let mut query_url = base
            .join("query")
            .map_err(|e| Error::config(format!("invalid influxdb.addr: {}", e)))?;
        query_url.query_pairs_mut().append_pair("db", &config.database);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::storage(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            write_url,
            query_url,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.user.is_empty() {
            req
        } else {
            req.basic_auth(&self.user, Some(&self.password))
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::storage(format!("{}: {}", status, body.trim())))
    }
}

#[async_trait]
impl PointWriter for InfluxClient {
    async fn write(&self, points: Vec<Point>) -> Result<()> {
        let body = points
            .iter()
            .map(Point::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        self.send(self.http.post(self.write_url.clone()).body(body)).await
    }

    async fn query(&self, query: &str) -> Result<()> {
        let mut url = self.query_url.clone();
        url.query_pairs_mut().append_pair("q", query);
        self.send(self.http.post(url)).await
    }
}

/// Create the database and its default retention policy.
///
/// Failures are logged and otherwise ignored.
pub async fn provision(writer: &dyn PointWriter, config: &InfluxConfig) {
    let create_db = format!("create database {}", config.database);
    if let Err(e) = writer.query(&create_db).await {
        warn!("create database failed: {}", e);
        return;
    }

    let create_rp = format!(
        "create retention policy {} on {} duration {} replication 1 default",
        config.retention_policy, config.database, config.retention
    );
    if let Err(e) = writer.query(&create_rp).await {
        warn!("create retention policy failed: {}", e);
        return;
    }

    debug!(database = %config.database, "influxdb provisioned");
}

/// [`PointWriter`] that keeps everything in memory.
///
/// Handy for dry runs and for exercising the pipeline without a database.
#[derive(Default)]
pub struct MemoryWriter {
    batches: Mutex<Vec<Vec<Point>>>,
    queries: Mutex<Vec<String>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches written so far, in order.
    pub fn batches(&self) -> Vec<Vec<Point>> {
        self.batches.lock().clone()
    }

    /// Queries run so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    /// Total number of points written.
    pub fn point_count(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl PointWriter for MemoryWriter {
    async fn write(&self, points: Vec<Point>) -> Result<()> {
        self.batches.lock().push(points);
        Ok(())
    }

    async fn query(&self, query: &str) -> Result<()> {
        self.queries.lock().push(query.to_string());
        Ok(())
    }
}
