//! Connection metadata pipeline.
//!
//! Relays hand a [`ConnectionRecord`] to the shared [`Recorder`] when they
//! finish. Records go through a bounded queue to a single flush task that
//! writes them to the store in batches of half the queue capacity. A full
//! queue suspends the producer; records are never dropped on the way in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::Result;
use crate::server::config::InfluxConfig;
use crate::server::influx::{self, FieldValue, InfluxClient, Point, PointWriter};

/// Measurement name for relay records.
pub const MEASUREMENT: &str = "flow";

/// Metadata of one completed TCP relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Host the serving node is bound on
    pub listen_host: String,
    /// Port of the serving node
    pub listen_port: u16,
    /// Remote address of the inbound connection
    pub client_addr: String,
    /// Decoded destination
    pub target_addr: String,
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Convert to a `flow` point.
    pub fn to_point(&self) -> Point {
        Point::new(MEASUREMENT, self.timestamp)
            .tag("host", self.listen_host.clone())
            .tag("port", self.listen_port.to_string())
            .field("caddr", FieldValue::Str(self.client_addr.clone()))
            .field("saddr", FieldValue::Str(self.target_addr.clone()))
            .field("rlen", FieldValue::Int(saturating_i64(self.bytes_client_to_target)))
            .field("wlen", FieldValue::Int(saturating_i64(self.bytes_target_to_client)))
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Pipeline tuning.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Bounded queue capacity
    pub capacity: usize,
    /// Optional periodic flush of a non-empty batch
    pub flush_interval: Option<Duration>,
}

impl PipelineSettings {
    /// Batch size that triggers a write.
    pub fn batch_size(&self) -> usize {
        (self.capacity / 2).max(1)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capacity: crate::server::config::DEFAULT_QUEUE_CAPACITY,
            flush_interval: None,
        }
    }
}

impl From<&InfluxConfig> for PipelineSettings {
    fn from(config: &InfluxConfig) -> Self {
        Self {
            capacity: config.queue_capacity.max(2),
            flush_interval: config.flush_interval(),
        }
    }
}

struct Pipeline {
    tx: mpsc::Sender<ConnectionRecord>,
    buffered: Arc<AtomicUsize>,
    batch_size: usize,
}

/// Handle to the metrics pipeline.
///
/// Cheap to clone. A disabled recorder accepts and discards every record.
/// The flush task writes out any partial batch once every clone is dropped.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Option<Arc<Pipeline>>,
}

impl Recorder {
    /// A recorder that does nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Open the queue and start the flush task.
    ///
    /// Returns once the flush task is running.
    pub async fn start(writer: Arc<dyn PointWriter>, settings: PipelineSettings) -> Self {
        let capacity = settings.capacity.max(1);
        let batch_size = settings.batch_size();
        let (tx, rx) = mpsc::channel(capacity);
        let buffered = Arc::new(AtomicUsize::new(0));
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(flush_task(
            rx,
            writer,
            batch_size,
            settings.flush_interval,
            buffered.clone(),
            ready_tx,
        ));
        // The task only drops the sender after signalling.
        let _ = ready_rx.await;

        debug!(capacity, batch_size, "metrics pipeline running");
        Self {
            inner: Some(Arc::new(Pipeline {
                tx,
                buffered,
                batch_size,
            })),
        }
    }

    /// Whether records go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Queue a record, waiting while the queue is full.
    pub async fn record(&self, record: ConnectionRecord) {
        let Some(pipeline) = &self.inner else {
            return;
        };
        if pipeline.tx.send(record).await.is_err() {
            warn!("metrics flush task is gone, record dropped");
        }
    }

    /// Records accumulated by the flush task but not yet written.
    pub fn buffered(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |p| p.buffered.load(Ordering::Acquire))
    }

    /// Number of records per write, or 0 when disabled.
    pub fn batch_size(&self) -> usize {
        self.inner.as_ref().map_or(0, |p| p.batch_size)
    }

    /// Whether both handles feed the same pipeline.
    pub fn same_pipeline(&self, other: &Recorder) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

enum Event {
    Record(Option<ConnectionRecord>),
    Tick,
}

async fn flush_task(
    mut rx: mpsc::Receiver<ConnectionRecord>,
    writer: Arc<dyn PointWriter>,
    batch_size: usize,
    flush_interval: Option<Duration>,
    buffered: Arc<AtomicUsize>,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());

    let mut ticker = flush_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut batch: Vec<Point> = Vec::with_capacity(batch_size);

    loop {
        let event = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                record = rx.recv() => Event::Record(record),
                _ = ticker.tick() => Event::Tick,
            },
            None => Event::Record(rx.recv().await),
        };

        match event {
            Event::Record(Some(record)) => {
                batch.push(record.to_point());
                if batch.len() >= batch_size {
                    flush(writer.as_ref(), &mut batch).await;
                }
                buffered.store(batch.len(), Ordering::Release);
            }
            Event::Record(None) => {
                if !batch.is_empty() {
                    flush(writer.as_ref(), &mut batch).await;
                    buffered.store(0, Ordering::Release);
                }
                debug!("metrics pipeline closed");
                return;
            }
            Event::Tick => {
                if !batch.is_empty() {
                    flush(writer.as_ref(), &mut batch).await;
                    buffered.store(0, Ordering::Release);
                }
            }
        }
    }
}

async fn flush(writer: &dyn PointWriter, batch: &mut Vec<Point>) {
    let points = std::mem::take(batch);
    let count = points.len();
    match writer.write(points).await {
        Ok(()) => debug!(count, "flushed connection records"),
        Err(e) => warn!(count, "write points failed, batch dropped: {}", e),
    }
}

/// Process-wide home of the [`Recorder`].
///
/// The first caller builds the pipeline; concurrent and later callers get a
/// clone of the same handle.
pub struct RecorderSlot {
    cell: OnceCell<Recorder>,
}

impl RecorderSlot {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Get the recorder, starting it from `config` on first use.
    ///
    /// No config yields a disabled recorder. Provisioning is best effort.
    pub async fn get_or_start(&self, config: Option<&InfluxConfig>) -> Result<Recorder> {
        self.get_or_try_start_with(|| async move {
            let Some(config) = config else {
                debug!("influxdb not configured, metrics disabled");
                return Ok(Recorder::disabled());
            };

            let client = Arc::new(InfluxClient::new(config)?);
            influx::provision(client.as_ref(), config).await;
            Ok(Recorder::start(client, PipelineSettings::from(config)).await)
        })
        .await
    }

    /// Get the recorder, building it with `init` on first use.
    pub async fn get_or_try_start_with<F, Fut>(&self, init: F) -> Result<Recorder>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Recorder>>,
    {
        self.cell.get_or_try_init(init).await.cloned()
    }

    /// The recorder, if it has been started.
    pub fn get(&self) -> Option<Recorder> {
        self.cell.get().cloned()
    }
}

impl Default for RecorderSlot {
    fn default() -> Self {
        Self::new()
    }
}
