//! Bounded queue of batch-point bundles plus a single writer task with
//! infinite-retry semantics, generalizing the teacher's `output.rs`
//! (TCP/Carbon, std thread + crossbeam) to HTTP/line-protocol over
//! tokio + reqwest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use crate::config::TsdbConfig;
use crate::measurement::Point;

/// Default capacity of the bounded send queue; producers block when full.
pub const QUEUE_CAPACITY: usize = 65_535;

const WRITE_RETRY_DELAY: Duration = Duration::from_secs(30);

pub type Batch = Vec<Point>;

#[derive(Clone)]
pub struct TsdbHandle {
    sender: flume::Sender<Option<Batch>>,
    sent: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl TsdbHandle {
    /// Blocks the caller when the queue is full; this is the sole
    /// backpressure point between device loops and the TSDB.
    pub fn send(&self, batch: Batch) -> Result<()> {
        self.sender
            .send(Some(batch))
            .map_err(|_| anyhow::anyhow!("tsdb writer task has exited"))
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Connects to one TSDB profile (HTTP client + 5-second Ping) and spawns
/// its writer task. Startup is fatal if the Ping fails.
pub async fn connect(cfg: Arc<TsdbConfig>) -> Result<TsdbHandle> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("building tsdb http client")?;

    let ping_url = format!("http://{}:{}/ping", cfg.host, cfg.port);
    client
        .get(&ping_url)
        .send()
        .await
        .with_context(|| format!("tsdb profile {}: ping failed", cfg.id))?;

    let (sender, receiver) = flume::bounded(QUEUE_CAPACITY);
    let sent = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    let task_sent = sent.clone();
    let task_errors = errors.clone();
    let task_cfg = cfg.clone();
    tokio::spawn(async move {
        writer_loop(task_cfg, client, receiver, task_sent, task_errors).await;
    });

    info!("tsdb profile {}: connected, writer task started", cfg.id);
    Ok(TsdbHandle {
        sender,
        sent,
        errors,
    })
}

async fn writer_loop(
    cfg: Arc<TsdbConfig>,
    client: reqwest::Client,
    receiver: flume::Receiver<Option<Batch>>,
    sent: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
) {
    while let Ok(maybe_batch) = receiver.recv_async().await {
        let Some(batch) = maybe_batch else {
            warn!("tsdb profile {}: skipping nil batch", cfg.id);
            continue;
        };
        loop {
            match write_batch(&cfg, &client, &batch).await {
                Ok(()) => {
                    sent.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "tsdb profile {}: write failed, retrying in {}s: {e:#}",
                        cfg.id,
                        WRITE_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
            }
        }
    }
}

async fn write_batch(cfg: &TsdbConfig, client: &reqwest::Client, batch: &Batch) -> Result<()> {
    let mut body = String::new();
    for point in batch {
        if point.tags.is_empty() || point.fields.is_empty() {
            warn!("tsdb profile {}: skipping point with empty tag/field map", cfg.id);
            continue;
        }
        body.push_str(&line_protocol(point));
        body.push('\n');
    }
    if body.is_empty() {
        return Ok(());
    }

    let url = format!(
        "http://{}:{}/write?db={}&rp={}&precision=ns",
        cfg.host, cfg.port, cfg.database, cfg.retention
    );
    let mut request = client.post(&url).body(body);
    if !cfg.user.is_empty() {
        request = request.basic_auth(&cfg.user, Some(&cfg.password));
    }

    let response = request.send().await.context("tsdb write request failed")?;
    if !response.status().is_success() {
        bail!("tsdb write returned status {}", response.status());
    }
    Ok(())
}

fn line_protocol(point: &Point) -> String {
    let mut tags: Vec<_> = point.tags.iter().collect();
    tags.sort_by(|a, b| a.0.cmp(b.0));
    let tag_str: Vec<String> = tags
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
        .collect();

    let mut fields: Vec<_> = point.fields.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    let field_str: Vec<String> = fields
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), v))
        .collect();

    let nanos = point
        .timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    format!(
        "{},{} {} {}",
        escape(&point.measurement),
        tag_str.join(","),
        field_str.join(","),
        nanos
    )
}

fn escape(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn line_protocol_sorts_tags_and_fields() {
        let point = Point {
            measurement: "system".to_string(),
            tags: HashMap::from([
                ("host".to_string(), "r1".to_string()),
                ("site".to_string(), "dc1".to_string()),
            ]),
            fields: HashMap::from([("uptime".to_string(), 12345.0)]),
            timestamp: UNIX_EPOCH + Duration::from_secs(1),
        };
        let line = line_protocol(&point);
        assert_eq!(line, "system,host=r1,site=dc1 uptime=12345 1000000000");
    }

    #[test]
    fn escape_handles_reserved_characters() {
        assert_eq!(escape("a b,c=d"), "a\\ b\\,c\\=d");
    }
}
