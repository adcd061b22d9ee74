//! A named group of metrics emitted together as one point (scalar mode) or
//! one point per discovered index row (indexed mode); owns the OID→metric
//! routing table, the live index set, and point assembly.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::metric::{Metric, MetricConfig};
use crate::snmp::{SnmpSession, MAX_OIDS_PER_GET};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementMode {
    Value,
    Indexed,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CondOp {
    Eq,
    Lt,
    Gt,
    Ge,
    Le,
}

impl CondOp {
    fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CondOp::Eq => lhs == rhs,
            CondOp::Lt => lhs < rhs,
            CondOp::Gt => lhs > rhs,
            CondOp::Ge => lhs >= rhs,
            CondOp::Le => lhs <= rhs,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MeasurementFilter {
    File {
        path: String,
        #[serde(default)]
        enable_alias: bool,
    },
    #[serde(rename = "oidcondition")]
    OidCondition { oid: String, op: CondOp, value: i64 },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MeasurementConfig {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub fields: Vec<String>,
    pub mode: MeasurementMode,
    #[serde(default)]
    pub index_oid: Option<String>,
    #[serde(default)]
    pub index_tag: Option<String>,
    #[serde(default)]
    pub filter: Option<MeasurementFilter>,
}

impl MeasurementConfig {
    pub fn init(&mut self, id: &str) -> Result<()> {
        self.id = id.to_string();
        if self.name.is_empty() {
            bail!("measurement {}: name not set", self.id);
        }
        if self.fields.is_empty() {
            bail!("measurement {}: fields not set", self.id);
        }
        if self.mode == MeasurementMode::Indexed {
            let index_oid = self
                .index_oid
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("measurement {}: indexOID required for indexed mode", self.id))?;
            if !index_oid.starts_with('.') {
                bail!("measurement {}: bad indexOID format: {}", self.id, index_oid);
            }
            if self.index_tag.is_none() {
                bail!("measurement {}: indexTag required for indexed mode", self.id);
            }
        }
        Ok(())
    }
}

/// Runtime state for one measurement on one device.
pub struct Measurement {
    pub cfg: Arc<MeasurementConfig>,
    pub all_indexed: HashMap<String, String>,
    pub filter_labels: HashMap<String, String>,
    pub cur_indexed: HashMap<String, String>,
    pub values: HashMap<String, HashMap<String, Metric>>,
    pub snmp_oids: Vec<String>,
    /// realOID -> (value key into `values`, metric-config id)
    pub oid_map: HashMap<String, (String, String)>,
}

impl Measurement {
    /// Performs the full init contract: index discovery, filtering,
    /// metric instantiation, routing-table construction, and the seed fetch.
    pub async fn init(
        cfg: Arc<MeasurementConfig>,
        metric_cfgs: &HashMap<String, Arc<MetricConfig>>,
        session: &SnmpSession,
    ) -> Result<Self> {
        let mut measurement = Measurement {
            cfg: cfg.clone(),
            all_indexed: HashMap::new(),
            filter_labels: HashMap::new(),
            cur_indexed: HashMap::new(),
            values: HashMap::new(),
            snmp_oids: Vec::new(),
            oid_map: HashMap::new(),
        };

        if cfg.mode == MeasurementMode::Indexed {
            let index_oid = cfg.index_oid.as_deref().unwrap();
            measurement.all_indexed = discover_index(session, index_oid).await?;
            measurement.apply_filter(session).await?;
        } else {
            measurement.cur_indexed = HashMap::new();
        }

        let use_bulk = cfg.mode == MeasurementMode::Indexed && session.supports_bulk();
        measurement.build_metrics(metric_cfgs, use_bulk)?;

        let (_, _, fatal) = if use_bulk {
            measurement.bulk_data(session).await?
        } else {
            measurement.get_data(session).await?
        };
        if fatal {
            bail!("measurement {}: seed fetch failed", measurement.cfg.id);
        }

        Ok(measurement)
    }

    /// `use_bulk` mirrors the device loop's own fetch-mode choice (per
    /// `session.supports_bulk()`), so indexed rows on a device that can't
    /// bulkwalk still get real OIDs windowed through `snmp_oids` instead of
    /// bulkwalking a device that doesn't support it.
    fn build_metrics(&mut self, metric_cfgs: &HashMap<String, Arc<MetricConfig>>, use_bulk: bool) -> Result<()> {
        let keys: Vec<String> = match self.cfg.mode {
            MeasurementMode::Value => vec!["0".to_string()],
            MeasurementMode::Indexed => {
                if self.cur_indexed.is_empty() {
                    self.cur_indexed = self.all_indexed.clone();
                }
                self.cur_indexed.values().cloned().collect()
            }
        };

        for key in &keys {
            let mut row = HashMap::new();
            for field_id in &self.cfg.fields {
                let metric_cfg = metric_cfgs
                    .get(field_id)
                    .ok_or_else(|| anyhow::anyhow!("measurement {}: unknown metric id {}", self.cfg.id, field_id))?
                    .clone();
                let real_oid = if self.cfg.mode == MeasurementMode::Value {
                    metric_cfg.base_oid.clone()
                } else {
                    let suffix = self
                        .cur_indexed
                        .iter()
                        .find(|(_, label)| *label == key)
                        .map(|(suffix, _)| suffix.clone())
                        .unwrap_or_default();
                    format!("{}.{}", metric_cfg.base_oid, suffix)
                };
                self.oid_map
                    .insert(real_oid.clone(), (key.clone(), field_id.clone()));
                if self.cfg.mode == MeasurementMode::Value || !use_bulk {
                    self.snmp_oids.push(real_oid.clone());
                }
                row.insert(field_id.clone(), Metric::new(metric_cfg, real_oid));
            }
            self.values.insert(key.clone(), row);
        }
        Ok(())
    }

    async fn apply_filter(&mut self, session: &SnmpSession) -> Result<()> {
        match &self.cfg.filter {
            None => {
                self.cur_indexed = self.all_indexed.clone();
            }
            Some(MeasurementFilter::File { path, enable_alias }) => {
                self.filter_labels = load_file_filter(path)?;
                self.cur_indexed = self
                    .all_indexed
                    .iter()
                    .filter_map(|(suffix, discovered)| {
                        self.filter_labels.get(discovered).map(|alias| {
                            let effective = if *enable_alias && !alias.is_empty() {
                                alias.clone()
                            } else {
                                discovered.clone()
                            };
                            (suffix.clone(), effective)
                        })
                    })
                    .collect();
            }
            Some(MeasurementFilter::OidCondition { oid, op, value }) => {
                let samples = session.bulkwalk(oid).await.context("oid-condition filter bulkwalk")?;
                for sample in &samples {
                    let Some(raw) = sample.raw else { continue };
                    if op.eval(raw, *value) {
                        let suffix = suffix_of(&sample.oid, oid);
                        self.filter_labels.insert(suffix, String::new());
                    }
                }
                self.cur_indexed = self
                    .all_indexed
                    .iter()
                    .filter(|(suffix, _)| self.filter_labels.contains_key(*suffix))
                    .map(|(suffix, discovered)| (suffix.clone(), discovered.clone()))
                    .collect();
            }
        }
        Ok(())
    }

    /// GET fetch for scalar measurements: window `snmp_oids` into chunks of
    /// at most 60 and route each PDU through `oid_map`. A window failure is a
    /// transport error: the fetch keeps going through the remaining windows
    /// (so partial data for this tick still lands) but reports `fatal` so the
    /// caller rebuilds the session before the next tick.
    pub async fn get_data(&mut self, session: &SnmpSession) -> Result<(u64, u64, bool)> {
        let mut sent = 0u64;
        let mut errors = 0u64;
        for window in self.snmp_oids.clone().chunks(MAX_OIDS_PER_GET) {
            match session.get(window).await {
                Ok(samples) => {
                    sent += samples.len() as u64;
                    self.route_samples(samples);
                }
                Err(e) => {
                    warn!("measurement {}: get window failed: {e:#}", self.cfg.id);
                    errors += 1;
                }
            }
        }
        Ok((sent, errors, errors > 0))
    }

    /// BULKWALK fetch for indexed measurements: walk each metric's base OID
    /// and route every returned PDU by exact real-OID match. Same fatal
    /// semantics as `get_data`.
    pub async fn bulk_data(&mut self, session: &SnmpSession) -> Result<(u64, u64, bool)> {
        let mut sent = 0u64;
        let mut errors = 0u64;
        let base_oids: Vec<String> = self
            .cfg
            .fields
            .iter()
            .filter_map(|id| {
                self.values
                    .values()
                    .next()
                    .and_then(|row| row.get(id))
                    .map(|m| m.cfg.base_oid.clone())
            })
            .collect();
        for base_oid in base_oids {
            match session.bulkwalk(&base_oid).await {
                Ok(samples) => {
                    sent += samples.len() as u64;
                    self.route_samples(samples);
                }
                Err(e) => {
                    warn!("measurement {}: bulkwalk {} failed: {e:#}", self.cfg.id, base_oid);
                    errors += 1;
                }
            }
        }
        Ok((sent, errors, errors > 0))
    }

    fn route_samples(&mut self, samples: Vec<crate::snmp::RawSample>) {
        for sample in samples {
            let Some(raw) = sample.raw else { continue };
            let Some((key, field_id)) = self.oid_map.get(&sample.oid).cloned() else {
                debug!("measurement {}: unrouted oid {}", self.cfg.id, sample.oid);
                continue;
            };
            if let Some(metric) = self
                .values
                .get_mut(&key)
                .and_then(|row| row.get_mut(&field_id))
            {
                trace!("measurement {}: routed {} -> {}", self.cfg.id, metric.real_oid, raw);
                metric.set_raw(raw, sample.timestamp);
            }
        }
    }

    /// Assembles one point per row of `values`; scalar mode has exactly one
    /// row keyed `"0"`, indexed mode has one per effective label.
    pub fn assemble_points(&self, host: &str, extra_tags: &HashMap<String, String>) -> Vec<Point> {
        let mut points = Vec::with_capacity(self.values.len());
        for (key, row) in &self.values {
            let mut tags = extra_tags.clone();
            tags.insert("host".to_string(), host.to_string());
            if self.cfg.mode == MeasurementMode::Indexed {
                if let Some(index_tag) = &self.cfg.index_tag {
                    tags.insert(index_tag.clone(), key.clone());
                }
            }
            let mut fields = HashMap::new();
            let mut latest_time: Option<SystemTime> = None;
            for metric in row.values() {
                fields.insert(metric.cfg.field_name.clone(), metric.cooked_value);
                if let Some(t) = metric.cur_time {
                    latest_time = Some(latest_time.map_or(t, |cur| cur.max(t)));
                }
            }
            points.push(Point {
                measurement: self.cfg.name.clone(),
                tags,
                fields,
                timestamp: latest_time.unwrap_or_else(SystemTime::now),
            });
        }
        points
    }
}

#[derive(Debug, Clone)]
pub struct Point {
    pub measurement: String,
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, f64>,
    pub timestamp: SystemTime,
}

async fn discover_index(session: &SnmpSession, index_oid: &str) -> Result<HashMap<String, String>> {
    let samples = session.bulkwalk(index_oid).await.context("index discovery bulkwalk")?;
    let mut out = HashMap::new();
    for sample in samples {
        let suffix = suffix_of(&sample.oid, index_oid);
        let label = sample
            .string_value
            .clone()
            .or_else(|| sample.raw.map(|v| v.to_string()))
            .unwrap_or_default();
        out.insert(suffix, label);
    }
    Ok(out)
}

fn suffix_of(full_oid: &str, base_oid: &str) -> String {
    full_oid
        .strip_prefix(base_oid)
        .unwrap_or(full_oid)
        .trim_start_matches('.')
        .to_string()
}

/// Reads a `#`-comment-aware index-filter file: one whitespace token is a
/// wanted label with empty alias, two tokens are label+alias, other arities
/// are logged and skipped.
fn load_file_filter(path: &str) -> Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path).with_context(|| format!("reading filter file {path}"))?;
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.len() {
            0 => continue,
            1 => {
                out.insert(tokens[0].to_string(), String::new());
            }
            2 => {
                out.insert(tokens[0].to_string(), tokens[1].to_string());
            }
            _ => {
                warn!("filter file {}: skipping malformed line {:?}", path, line);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn suffix_of_strips_base_oid_and_dot() {
        assert_eq!(suffix_of(".1.3.6.1.2.1.2.2.1.2.1", ".1.3.6.1.2.1.2.2.1.2"), "1");
    }

    #[test]
    fn file_filter_parses_one_and_two_token_lines() {
        let file = tempfile_with_contents("eth0 wan\nlo\n# comment\neth1 wan lan\n");
        let parsed = load_file_filter(file.path_str()).unwrap();
        assert_eq!(parsed.get("eth0"), Some(&"wan".to_string()));
        assert_eq!(parsed.get("lo"), Some(&String::new()));
        assert!(!parsed.contains_key("eth1"));
        file.close();
    }

    #[test]
    fn s3_indexed_with_file_filter_and_alias() {
        let all_indexed: HashMap<String, String> = Vec::from([
            ("1".to_string(), "eth0".to_string()),
            ("2".to_string(), "eth1".to_string()),
            ("3".to_string(), "lo".to_string()),
        ])
        .into_iter()
        .collect();
        let filter_labels: HashMap<String, String> = Vec::from([
            ("eth0".to_string(), "wan".to_string()),
            ("lo".to_string(), String::new()),
        ])
        .into_iter()
        .collect();
        let enable_alias = true;
        let cur_indexed: HashMap<String, String> = all_indexed
            .iter()
            .filter_map(|(suffix, discovered)| {
                filter_labels.get(discovered).map(|alias| {
                    let effective = if enable_alias && !alias.is_empty() {
                        alias.clone()
                    } else {
                        discovered.clone()
                    };
                    (suffix.clone(), effective)
                })
            })
            .collect();
        assert_eq!(cur_indexed.get("1"), Some(&"wan".to_string()));
        assert_eq!(cur_indexed.get("3"), Some(&"lo".to_string()));
        assert_eq!(cur_indexed.len(), 2);
    }

    #[test]
    fn s4_oid_condition_filter_keeps_matching_suffixes() {
        let all_indexed: HashMap<String, String> = Vec::from([
            ("1".to_string(), "a".to_string()),
            ("2".to_string(), "b".to_string()),
            ("3".to_string(), "c".to_string()),
        ])
        .into_iter()
        .collect();
        let readings = [("1", 1i64), ("2", 6), ("3", 6)];
        let mut filter_labels = HashMap::new();
        for (suffix, value) in readings {
            if CondOp::Eq.eval(value, 6) {
                filter_labels.insert(suffix.to_string(), String::new());
            }
        }
        let cur_indexed: HashMap<String, String> = all_indexed
            .iter()
            .filter(|(suffix, _)| filter_labels.contains_key(*suffix))
            .map(|(s, l)| (s.clone(), l.clone()))
            .collect();
        assert_eq!(cur_indexed.get("2"), Some(&"b".to_string()));
        assert_eq!(cur_indexed.get("3"), Some(&"c".to_string()));
        assert!(!cur_indexed.contains_key("1"));
    }

    struct TempFile {
        path: std::path::PathBuf,
    }
    impl TempFile {
        fn path_str(&self) -> &str {
            self.path.to_str().unwrap()
        }
        fn close(self) {
            let _ = fs::remove_file(&self.path);
        }
    }
    fn tempfile_with_contents(contents: &str) -> TempFile {
        let path = std::env::temp_dir().join(format!("measurement-filter-test-{:?}.txt", std::thread::current().id()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        TempFile { path }
    }
}
