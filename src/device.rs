//! Periodic acquisition driver: owns one SNMP session, an array of
//! measurements, a ticker, and a control channel. Implements the
//! `initializing` / `polling` / `recovering` / `terminated` state machine.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use regex::Regex;

use crate::config::{Config, DeviceConfig};
use crate::measurement::{CondOp, Measurement, MeasurementFilter, MeasurementMode};
use crate::metric::MetricConfig;
use crate::snmp::SnmpSession;
use crate::tsdb::TsdbHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugToggle {
    Enable,
    Disable,
}

/// Per-device trace file, `debug_<host-with-dots-as-dashes>.log` under the
/// configured log directory, opened only while debug is toggled on for this
/// device and closed (dropped) when it's toggled back off.
struct DebugLog {
    log_dir: String,
    host: String,
    file: Option<File>,
}

impl DebugLog {
    fn new(log_dir: String, host: String) -> Self {
        DebugLog { log_dir, host, file: None }
    }

    fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.file = None;
            return;
        }
        let path = format!("{}/debug_{}.log", self.log_dir, self.host.replace('.', "-"));
        match OpenOptions::new().create(true).append(true).mode(0o664).open(&path) {
            Ok(file) => self.file = Some(file),
            Err(e) => warn!("device {}: opening debug log {path}: {e}", self.host),
        }
    }

    fn log(&mut self, msg: &str) {
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "{msg}");
        }
    }
}

/// Runtime counters read by the status endpoint via atomic loads; written
/// only by the owning device loop.
#[derive(Default)]
pub struct DeviceCounters {
    pub requests: AtomicU64,
    pub gets: AtomicU64,
    pub errors: AtomicU64,
}

pub struct Device {
    pub cfg: Arc<DeviceConfig>,
    pub counters: Arc<DeviceCounters>,
    debug_tx: tokio::sync::mpsc::Sender<DebugToggle>,
    debug_rx: tokio::sync::mpsc::Receiver<DebugToggle>,
    enabled_tx: tokio::sync::mpsc::Sender<tokio::sync::oneshot::Sender<bool>>,
    enabled_rx: tokio::sync::mpsc::Receiver<tokio::sync::oneshot::Sender<bool>>,
    debug: bool,
    debug_log: DebugLog,
}

impl Device {
    pub fn new(cfg: Arc<DeviceConfig>, log_dir: String) -> Self {
        let (debug_tx, debug_rx) = tokio::sync::mpsc::channel(1);
        let (enabled_tx, enabled_rx) = tokio::sync::mpsc::channel(1);
        let mut debug_log = DebugLog::new(log_dir, cfg.host.clone());
        debug_log.set_enabled(cfg.debug);
        Device {
            debug: cfg.debug,
            cfg,
            counters: Arc::new(DeviceCounters::default()),
            debug_tx,
            debug_rx,
            enabled_tx,
            enabled_rx,
            debug_log,
        }
    }

    pub fn debug_sender(&self) -> tokio::sync::mpsc::Sender<DebugToggle> {
        self.debug_tx.clone()
    }

    pub fn enabled_query_sender(&self) -> tokio::sync::mpsc::Sender<tokio::sync::oneshot::Sender<bool>> {
        self.enabled_tx.clone()
    }

    /// Builds the session and measurement set (`initializing`), then runs
    /// `polling` until `quit` fires, falling back to `recovering` on
    /// transport errors.
    pub async fn run(
        mut self,
        config: Arc<Config>,
        metric_cfgs: Arc<HashMap<String, Arc<MetricConfig>>>,
        tsdb: TsdbHandle,
        mut quit: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut session = self.build_session().await?;
        let mut measurements = self.build_measurements(&config, &metric_cfgs, &session).await?;
        info!(
            "device {}: initialized with {} measurements",
            self.cfg.id,
            measurements.len()
        );

        let extra_tags = self.cfg.parsed_extra_tags();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.freq));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = quit.recv() => {
                    debug!("device {}: terminated", self.cfg.id);
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.poll_once(&session, &mut measurements, &extra_tags, &tsdb).await {
                        Ok(fatal) => {
                            if fatal {
                                warn!("device {}: fetch error, recovering", self.cfg.id);
                                session = self.recover_session().await?;
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(toggle) = self.debug_rx.recv() => {
                    self.debug = toggle == DebugToggle::Enable;
                    self.debug_log.set_enabled(self.debug);
                    debug!("device {}: debug logging set to {}", self.cfg.id, self.debug);
                }
                Some(respond_to) = self.enabled_rx.recv() => {
                    let _ = respond_to.send(self.debug);
                }
            }
        }
    }

    async fn build_session(&self) -> Result<SnmpSession> {
        let session =
            SnmpSession::connect(&self.cfg.snmp, &self.cfg.host, self.cfg.snmp.timeout, self.cfg.snmp.retries)
                .await
                .with_context(|| format!("device {}: building snmp session", self.cfg.id))?;
        if let Some(keys) = &session.usm_keys {
            debug!(
                "device {}: usm keys derived (auth={}, priv={})",
                self.cfg.id,
                keys.auth_key.is_some(),
                keys.priv_key.is_some()
            );
        }
        Ok(session)
    }

    /// `recovering`: close and reopen the session, retrying with backoff of
    /// `timeout` seconds between attempts, indefinitely.
    async fn recover_session(&self) -> Result<SnmpSession> {
        loop {
            match self.build_session().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    error!("device {}: session recovery failed, retrying: {e:#}", self.cfg.id);
                    tokio::time::sleep(Duration::from_secs(self.cfg.snmp.timeout.max(1))).await;
                }
            }
        }
    }

    async fn build_measurements(
        &self,
        config: &Config,
        metric_cfgs: &HashMap<String, Arc<MetricConfig>>,
        session: &SnmpSession,
    ) -> Result<Vec<Measurement>> {
        let measurement_ids = resolve_measurement_ids(self.cfg.as_ref(), config)?;
        let mut measurements = Vec::with_capacity(measurement_ids.len());
        for id in measurement_ids {
            let mut meas_cfg = config
                .measurements
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("device {}: unknown measurement id {}", self.cfg.id, id))?
                .clone();
            if let Some(filter) = device_filter_for(self.cfg.as_ref(), &id) {
                if meas_cfg.mode == MeasurementMode::Indexed {
                    meas_cfg.filter = Some(filter);
                } else {
                    warn!(
                        "device {}: measFilters entry for {} ignored, not an indexed measurement",
                        self.cfg.id, id
                    );
                }
            }
            let measurement = Measurement::init(Arc::new(meas_cfg), metric_cfgs, session)
                .await
                .with_context(|| format!("device {}: initializing measurement {}", self.cfg.id, id))?;
            measurements.push(measurement);
        }
        Ok(measurements)
    }

    /// Runs one tick over every measurement, batching all assembled points
    /// into a single TSDB send. Returns whether any measurement's fetch hit
    /// a transport error (`fatal`); the caller rebuilds the session before
    /// the next tick when it does. A TSDB send failure (dead writer task) is
    /// a distinct failure class and is returned as `Err` instead, since
    /// rebuilding the SNMP session can't fix it.
    async fn poll_once(
        &mut self,
        session: &SnmpSession,
        measurements: &mut [Measurement],
        extra_tags: &HashMap<String, String>,
        tsdb: &TsdbHandle,
    ) -> Result<bool> {
        tokio::time::sleep(Duration::from_secs(self.cfg.snmp.timeout)).await;

        let mut batch = Vec::new();
        let mut fatal = false;
        for measurement in measurements.iter_mut() {
            self.debug_log.log(&format!("processing measurement: {}", measurement.cfg.id));
            self.counters.requests.fetch_add(1, Ordering::Relaxed);
            let use_bulk = measurement.cfg.mode == MeasurementMode::Indexed && session.supports_bulk();
            let (sent, errors, meas_fatal) = if use_bulk {
                measurement.bulk_data(session).await?
            } else {
                measurement.get_data(session).await?
            };
            self.debug_log
                .log(&format!("measurement {}: gets={sent} errors={errors}", measurement.cfg.id));
            self.counters.gets.fetch_add(sent, Ordering::Relaxed);
            self.counters.errors.fetch_add(errors, Ordering::Relaxed);
            fatal |= meas_fatal;
            batch.extend(measurement.assemble_points(&self.cfg.host, extra_tags));
        }

        tsdb.send(batch)?;
        Ok(fatal)
    }
}

/// Resolves a device's `measFilters` arrays (`[measId, type, arg1, arg2,
/// arg3]`) into a `MeasurementFilter` for one measurement id. Entries for
/// other ids are skipped; an unknown filter type is logged and skipped.
/// When more than one entry targets the same id, the last one wins.
fn device_filter_for(device: &DeviceConfig, meas_id: &str) -> Option<MeasurementFilter> {
    let mut found = None;
    for f in &device.meas_filters {
        if f.first().map(String::as_str) != Some(meas_id) {
            continue;
        }
        match f.get(1).map(String::as_str) {
            Some("file") => {
                let Some(path) = f.get(2) else {
                    warn!("measFilters entry for {meas_id}: file filter missing filename");
                    continue;
                };
                let enable_alias = f.get(3).map(|flag| flag == "EnableAlias").unwrap_or(false);
                found = Some(MeasurementFilter::File { path: path.clone(), enable_alias });
            }
            Some("OIDCondition") => {
                let (Some(oid), Some(cond), Some(value)) = (f.get(2), f.get(3), f.get(4)) else {
                    warn!("measFilters entry for {meas_id}: OIDCondition filter missing arguments");
                    continue;
                };
                let Some(op) = parse_cond_op(cond) else {
                    warn!("measFilters entry for {meas_id}: unknown condition type {cond}");
                    continue;
                };
                let Ok(value) = value.parse::<i64>() else {
                    warn!("measFilters entry for {meas_id}: bad condition value {value}");
                    continue;
                };
                found = Some(MeasurementFilter::OidCondition { oid: oid.clone(), op, value });
            }
            Some(other) => warn!("measFilters entry for {meas_id}: invalid filter type {other}"),
            None => warn!("measFilters entry for {meas_id}: missing filter type"),
        }
    }
    found
}

fn parse_cond_op(s: &str) -> Option<CondOp> {
    match s {
        "eq" => Some(CondOp::Eq),
        "lt" => Some(CondOp::Lt),
        "gt" => Some(CondOp::Gt),
        "ge" => Some(CondOp::Ge),
        "le" => Some(CondOp::Le),
        _ => None,
    }
}

/// For each configured pattern, selects matching `GetGroups` entries from
/// config, unions and dedupes their measurement ids.
fn resolve_measurement_ids(device: &DeviceConfig, config: &Config) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for pattern in &device.metric_group_patterns {
        let re = Regex::new(pattern).with_context(|| format!("bad metricGroupPattern {pattern}"))?;
        for (group_id, group) in &config.get_groups {
            if re.is_match(group_id) {
                for meas_id in &group.measurements {
                    if seen.insert(meas_id.clone()) {
                        ids.push(meas_id.clone());
                    }
                }
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceSnmpConfig, GetGroupConfig};

    fn device_cfg(patterns: Vec<String>) -> DeviceConfig {
        DeviceConfig {
            id: "r1".into(),
            host: "10.0.0.1".into(),
            snmp: DeviceSnmpConfig::default(),
            freq: 60,
            debug: false,
            extra_tags: vec![],
            metric_group_patterns: patterns,
            meas_filters: vec![],
            config: None,
        }
    }

    #[test]
    fn resolve_measurement_ids_unions_and_dedupes() {
        let mut config = Config::default();
        config.get_groups.insert(
            "core".into(),
            GetGroupConfig {
                measurements: vec!["system".into(), "interfaces".into()],
            },
        );
        config.get_groups.insert(
            "core-extra".into(),
            GetGroupConfig {
                measurements: vec!["interfaces".into(), "cpu".into()],
            },
        );
        let device = device_cfg(vec!["^core.*".into()]);
        let mut ids = resolve_measurement_ids(&device, &config).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["cpu", "interfaces", "system"]);
    }

    #[test]
    fn device_filter_for_parses_file_and_oid_condition() {
        let mut device = device_cfg(vec![]);
        device.meas_filters = vec![
            vec!["ifs".into(), "file".into(), "/etc/ifs.filter".into(), "EnableAlias".into()],
            vec!["cpu".into(), "OIDCondition".into(), "cpuType".into(), "eq".into(), "1".into()],
        ];

        let ifs = device_filter_for(&device, "ifs").unwrap();
        assert_eq!(
            ifs,
            MeasurementFilter::File { path: "/etc/ifs.filter".into(), enable_alias: true }
        );

        let cpu = device_filter_for(&device, "cpu").unwrap();
        assert_eq!(cpu, MeasurementFilter::OidCondition { oid: "cpuType".into(), op: CondOp::Eq, value: 1 });

        assert!(device_filter_for(&device, "system").is_none());
    }

    #[test]
    fn device_filter_for_last_match_wins() {
        let mut device = device_cfg(vec![]);
        device.meas_filters = vec![
            vec!["ifs".into(), "file".into(), "/etc/a.filter".into()],
            vec!["ifs".into(), "file".into(), "/etc/b.filter".into()],
        ];
        let ifs = device_filter_for(&device, "ifs").unwrap();
        assert_eq!(ifs, MeasurementFilter::File { path: "/etc/b.filter".into(), enable_alias: false });
    }

    #[test]
    fn device_filter_for_skips_unknown_type() {
        let mut device = device_cfg(vec![]);
        device.meas_filters = vec![vec!["ifs".into(), "bogus".into()]];
        assert!(device_filter_for(&device, "ifs").is_none());
    }
}
