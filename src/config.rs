//! On-disk configuration schema and load-from-file / load-from-directory
//! merge, in the shape the teacher's `config.rs` uses `config-file` +
//! `scan_dir` for.

use std::collections::HashMap;

use anyhow::{bail, Error};
use config_file::FromConfigFile;
use log::debug;
use scan_dir::ScanDir;
use serde::{Deserialize, Serialize};

use crate::measurement::MeasurementConfig;
use crate::metric::MetricConfig;
use crate::snmp::SnmpVersion;
use crate::snmp::usm::{AuthProtocol, PrivProtocol, SecLevel};

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_dir() -> String {
    "/var/log/influx-snmp-collector".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GetGroupConfig {
    pub measurements: Vec<String>,
}

/// USM + version/community parameters for one device's SNMP session. Split
/// out of `DeviceConfig` so `snmp.rs`/`usm.rs` depend on this narrow type
/// rather than the full device schema (freq, tags, filters, ...).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DeviceSnmpConfig {
    pub version: SnmpVersion,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub community: Option<String>,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub retries: usize,
    #[serde(default, rename = "v3_sec_level")]
    pub v3_sec_level: Option<SecLevel>,
    #[serde(default, rename = "v3_auth_user")]
    pub v3_auth_user: Option<String>,
    #[serde(default, rename = "v3_auth_prot")]
    pub v3_auth_prot: Option<AuthProtocol>,
    #[serde(default, rename = "v3_auth_pass")]
    pub v3_auth_pass: Option<String>,
    #[serde(default, rename = "v3_priv_prot")]
    pub v3_priv_prot: Option<PrivProtocol>,
    #[serde(default, rename = "v3_priv_pass")]
    pub v3_priv_pass: Option<String>,
}

impl Default for DeviceSnmpConfig {
    fn default() -> Self {
        DeviceSnmpConfig {
            version: SnmpVersion::V2c,
            port: 161,
            community: None,
            timeout: 5,
            retries: 1,
            v3_sec_level: None,
            v3_auth_user: None,
            v3_auth_prot: None,
            v3_auth_pass: None,
            v3_priv_prot: None,
            v3_priv_pass: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DeviceConfig {
    #[serde(skip)]
    pub id: String,
    pub host: String,
    #[serde(flatten)]
    pub snmp: DeviceSnmpConfig,
    #[serde(default = "default_freq")]
    pub freq: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub extra_tags: Vec<String>,
    #[serde(default)]
    pub metric_group_patterns: Vec<String>,
    /// arrays of strings: [meas_id, filter_type, arg1, arg2, arg3]
    #[serde(default)]
    pub meas_filters: Vec<Vec<String>>,
    /// TSDB profile name; defaults to this device's own id when absent.
    #[serde(default)]
    pub config: Option<String>,
}

fn default_freq() -> u64 {
    60
}

impl DeviceConfig {
    /// extraTags parsed into a tag map; malformed `k=v` entries are dropped
    /// with a warning by the caller, not here.
    pub fn parsed_extra_tags(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for raw in &self.extra_tags {
            if let Some((k, v)) = raw.split_once('=') {
                out.insert(k.to_string(), v.to_string());
            } else {
                log::warn!("device {}: malformed extraTags entry {:?}", self.id, raw);
            }
        }
        out
    }

    pub fn tsdb_profile(&self) -> &str {
        self.config.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TsdbConfig {
    #[serde(skip)]
    pub id: String,
    pub host: String,
    #[serde(default = "default_tsdb_port")]
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_retention")]
    pub retention: String,
}

fn default_tsdb_port() -> u16 {
    8086
}

fn default_retention() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct HttpConfig {
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub metrics: HashMap<String, MetricConfig>,
    #[serde(default)]
    pub measurements: HashMap<String, MeasurementConfig>,
    #[serde(default)]
    pub get_groups: HashMap<String, GetGroupConfig>,
    #[serde(default, rename = "snmp_device")]
    pub snmp_devices: HashMap<String, DeviceConfig>,
    #[serde(default)]
    pub influx: HashMap<String, TsdbConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Validates and finalizes cross-references: sets `id` fields, runs each
    /// metric's `init()`, and resolves every device's TSDB-profile binding,
    /// falling back to the `*` wildcard profile. Mirrors the orchestrator's
    /// binding-resolution contract.
    pub fn finalize(&mut self) -> Result<(), Error> {
        for (id, metric) in self.metrics.iter_mut() {
            metric.init(id)?;
        }
        for (id, measurement) in self.measurements.iter_mut() {
            measurement.init(id)?;
        }
        for (id, device) in self.snmp_devices.iter_mut() {
            device.id = id.clone();
        }
        for (id, tsdb) in self.influx.iter_mut() {
            tsdb.id = id.clone();
        }
        for device in self.snmp_devices.values() {
            let profile = device.tsdb_profile();
            if !self.influx.contains_key(profile) && !self.influx.contains_key("*") {
                bail!(
                    "device {}: no Influx profile named {:?} and no wildcard '*' profile configured",
                    device.id,
                    profile
                );
            }
        }
        Ok(())
    }

    pub fn resolve_tsdb<'a>(&'a self, device: &DeviceConfig) -> Result<&'a TsdbConfig, Error> {
        let profile = device.tsdb_profile();
        if let Some(tsdb) = self.influx.get(profile) {
            return Ok(tsdb);
        }
        self.influx
            .get("*")
            .ok_or_else(|| anyhow::anyhow!("no Influx profile for device {}", device.id))
    }
}

pub fn from_file(path: &str) -> Result<Config, Error> {
    debug!("config(file={}): loading from file", path);
    Ok(Config::from_config_file(path)?)
}

pub fn from_directory(path: &str) -> Result<Config, Error> {
    debug!(
        "config(directory={}): loading configuration files from directory",
        path
    );

    let files: Vec<_> = ScanDir::files()
        .walk(path, |iter| {
            iter.filter(|(_, name)| name.ends_with(".toml") || name.ends_with(".yaml"))
                .map(|(ref entry, _)| entry.path())
                .collect()
        })
        .map_err(|errors| anyhow::Error::msg(format!("{:#?}", errors)))?;

    let mut config = Config::default();
    for file in files {
        let tmp = from_file(file.to_str().unwrap())?;
        merge_config(&mut config, tmp, &file)?;
    }
    Ok(config)
}

fn merge_config(
    config: &mut Config,
    tmp: Config,
    file: &std::path::Path,
) -> Result<(), Error> {
    if config.general.log_dir.is_empty() {
        config.general = tmp.general;
    }
    merge_map(&mut config.metrics, tmp.metrics, file)?;
    merge_map(&mut config.measurements, tmp.measurements, file)?;
    merge_map(&mut config.get_groups, tmp.get_groups, file)?;
    merge_map(&mut config.snmp_devices, tmp.snmp_devices, file)?;
    merge_map(&mut config.influx, tmp.influx, file)?;
    if tmp.http.port != 0 {
        config.http.port = tmp.http.port;
    }
    Ok(())
}

fn merge_map<V: PartialEq + Clone>(
    dst: &mut HashMap<String, V>,
    src: HashMap<String, V>,
    file: &std::path::Path,
) -> Result<(), Error> {
    for (name, entry) in src.into_iter() {
        if let Some(existing) = dst.get(&name) {
            if existing != &entry {
                bail!(
                    "previous definition of {} differs from new definition in {:?}",
                    name,
                    file
                );
            }
        } else {
            dst.insert(name, entry);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_tsdb_profile_defaults_to_id() {
        let mut device = DeviceConfig {
            id: "r1".into(),
            host: "10.0.0.1".into(),
            snmp: DeviceSnmpConfig::default(),
            freq: 60,
            debug: false,
            extra_tags: vec![],
            metric_group_patterns: vec![],
            meas_filters: vec![],
            config: None,
        };
        assert_eq!(device.tsdb_profile(), "r1");
        device.config = Some("core-profile".into());
        assert_eq!(device.tsdb_profile(), "core-profile");
    }

    #[test]
    fn extra_tags_parse_key_value_pairs() {
        let device = DeviceConfig {
            id: "r1".into(),
            host: "10.0.0.1".into(),
            snmp: DeviceSnmpConfig::default(),
            freq: 60,
            debug: false,
            extra_tags: vec!["site=dc1".into(), "role=core".into(), "malformed".into()],
            metric_group_patterns: vec![],
            meas_filters: vec![],
            config: None,
        };
        let tags = device.parsed_extra_tags();
        assert_eq!(tags.get("site"), Some(&"dc1".to_string()));
        assert_eq!(tags.get("role"), Some(&"core".to_string()));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn finalize_fails_without_tsdb_binding() {
        let mut config = Config::default();
        config.snmp_devices.insert(
            "r1".into(),
            DeviceConfig {
                id: String::new(),
                host: "10.0.0.1".into(),
                snmp: DeviceSnmpConfig::default(),
                freq: 60,
                debug: false,
                extra_tags: vec![],
                metric_group_patterns: vec![],
                meas_filters: vec![],
                config: None,
            },
        );
        assert!(config.finalize().is_err());
    }

    #[test]
    fn finalize_accepts_wildcard_tsdb_profile() {
        let mut config = Config::default();
        config.snmp_devices.insert(
            "r1".into(),
            DeviceConfig {
                id: String::new(),
                host: "10.0.0.1".into(),
                snmp: DeviceSnmpConfig::default(),
                freq: 60,
                debug: false,
                extra_tags: vec![],
                metric_group_patterns: vec![],
                meas_filters: vec![],
                config: None,
            },
        );
        config.influx.insert(
            "*".into(),
            TsdbConfig {
                id: String::new(),
                host: "tsdb".into(),
                port: 8086,
                database: "metrics".into(),
                user: String::new(),
                password: String::new(),
                retention: "default".into(),
            },
        );
        assert!(config.finalize().is_ok());
    }
}
