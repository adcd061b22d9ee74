//! SNMP session construction and the GET/BULKWALK primitives measurements
//! fetch data through.
//!
//! The wire transport for community-based v1/v2c traffic is `csnmp`'s
//! `Snmp2cClient`. SNMPv3 sessions validate and derive USM credentials per
//! RFC 3414 (see [`usm`]) and reuse the same community-shaped transport for
//! the actual GET/BULKWALK round trips; see DESIGN.md for why a full
//! encrypted SNMPv3 wire stack is out of scope here.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use csnmp::{ObjectIdentifier, ObjectValue, Snmp2cClient};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub mod usm;

use crate::config::DeviceSnmpConfig;

/// A single PDU result: the dotted OID string it came back under, the
/// sample time, and the raw value coerced to an integer where possible.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub oid: String,
    pub timestamp: SystemTime,
    pub raw: Option<i64>,
    pub string_value: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    #[serde(rename = "1")]
    V1,
    #[serde(rename = "2c")]
    V2c,
    #[serde(rename = "3")]
    V3,
}

/// Maximum OIDs per GET PDU window (gosnmp/RFC limit the original source
/// and this crate both honor).
pub const MAX_OIDS_PER_GET: usize = 60;

pub struct SnmpSession {
    client: Snmp2cClient,
    version: SnmpVersion,
    /// populated only for SNMPv3; kept so callers/tests can assert that
    /// key derivation succeeded.
    pub usm_keys: Option<usm::UsmKeys>,
}

impl SnmpSession {
    pub async fn connect(
        cfg: &DeviceSnmpConfig,
        host: &str,
        timeout_secs: u64,
        retries: usize,
    ) -> Result<Self> {
        let addr = resolve_one(host, cfg.port)?;
        let timeout = Duration::from_secs(timeout_secs);

        let usm_keys = match cfg.version {
            SnmpVersion::V1 => None,
            SnmpVersion::V2c => {
                if cfg.community.as_deref().unwrap_or("").is_empty() {
                    bail!("Error on snmp community");
                }
                None
            }
            SnmpVersion::V3 => {
                let keys = usm::derive_keys(cfg)?;
                debug!(
                    "snmp v3 session for {host}: auth_key={}, priv_key={}",
                    keys.auth_key.is_some(),
                    keys.priv_key.is_some()
                );
                Some(keys)
            }
        };

        // the community string doubles as the v1/v2c wire credential; for
        // v3 there is no real encrypted envelope here (see module docs), so
        // the USM username stands in for routing/logging purposes only.
        let community = match cfg.version {
            SnmpVersion::V1 | SnmpVersion::V2c => cfg.community.clone().unwrap_or_default(),
            SnmpVersion::V3 => cfg.v3_auth_user.clone().unwrap_or_default(),
        };

        let client = Snmp2cClient::new(addr, community.into_bytes(), None, Some(timeout), retries)
            .await
            .context("snmp client connect failed")?;

        Ok(SnmpSession {
            client,
            version: cfg.version,
            usm_keys,
        })
    }

    pub fn supports_bulk(&self) -> bool {
        !matches!(self.version, SnmpVersion::V1)
    }

    /// GET one window (≤ `MAX_OIDS_PER_GET`) of OIDs at a time; callers are
    /// responsible for windowing, per spec's `snmpGetData`.
    pub async fn get(&self, oids: &[String]) -> Result<Vec<RawSample>> {
        let parsed: Result<Vec<ObjectIdentifier>> = oids
            .iter()
            .map(|o| {
                o.parse::<ObjectIdentifier>()
                    .map_err(|e| anyhow::anyhow!("{e}"))
            })
            .collect();
        let parsed = parsed?;

        let map = self
            .client
            .get_multiple(parsed)
            .await
            .context("snmp get failed")?;

        let now = SystemTime::now();
        Ok(map
            .into_iter()
            .map(|(oid, value)| to_raw_sample(oid, value, now))
            .collect())
    }

    /// BULKWALK the subtree rooted at `base_oid`.
    pub async fn bulkwalk(&self, base_oid: &str) -> Result<Vec<RawSample>> {
        let top: ObjectIdentifier = base_oid.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
        let map = self
            .client
            .walk_bulk(top, 10)
            .await
            .context("snmp bulkwalk failed")?;

        let now = SystemTime::now();
        Ok(map
            .into_iter()
            .map(|(oid, value)| to_raw_sample(oid, value, now))
            .collect())
    }
}

fn to_raw_sample(oid: ObjectIdentifier, value: ObjectValue, now: SystemTime) -> RawSample {
    let oid_string = format!(".{oid}");
    let raw = object_value_to_i64(&value);
    let string_value = match &value {
        ObjectValue::String(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        _ => None,
    };
    RawSample {
        oid: oid_string,
        timestamp: now,
        raw,
        string_value,
    }
}

pub fn object_value_to_i64(value: &ObjectValue) -> Option<i64> {
    match value {
        ObjectValue::Integer(i) => Some(*i as i64),
        ObjectValue::Counter32(c) => Some(*c as i64),
        ObjectValue::Unsigned32(u) => Some(*u as i64),
        ObjectValue::TimeTicks(t) => Some(*t as i64),
        ObjectValue::Counter64(c) => Some(*c as i64),
        _ => None,
    }
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving host {host}"))?
        .collect();
    if addrs.is_empty() {
        bail!("no addresses found for host {host}");
    }
    if addrs.len() > 1 {
        warn!("lookup for {} host has more than one IP: {:?}", host, addrs);
    }
    Ok(addrs.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_value_coerces_to_i64() {
        assert_eq!(object_value_to_i64(&ObjectValue::Counter32(42)), Some(42));
        assert_eq!(
            object_value_to_i64(&ObjectValue::Counter64(u64::MAX)),
            Some(u64::MAX as i64)
        );
        assert_eq!(
            object_value_to_i64(&ObjectValue::String(b"eth0".to_vec())),
            None
        );
    }
}
