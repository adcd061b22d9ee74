use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// collectd-style data source kind; see https://collectd.org/wiki/index.php/Data_source
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    Gauge,
    Integer,
    Counter32,
    Counter64,
    Absolute,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricConfig {
    #[serde(skip)]
    pub id: String,
    pub field_name: String,
    #[serde(default)]
    pub description: String,
    pub base_oid: String,
    pub kind: MetricKind,
    /// only meaningful for COUNTER32/COUNTER64
    #[serde(default)]
    pub get_rate: bool,
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub shift: f64,
}

impl MetricConfig {
    pub fn init(&mut self, id: &str) -> Result<()> {
        self.id = id.to_string();
        if self.field_name.is_empty() {
            bail!("field_name not set in metric config {}", self.id);
        }
        if !self.base_oid.starts_with('.') {
            bail!("bad base_oid format: {} in metric config {}", self.base_oid, self.id);
        }
        Ok(())
    }
}

/// max delta for a 32-bit counter's wrap arithmetic: unsigned 32-bit range,
/// not Go's math.MaxInt32 (signed) which the original source used in error.
const MAX_COUNTER32: i64 = u32::MAX as i64;
const MAX_COUNTER64: i64 = i64::MAX;

/// Runtime state for one (metric config, index row) pair.
#[derive(Debug, Clone)]
pub struct Metric {
    pub cfg: Arc<MetricConfig>,
    pub real_oid: String,
    cur_value: i64,
    last_value: i64,
    pub cur_time: Option<SystemTime>,
    last_time: Option<SystemTime>,
    pub cooked_value: f64,
}

impl Metric {
    pub fn new(cfg: Arc<MetricConfig>, real_oid: String) -> Self {
        Metric {
            cfg,
            real_oid,
            cur_value: 0,
            last_value: 0,
            cur_time: None,
            last_time: None,
            cooked_value: 0.0,
        }
    }

    /// Feed a freshly retrieved raw PDU value into the metric, triggering
    /// cooking per the metric's kind. Dispatch happens once here instead of
    /// a strategy object per metric, since the kind set is closed and small.
    pub fn set_raw(&mut self, raw: i64, now: SystemTime) {
        match self.cfg.kind {
            MetricKind::Gauge | MetricKind::Integer | MetricKind::Absolute => {
                self.cur_value = raw;
                self.cur_time = Some(now);
                self.cooked_value = self.apply_scale_shift(raw as f64);
            }
            MetricKind::Counter32 => {
                self.shift_and_compute(raw, now, MAX_COUNTER32);
            }
            MetricKind::Counter64 => {
                self.shift_and_compute(raw, now, MAX_COUNTER64);
            }
        }
    }

    fn shift_and_compute(&mut self, raw: i64, now: SystemTime, max: i64) {
        self.last_value = self.cur_value;
        self.last_time = self.cur_time;
        self.cur_value = raw;
        self.cur_time = Some(now);

        let Some(last_time) = self.last_time else {
            // seed fetch: no baseline to compute a delta against yet.
            self.cooked_value = 0.0;
            return;
        };
        let cur_time = self.cur_time.unwrap();

        let delta = if self.cur_value >= self.last_value {
            self.cur_value - self.last_value
        } else {
            max - self.last_value + self.cur_value
        };

        let cooked = if self.cfg.get_rate {
            let seconds = cur_time
                .duration_since(last_time)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            if seconds > 0.0 {
                delta as f64 / seconds
            } else {
                0.0
            }
        } else {
            delta as f64
        };

        self.cooked_value = self.apply_scale_shift(cooked);
    }

    fn apply_scale_shift(&self, cooked: f64) -> f64 {
        if self.cfg.scale != 0.0 || self.cfg.shift != 0.0 {
            cooked * self.cfg.scale + self.cfg.shift
        } else {
            cooked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg(kind: MetricKind, get_rate: bool) -> Arc<MetricConfig> {
        Arc::new(MetricConfig {
            id: "m".into(),
            field_name: "f".into(),
            description: String::new(),
            base_oid: ".1.2.3".into(),
            kind,
            get_rate,
            scale: 0.0,
            shift: 0.0,
        })
    }

    #[test]
    fn gauge_is_value_as_read() {
        let mut m = Metric::new(cfg(MetricKind::Gauge, false), ".1.2.3.0".into());
        m.set_raw(12345, SystemTime::now());
        assert_eq!(m.cooked_value, 12345.0);
    }

    #[test]
    fn counter32_wraps_at_u32_max() {
        let mut m = Metric::new(cfg(MetricKind::Counter32, true), ".1.2.3.0".into());
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);
        m.set_raw(4294967290, t0);
        m.set_raw(10, t1);
        let expected = (u32::MAX as i64 - 4294967290 + 10) as f64;
        assert_eq!(m.cooked_value, expected);
    }

    #[test]
    fn counter32_monotonic_no_rate() {
        let mut m = Metric::new(cfg(MetricKind::Counter32, false), ".1.2.3.0".into());
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(5);
        m.set_raw(100, t0);
        m.set_raw(150, t1);
        assert_eq!(m.cooked_value, 50.0);
    }

    #[test]
    fn counter64_wraps_at_i64_max() {
        let mut m = Metric::new(cfg(MetricKind::Counter64, true), ".1.2.3.0".into());
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(2);
        let near_max = i64::MAX - 5;
        m.set_raw(near_max, t0);
        m.set_raw(4, t1);
        let expected = (i64::MAX - near_max + 4) as f64 / 2.0;
        assert_eq!(m.cooked_value, expected);
    }

    #[test]
    fn first_sample_has_no_delta_yet() {
        let mut m = Metric::new(cfg(MetricKind::Counter32, false), ".1.2.3.0".into());
        m.set_raw(42, SystemTime::now());
        assert_eq!(m.cooked_value, 0.0);
    }

    #[test]
    fn scale_and_shift_apply_when_nonzero() {
        let mut cfg = cfg(MetricKind::Gauge, false);
        Arc::get_mut(&mut cfg).unwrap().scale = 2.0;
        Arc::get_mut(&mut cfg).unwrap().shift = 1.0;
        let mut m = Metric::new(cfg, ".1.2.3.0".into());
        m.set_raw(10, SystemTime::now());
        assert_eq!(m.cooked_value, 21.0);
    }
}
