//! # Health Pool Scanner
//!
//! Services report capacity and current health as two plain string keys:
//!
//! ```text
//! <service-path>:__healthpool__<metric-type>_cap
//! <service-path>:__healthpool__<metric-type>_health
//! ```
//!
//! Every poll scans all such keys, pairs the two halves per
//! `(service-path, metric-type)` and republishes the whole mapping.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::core::channel::{Channel, ChannelValue};
use crate::error::StoreError;
use crate::ingestors::poller::PollSource;
use crate::ingestors::store::KeyedStore;
use std::sync::Arc;

pub const HEALTH_KEY_PATTERN: &str = "*:__healthpool__*_*";
const POOL_MARKER: &str = ":__healthpool__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthHalf {
    Cap,
    Health,
}

/// A parsed health-pool key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthKey {
    pub service_path: String,
    pub metric_type: String,
    pub half: HealthHalf,
}

impl HealthKey {
    /// Splits at the first `:__healthpool__`; the rest must end in `_cap` or
    /// `_health`. Empty service paths or metric types are rejected.
    pub fn parse(key: &str) -> Option<Self> {
        let (service_path, rest) = key.split_once(POOL_MARKER)?;
        let (metric_type, half) = if let Some(metric) = rest.strip_suffix("_cap") {
            (metric, HealthHalf::Cap)
        } else if let Some(metric) = rest.strip_suffix("_health") {
            (metric, HealthHalf::Health)
        } else {
            return None;
        };
        if service_path.is_empty() || metric_type.is_empty() {
            return None;
        }
        Some(Self {
            service_path: service_path.to_string(),
            metric_type: metric_type.to_string(),
            half,
        })
    }

    /// `"<service-path>[<metric-type>]"`, the mapping key of the metric.
    pub fn metric_id(&self) -> String {
        format!("{}[{}]", self.service_path, self.metric_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthBand {
    Healthy,
    Warning,
    Critical,
}

impl HealthBand {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 50.0 {
            HealthBand::Healthy
        } else if percentage >= 25.0 {
            HealthBand::Warning
        } else {
            HealthBand::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthBand::Healthy => "Healthy",
            HealthBand::Warning => "Warning",
            HealthBand::Critical => "Critical",
        }
    }
}

impl fmt::Display for HealthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One paired capacity/health reading.
#[derive(Debug, Clone)]
pub struct HealthMetric {
    pub service_path: String,
    pub metric_type: String,
    pub health: i64,
    pub cap: i64,
    pub observed_at: DateTime<Utc>,
}

// Readings taken at different times compare equal when the values match.
impl PartialEq for HealthMetric {
    fn eq(&self, other: &Self) -> bool {
        self.service_path == other.service_path
            && self.metric_type == other.metric_type
            && self.health == other.health
            && self.cap == other.cap
    }
}

impl Eq for HealthMetric {}

impl HealthMetric {
    /// `health / cap × 100`, or `0.0` when the capacity is not positive.
    pub fn percentage(&self) -> f64 {
        if self.cap > 0 {
            self.health as f64 / self.cap as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn status(&self) -> HealthBand {
        HealthBand::from_percentage(self.percentage())
    }
}

impl fmt::Display for HealthMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] health={}/{} ({:.1}%) - {}",
            self.service_path,
            self.metric_type,
            self.health,
            self.cap,
            self.percentage(),
            self.status()
        )
    }
}

impl Serialize for HealthMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("HealthMetric", 7)?;
        s.serialize_field("servicePath", &self.service_path)?;
        s.serialize_field("metricType", &self.metric_type)?;
        s.serialize_field("health", &self.health)?;
        s.serialize_field("cap", &self.cap)?;
        s.serialize_field("percentage", &self.percentage())?;
        s.serialize_field("status", &self.status())?;
        s.serialize_field("observedAt", &self.observed_at)?;
        s.end()
    }
}

/// Values are integers; a missing or empty value counts as `0`.
fn parse_reading(key: &str, value: Option<&str>) -> Option<i64> {
    match value.map(str::trim) {
        None | Some("") => Some(0),
        Some(raw) => match raw.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Ignoring non-integer health value '{}' at {}", raw, key);
                None
            }
        },
    }
}

/// Poll source for the health pool.
#[derive(Debug, Clone, Default)]
pub struct HealthSource;

impl PollSource for HealthSource {
    type Output = BTreeMap<String, HealthMetric>;

    const NAME: &'static str = "HealthMonitor";
    const CHANNEL: Channel = Channel::HealthMetrics;
    const PUBLISH_UNCHANGED: bool = true;

    async fn fetch<S: KeyedStore>(&self, store: &mut S) -> Result<Option<Self::Output>, StoreError> {
        let keys = store.scan_keys(HEALTH_KEY_PATTERN).await?;
        let observed_at = Utc::now();

        let mut halves: BTreeMap<String, (HealthKey, Option<i64>, Option<i64>)> = BTreeMap::new();
        for key in keys {
            let Some(parsed) = HealthKey::parse(&key) else {
                log::trace!("Skipping key outside the health pool grammar: {}", key);
                continue;
            };
            let value = store.get(&key).await?;
            let Some(reading) = parse_reading(&key, value.as_deref()) else {
                continue;
            };
            let half = parsed.half;
            let entry = halves
                .entry(parsed.metric_id())
                .or_insert_with(|| (parsed, None, None));
            match half {
                HealthHalf::Cap => entry.1 = Some(reading),
                HealthHalf::Health => entry.2 = Some(reading),
            }
        }

        let metrics = halves
            .into_iter()
            .filter_map(|(id, (key, cap, health))| {
                Some((
                    id,
                    HealthMetric {
                        service_path: key.service_path,
                        metric_type: key.metric_type,
                        health: health?,
                        cap: cap?,
                        observed_at,
                    },
                ))
            })
            .collect();
        Ok(Some(metrics))
    }

    fn to_value(output: &Arc<Self::Output>) -> ChannelValue {
        ChannelValue::HealthMetrics(Arc::clone(output))
    }
}
