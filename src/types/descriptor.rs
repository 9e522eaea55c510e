use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Training status reported by a descriptor. Only `Ok` is promotable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DescriptorStatus {
    Ok,
    NoData,
    InsufficientSamples,
    InsufficientTrainSamples,
    Degraded,
    Other(String),
}

impl DescriptorStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DescriptorStatus::Ok => "ok",
            DescriptorStatus::NoData => "no_data",
            DescriptorStatus::InsufficientSamples => "insufficient_samples",
            DescriptorStatus::InsufficientTrainSamples => "insufficient_train_samples",
            DescriptorStatus::Degraded => "degraded",
            DescriptorStatus::Other(s) => s,
        }
    }
}

impl From<String> for DescriptorStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ok" => DescriptorStatus::Ok,
            "no_data" => DescriptorStatus::NoData,
            "insufficient_samples" => DescriptorStatus::InsufficientSamples,
            // rugguard trainer spells it out
            "insufficient_train_samples" | "insufficient_training_samples" => {
                DescriptorStatus::InsufficientTrainSamples
            }
            "degraded" => DescriptorStatus::Degraded,
            _ => DescriptorStatus::Other(s),
        }
    }
}

impl From<DescriptorStatus> for String {
    fn from(status: DescriptorStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for DescriptorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric metrics of a descriptor.
///
/// Nested maps are flattened with `.` separators (`10m.auc_holdout`), non-numeric
/// leaves are dropped and non-finite numbers are treated as missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// First present metric among `names`, with the name that matched
    pub fn first_of<'a>(&self, names: &[&'a str]) -> Option<(&'a str, f64)> {
        names
            .iter()
            .find_map(|name| self.get(name).map(|value| (*name, value)))
    }

    fn flatten_into(out: &mut BTreeMap<String, f64>, prefix: Option<&str>, value: &Value) {
        let Value::Object(map) = value else {
            return;
        };
        for (key, leaf) in map {
            let path = match prefix {
                Some(p) => format!("{}.{}", p, key),
                None => key.clone(),
            };
            match leaf {
                Value::Number(n) => {
                    if let Some(v) = n.as_f64().filter(|v| v.is_finite()) {
                        out.insert(path, v);
                    }
                }
                Value::Object(_) => Self::flatten_into(out, Some(&path), leaf),
                _ => {}
            }
        }
    }
}

impl<'de> Deserialize<'de> for Metrics {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let mut out = BTreeMap::new();
        Self::flatten_into(&mut out, None, &value);
        Ok(Metrics(out))
    }
}

impl<'a> FromIterator<(&'a str, f64)> for Metrics {
    fn from_iter<I: IntoIterator<Item = (&'a str, f64)>>(iter: I) -> Self {
        Metrics(
            iter.into_iter()
                .filter(|(_, v)| v.is_finite())
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

/// Model artifact written by a training job.
///
/// Kind-specific parameters (weights, thresholds, trail params) are kept in
/// `extra` untouched; the gateway never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub status: DescriptorStatus,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdout_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ModelDescriptor {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn is_ok(&self) -> bool {
        self.status == DescriptorStatus::Ok
    }

    /// Sample count for kinds without a holdout split
    pub fn sample_count(&self) -> Option<u64> {
        self.sample_size.or(self.train_size)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// One-line summary for status listings
    pub fn summary(&self) -> String {
        let created = self
            .created_at()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .or_else(|| self.created.clone())
            .unwrap_or_else(|| "-".to_string());
        let train = self
            .train_size
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "status={} train_size={} metrics={} created={}",
            self.status,
            train,
            self.metrics.0.len(),
            created
        )
    }
}

#[cfg(test)]
impl ModelDescriptor {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn new(status: DescriptorStatus, metrics: Metrics) -> Self {
        Self {
            status,
            metrics,
            train_size: None,
            holdout_size: None,
            sample_size: None,
            created: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_train_size(mut self, n: u64) -> Self {
        self.train_size = Some(n);
        self
    }

    pub fn with_sample_size(mut self, n: u64) -> Self {
        self.sample_size = Some(n);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
