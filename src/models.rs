use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How a subscription authenticates against its vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
    Cookie,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::ApiKey => "api_key",
            AuthKind::OAuth => "oauth",
            AuthKind::Cookie => "cookie",
        }
    }
}

/// Credentials for one subscription. Opaque to everything except the
/// provider that owns the subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub kind: AuthKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl AuthConfig {
    /// Trimmed value of an `extra` entry, `None` when absent or blank.
    pub fn extra_value(&self, name: &str) -> Option<&str> {
        self.extra
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Trimmed primary key, `None` when blank.
    pub fn primary_key(&self) -> Option<&str> {
        Some(self.key.trim()).filter(|s| !s.is_empty())
    }
}

/// One monitored subscription as read from the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    #[serde(rename = "provider", alias = "provider_id")]
    pub provider_id: String,
    #[serde(rename = "name", alias = "display_name", default)]
    pub display_name: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl SubscriptionEntry {
    pub fn new(provider_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            display_name: display_name.into(),
            auth: AuthConfig::default(),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

/// Static feature set a provider declares about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_usage_metrics: bool,
    pub supports_cost_breakdown: bool,
    pub supports_cost_by_model: bool,
    #[serde(rename = "accepted_auth_kinds")]
    pub auth_types: Vec<AuthKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    #[default]
    Ok,
    Error,
    Unauthorized,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Ok => "ok",
            SnapshotStatus::Error => "error",
            SnapshotStatus::Unauthorized => "unauthorized",
        }
    }
}

/// Recurring interval a metric is measured over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Stable id, unique within one snapshot's metrics
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

impl UsageWindow {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            resets_at: None,
        }
    }

    pub fn resetting_at(mut self, resets_at: Option<DateTime<Utc>>) -> Self {
        self.resets_at = resets_at;
        self
    }
}

/// Measured quantity. Any of used/limit/remaining may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAmount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    /// Lowercase unit token, e.g. "requests", "tokens", "percent", "usd"
    pub unit: String,
}

impl UsageAmount {
    pub fn used(value: f64, unit: impl Into<String>) -> Self {
        Self {
            used: Some(value),
            limit: None,
            remaining: None,
            unit: unit.into(),
        }
    }

    pub fn bounded(used: f64, limit: f64, remaining: f64, unit: impl Into<String>) -> Self {
        Self {
            used: Some(used),
            limit: Some(limit),
            remaining: Some(remaining),
            unit: unit.into(),
        }
    }

    /// Usage percentage when both used and a positive limit are known
    pub fn used_percent(&self) -> Option<f64> {
        match (self.used, self.limit) {
            (Some(used), Some(limit)) if limit > 0.0 => Some(used / limit * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetric {
    pub name: String,
    pub window: UsageWindow,
    pub amount: UsageAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renews_at: Option<DateTime<Utc>>,
}

impl PlanInfo {
    pub fn subscription(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "subscription".to_string(),
            renews_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCost {
    /// Calendar day, `YYYY-MM-DD`
    pub date: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Spend over a billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub total: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_model: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_day: Vec<DailyCost>,
    pub period: TimePeriod,
}

/// Normalized usage of one subscription at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub provider_id: String,
    /// Vendor display name, e.g. "OpenAI"
    pub display_name: String,
    /// Configured subscription name
    pub subscription_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanInfo>,
    /// Always serialized, as `[]` when there is nothing to report
    #[serde(default)]
    pub metrics: Vec<UsageMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostBreakdown>,
    pub status: SnapshotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl UsageSnapshot {
    /// Empty OK snapshot stamped with the current time
    pub fn new(provider_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            display_name: display_name.into(),
            subscription_name: String::new(),
            timestamp: Utc::now(),
            plan: None,
            metrics: Vec::new(),
            cost: None,
            status: SnapshotStatus::Ok,
            error_message: None,
        }
    }

    /// Error snapshot for an entry that produced no data at all
    pub fn failed(entry: &SubscriptionEntry, display_name: &str, message: String) -> Self {
        Self {
            subscription_name: entry.display_name.clone(),
            status: SnapshotStatus::Error,
            error_message: Some(message),
            ..Self::new(entry.provider_id.clone(), display_name)
        }
    }

    /// Marks the snapshot as degraded while keeping whatever data it holds
    pub fn mark_partial(&mut self, message: impl Into<String>) {
        self.status = SnapshotStatus::Error;
        self.error_message = Some(message.into());
    }

    pub fn is_ok(&self) -> bool {
        self.status == SnapshotStatus::Ok
    }
}
