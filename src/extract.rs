//! Usage mining for payloads without a fixed schema.
//!
//! Tiers run in priority order and the first one that yields anything wins:
//! a known `rate_limit` window shape, then a walk over objects carrying
//! used/limit/remaining style keys, then a scan of numeric leaves whose path
//! looks usage-related. When every tier comes back empty the caller gets a
//! single "endpoint reachable" metric instead of an empty list.

use crate::models::{UsageAmount, UsageMetric, UsageWindow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

const USED_KEYS: &[&str] = &["used", "usage", "consumed", "current_usage"];
const LIMIT_KEYS: &[&str] = &["limit", "quota", "max", "cap"];
const REMAINING_KEYS: &[&str] = &["remaining", "left", "available"];
const NAME_KEYS: &[&str] = &["name", "label", "title", "model", "plan"];
const UNIT_KEYS: &[&str] = &["unit", "currency"];
const RESET_KEYS: &[&str] = &[
    "reset_at",
    "resets_at",
    "resetAt",
    "resetsAt",
    "reset_time",
    "resetTime",
];
const PLAN_KEYS: &[&str] = &["plan", "plan_type", "chatgpt_plan_type", "subscription", "tier"];

/// Rate-limit windows recognised by the first tier: (key, window id, label)
const RATE_LIMIT_WINDOWS: &[(&str, &str, &str)] = &[
    ("primary_window", "5h", "5 Hour"),
    ("secondary_window", "7d", "7 Day"),
];

/// Leaf metrics kept by the last tier
pub const MAX_LEAF_METRICS: usize = 8;

/// Keyword lists driving the leaf scan. Loaded from the `[extractor]`
/// config section so new vendors do not need a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_usage_keywords")]
    pub usage_keywords: Vec<String>,
    #[serde(default = "default_timestamp_keywords")]
    pub timestamp_keywords: Vec<String>,
}

fn default_usage_keywords() -> Vec<String> {
    [
        "usage", "used", "remaining", "remain", "left", "available", "quota", "limit", "cap",
        "count", "requests", "messages", "tokens", "spend", "cost", "credits", "balance",
        "percent",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_timestamp_keywords() -> Vec<String> {
    [
        "time",
        "timestamp",
        "date",
        "expires",
        "expiry",
        "reset",
        "created",
        "updated",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            usage_keywords: default_usage_keywords(),
            timestamp_keywords: default_timestamp_keywords(),
        }
    }
}

/// Per-run state shared by the tiers
#[derive(Debug)]
pub struct ExtractState {
    pub now: DateTime<Utc>,
    /// Metric ids already emitted
    pub seen: HashSet<String>,
}

impl ExtractState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            seen: HashSet::new(),
        }
    }

    /// Records `id`, returning false if it was already taken
    fn claim(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }
}

/// One extraction strategy
pub trait Tier: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, root: &Value, state: &mut ExtractState) -> Vec<UsageMetric>;
}

/// `rate_limit.{primary,secondary}_window.used_percent`
#[derive(Debug, Default)]
pub struct RateLimitWindows;

impl Tier for RateLimitWindows {
    fn name(&self) -> &'static str {
        "rate_limit_windows"
    }

    fn extract(&self, root: &Value, state: &mut ExtractState) -> Vec<UsageMetric> {
        let Some(rate_limit) = root.get("rate_limit").and_then(Value::as_object) else {
            return Vec::new();
        };

        let mut metrics = Vec::with_capacity(RATE_LIMIT_WINDOWS.len());
        for (key, id, label) in RATE_LIMIT_WINDOWS {
            let Some(window) = rate_limit.get(*key).and_then(Value::as_object) else {
                continue;
            };
            let Some(used_percent) = window.get("used_percent").and_then(as_number) else {
                continue;
            };

            let resets_at = window
                .get("reset_at")
                .and_then(as_number)
                .and_then(epoch_seconds)
                .or_else(|| {
                    window
                        .get("reset_after_seconds")
                        .and_then(as_number)
                        .and_then(|secs| offset_seconds(state.now, secs))
                });

            state.claim(id);
            metrics.push(UsageMetric {
                name: format!("{} Usage", label),
                window: UsageWindow::new(*id, *label).resetting_at(resets_at),
                amount: UsageAmount::bounded(
                    used_percent,
                    100.0,
                    (100.0 - used_percent).clamp(0.0, 100.0),
                    "percent",
                ),
            });
        }
        metrics
    }
}

/// Depth-first walk over objects exposing used/limit/remaining synonyms
#[derive(Debug, Default)]
pub struct KeyedObjectWalk;

impl KeyedObjectWalk {
    fn visit(
        &self,
        path: &mut Vec<String>,
        node: &Value,
        state: &mut ExtractState,
        out: &mut Vec<UsageMetric>,
    ) {
        match node {
            Value::Object(map) => {
                if let Some(metric) = self.metric_for(path, map, state) {
                    out.push(metric);
                }
                for (key, child) in map {
                    path.push(key.clone());
                    self.visit(path, child, state, out);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate() {
                    path.push(idx.to_string());
                    self.visit(path, child, state, out);
                    path.pop();
                }
            }
            _ => {}
        }
    }

    fn metric_for(
        &self,
        path: &[String],
        map: &Map<String, Value>,
        state: &mut ExtractState,
    ) -> Option<UsageMetric> {
        let used = find_number(map, USED_KEYS);
        let limit = find_number(map, LIMIT_KEYS);
        let remaining = find_number(map, REMAINING_KEYS);
        if used.is_none() && limit.is_none() && remaining.is_none() {
            return None;
        }

        let name = find_string(map, NAME_KEYS)
            .map(str::to_string)
            .or_else(|| Some(path.join(" / ").trim().to_string()).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "Usage".to_string());
        let id = normalize_id(&name);
        if !state.claim(&id) {
            return None;
        }

        Some(UsageMetric {
            name,
            window: UsageWindow::new(id, "Current").resetting_at(find_reset_time(map)),
            amount: UsageAmount {
                used,
                limit,
                remaining,
                unit: find_string(map, UNIT_KEYS)
                    .unwrap_or("count")
                    .to_lowercase(),
            },
        })
    }
}

impl Tier for KeyedObjectWalk {
    fn name(&self) -> &'static str {
        "keyed_object_walk"
    }

    fn extract(&self, root: &Value, state: &mut ExtractState) -> Vec<UsageMetric> {
        let mut out = Vec::new();
        self.visit(&mut Vec::new(), root, state, &mut out);
        out
    }
}

/// Scalar leaves whose key or path mentions a usage keyword
#[derive(Debug)]
pub struct LeafNumeric {
    usage_keywords: Vec<String>,
    timestamp_keywords: Vec<String>,
    max_metrics: usize,
}

impl LeafNumeric {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            usage_keywords: lowercase_all(&config.usage_keywords),
            timestamp_keywords: lowercase_all(&config.timestamp_keywords),
            max_metrics: MAX_LEAF_METRICS,
        }
    }

    fn is_usage_like(&self, joined_path: &str, key: &str) -> bool {
        self.usage_keywords
            .iter()
            .any(|kw| key.contains(kw.as_str()) || joined_path.contains(kw.as_str()))
    }

    fn is_timestamp_like(&self, key: &str) -> bool {
        self.timestamp_keywords
            .iter()
            .any(|kw| key.contains(kw.as_str()))
    }

    fn visit(
        &self,
        path: &mut Vec<String>,
        node: &Value,
        state: &mut ExtractState,
        out: &mut Vec<UsageMetric>,
    ) {
        if out.len() >= self.max_metrics {
            return;
        }

        match node {
            Value::Object(map) => {
                for (key, child) in map {
                    path.push(key.clone());
                    self.visit(path, child, state, out);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate() {
                    path.push(idx.to_string());
                    self.visit(path, child, state, out);
                    path.pop();
                }
            }
            leaf => {
                let Some(value) = as_number(leaf) else {
                    return;
                };
                let key = path.last().map(|k| k.to_lowercase()).unwrap_or_default();
                let joined = path.join("/").to_lowercase();
                if !self.is_usage_like(&joined, &key) || self.is_timestamp_like(&key) {
                    return;
                }

                let name = prettify_path(path).unwrap_or_else(|| "Usage".to_string());
                let id = normalize_id(&name);
                if !state.claim(&id) {
                    return;
                }

                out.push(UsageMetric {
                    name,
                    window: UsageWindow::new(id, "Current"),
                    amount: UsageAmount::used(value, unit_for_key(&key)),
                });
            }
        }
    }
}

impl Tier for LeafNumeric {
    fn name(&self) -> &'static str {
        "leaf_numeric"
    }

    fn extract(&self, root: &Value, state: &mut ExtractState) -> Vec<UsageMetric> {
        let mut out = Vec::new();
        self.visit(&mut Vec::new(), root, state, &mut out);
        out
    }
}

/// Runs the tiers in priority order
pub struct Extractor {
    tiers: Vec<Box<dyn Tier>>,
}

impl Extractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            tiers: vec![
                Box::new(RateLimitWindows),
                Box::new(KeyedObjectWalk),
                Box::new(LeafNumeric::new(config)),
            ],
        }
    }

    /// Metrics from the first tier that finds any; may be empty
    pub fn extract(&self, raw: &Value, now: DateTime<Utc>) -> Vec<UsageMetric> {
        let mut state = ExtractState::new(now);
        for tier in &self.tiers {
            let metrics = tier.extract(raw, &mut state);
            if !metrics.is_empty() {
                tracing::debug!(tier = tier.name(), count = metrics.len(), "extracted metrics");
                return metrics;
            }
        }
        Vec::new()
    }

    /// Like [`Extractor::extract`] but never returns an empty list
    pub fn extract_or_reachable(&self, raw: &Value, now: DateTime<Utc>) -> Vec<UsageMetric> {
        let metrics = self.extract(raw, now);
        if metrics.is_empty() {
            vec![reachable_metric()]
        } else {
            metrics
        }
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(&ExtractorConfig::default())
    }
}

/// Stand-in metric for a successful response with nothing usage-like in it
pub fn reachable_metric() -> UsageMetric {
    UsageMetric {
        name: "Usage Endpoint Reachable".to_string(),
        window: UsageWindow::new("current", "Current"),
        amount: UsageAmount::used(1.0, "status"),
    }
}

/// Plan name from the usual top-level keys, the `auth` block, or anywhere
/// a `chatgpt_plan_type` shows up.
pub fn extract_plan_name(raw: &Value) -> Option<String> {
    let root = raw.as_object()?;
    find_string(root, PLAN_KEYS)
        .or_else(|| {
            root.get("auth")
                .and_then(Value::as_object)
                .and_then(|auth| find_string(auth, &["chatgpt_plan_type"]))
        })
        .or_else(|| find_string_deep(raw, "chatgpt_plan_type"))
        .map(format_plan_name)
}

/// Numeric view of a JSON value: numbers, numeric strings and booleans.
/// Anything else is treated as absent.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Metric id: lowercase, runs of whitespace, `/` and `-` folded into `_`
pub fn normalize_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if c.is_whitespace() || c == '/' || c == '-' {
            pending_sep = true;
            continue;
        }
        if pending_sep && !id.is_empty() {
            id.push('_');
        }
        pending_sep = false;
        id.extend(c.to_lowercase());
    }
    if id.is_empty() {
        "usage".to_string()
    } else {
        id
    }
}

fn find_number(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| map.get(*k).and_then(as_number))
}

fn find_string<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        map.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

fn find_string_deep<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match value {
        Value::Object(map) => find_string(map, &[key])
            .or_else(|| map.values().find_map(|child| find_string_deep(child, key))),
        Value::Array(items) => items.iter().find_map(|child| find_string_deep(child, key)),
        _ => None,
    }
}

fn find_reset_time(map: &Map<String, Value>) -> Option<DateTime<Utc>> {
    for key in RESET_KEYS {
        let Some(value) = map.get(*key) else {
            continue;
        };
        if let Some(ts) = as_number(value) {
            return epoch_seconds(ts);
        }
        if let Some(parsed) = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    None
}

fn epoch_seconds(ts: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts as i64, 0).single()
}

/// `now + secs`, or `None` when the offset does not fit a timestamp
fn offset_seconds(now: DateTime<Utc>, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs.abs() >= (i64::MAX / 1000) as f64 {
        return None;
    }
    now.checked_add_signed(Duration::try_seconds(secs as i64)?)
}

fn unit_for_key(key: &str) -> &'static str {
    if key.contains("cost") || key.contains("spend") {
        "usd"
    } else if key.contains("token") {
        "tokens"
    } else if key.contains("request") || key.contains("message") {
        "requests"
    } else {
        "count"
    }
}

/// Display name from the last three non-index path segments
fn prettify_path(path: &[String]) -> Option<String> {
    let segments: Vec<&str> = path
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty() && p.parse::<i64>().is_err())
        .collect();
    if segments.is_empty() {
        return None;
    }

    let tail = &segments[segments.len().saturating_sub(3)..];
    Some(
        tail.iter()
            .map(|segment| title_case(&segment.replace(['_', '-'], " ")))
            .collect::<Vec<_>>()
            .join(" / "),
    )
}

fn format_plan_name(raw: &str) -> String {
    title_case(&raw.trim().replace('_', " "))
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn lowercase_all(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}
