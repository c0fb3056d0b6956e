use crate::extract::{extract_plan_name, Extractor, ExtractorConfig};
use crate::models::{
    AuthConfig, AuthKind, Capabilities, CostBreakdown, DailyCost, PlanInfo, TimePeriod,
    UsageSnapshot,
};
use crate::providers::{FetchContext, FetchResult, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::time::Duration as StdDuration;

/// Pretend network round trip
const LATENCY: StdDuration = StdDuration::from_millis(50);

/// Offline provider for demos. Serves a canned web-style payload through the
/// same extractor the real adapters use.
pub struct MockProvider {
    extractor: Extractor,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_extractor(&ExtractorConfig::default())
    }

    pub fn with_extractor(config: &ExtractorConfig) -> Self {
        Self {
            extractor: Extractor::new(config),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_payload(now: DateTime<Utc>) -> Value {
    json!({
        "plan_type": "max",
        "rate_limit": {
            "primary_window": {
                "used_percent": 72,
                "limit_window_seconds": 18000,
                "reset_at": (now + Duration::hours(3)).timestamp()
            },
            "secondary_window": {
                "used_percent": 45,
                "limit_window_seconds": 604800,
                "reset_after_seconds": 3 * 24 * 3600
            }
        },
        "credits": {"has_credits": false, "balance": "0"}
    })
}

fn sample_cost(now: DateTime<Utc>) -> CostBreakdown {
    let by_day: Vec<DailyCost> = (0..7)
        .rev()
        .map(|days_ago| DailyCost {
            date: (now - Duration::days(days_ago)).format("%Y-%m-%d").to_string(),
            cost: 1.5 + days_ago as f64 * 0.25,
        })
        .collect();
    CostBreakdown {
        total: by_day.iter().map(|d| d.cost).sum(),
        currency: "USD".to_string(),
        by_model: None,
        by_day,
        period: TimePeriod {
            start: now - Duration::days(7),
            end: now,
        },
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &'static str {
        "mock"
    }

    fn display_name(&self) -> &'static str {
        "Mock"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_usage_metrics: true,
            supports_cost_breakdown: true,
            supports_cost_by_model: false,
            auth_types: vec![AuthKind::ApiKey, AuthKind::OAuth, AuthKind::Cookie],
        }
    }

    async fn validate_auth(&self, _ctx: &FetchContext, _auth: &AuthConfig) -> FetchResult<()> {
        Ok(())
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        _auth: &AuthConfig,
    ) -> FetchResult<UsageSnapshot> {
        ctx.run(async {
            tokio::time::sleep(LATENCY).await;
            Ok(())
        })
        .await?;

        let now = Utc::now();
        let raw = sample_payload(now);
        let mut snap = UsageSnapshot::new(self.id(), self.display_name());
        snap.metrics = self.extractor.extract_or_reachable(&raw, now);
        snap.plan = extract_plan_name(&raw).map(PlanInfo::subscription);
        snap.cost = Some(sample_cost(now));
        Ok(snap)
    }
}
