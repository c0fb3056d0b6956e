use crate::extract::{as_number, normalize_id};
use crate::models::{
    AuthConfig, AuthKind, Capabilities, PlanInfo, UsageAmount, UsageMetric, UsageSnapshot,
    UsageWindow,
};
use crate::providers::{send_json, FetchContext, FetchError, FetchResult, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;

const DEFAULT_BASE_URL: &str = "https://www.kimi.com/apiv2";
const USAGES_PATH: &str = "/kimi.gateway.billing.v1.BillingService/GetUsages";
const SUBSCRIPTION_PATH: &str = "/kimi.gateway.order.v1.SubscriptionService/GetSubscription";
const CODING_SCOPE: &str = "FEATURE_CODING";
const MINUTE_UNIT: &str = "TIME_UNIT_MINUTE";

const MISSING_AUTH: &str = "kimi requires auth_token and cookie in auth.extra";

#[derive(Debug, Default, Deserialize)]
struct UsagesResponse {
    #[serde(default)]
    usages: Vec<Usage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    /// Either a scope name or a numeric scope id
    #[serde(default)]
    scope: Value,
    #[serde(default)]
    detail: UsageDetail,
    #[serde(default)]
    limits: Vec<LimitInfo>,
}

/// Counters arrive as strings ("100"), sometimes as plain numbers
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageDetail {
    #[serde(default)]
    limit: Value,
    #[serde(default)]
    used: Value,
    #[serde(default)]
    remaining: Value,
    #[serde(default)]
    reset_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LimitInfo {
    #[serde(default)]
    window: LimitWindow,
    #[serde(default)]
    detail: UsageDetail,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LimitWindow {
    #[serde(default)]
    duration: i64,
    #[serde(default)]
    time_unit: Value,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionResponse {
    #[serde(default)]
    subscription: Subscription,
}

#[derive(Debug, Default, Deserialize)]
struct Subscription {
    #[serde(default)]
    goods: Goods,
}

#[derive(Debug, Default, Deserialize)]
struct Goods {
    #[serde(default)]
    title: String,
}

pub struct KimiProvider {
    client: reqwest::Client,
    base_url: String,
}

impl KimiProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn credentials(auth: &AuthConfig) -> FetchResult<(&str, &str)> {
        match (auth.extra_value("auth_token"), auth.extra_value("cookie")) {
            (Some(token), Some(cookie)) => Ok((token, cookie)),
            _ => Err(FetchError::Config(MISSING_AUTH.to_string())),
        }
    }

    fn request(&self, path: &str, token: &str, cookie: &str, body: Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header("Cookie", cookie)
            .header("Accept", "*/*")
            .header("Accept-Language", "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7")
            .header("Connect-Protocol-Version", "1")
            .header("Origin", "https://www.kimi.com")
            .header("Referer", "https://www.kimi.com/code/console")
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-origin")
            .header("X-Language", "zh-CN")
            .header("X-Msh-Platform", "web")
            .header("X-Msh-Version", "1.0.0")
            .json(&body)
    }

    async fn get_usages(&self, ctx: &FetchContext, token: &str, cookie: &str) -> FetchResult<UsagesResponse> {
        let request = self.request(USAGES_PATH, token, cookie, json!({"scope": [CODING_SCOPE]}));
        send_json(ctx, request).await
    }

    async fn get_subscription(
        &self,
        ctx: &FetchContext,
        token: &str,
        cookie: &str,
    ) -> FetchResult<SubscriptionResponse> {
        send_json(ctx, self.request(SUBSCRIPTION_PATH, token, cookie, json!({}))).await
    }
}

impl Default for KimiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for KimiProvider {
    fn id(&self) -> &'static str {
        "kimi"
    }

    fn display_name(&self) -> &'static str {
        "Kimi Code"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_usage_metrics: true,
            supports_cost_breakdown: false,
            supports_cost_by_model: false,
            auth_types: vec![AuthKind::Cookie],
        }
    }

    async fn validate_auth(&self, ctx: &FetchContext, auth: &AuthConfig) -> FetchResult<()> {
        let (token, cookie) = Self::credentials(auth)?;
        self.get_usages(ctx, token, cookie).await.map(|_| ())
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        auth: &AuthConfig,
    ) -> FetchResult<UsageSnapshot> {
        let (token, cookie) = Self::credentials(auth)?;

        let (usages, subscription) = tokio::join!(
            self.get_usages(ctx, token, cookie),
            self.get_subscription(ctx, token, cookie)
        );
        let usages = usages?;

        let mut snap = UsageSnapshot::new(self.id(), self.display_name());
        match subscription {
            Ok(sub) => {
                let title = sub.subscription.goods.title.trim();
                if !title.is_empty() {
                    snap.plan = Some(PlanInfo::subscription(title));
                }
            }
            Err(err) => {
                snap.mark_partial(format!("failed to fetch subscription: {}", err));
            }
        }
        snap.metrics = build_metrics(&usages);
        Ok(snap)
    }
}

fn build_metrics(usages: &UsagesResponse) -> Vec<UsageMetric> {
    let mut metrics = Vec::new();
    let mut seen = HashSet::new();

    for usage in usages.usages.iter().filter(|u| is_coding_scope(&u.scope)) {
        if seen.insert("daily".to_string()) {
            metrics.push(UsageMetric {
                name: "Daily Requests".to_string(),
                window: UsageWindow::new("daily", "Daily").resetting_at(usage.detail.reset_time),
                amount: detail_amount(&usage.detail),
            });
        }

        for limit in &usage.limits {
            let label = window_label(&limit.window);
            let id = format!("window_{}", normalize_id(&label));
            if !seen.insert(id.clone()) {
                continue;
            }
            metrics.push(UsageMetric {
                name: format!("Window ({})", label),
                window: UsageWindow::new(id, label).resetting_at(limit.detail.reset_time),
                amount: detail_amount(&limit.detail),
            });
        }
    }
    metrics
}

/// Unparseable counters read as zero
fn detail_amount(detail: &UsageDetail) -> UsageAmount {
    let count = |v: &Value| as_number(v).map(f64::trunc).unwrap_or(0.0);
    UsageAmount::bounded(
        count(&detail.used),
        count(&detail.limit),
        count(&detail.remaining),
        "requests",
    )
}

fn window_label(window: &LimitWindow) -> String {
    let unit = normalize_time_unit(&window.time_unit);
    if unit == MINUTE_UNIT {
        format!("{}m", window.duration)
    } else {
        format!("{} {}", window.duration, unit)
    }
}

/// The time unit occasionally arrives as the bare enum ordinal 5
fn normalize_time_unit(unit: &Value) -> String {
    let unit = match unit {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    if unit == "5" {
        MINUTE_UNIT.to_string()
    } else {
        unit
    }
}

/// Blank, `FEATURE_CODING`, or a numeric scope id
fn is_coding_scope(scope: &Value) -> bool {
    match scope {
        Value::Null => true,
        Value::Number(_) => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s == CODING_SCOPE || s.parse::<f64>().is_ok()
        }
        _ => false,
    }
}
