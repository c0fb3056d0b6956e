use crate::extract::{as_number, normalize_id};
use crate::models::{
    AuthConfig, AuthKind, Capabilities, CostBreakdown, PlanInfo, TimePeriod, UsageAmount,
    UsageMetric, UsageSnapshot, UsageWindow,
};
use crate::providers::{send_json, FetchContext, FetchError, FetchResult, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

const DEFAULT_BASE_URL: &str = "https://zenmux.ai";
const CURRENT_PATH: &str = "/api/subscription/get_current";
const CURRENT_USAGE_PATH: &str = "/api/subscription/get_current_usage";
const SUMMARY_PATH: &str = "/api/dashboard/cost/query/subscription_summary";

/// Flows per window when the plan description does not say
const DEFAULT_FLOW_QUOTA: u64 = 1200;

const MISSING_AUTH: &str = "zenmux requires ctoken and session_id in auth.extra";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentSubscription {
    #[serde(default)]
    name: String,
    /// Starts with the flow quota, e.g. "1200 flows per 5 hours"
    #[serde(default)]
    desc: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageItem {
    #[serde(default)]
    period_type: String,
    #[serde(default)]
    cycle_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    used_rate: f64,
}

/// Every figure in the summary is a decimal string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryData {
    #[serde(default)]
    total_cost: Value,
    #[serde(default)]
    request_counts: Value,
    #[serde(default)]
    total_tokens: Value,
}

struct Session<'a> {
    ctoken: &'a str,
    session_id: &'a str,
    session_id_sig: Option<&'a str>,
}

impl<'a> Session<'a> {
    fn resolve(auth: &'a AuthConfig) -> FetchResult<Self> {
        match (auth.extra_value("ctoken"), auth.extra_value("session_id")) {
            (Some(ctoken), Some(session_id)) => Ok(Session {
                ctoken,
                session_id,
                session_id_sig: auth.extra_value("session_id_sig"),
            }),
            _ => Err(FetchError::Config(MISSING_AUTH.to_string())),
        }
    }

    fn cookie_header(&self) -> String {
        let mut cookie = format!("ctoken={}; sessionId={}", self.ctoken, self.session_id);
        if let Some(sig) = self.session_id_sig {
            cookie.push_str(&format!("; sessionId.sig={}", sig));
        }
        cookie
    }
}

pub struct ZenMuxProvider {
    client: reqwest::Client,
    base_url: String,
}

impl ZenMuxProvider {
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

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &FetchContext,
        path: &str,
        session: &Session<'_>,
    ) -> FetchResult<Option<T>> {
        let request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(&[("ctoken", session.ctoken)])
            .header("Cookie", session.cookie_header())
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7")
            .header("Referer", "https://zenmux.ai/platform/subscription");
        let envelope: Envelope<T> = send_json(ctx, request).await?;
        Ok(envelope.data)
    }
}

impl Default for ZenMuxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ZenMuxProvider {
    fn id(&self) -> &'static str {
        "zenmux"
    }

    fn display_name(&self) -> &'static str {
        "ZenMux"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_usage_metrics: true,
            supports_cost_breakdown: true,
            supports_cost_by_model: false,
            auth_types: vec![AuthKind::Cookie],
        }
    }

    async fn validate_auth(&self, ctx: &FetchContext, auth: &AuthConfig) -> FetchResult<()> {
        let session = Session::resolve(auth)?;
        self.get::<CurrentSubscription>(ctx, CURRENT_PATH, &session)
            .await
            .map(|_| ())
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        auth: &AuthConfig,
    ) -> FetchResult<UsageSnapshot> {
        let session = Session::resolve(auth)?;

        let (current, usage, summary) = tokio::join!(
            self.get::<CurrentSubscription>(ctx, CURRENT_PATH, &session),
            self.get::<Vec<UsageItem>>(ctx, CURRENT_USAGE_PATH, &session),
            self.get::<SummaryData>(ctx, SUMMARY_PATH, &session)
        );

        let mut errors = Vec::new();
        let current = collect(current, "get_current", &mut errors);
        let usage = collect(usage, "get_current_usage", &mut errors);
        let summary = collect(summary, "subscription_summary", &mut errors);
        if errors.len() == 3 {
            return Err(FetchError::AllEndpointsFailed(errors));
        }

        let mut snap = UsageSnapshot::new(self.id(), self.display_name());
        if !errors.is_empty() {
            snap.mark_partial(format!("partial data: {}", errors.join("; ")));
        }

        let current = current.flatten();
        if let Some(sub) = &current {
            snap.plan = Some(PlanInfo {
                renews_at: sub.expired_at,
                ..PlanInfo::subscription(sub.name.trim())
            });
        }

        let quota = current
            .as_ref()
            .map(|sub| parse_quota(&sub.desc))
            .unwrap_or(DEFAULT_FLOW_QUOTA) as f64;
        let mut metrics = flow_metrics(&usage.flatten().unwrap_or_default(), quota);

        if let Some(summary) = summary.flatten() {
            if let Some(tokens) = as_number(&summary.total_tokens) {
                metrics.push(UsageMetric {
                    name: "Total Tokens".to_string(),
                    window: UsageWindow::new("total_tokens", "Total"),
                    amount: UsageAmount::used(tokens, "tokens"),
                });
            }
            if let Some(requests) = as_number(&summary.request_counts) {
                metrics.push(UsageMetric {
                    name: "API Requests".to_string(),
                    window: UsageWindow::new("total_requests", "Total"),
                    amount: UsageAmount::used(requests, "requests"),
                });
            }

            let now = Utc::now();
            snap.cost = Some(CostBreakdown {
                total: as_number(&summary.total_cost).unwrap_or(0.0),
                currency: "USD".to_string(),
                by_model: None,
                by_day: Vec::new(),
                period: TimePeriod {
                    start: current.as_ref().and_then(|s| s.started_at).unwrap_or(now),
                    end: now,
                },
            });
        }

        snap.metrics = metrics;
        Ok(snap)
    }
}

fn collect<T>(result: FetchResult<T>, endpoint: &str, errors: &mut Vec<String>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            errors.push(format!("{}: {}", endpoint, err));
            None
        }
    }
}

/// One metric per usage window; repeated windows keep the first entry
fn flow_metrics(items: &[UsageItem], quota: f64) -> Vec<UsageMetric> {
    let mut seen = HashSet::new();
    items
        .iter()
        .map(|item| flow_metric(item, quota))
        .filter(|metric| seen.insert(metric.window.id.clone()))
        .collect()
}

fn flow_metric(item: &UsageItem, quota: f64) -> UsageMetric {
    let (name, id, label) = match item.period_type.trim() {
        "hour_5" => ("5h Flows".to_string(), "5h".to_string(), "5 Hour".to_string()),
        "week" => ("7d Flows".to_string(), "7d".to_string(), "7 Day".to_string()),
        "" => ("Flows".to_string(), "flows".to_string(), "Current".to_string()),
        other => (other.to_string(), normalize_id(other), other.to_string()),
    };
    let used = quota * item.used_rate;
    UsageMetric {
        name,
        window: UsageWindow::new(id, label).resetting_at(item.cycle_end_time),
        amount: UsageAmount::bounded(used, quota, quota - used, "flows"),
    }
}

/// Leading integer of the plan description; falls back to the default quota
fn parse_quota(desc: &str) -> u64 {
    let digits: String = desc
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => n,
        _ => DEFAULT_FLOW_QUOTA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotStatus;
    use crate::providers::test_support::serve;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, MethodRouter};
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn auth(sig: Option<&str>) -> AuthConfig {
        let mut extra = HashMap::from([
            ("ctoken".to_string(), "ct-1".to_string()),
            ("session_id".to_string(), "sess-1".to_string()),
        ]);
        if let Some(sig) = sig {
            extra.insert("session_id_sig".to_string(), sig.to_string());
        }
        AuthConfig {
            kind: AuthKind::Cookie,
            key: String::new(),
            extra,
        }
    }

    fn router_with_current(current: MethodRouter) -> Router {
        Router::new()
            .route(CURRENT_PATH, current)
            .route(
                CURRENT_USAGE_PATH,
                get(|| async {
                    Json(json!({"success": true, "data": [
                        {"periodType": "hour_5", "usedRate": 0.25,
                         "cycleEndTime": "2030-01-01T05:00:00Z"},
                        {"periodType": "week", "usedRate": 0.5}
                    ]}))
                }),
            )
            .route(
                SUMMARY_PATH,
                get(|| async {
                    Json(json!({"success": true, "data": {
                        "totalCost": "12.5", "requestCounts": "340", "totalTokens": "1500000"
                    }}))
                }),
            )
    }

    fn full_router() -> Router {
        router_with_current(get(
            |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("ctoken").map(String::as_str), Some("ct-1"));
                assert_eq!(
                    headers["cookie"],
                    "ctoken=ct-1; sessionId=sess-1; sessionId.sig=sig-1"
                );
                Json(json!({"success": true, "data": {
                    "name": "Pro",
                    "desc": "2400 flows every 5 hours",
                    "startedAt": "2030-01-01T00:00:00Z",
                    "expiredAt": "2030-02-01T00:00:00Z"
                }}))
            },
        ))
    }

    #[tokio::test]
    async fn test_fetch_usage_with_all_endpoints() {
        let base = serve(full_router()).await;
        let provider = ZenMuxProvider::new().with_base_url(base);

        let snap = provider
            .fetch_usage(&FetchContext::new(), &auth(Some("sig-1")))
            .await
            .unwrap();

        assert_eq!(snap.status, SnapshotStatus::Ok);
        let plan = snap.plan.expect("plan");
        assert_eq!(plan.name, "Pro");
        assert_eq!(plan.renews_at.map(|t| t.to_rfc3339()), Some("2030-02-01T00:00:00+00:00".to_string()));

        let names: Vec<_> = snap.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["5h Flows", "7d Flows", "Total Tokens", "API Requests"]);
        assert_eq!(
            snap.metrics[0].amount,
            UsageAmount::bounded(600.0, 2400.0, 1800.0, "flows")
        );
        assert_eq!(snap.metrics[1].window.label, "7 Day");
        assert_eq!(snap.metrics[1].amount.used, Some(1200.0));
        assert_eq!(snap.metrics[2].amount.used, Some(1_500_000.0));

        let cost = snap.cost.expect("cost");
        assert_eq!(cost.total, 12.5);
        assert_eq!(cost.currency, "USD");
    }

    #[tokio::test]
    async fn test_missing_subscription_uses_default_quota() {
        let router =
            router_with_current(get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let base = serve(router).await;
        let provider = ZenMuxProvider::new().with_base_url(base);

        let snap = provider
            .fetch_usage(&FetchContext::new(), &auth(Some("sig-1")))
            .await
            .unwrap();

        assert_eq!(snap.status, SnapshotStatus::Error);
        assert_eq!(
            snap.error_message.as_deref(),
            Some("partial data: get_current: unexpected status code: 500")
        );
        assert!(snap.plan.is_none());
        assert_eq!(snap.metrics[0].amount.limit, Some(1200.0));
        assert_eq!(snap.metrics[0].amount.used, Some(300.0));
    }

    #[tokio::test]
    async fn test_all_endpoints_failing_is_error() {
        let router = Router::new().fallback(|| async { StatusCode::FORBIDDEN });
        let base = serve(router).await;
        let provider = ZenMuxProvider::new().with_base_url(base);

        let err = provider
            .fetch_usage(&FetchContext::new(), &auth(None))
            .await
            .unwrap_err();
        match err {
            FetchError::AllEndpointsFailed(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].starts_with("get_current: unauthorized"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_session_fails_before_network() {
        let provider = ZenMuxProvider::new().with_base_url("http://127.0.0.1:1");
        let mut auth = auth(None);
        auth.extra.remove("session_id");

        let err = provider
            .validate_auth(&FetchContext::new(), &auth)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), MISSING_AUTH);
    }

    #[test]
    fn test_cookie_header_without_signature() {
        let auth = auth(None);
        let session = Session::resolve(&auth).unwrap();
        assert_eq!(session.cookie_header(), "ctoken=ct-1; sessionId=sess-1");
    }

    #[test]
    fn test_parse_quota() {
        assert_eq!(parse_quota("2400 flows / 5h"), 2400);
        assert_eq!(parse_quota("  600"), 600);
        assert_eq!(parse_quota("unlimited"), DEFAULT_FLOW_QUOTA);
        assert_eq!(parse_quota("0 flows"), DEFAULT_FLOW_QUOTA);
        assert_eq!(parse_quota(""), DEFAULT_FLOW_QUOTA);
    }

    #[test]
    fn test_repeated_and_blank_periods_get_unique_ids() {
        let items: Vec<UsageItem> = serde_json::from_value(json!([
            {"periodType": "hour_5", "usedRate": 0.1},
            {"periodType": "hour_5", "usedRate": 0.9},
            {"periodType": "", "usedRate": 0.5},
            {"periodType": " ", "usedRate": 0.7},
            {"periodType": "Month Cycle", "usedRate": 0.2}
        ]))
        .unwrap();

        let metrics = flow_metrics(&items, 100.0);

        let ids: Vec<_> = metrics.iter().map(|m| m.window.id.as_str()).collect();
        assert_eq!(ids, vec!["5h", "flows", "month_cycle"]);
        assert_eq!(metrics[0].amount.used, Some(10.0));
        assert_eq!(metrics[1].name, "Flows");
        assert_eq!(metrics[2].window.label, "Month Cycle");
    }
}
