use crate::extract::{extract_plan_name, Extractor, ExtractorConfig};
use crate::models::{
    AuthConfig, AuthKind, Capabilities, CostBreakdown, DailyCost, PlanInfo, TimePeriod,
    UsageAmount, UsageMetric, UsageSnapshot, UsageWindow,
};
use crate::providers::{send, send_json, FetchContext, FetchError, FetchResult, Provider, USER_AGENT};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_WEB_BASE_URL: &str = "https://chatgpt.com";
const WHAM_USAGE_PATH: &str = "/backend-api/wham/usage";
const DEFAULT_REFERER: &str = "https://chatgpt.com/codex/settings/usage";
const COST_LOOKBACK_DAYS: i64 = 30;

const MISSING_AUTH: &str =
    "openai requires either auth.key (API key) or auth.extra.bearer_token + auth.extra.cookie";

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    #[allow(dead_code)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[allow(dead_code)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct CostsResponse {
    #[serde(default)]
    data: Vec<CostBucket>,
}

#[derive(Debug, Deserialize)]
struct CostBucket {
    #[serde(default)]
    start_time: i64,
    #[serde(default)]
    results: Vec<CostResult>,
}

#[derive(Debug, Deserialize)]
struct CostResult {
    amount: CostAmount,
}

#[derive(Debug, Deserialize)]
struct CostAmount {
    #[serde(default)]
    value: f64,
    #[serde(default)]
    currency: String,
}

/// Which credentials a subscription carries
enum Credentials<'a> {
    ApiKey {
        key: &'a str,
        organization: Option<&'a str>,
        project: Option<&'a str>,
    },
    /// ChatGPT session copied from a browser
    Web {
        bearer_token: &'a str,
        cookie: &'a str,
    },
}

impl<'a> Credentials<'a> {
    fn resolve(auth: &'a AuthConfig) -> FetchResult<Self> {
        if let (Some(bearer_token), Some(cookie)) =
            (auth.extra_value("bearer_token"), auth.extra_value("cookie"))
        {
            return Ok(Credentials::Web {
                bearer_token,
                cookie,
            });
        }

        let key = auth
            .primary_key()
            .ok_or_else(|| FetchError::Config(MISSING_AUTH.to_string()))?;
        Ok(Credentials::ApiKey {
            key,
            organization: auth.extra_value("organization"),
            project: auth.extra_value("project"),
        })
    }
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_base_url: String,
    web_base_url: String,
    extractor: Extractor,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self::with_extractor(&ExtractorConfig::default())
    }

    pub fn with_extractor(config: &ExtractorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            web_base_url: DEFAULT_WEB_BASE_URL.to_string(),
            extractor: Extractor::new(config),
        }
    }

    /// Points both the platform API and the web backend at `base_url`
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        self.api_base_url = base_url.clone();
        self.web_base_url = base_url;
        self
    }

    fn api_request(
        &self,
        path: &str,
        key: &str,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}{}", self.api_base_url, path))
            .bearer_auth(key)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT);
        if let Some(org) = organization {
            request = request.header("OpenAI-Organization", org);
        }
        if let Some(project) = project {
            request = request.header("OpenAI-Project", project);
        }
        request
    }

    fn wham_request(
        &self,
        bearer_token: &str,
        cookie: &str,
        auth: &AuthConfig,
    ) -> reqwest::RequestBuilder {
        let language = auth.extra_value("oai_language").unwrap_or("en-US");
        let mut request = self
            .client
            .get(format!("{}{}", self.web_base_url, WHAM_USAGE_PATH))
            .bearer_auth(bearer_token)
            .header("Accept", "*/*")
            .header("Cookie", cookie)
            .header(
                "Referer",
                auth.extra_value("referer").unwrap_or(DEFAULT_REFERER),
            )
            .header("Accept-Language", language)
            .header("oai-language", language)
            .header(
                "User-Agent",
                auth.extra_value("user_agent").unwrap_or(USER_AGENT),
            );

        for (extra_key, header) in [
            ("oai_device_id", "oai-device-id"),
            ("oai_client_build_number", "oai-client-build-number"),
            ("oai_client_version", "oai-client-version"),
        ] {
            if let Some(value) = auth.extra_value(extra_key) {
                request = request.header(header, value);
            }
        }
        request
    }

    async fn fetch_wham(
        &self,
        ctx: &FetchContext,
        bearer_token: &str,
        cookie: &str,
        auth: &AuthConfig,
    ) -> FetchResult<Value> {
        let body = send(ctx, self.wham_request(bearer_token, cookie, auth)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn snapshot_from_wham(&self, raw: &Value) -> UsageSnapshot {
        let mut snap = UsageSnapshot::new(self.id(), self.display_name());
        snap.metrics = self.extractor.extract_or_reachable(raw, Utc::now());
        snap.plan = extract_plan_name(raw).map(PlanInfo::subscription);
        snap
    }

    async fn fetch_costs(
        &self,
        ctx: &FetchContext,
        creds: (&str, Option<&str>, Option<&str>),
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FetchResult<CostsResponse> {
        let (key, organization, project) = creds;
        let request = self
            .api_request("/v1/organization/costs", key, organization, project)
            .query(&[
                ("start_time", start.timestamp().to_string()),
                ("end_time", end.timestamp().to_string()),
            ]);
        send_json(ctx, request).await
    }

    async fn fetch_api_usage(
        &self,
        ctx: &FetchContext,
        key: &str,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> FetchResult<UsageSnapshot> {
        let end = Utc::now();
        let start = end - ChronoDuration::days(COST_LOOKBACK_DAYS);

        let models = send_json::<ModelsResponse>(
            ctx,
            self.api_request("/v1/models", key, organization, project),
        );
        let costs = self.fetch_costs(ctx, (key, organization, project), start, end);
        let (models, costs) = tokio::join!(models, costs);

        let mut snap = UsageSnapshot::new(self.id(), self.display_name());
        match (models, costs) {
            (Err(model_err), Err(cost_err)) => Err(FetchError::AllEndpointsFailed(vec![
                format!("get_models: {}", model_err),
                format!("get_costs: {}", cost_err),
            ])),
            (_, Err(cost_err)) => {
                snap.mark_partial(format!("partial data: get_costs: {}", cost_err));
                Ok(snap)
            }
            (_, Ok(costs)) => {
                let cost = summarize_costs(&costs, start, end);
                snap.metrics = vec![UsageMetric {
                    name: "Total Spend".to_string(),
                    window: UsageWindow::new("rolling_30d", "Last 30 Days"),
                    amount: UsageAmount::used(cost.total, cost.currency.to_lowercase()),
                }];
                snap.cost = Some(cost);
                Ok(snap)
            }
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &'static str {
        "openai"
    }

    fn display_name(&self) -> &'static str {
        "OpenAI"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_usage_metrics: true,
            supports_cost_breakdown: true,
            supports_cost_by_model: false,
            auth_types: vec![AuthKind::ApiKey, AuthKind::Cookie],
        }
    }

    async fn validate_auth(&self, ctx: &FetchContext, auth: &AuthConfig) -> FetchResult<()> {
        match Credentials::resolve(auth)? {
            Credentials::Web {
                bearer_token,
                cookie,
            } => self
                .fetch_wham(ctx, bearer_token, cookie, auth)
                .await
                .map(|_| ()),
            Credentials::ApiKey {
                key,
                organization,
                project,
            } => send_json::<ModelsResponse>(
                ctx,
                self.api_request("/v1/models", key, organization, project),
            )
            .await
            .map(|_| ()),
        }
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        auth: &AuthConfig,
    ) -> FetchResult<UsageSnapshot> {
        match Credentials::resolve(auth)? {
            Credentials::Web {
                bearer_token,
                cookie,
            } => {
                let raw = self.fetch_wham(ctx, bearer_token, cookie, auth).await?;
                Ok(self.snapshot_from_wham(&raw))
            }
            Credentials::ApiKey {
                key,
                organization,
                project,
            } => self.fetch_api_usage(ctx, key, organization, project).await,
        }
    }
}

/// Sums the daily buckets. Currency defaults to USD and follows the last
/// bucket that names one.
fn summarize_costs(costs: &CostsResponse, start: DateTime<Utc>, end: DateTime<Utc>) -> CostBreakdown {
    let mut total = 0.0;
    let mut currency = "USD".to_string();
    let mut by_day = Vec::with_capacity(costs.data.len());

    for bucket in &costs.data {
        let mut day_cost = 0.0;
        for result in &bucket.results {
            day_cost += result.amount.value;
            if !result.amount.currency.trim().is_empty() {
                currency = result.amount.currency.trim().to_uppercase();
            }
        }
        total += day_cost;

        if bucket.start_time > 0 {
            if let Some(day) = DateTime::from_timestamp(bucket.start_time, 0) {
                by_day.push(DailyCost {
                    date: day.format("%Y-%m-%d").to_string(),
                    cost: day_cost,
                });
            }
        }
    }

    CostBreakdown {
        total,
        currency,
        by_model: None,
        by_day,
        period: TimePeriod { start, end },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotStatus;
    use crate::providers::test_support::serve;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn api_key_auth(key: &str) -> AuthConfig {
        AuthConfig {
            kind: AuthKind::ApiKey,
            key: key.to_string(),
            extra: HashMap::new(),
        }
    }

    fn web_auth() -> AuthConfig {
        AuthConfig {
            kind: AuthKind::Cookie,
            key: String::new(),
            extra: HashMap::from([
                ("bearer_token".to_string(), "web-token".to_string()),
                ("cookie".to_string(), "session=1".to_string()),
                ("oai_device_id".to_string(), "dev-1".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_missing_auth_fails_before_network() {
        let provider = OpenAiProvider::new().with_base_url("http://127.0.0.1:1");
        let ctx = FetchContext::new();

        let err = provider
            .fetch_usage(&ctx, &AuthConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Config(_)));
        assert_eq!(err.to_string(), MISSING_AUTH);

        // Only one of the two web fields is not enough either
        let mut half_web = AuthConfig::default();
        half_web
            .extra
            .insert("bearer_token".to_string(), "t".to_string());
        assert!(matches!(
            provider.validate_auth(&ctx, &half_web).await,
            Err(FetchError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_mode_builds_cost_breakdown() {
        let router = Router::new()
            .route(
                "/v1/models",
                get(|headers: HeaderMap| async move {
                    assert_eq!(headers["authorization"], "Bearer sk-test");
                    Json(json!({"data": [{"id": "gpt-4o"}]}))
                }),
            )
            .route(
                "/v1/organization/costs",
                get(|| async {
                    Json(json!({"data": [
                        {"start_time": 1_700_000_000, "results": [
                            {"amount": {"value": 1.25, "currency": "usd"}},
                            {"amount": {"value": 0.75, "currency": "usd"}}
                        ]},
                        {"start_time": 1_700_086_400, "results": [
                            {"amount": {"value": 3.0, "currency": "usd"}}
                        ]}
                    ]}))
                }),
            );
        let base = serve(router).await;
        let provider = OpenAiProvider::new().with_base_url(base);

        let snap = provider
            .fetch_usage(&FetchContext::new(), &api_key_auth("sk-test"))
            .await
            .unwrap();

        assert_eq!(snap.status, SnapshotStatus::Ok);
        let cost = snap.cost.expect("cost breakdown");
        assert_eq!(cost.total, 5.0);
        assert_eq!(cost.currency, "USD");
        assert_eq!(
            cost.by_day,
            vec![
                DailyCost { date: "2023-11-14".to_string(), cost: 2.0 },
                DailyCost { date: "2023-11-15".to_string(), cost: 3.0 },
            ]
        );
        assert_eq!(snap.metrics.len(), 1);
        assert_eq!(snap.metrics[0].name, "Total Spend");
        assert_eq!(snap.metrics[0].window.id, "rolling_30d");
        assert_eq!(snap.metrics[0].amount.used, Some(5.0));
        assert_eq!(snap.metrics[0].amount.unit, "usd");
    }

    #[tokio::test]
    async fn test_api_key_mode_costs_failure_is_partial() {
        let router = Router::new()
            .route("/v1/models", get(|| async { Json(json!({"data": []})) }))
            .route(
                "/v1/organization/costs",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let base = serve(router).await;
        let provider = OpenAiProvider::new().with_base_url(base);

        let snap = provider
            .fetch_usage(&FetchContext::new(), &api_key_auth("sk-test"))
            .await
            .unwrap();

        assert_eq!(snap.status, SnapshotStatus::Error);
        assert!(snap.metrics.is_empty());
        assert!(snap.cost.is_none());
        assert_eq!(
            snap.error_message.as_deref(),
            Some("partial data: get_costs: unexpected status code: 500")
        );
    }

    #[tokio::test]
    async fn test_api_key_mode_all_endpoints_failing_is_error() {
        let router = Router::new()
            .route("/v1/models", get(|| async { StatusCode::BAD_GATEWAY }))
            .route(
                "/v1/organization/costs",
                get(|| async { StatusCode::BAD_GATEWAY }),
            );
        let base = serve(router).await;
        let provider = OpenAiProvider::new().with_base_url(base);

        let err = provider
            .fetch_usage(&FetchContext::new(), &api_key_auth("sk-test"))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "all endpoints failed: get_models: unexpected status code: 502; \
             get_costs: unexpected status code: 502"
        );
    }

    #[tokio::test]
    async fn test_web_mode_mines_wham_payload() {
        let router = Router::new().route(
            WHAM_USAGE_PATH,
            get(|headers: HeaderMap| async move {
                assert_eq!(headers["authorization"], "Bearer web-token");
                assert_eq!(headers["cookie"], "session=1");
                assert_eq!(headers["oai-device-id"], "dev-1");
                assert_eq!(headers["referer"], DEFAULT_REFERER);
                Json(json!({
                    "plan_type": "pro",
                    "rate_limit": {
                        "primary_window": {"used_percent": 12, "reset_at": 1_900_000_000},
                        "secondary_window": {"used_percent": 40, "reset_after_seconds": 3600}
                    }
                }))
            }),
        );
        let base = serve(router).await;
        let provider = OpenAiProvider::new().with_base_url(base);

        let snap = provider
            .fetch_usage(&FetchContext::new(), &web_auth())
            .await
            .unwrap();

        assert_eq!(snap.plan.map(|p| p.name), Some("Pro".to_string()));
        let names: Vec<_> = snap.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["5 Hour Usage", "7 Day Usage"]);
        assert_eq!(snap.metrics[0].amount.remaining, Some(88.0));
        assert!(snap.metrics[1].window.resets_at.is_some());
    }

    #[tokio::test]
    async fn test_web_mode_without_usage_reports_reachable() {
        let router = Router::new().route(
            WHAM_USAGE_PATH,
            get(|| async { Json(json!({"account": {"email": "a@b.c"}})) }),
        );
        let base = serve(router).await;
        let provider = OpenAiProvider::new().with_base_url(base);

        let snap = provider
            .fetch_usage(&FetchContext::new(), &web_auth())
            .await
            .unwrap();

        assert_eq!(snap.metrics.len(), 1);
        assert_eq!(snap.metrics[0].name, "Usage Endpoint Reachable");
        assert!(snap.plan.is_none());
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_unauthorized() {
        let router = Router::new().route("/v1/models", get(|| async { StatusCode::UNAUTHORIZED }));
        let base = serve(router).await;
        let provider = OpenAiProvider::new().with_base_url(base);

        let result = provider
            .validate_auth(&FetchContext::new(), &api_key_auth("sk-bad"))
            .await;
        assert!(matches!(result, Err(FetchError::Unauthorized(_))));
    }
}
