use crate::extract::normalize_id;
use crate::models::{
    AuthConfig, AuthKind, Capabilities, PlanInfo, UsageAmount, UsageMetric, UsageSnapshot,
    UsageWindow,
};
use crate::providers::{send_json, FetchContext, FetchError, FetchResult, Provider};
use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use std::collections::HashSet;

const DEFAULT_BASE_URL: &str = "https://www.minimaxi.com/v1/api/openplatform";
const SUBSCRIBE_PATH: &str = "/charge/combo/cycle_audio_resource_package";
const REMAINS_PATH: &str = "/coding_plan/remains";

const MISSING_AUTH: &str = "minimax requires cookie and group_id in auth.extra";

#[derive(Debug, Deserialize)]
struct SubscribeResponse {
    #[serde(default)]
    current_subscribe: CurrentSubscribe,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentSubscribe {
    #[serde(default)]
    current_subscribe_title: String,
}

#[derive(Debug, Deserialize)]
struct RemainsResponse {
    #[serde(default)]
    model_remains: Vec<ModelRemain>,
}

#[derive(Debug, Deserialize)]
struct ModelRemain {
    #[serde(default)]
    model_name: String,
    /// Interval end, unix milliseconds
    #[serde(default)]
    end_time: i64,
    #[serde(default)]
    current_interval_total_count: i64,
    /// Despite the name this is what is left in the interval
    #[serde(default)]
    current_interval_usage_count: i64,
}

pub struct MiniMaxProvider {
    client: reqwest::Client,
    base_url: String,
}

impl MiniMaxProvider {
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
        match (auth.extra_value("cookie"), auth.extra_value("group_id")) {
            (Some(cookie), Some(group_id)) => Ok((cookie, group_id)),
            _ => Err(FetchError::Config(MISSING_AUTH.to_string())),
        }
    }

    fn request(&self, path: &str, cookie: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .header("Cookie", cookie)
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7")
            .header("Origin", "https://platform.minimaxi.com")
            .header("Referer", "https://platform.minimaxi.com/")
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-site")
    }

    async fn get_subscribe(
        &self,
        ctx: &FetchContext,
        cookie: &str,
        group_id: &str,
    ) -> FetchResult<SubscribeResponse> {
        let request = self.request(SUBSCRIBE_PATH, cookie).query(&[
            ("biz_line", "2"),
            ("cycle_type", "3"),
            ("resource_package_type", "7"),
            ("GroupId", group_id),
        ]);
        send_json(ctx, request).await
    }

    async fn get_remains(
        &self,
        ctx: &FetchContext,
        cookie: &str,
        group_id: &str,
    ) -> FetchResult<RemainsResponse> {
        let request = self
            .request(REMAINS_PATH, cookie)
            .query(&[("GroupId", group_id)]);
        send_json(ctx, request).await
    }
}

impl Default for MiniMaxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MiniMaxProvider {
    fn id(&self) -> &'static str {
        "minimax"
    }

    fn display_name(&self) -> &'static str {
        "MiniMax"
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
        let (cookie, group_id) = Self::credentials(auth)?;
        self.get_subscribe(ctx, cookie, group_id).await.map(|_| ())
    }

    async fn fetch_usage(
        &self,
        ctx: &FetchContext,
        auth: &AuthConfig,
    ) -> FetchResult<UsageSnapshot> {
        let (cookie, group_id) = Self::credentials(auth)?;

        let (subscribe, remains) = tokio::join!(
            self.get_subscribe(ctx, cookie, group_id),
            self.get_remains(ctx, cookie, group_id)
        );

        let mut errors = Vec::new();
        let subscribe = match subscribe {
            Ok(resp) => Some(resp),
            Err(err) => {
                errors.push(format!("get_subscribe: {}", err));
                None
            }
        };
        let remains = match remains {
            Ok(resp) => Some(resp),
            Err(err) => {
                errors.push(format!("get_remains: {}", err));
                None
            }
        };
        if subscribe.is_none() && remains.is_none() {
            return Err(FetchError::AllEndpointsFailed(errors));
        }

        let mut snap = UsageSnapshot::new(self.id(), self.display_name());
        if !errors.is_empty() {
            snap.mark_partial(format!("partial data: {}", errors.join("; ")));
        }

        if let Some(subscribe) = subscribe {
            let title = subscribe.current_subscribe.current_subscribe_title.trim();
            if !title.is_empty() {
                snap.plan = Some(PlanInfo::subscription(title));
            }
        }
        if let Some(remains) = remains {
            snap.metrics = build_metrics(&remains);
        }
        Ok(snap)
    }
}

fn build_metrics(remains: &RemainsResponse) -> Vec<UsageMetric> {
    let multiple = remains.model_remains.len() > 1;
    let mut seen = HashSet::new();
    let mut metrics = Vec::new();

    for (index, remain) in remains.model_remains.iter().enumerate() {
        let model = match remain.model_name.trim() {
            "" => format!("Model {}", index + 1),
            name => name.to_string(),
        };
        let window_id = if multiple {
            format!("interval_{}", normalize_id(&model))
        } else {
            "interval".to_string()
        };
        if !seen.insert(window_id.clone()) {
            continue;
        }

        let total = remain.current_interval_total_count;
        let remaining = remain.current_interval_usage_count;
        metrics.push(UsageMetric {
            name: format!("{} Usage", model),
            window: UsageWindow::new(window_id, "Current Interval").resetting_at(
                Some(remain.end_time)
                    .filter(|ms| *ms > 0)
                    .and_then(DateTime::from_timestamp_millis),
            ),
            amount: UsageAmount::bounded(
                total.saturating_sub(remaining) as f64,
                total as f64,
                remaining as f64,
                "requests",
            ),
        });
    }
    metrics
}
