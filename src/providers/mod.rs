pub mod kimi;
pub mod minimax;
pub mod mock;
pub mod openai;
pub mod zenmux;

use crate::extract::ExtractorConfig;
use crate::models::{AuthConfig, Capabilities, UsageSnapshot};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) const USER_AGENT: &str = concat!("sub-mon/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    /// Required auth fields are missing; raised before any network call
    #[error("{0}")]
    Config(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {status}")]
    Status { status: u16, body: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("all endpoints failed: {}", .0.join("; "))]
    AllEndpointsFailed(Vec<String>),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Deadline and cancellation signal shared by every worker of one
/// aggregation cycle.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl FetchContext {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Child context that is cancelled together with `token`
    pub fn with_cancel(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Reason the context is finished, if it is
    pub fn err(&self) -> Option<FetchError> {
        if self.cancel.is_cancelled() {
            return Some(FetchError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(FetchError::DeadlineExceeded),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Time left before the deadline, capped at the default request timeout
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(REQUEST_TIMEOUT),
            None => REQUEST_TIMEOUT,
        }
    }

    /// Runs `fut` until it completes, the deadline passes or the context is
    /// cancelled, whichever comes first.
    pub async fn run<T, F>(&self, fut: F) -> FetchResult<T>
    where
        F: Future<Output = FetchResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let sleep = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            _ = sleep => Err(FetchError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Contract every vendor integration implements. The aggregation engine
/// only ever talks to vendors through this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Checks the credentials, hitting the vendor if the fields look complete
    async fn validate_auth(&self, ctx: &FetchContext, auth: &AuthConfig) -> FetchResult<()>;

    /// Produces one snapshot. Must finish once `ctx` is done.
    async fn fetch_usage(&self, ctx: &FetchContext, auth: &AuthConfig)
        -> FetchResult<UsageSnapshot>;
}

/// Every built-in vendor adapter. `extractor` tunes the adapters that mine
/// schema-less payloads.
pub fn builtin(extractor: &ExtractorConfig) -> Vec<Box<dyn Provider>> {
    vec![
        Box::new(openai::OpenAiProvider::with_extractor(extractor)),
        Box::new(kimi::KimiProvider::new()),
        Box::new(minimax::MiniMaxProvider::new()),
        Box::new(zenmux::ZenMuxProvider::new()),
    ]
}

/// Sends a prepared request under `ctx` and returns the body of a 2xx reply.
pub(crate) async fn send(
    ctx: &FetchContext,
    request: reqwest::RequestBuilder,
) -> FetchResult<String> {
    ctx.run(async {
        let response = request.timeout(ctx.remaining()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        tracing::debug!(status = status.as_u16(), bytes = body.len(), "upstream response");

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(FetchError::Unauthorized(format!(
                "upstream rejected credentials ({})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    })
    .await
}

/// `send` followed by JSON decoding into `T`
pub(crate) async fn send_json<T: serde::de::DeserializeOwned>(
    ctx: &FetchContext,
    request: reqwest::RequestBuilder,
) -> FetchResult<T> {
    let body = send(ctx, request).await?;
    Ok(serde_json::from_str(&body)?)
}
