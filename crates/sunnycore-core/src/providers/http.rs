//! Extension point for a real HTTP-backed `ProviderAdapter`.
//!
//! Wiring real Gmail/Drive/Calendar OAuth, pagination, and rate-limit
//! back-off is explicitly out of scope (identity/session management and
//! the HTTP surface live outside this crate). This module documents the
//! shape a deployment fills in: a bearer-token-bearing `reqwest::Client`
//! behind the same `ProviderAdapter` trait the fixture adapter
//! implements.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{Source, Watch};

use super::{PollResult, ProviderAdapter, RawItem};

/// Bearer-token HTTP client configuration for a single provider.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub bearer_token: String,
}

/// Skeleton HTTP adapter. A deployment plugs in provider-specific
/// request/response shapes; the bounded-retry and timeout contract
/// (§4.1, §5) is enforced here once, at the boundary every concrete
/// provider shares.
pub struct HttpProviderAdapter {
    source: Source,
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProviderAdapter {
    pub fn new(source: Source, config: HttpProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(super::ADAPTER_CALL_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            source,
            config,
            client,
        }
    }

    /// Runs `f` up to `MAX_ADAPTER_ATTEMPTS` times, only retrying on
    /// errors the callback marks transient, matching §4.1's "attempts
    /// ≤ 3, total wall-time ≤ 10s" budget.
    async fn with_retry<T, F, Fut>(&self, mut f: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut last_err = None;
        for attempt in 0..super::MAX_ADAPTER_ATTEMPTS {
            match tokio::time::timeout(super::ADAPTER_CALL_TIMEOUT, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() && attempt + 1 < super::MAX_ADAPTER_ATTEMPTS => {
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    last_err = Some(CoreError::transient("provider call timed out"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::transient("provider call exhausted retries")))
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn setup_watch(
        &self,
        _owner_id: Uuid,
        _resource_id: Option<&str>,
    ) -> Result<Watch, CoreError> {
        Err(CoreError::fatal(format!(
            "{}: HTTP adapter not wired to a concrete provider client (see DESIGN.md)",
            self.config.base_url
        )))
    }

    async fn poll(
        &self,
        _owner_id: Uuid,
        _history_token: Option<&str>,
    ) -> Result<PollResult, CoreError> {
        self.with_retry(|| async {
            Err(CoreError::fatal(
                "HTTP adapter not wired to a concrete provider client (see DESIGN.md)",
            ))
        })
        .await
    }

    async fn fetch_item(&self, _owner_id: Uuid, _source_id: &str) -> Result<RawItem, CoreError> {
        Err(CoreError::fatal(
            "HTTP adapter not wired to a concrete provider client (see DESIGN.md)",
        ))
    }

    async fn stop_watch(&self, _watch: &Watch) -> Result<(), CoreError> {
        Ok(())
    }
}
