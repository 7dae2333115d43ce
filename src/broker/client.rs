// =============================================================================
// Paper-broker REST client — OAuth bearer auth with serialized token refresh
// =============================================================================
//
// SECURITY: the bearer token is never logged or serialized. Refresh happens
// out-of-band through an injected `TokenRefresher`; this client only decides
// WHEN to refresh (expiry less than 60 s away) and serializes refreshes per
// user behind an async mutex so concurrent workers cannot double-refresh.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{Account, BrokerOrder, BrokerPort, BrokerPosition, OrderRequest};
use crate::error::{EngineError, Result};

/// Refresh this close to expiry.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Bearer credential with its expiry, if known.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// Token needs refreshing before the next call.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => (at - now).num_seconds() < REFRESH_MARGIN_SECS,
            None => false,
        }
    }
}

/// Out-of-band OAuth exchange, owned by the auth layer outside this crate's
/// scope.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<AuthToken>;
}

/// REST client for the paper-trading API.
pub struct BrokerClient {
    base_url: String,
    http: reqwest::Client,
    token: RwLock<AuthToken>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    /// Serializes refreshes for this user.
    refresh_gate: Mutex<()>,
}

impl BrokerClient {
    pub fn new(
        base_url: impl Into<String>,
        token: AuthToken,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            http,
            token: RwLock::new(token),
            refresher,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Current bearer token, refreshed first when it is about to expire.
    async fn bearer(&self) -> Result<String> {
        let now = Utc::now();
        if !self.token.read().is_stale(now) {
            return Ok(self.token.read().access_token.clone());
        }

        let Some(refresher) = &self.refresher else {
            // No refresher wired: use the stale token and let the broker
            // reject it if it truly expired.
            warn!("broker token near expiry and no refresher configured");
            return Ok(self.token.read().access_token.clone());
        };

        let _gate = self.refresh_gate.lock().await;
        // Another worker may have refreshed while we waited on the gate.
        if !self.token.read().is_stale(Utc::now()) {
            return Ok(self.token.read().access_token.clone());
        }

        info!("refreshing broker token");
        let fresh = refresher
            .refresh()
            .await
            .map_err(|e| EngineError::BrokerAuth(format!("token refresh failed: {e}")))?;
        *self.token.write() = fresh.clone();
        Ok(fresh.access_token)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&OrderRequest>,
    ) -> Result<serde_json::Value> {
        let token = self.bearer().await?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.http.request(method.clone(), &url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::BrokerUnreachable(format!("{method} {path}: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            debug!(%method, path, "broker call succeeded");
            return Ok(body);
        }

        let detail = body["message"].as_str().unwrap_or("no detail").to_string();
        Err(classify_http_failure(status, path, detail))
    }

    fn decode<T: serde::de::DeserializeOwned>(path: &str, value: serde_json::Value) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::BrokerUnreachable(format!("{path}: malformed response: {e}")))
    }
}

/// HTTP status -> engine error kind.
fn classify_http_failure(status: reqwest::StatusCode, path: &str, detail: String) -> EngineError {
    use reqwest::StatusCode;
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EngineError::BrokerAuth(format!("{path}: {status}: {detail}"))
        }
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            EngineError::BrokerRejected(format!("{path}: {detail}"))
        }
        s if s.is_server_error() => EngineError::BrokerUnreachable(format!("{path}: {status}")),
        _ => EngineError::BrokerRejected(format!("{path}: {status}: {detail}")),
    }
}

#[async_trait]
impl BrokerPort for BrokerClient {
    #[instrument(skip(self), name = "broker::account")]
    async fn account(&self) -> Result<Account> {
        let body = self.request(reqwest::Method::GET, "/v2/account", None).await?;
        Self::decode("/v2/account", body)
    }

    #[instrument(skip(self), name = "broker::list_positions")]
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        let body = self.request(reqwest::Method::GET, "/v2/positions", None).await?;
        Self::decode("/v2/positions", body)
    }

    #[instrument(skip(self, request), name = "broker::submit_order",
                 fields(symbol = %request.symbol, side = %request.side))]
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder> {
        let body = self
            .request(reqwest::Method::POST, "/v2/orders", Some(request))
            .await?;
        Self::decode("/v2/orders", body)
    }

    #[instrument(skip(self), name = "broker::get_order")]
    async fn get_order(&self, id: &str) -> Result<BrokerOrder> {
        let path = format!("/v2/orders/{id}");
        let body = self.request(reqwest::Method::GET, &path, None).await?;
        Self::decode(&path, body)
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, id: &str) -> Result<()> {
        let path = format!("/v2/orders/{id}");
        self.request(reqwest::Method::DELETE, &path, None).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::cancel_all_orders")]
    async fn cancel_all_orders(&self) -> Result<()> {
        self.request(reqwest::Method::DELETE, "/v2/orders", None).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::close_position")]
    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder> {
        let path = format!("/v2/positions/{symbol}");
        let body = self.request(reqwest::Method::DELETE, &path, None).await?;
        Self::decode(&path, body)
    }

    /// Close every open position with market orders. Implemented as one
    /// close per position so each failure stays attributable to its symbol.
    #[instrument(skip(self), name = "broker::close_all_positions")]
    async fn close_all_positions(&self) -> Result<Vec<BrokerOrder>> {
        let positions = self.list_positions().await?;
        let mut orders = Vec::with_capacity(positions.len());
        for position in positions {
            match self.close_position(&position.symbol).await {
                Ok(order) => orders.push(order),
                Err(e) => warn!(symbol = %position.symbol, error = %e, "close failed"),
            }
        }
        Ok(orders)
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}
