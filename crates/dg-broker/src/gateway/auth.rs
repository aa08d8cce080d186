//! Shared gateway token cache

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use dg_core::config::BackoffConfig;
use dg_core::traits::TokenEndpoint;
use dg_core::{AuthToken, GatewayError};

use super::backoff::RetryBackoff;

/// Caches one gateway token for all sessions
///
/// Refreshes are single-flight: callers arriving while a refresh is in
/// progress wait for it and share its result. Transient failures are
/// retried with bounded backoff; rejected credentials are not.
pub struct GatewayAuthClient {
    endpoint: Arc<dyn TokenEndpoint>,
    backoff: BackoffConfig,
    max_attempts: u32,
    refresh_skew: Duration,
    cached: Mutex<Option<AuthToken>>,
}

impl GatewayAuthClient {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        backoff: BackoffConfig,
        max_attempts: u32,
        refresh_skew: Duration,
    ) -> Self {
        Self {
            endpoint,
            backoff,
            max_attempts,
            refresh_skew,
            cached: Mutex::new(None),
        }
    }

    /// A token valid for at least the refresh skew
    pub async fn token(&self) -> Result<AuthToken, GatewayError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.expires_within(self.refresh_skew) {
                return Ok(token.clone());
            }
            tracing::debug!("Gateway token for {} is due for renewal", token.username);
        }

        let token = self.login().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Forget `rejected` so the next [`token`](Self::token) call logs in again.
    ///
    /// A newer token cached by another session is kept.
    pub async fn invalidate(&self, rejected: &AuthToken) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|t| t.value == rejected.value) {
            tracing::info!("Discarding gateway token rejected by the gateway");
            *cached = None;
        }
    }

    async fn login(&self) -> Result<AuthToken, GatewayError> {
        let mut backoff = RetryBackoff::from_config(&self.backoff, self.max_attempts);
        loop {
            match self.endpoint.request_token().await {
                Ok(token) => {
                    tracing::info!(
                        "Obtained gateway token for {} (data source {})",
                        token.username,
                        token.data_source
                    );
                    return Ok(token);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!("Gateway login refused: {}", e);
                    return Err(e);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            "Gateway login attempt {} failed: {}. Retrying in {:?}",
                            backoff.attempts_made() - 1,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            "Gateway login failed after {} attempts: {}",
                            backoff.attempts_made(),
                            e
                        );
                        return Err(e);
                    }
                },
            }
        }
    }
}
