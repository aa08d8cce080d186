//! Gateway REST client
//!
//! Logs in for tokens and provisions the gateway-side connection records
//! tunnels attach to.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use dg_core::config::GatewayConfig;
use dg_core::traits::{ConnectionDescriptor, TokenEndpoint};
use dg_core::{AuthToken, GatewayError};

/// Successful reply of the token endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    auth_token: String,
    username: String,
    data_source: String,
    #[serde(default)]
    available_data_sources: Vec<String>,
}

/// Reply of the connection provisioning endpoint
#[derive(Debug, Deserialize)]
struct ProvisionedConnection {
    identifier: String,
}

/// REST client for the gateway web application
pub struct GatewayRestClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayRestClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), GatewayError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            401 | 403 => Err(GatewayError::Rejected(
                status.canonical_reason().unwrap_or("Unauthorized").into(),
            )),
            code => Err(GatewayError::Http { status: code }),
        }
    }

    /// Create a gateway connection record for `descriptor`, returning its identifier
    pub async fn provision_connection(
        &self,
        token: &AuthToken,
        descriptor: &ConnectionDescriptor,
    ) -> Result<String, GatewayError> {
        let url = self.config.connections_url(&token.data_source);
        let body = connection_body(descriptor);

        let resp = self
            .http
            .post(&url)
            .query(&[("token", token.value.expose())])
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        Self::check_status(&resp)?;

        let created: ProvisionedConnection = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("invalid provisioning reply: {}", e)))?;
        tracing::debug!(
            "Provisioned gateway connection {} for {}",
            created.identifier,
            descriptor.machine_id
        );
        Ok(created.identifier)
    }

    /// Delete a connection record created by [`provision_connection`](Self::provision_connection)
    pub async fn delete_connection(
        &self,
        token: &AuthToken,
        identifier: &str,
    ) -> Result<(), GatewayError> {
        let url = self.config.connection_url(&token.data_source, identifier);
        let resp = self
            .http
            .delete(&url)
            .query(&[("token", token.value.expose())])
            .send()
            .await
            .map_err(request_error)?;
        Self::check_status(&resp)?;
        tracing::debug!("Deleted gateway connection {}", identifier);
        Ok(())
    }
}

#[async_trait]
impl TokenEndpoint for GatewayRestClient {
    async fn request_token(&self) -> Result<AuthToken, GatewayError> {
        let form = [
            ("username", self.config.username.as_str()),
            ("password", self.config.password.expose()),
        ];
        let resp = self
            .http
            .post(self.config.tokens_url())
            .form(&form)
            .send()
            .await
            .map_err(request_error)?;
        Self::check_status(&resp)?;

        let reply: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("invalid token reply: {}", e)))?;
        if !reply.available_data_sources.is_empty()
            && !reply
                .available_data_sources
                .contains(&self.config.data_source)
        {
            tracing::warn!(
                "Configured data source {} not offered by gateway (available: {:?})",
                self.config.data_source,
                reply.available_data_sources
            );
        }

        Ok(AuthToken::new(
            reply.auth_token,
            reply.username,
            reply.data_source,
            self.config.token_ttl,
        ))
    }
}

fn request_error(e: reqwest::Error) -> GatewayError {
    if e.is_connect() || e.is_timeout() {
        GatewayError::Unreachable(e.without_url().to_string())
    } else {
        GatewayError::Transport(e.without_url().to_string())
    }
}

/// JSON body describing an RDP connection record
fn connection_body(descriptor: &ConnectionDescriptor) -> serde_json::Value {
    let creds = &descriptor.credentials;
    let mut parameters = json!({
        "hostname": descriptor.host,
        "port": descriptor.port.to_string(),
        "username": creds.username,
        "password": creds.password.expose(),
        "security": "any",
        "ignore-cert": "true",
    });
    if let (Some(domain), Some(map)) = (&creds.domain, parameters.as_object_mut()) {
        map.insert("domain".to_string(), json!(domain));
    }

    json!({
        "parentIdentifier": "ROOT",
        "name": format!("{} ({})", descriptor.name, descriptor.machine_id),
        "protocol": descriptor.protocol,
        "parameters": parameters,
        "attributes": {},
    })
}
