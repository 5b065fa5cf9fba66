//! Activation bridge client
//!
//! The bridge watches the settlement chain and trades a confirmed burn for an
//! activation code redeemable on the native chain. Requests are keyed by the
//! burn tx hash, so presenting the same proof twice returns the same code.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use qnet_network::NodeType;

use crate::retry::RetryPolicy;

pub const BRIDGE_ACTIVATION_PATH: &str = "/api/v1/bridge/activation";
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Transport failure, timeout or server error. Worth retrying.
    #[error("Bridge unavailable: {0}")]
    Unavailable(String),

    /// The bridge refused the proof. The reason is the bridge's own.
    #[error("{0}")]
    Rejected(String),

    #[error("Invalid bridge response: {0}")]
    InvalidResponse(String),
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub burn_tx_hash: String,
    pub node_type: NodeType,
    pub native_owner_address: String,
    pub settlement_source_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub activation_code: String,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// A service that exchanges burn proofs for activation codes.
#[async_trait]
pub trait ActivationBridge: Send + Sync {
    async fn request_activation(&self, request: &BridgeRequest)
        -> Result<BridgeResponse, BridgeError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// JSON-over-HTTP bridge.
#[derive(Clone)]
pub struct HttpBridge {
    base: String,
    client: Client,
}

impl HttpBridge {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Unavailable(format!("client setup: {}", e)))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl ActivationBridge for HttpBridge {
    async fn request_activation(
        &self,
        request: &BridgeRequest,
    ) -> Result<BridgeResponse, BridgeError> {
        let url = format!("{}{}", self.base, BRIDGE_ACTIVATION_PATH);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| BridgeError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let t = resp.text().await.unwrap_or_default();
            return Err(BridgeError::Unavailable(format!("{} {}", status, t.trim())));
        }
        if status.is_client_error() {
            let t = resp.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<ErrorBody>(&t) {
                Ok(body) => body.error,
                Err(_) if !t.trim().is_empty() => t.trim().to_string(),
                Err(_) => status.to_string(),
            };
            return Err(BridgeError::Rejected(reason));
        }
        if !status.is_success() {
            return Err(BridgeError::InvalidResponse(format!("unexpected status {}", status)));
        }

        let body = resp
            .json::<BridgeResponse>()
            .await
            .map_err(|e| BridgeError::InvalidResponse(e.to_string()))?;
        if body.activation_code.trim().is_empty() {
            return Err(BridgeError::InvalidResponse("empty activation code".into()));
        }
        Ok(body)
    }
}

/// Retrying, idempotent front for an [`ActivationBridge`].
pub struct ActivationBridgeClient {
    bridge: Arc<dyn ActivationBridge>,
    retry: RetryPolicy,
    issued: Mutex<HashMap<String, BridgeResponse>>,
}

impl ActivationBridgeClient {
    pub fn new(bridge: Arc<dyn ActivationBridge>, retry: RetryPolicy) -> Self {
        Self {
            bridge,
            retry,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Exchange a burn proof for an activation code.
    ///
    /// A code already issued for `burn_tx_hash` in this process is returned
    /// without contacting the bridge.
    pub async fn activation_code(&self, request: &BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        if let Some(existing) = self.issued(&request.burn_tx_hash) {
            return Ok(existing);
        }

        let bridge = &self.bridge;
        let response = self
            .retry
            .run(
                "bridge activation request",
                move || bridge.request_activation(request),
                BridgeError::is_retryable,
            )
            .await?;

        log::info!(
            "bridge issued activation code for burn {}",
            &request.burn_tx_hash
        );
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        Ok(issued
            .entry(request.burn_tx_hash.clone())
            .or_insert(response)
            .clone())
    }

    fn issued(&self, burn_tx_hash: &str) -> Option<BridgeResponse> {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(burn_tx_hash)
            .cloned()
    }
}
