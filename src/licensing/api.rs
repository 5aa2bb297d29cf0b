use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::licensing::audit::{AuditEntry, AuditKind};
use crate::licensing::config::{EntitlementConfig, Endpoints};
use crate::licensing::types::{HardwareIdentity, LicenseError};

// ============================================================================
// Activate / Validate
// ============================================================================

/// Body of both the activate and validate calls
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequest {
    pub key: String,
    pub identity: HardwareIdentity,
    pub device_model: String,
}

/// Response from license activation
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ActivateResponse {
    #[serde(default)]
    pub token: Option<serde_json::Value>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ActivateResponse {
    pub fn error_message(&self) -> Option<String> {
        self.error.clone().or_else(|| self.message.clone())
    }

    /// Token and signature, when the authority sent both
    pub fn signed_token(&self) -> Option<(serde_json::Value, String)> {
        match (&self.token, &self.signature) {
            (Some(token), Some(signature)) if !token.is_null() && !signature.trim().is_empty() => {
                Some((token.clone(), signature.clone()))
            }
            _ => None,
        }
    }
}

/// Response from license validation
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ValidateResponse {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub token: Option<serde_json::Value>,
    #[serde(default)]
    pub signature: Option<String>,
}

impl ValidateResponse {
    pub fn signed_token(&self) -> Option<(serde_json::Value, String)> {
        match (&self.token, &self.signature) {
            (Some(token), Some(signature)) if !token.is_null() && !signature.trim().is_empty() => {
                Some((token.clone(), signature.clone()))
            }
            _ => None,
        }
    }

    /// Short reason for a denial, for logs and the revoke transition
    pub fn denial_reason(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.status.clone())
            .unwrap_or_else(|| "license no longer allowed".to_string())
    }
}

// ============================================================================
// Device inventory
// ============================================================================

/// Inventory row upserted by the heartbeat
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHeartbeat {
    pub identity: HardwareIdentity,
    pub device_model: String,
    pub metadata: serde_json::Value,
}

// ============================================================================
// Authority
// ============================================================================

/// Remote license authority
#[async_trait]
pub trait LicenseAuthority: Send + Sync {
    async fn activate(&self, request: &LicenseRequest) -> Result<ActivateResponse, LicenseError>;

    async fn validate(&self, request: &LicenseRequest) -> Result<ValidateResponse, LicenseError>;

    async fn upsert_device(&self, heartbeat: &DeviceHeartbeat) -> Result<(), LicenseError>;

    async fn record_audit(&self, entry: &AuditEntry) -> Result<(), LicenseError>;
}

/// HTTP client for license server API
pub struct HttpAuthority {
    client: reqwest::Client,
    endpoints: Endpoints,
    api_key: Option<String>,
}

impl HttpAuthority {
    pub fn new(config: &EntitlementConfig) -> Result<Self, LicenseError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("vendo-entitlement/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LicenseError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: config.endpoints(),
            api_key: config.api_key.clone(),
        })
    }

    pub(crate) fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key).header("apikey", key),
            None => builder,
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: String,
        body: &T,
    ) -> Result<reqwest::Response, LicenseError> {
        let response = self
            .authorize(self.client.post(url))
            .json(body)
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LicenseError::RateLimited);
        }

        Ok(response)
    }
}

#[async_trait]
impl LicenseAuthority for HttpAuthority {
    async fn activate(&self, request: &LicenseRequest) -> Result<ActivateResponse, LicenseError> {
        let response = self.post_json(self.endpoints.activate(), request).await?;
        let status = response.status();

        // Parse response body regardless of status code (server returns JSON errors)
        let body: ActivateResponse = response.json().await.unwrap_or_default();

        if !status.is_success() {
            let message = body
                .error_message()
                .unwrap_or_else(|| format!("server returned {}", status));
            return Err(LicenseError::ActivationRejected(message));
        }

        Ok(body)
    }

    async fn validate(&self, request: &LicenseRequest) -> Result<ValidateResponse, LicenseError> {
        let response = self.post_json(self.endpoints.validate(), request).await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(LicenseError::Network(format!("server returned {}", status)));
        }

        // Denials arrive as 4xx with a JSON body that still carries `allowed`
        response
            .json()
            .await
            .map_err(|e| LicenseError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    async fn upsert_device(&self, heartbeat: &DeviceHeartbeat) -> Result<(), LicenseError> {
        let response = self
            .authorize(self.client.post(self.endpoints.devices()))
            .header("Prefer", "resolution=merge-duplicates")
            .json(heartbeat)
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LicenseError::Network(format!(
                "device upsert returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<(), LicenseError> {
        let url = match entry.kind {
            AuditKind::Activation => self.endpoints.activation_audit(),
            AuditKind::ValidationDenial => self.endpoints.validation_audit(),
        };
        let response = self.post_json(url, entry).await?;

        if !response.status().is_success() {
            return Err(LicenseError::Network(format!(
                "audit insert returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = LicenseRequest {
            key: "K".into(),
            identity: HardwareIdentity::new("SN-1"),
            device_model: "Orange Pi One".into(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "key": "K", "identity": "SN-1", "deviceModel": "Orange Pi One" })
        );
    }

    #[test]
    fn test_activate_response_requires_both_parts() {
        let only_token: ActivateResponse =
            serde_json::from_value(json!({ "token": { "ownerId": "x" } })).unwrap();
        assert!(only_token.signed_token().is_none());

        let failure: ActivateResponse =
            serde_json::from_value(json!({ "message": "key already bound" })).unwrap();
        assert_eq!(failure.error_message().as_deref(), Some("key already bound"));

        let ok: ActivateResponse =
            serde_json::from_value(json!({ "token": { "ownerId": "x" }, "signature": "c2ln" })).unwrap();
        assert!(ok.signed_token().is_some());
    }

    #[test]
    fn test_validate_denial_reason() {
        let denied: ValidateResponse =
            serde_json::from_value(json!({ "allowed": false, "status": "revoked" })).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.denial_reason(), "revoked");

        let bare: ValidateResponse = serde_json::from_value(json!({})).unwrap();
        assert!(!bare.allowed);
        assert_eq!(bare.denial_reason(), "license no longer allowed");
    }
}
