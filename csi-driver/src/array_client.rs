//! REST client for the storage array management API.
//!
//! The array is a closed appliance managed over an authenticated JSON REST
//! API. One `reqwest::Client` (the transport) is built at startup and shared
//! across requests; base URL and basic auth are applied per call from the
//! credentials carried in each CSI request's secrets.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error};

/// Secret keys carrying the array endpoint and login.
const SECRET_API_HOST: &str = "hostname";
const SECRET_USERNAME: &str = "username";
const SECRET_PASSWORD: &str = "password";

#[derive(Error, Debug)]
pub enum ArrayApiError {
    #[error("missing array credential '{0}' in request secrets")]
    MissingCredential(&'static str),

    #[error("failed to communicate with array API: {0}")]
    ServerCommunication(String),

    #[error("array API request failed: {0}")]
    Api(String),

    #[error("invalid array API response: {0}")]
    InvalidResponse(String),
}

/// Per-request array endpoint and login, parsed from CSI secrets.
#[derive(Debug, Clone)]
pub struct ArrayCredentials {
    pub api_host: String,
    pub username: String,
    pub password: String,
}

impl ArrayCredentials {
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Result<Self, ArrayApiError> {
        let get = |key: &'static str| {
            secrets
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or(ArrayApiError::MissingCredential(key))
        };
        Ok(Self {
            api_host: get(SECRET_API_HOST)?,
            username: get(SECRET_USERNAME)?,
            password: get(SECRET_PASSWORD)?,
        })
    }
}

/// The array wraps every response in this envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// Client for the array management API.
#[derive(Debug)]
pub struct ArrayClient {
    client: reqwest::Client,
}

impl Default for ArrayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build REST client");
        Self { client }
    }

    /// Register an initiator port on the array host object so the array will
    /// expose mapped LUNs to it.
    pub async fn add_port_for_host(
        &self,
        creds: &ArrayCredentials,
        host_id: i64,
        port_type: &str,
        port_address: &str,
    ) -> Result<(), ArrayApiError> {
        debug!(host_id, port_type, port_address, "adding port for host");
        let body = json!({ "type": port_type, "address": port_address });
        self.post(creds, &format!("api/rest/hosts/{host_id}/ports"), &body).await?;
        Ok(())
    }

    /// Push a CHAP security posture onto the array host object. `chap_creds`
    /// carries `security_method` plus the inbound/outbound username and
    /// secret keys that method requires.
    pub async fn add_chap_security_for_host(
        &self,
        creds: &ArrayCredentials,
        host_id: i64,
        chap_creds: &HashMap<String, String>,
    ) -> Result<(), ArrayApiError> {
        debug!(host_id, method = %chap_creds.get("security_method").map(String::as_str).unwrap_or(""), "updating host security");
        let body = serde_json::to_value(chap_creds)
            .map_err(|e| ArrayApiError::InvalidResponse(e.to_string()))?;
        self.put(creds, &format!("api/rest/hosts/{host_id}"), &body).await?;
        Ok(())
    }

    async fn post(
        &self,
        creds: &ArrayCredentials,
        path: &str,
        body: &Value,
    ) -> Result<Value, ArrayApiError> {
        let request = self
            .client
            .post(Self::url(creds, path))
            .basic_auth(&creds.username, Some(&creds.password))
            .json(body);
        Self::check_response(path, request.send().await).await
    }

    async fn put(
        &self,
        creds: &ArrayCredentials,
        path: &str,
        body: &Value,
    ) -> Result<Value, ArrayApiError> {
        let request = self
            .client
            .put(Self::url(creds, path))
            .basic_auth(&creds.username, Some(&creds.password))
            .json(body);
        Self::check_response(path, request.send().await).await
    }

    fn url(creds: &ArrayCredentials, path: &str) -> String {
        let host = creds.api_host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/{path}")
        } else {
            format!("https://{host}/{path}")
        }
    }

    async fn check_response(
        path: &str,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<Value, ArrayApiError> {
        let response = response.map_err(|e| {
            error!(path, error = %e, "array API request failed");
            ArrayApiError::ServerCommunication(format!("{path}: {e}"))
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ArrayApiError::InvalidResponse(format!("{path}: {e}")))?;

        let envelope: ApiResponse = serde_json::from_slice(&body).map_err(|e| {
            if status.is_success() {
                ArrayApiError::InvalidResponse(format!("{path}: {e}"))
            } else {
                ArrayApiError::Api(format!("{path}: HTTP {status}"))
            }
        })?;

        if !envelope.error.is_null() {
            return Err(ArrayApiError::Api(format!("{path}: {}", envelope.error)));
        }
        if !status.is_success() {
            return Err(ArrayApiError::Api(format!("{path}: HTTP {status}")));
        }
        Ok(envelope.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_credentials_from_secrets() {
        let creds = ArrayCredentials::from_secrets(&secrets(&[
            ("hostname", "https://array.example.com"),
            ("username", "admin"),
            ("password", "secret"),
        ]))
        .unwrap();
        assert_eq!(creds.api_host, "https://array.example.com");
        assert_eq!(creds.username, "admin");
    }

    #[test]
    fn test_credentials_missing_key() {
        let err = ArrayCredentials::from_secrets(&secrets(&[
            ("hostname", "array.example.com"),
            ("username", "admin"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_credentials_empty_value_is_missing() {
        let err = ArrayCredentials::from_secrets(&secrets(&[
            ("hostname", ""),
            ("username", "admin"),
            ("password", "secret"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("hostname"));
    }

    #[test]
    fn test_url_building() {
        let creds = ArrayCredentials {
            api_host: "array.example.com".into(),
            username: "u".into(),
            password: "p".into(),
        };
        assert_eq!(
            ArrayClient::url(&creds, "api/rest/hosts/12/ports"),
            "https://array.example.com/api/rest/hosts/12/ports"
        );

        let with_scheme = ArrayCredentials {
            api_host: "http://array.example.com/".into(),
            username: "u".into(),
            password: "p".into(),
        };
        assert_eq!(
            ArrayClient::url(&with_scheme, "api/rest/hosts/12"),
            "http://array.example.com/api/rest/hosts/12"
        );
    }
}
