// Registry client
// The IS-04 Registration API requests issued by the node behaviour

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::model::api_version::ApiVersion;
use crate::model::resource::ResourceType;
use crate::{NmosError, Result};

/// Outcome of POSTing a resource to `/resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// 201, the registry created the resource
    Created,
    /// 200, the registry already knew the resource and updated it
    AlreadyRegistered,
}

/// Outcome of POSTing `/health/nodes/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    /// 404, the node was garbage-collected and must re-register everything
    NotFound,
}

/// HTTP client bound to one registry's Registration API.
pub struct RegistryClient {
    http: reqwest::Client,
    base: String,
    heartbeat_timeout: Duration,
}

impl RegistryClient {
    /// `base_url` is the registry's API root, e.g. "http://registry:8080".
    pub fn new(
        base_url: &str,
        version: ApiVersion,
        request_timeout: Duration,
        heartbeat_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NmosError::Internal(e.to_string()))?;
        Ok(RegistryClient {
            http,
            base: format!(
                "{}/x-nmos/registration/{}",
                base_url.trim_end_matches('/'),
                version
            ),
            heartbeat_timeout,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// POST `/resource` with `{type, data}`.
    pub async fn register_resource(
        &self,
        resource_type: ResourceType,
        data: &serde_json::Value,
        token: Option<&str>,
    ) -> Result<RegisterOutcome> {
        let url = format!("{}/resource", self.base);
        debug!(%url, resource_type = %resource_type, "registering resource");

        let mut request = self.http.post(&url).json(&json!({
            "type": resource_type.name(),
            "data": data,
        }));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status().as_u16() {
            201 => Ok(RegisterOutcome::Created),
            200 => Ok(RegisterOutcome::AlreadyRegistered),
            status if (400..500).contains(&status) => Err(NmosError::PeerProtocol {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
            status => Err(NmosError::TransientNetwork(format!(
                "registry returned {}",
                status
            ))),
        }
    }

    /// DELETE `/resource/{type}s/{id}`.
    pub async fn delete_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/resource/{}/{}", self.base, resource_type.plural(), id);
        debug!(%url, "deleting resource");

        let mut request = self.http.delete(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status().as_u16() {
            204 => Ok(()),
            status if (400..500).contains(&status) => Err(NmosError::PeerProtocol {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
            status => Err(NmosError::TransientNetwork(format!(
                "registry returned {}",
                status
            ))),
        }
    }

    /// POST `/health/nodes/{id}`.
    pub async fn heartbeat(&self, node_id: &str, token: Option<&str>) -> Result<HeartbeatOutcome> {
        let url = format!("{}/health/nodes/{}", self.base, node_id);

        let mut request = self.http.post(&url).timeout(self.heartbeat_timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status().as_u16() {
            200 => Ok(HeartbeatOutcome::Ok),
            404 => Ok(HeartbeatOutcome::NotFound),
            status if (400..500).contains(&status) => Err(NmosError::PeerProtocol {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
            status => Err(NmosError::TransientNetwork(format!(
                "registry returned {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_composition() {
        let client = RegistryClient::new(
            "http://registry.example.com:8080/",
            ApiVersion::new(1, 3),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.base(),
            "http://registry.example.com:8080/x-nmos/registration/v1.3"
        );
    }
}
