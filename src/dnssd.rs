// DNS-SD seams
// Advertiser and discovery interfaces injected into the behaviour tasks

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::Result;

// Service types browsed and advertised by an NMOS node
pub const NODE_SERVICE: &str = "_nmos-node._tcp";
pub const REGISTRATION_SERVICE: &str = "_nmos-registration._tcp";
pub const REGISTER_SERVICE: &str = "_nmos-register._tcp";
pub const QUERY_SERVICE: &str = "_nmos-query._tcp";
pub const AUTHORIZATION_SERVICE: &str = "_nmos-auth._tcp";
pub const SYSTEM_SERVICE: &str = "_nmos-system._tcp";

pub type TxtRecords = HashMap<String, String>;

/// One browse result, resolved to a host and port plus its TXT records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub txt: TxtRecords,
}

impl ResolvedService {
    /// DNS-SD priority from the `pri` TXT record; services without one sort
    /// last.
    pub fn priority(&self) -> u32 {
        self.txt
            .get("pri")
            .and_then(|pri| pri.parse().ok())
            .unwrap_or(u32::MAX)
    }

    /// API versions from the `api_ver` TXT record, e.g. "v1.0,v1.1,v1.2".
    pub fn api_versions(&self) -> Vec<crate::model::ApiVersion> {
        self.txt
            .get("api_ver")
            .map(|versions| versions.split(',').filter_map(|v| v.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// The advertised protocol, defaulting to "http".
    pub fn api_proto(&self) -> &str {
        self.txt.get("api_proto").map(String::as_str).unwrap_or("http")
    }

    /// Base URL of the advertised API, e.g. "http://registry.local:8080".
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.api_proto(), self.host, self.port)
    }
}

/// Browses for services of a given type.
///
/// The actual mDNS/unicast DNS-SD implementation is supplied by the
/// integrator; one concrete type may implement both this and
/// [`ServiceAdvertiser`].
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn browse(&self, service_type: &str) -> Result<Vec<ResolvedService>>;
}

/// Advertises this node's own services.
#[async_trait]
pub trait ServiceAdvertiser: Send + Sync {
    async fn register(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt: TxtRecords,
    ) -> Result<()>;

    /// Replace the TXT records of an existing advertisement.
    async fn update_record(&self, name: &str, service_type: &str, txt: TxtRecords) -> Result<()>;

    async fn deregister(&self, name: &str, service_type: &str) -> Result<()>;
}

/// An in-process DNS-SD implementation.
///
/// Registered services are immediately visible to `browse`, which makes this
/// suitable for tests and for single-host deployments without an mDNS
/// responder.
#[derive(Default)]
pub struct MemoryDnsSd {
    services: RwLock<HashMap<(String, String), ResolvedService>>,
}

impl MemoryDnsSd {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryDnsSd::default())
    }
}

#[async_trait]
impl ServiceDiscovery for MemoryDnsSd {
    async fn browse(&self, service_type: &str) -> Result<Vec<ResolvedService>> {
        let services = self.services.read().await;
        let mut found: Vec<ResolvedService> = services
            .iter()
            .filter(|((_, advertised_type), _)| advertised_type == service_type)
            .map(|(_, service)| service.clone())
            .collect();
        found.sort_by_key(|service| service.priority());
        Ok(found)
    }
}

#[async_trait]
impl ServiceAdvertiser for MemoryDnsSd {
    async fn register(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt: TxtRecords,
    ) -> Result<()> {
        let mut services = self.services.write().await;
        services.insert(
            (name.to_string(), service_type.to_string()),
            ResolvedService {
                name: name.to_string(),
                host: "localhost".to_string(),
                port,
                txt,
            },
        );
        Ok(())
    }

    async fn update_record(&self, name: &str, service_type: &str, txt: TxtRecords) -> Result<()> {
        let mut services = self.services.write().await;
        if let Some(service) = services.get_mut(&(name.to_string(), service_type.to_string())) {
            service.txt = txt;
        }
        Ok(())
    }

    async fn deregister(&self, name: &str, service_type: &str) -> Result<()> {
        let mut services = self.services.write().await;
        services.remove(&(name.to_string(), service_type.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_browse_deregister() {
        let dnssd = MemoryDnsSd::new();
        let mut txt = TxtRecords::new();
        txt.insert("pri".to_string(), "100".to_string());
        txt.insert("api_ver".to_string(), "v1.2,v1.3".to_string());

        dnssd
            .register("registry", REGISTRATION_SERVICE, 8080, txt)
            .await
            .unwrap();

        let found = dnssd.browse(REGISTRATION_SERVICE).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].priority(), 100);
        assert_eq!(
            found[0].api_versions(),
            vec![crate::model::ApiVersion::new(1, 2), crate::model::ApiVersion::new(1, 3)]
        );
        assert_eq!(found[0].base_url(), "http://localhost:8080");

        assert!(dnssd.browse(AUTHORIZATION_SERVICE).await.unwrap().is_empty());

        dnssd.deregister("registry", REGISTRATION_SERVICE).await.unwrap();
        assert!(dnssd.browse(REGISTRATION_SERVICE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_browse_orders_by_priority() {
        let dnssd = MemoryDnsSd::new();
        for (name, pri) in [("backup", "200"), ("primary", "10")] {
            let mut txt = TxtRecords::new();
            txt.insert("pri".to_string(), pri.to_string());
            dnssd
                .register(name, REGISTRATION_SERVICE, 8080, txt)
                .await
                .unwrap();
        }

        let found = dnssd.browse(REGISTRATION_SERVICE).await.unwrap();
        assert_eq!(found[0].name, "primary");
        assert_eq!(found[1].name, "backup");
    }
}
