//! Device records and the collaborator contracts the redirection core
//! consumes.
//!
//! The core never owns device storage: it asks a [`DeviceRepo`] for the
//! record and a [`Cryptor`] for the stored secret. Persistent storage is a
//! deployment concern — this crate ships an in-memory repository seeded from
//! `[[devices]]` config entries, which is all a trusted-LAN console needs.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::RedirectError;

/// One managed AMT device.
#[derive(Clone, Deserialize)]
pub struct Device {
    /// Printable unique identifier, as provisioned in the firmware.
    pub guid: String,
    /// Digest username for the redirection service.
    pub username: String,
    /// Stored password blob; run through the [`Cryptor`] before use.
    pub password: String,
    /// Network address, `host` or `host:port`.
    pub address: String,
    /// Owning tenant. Empty for single-tenant deployments.
    #[serde(default)]
    pub tenant_id: String,
    /// Whether the redirection port speaks TLS (default true, port 16995).
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
}

fn default_use_tls() -> bool {
    true
}

// Manual impl so the stored secret never reaches a log line.
impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("guid", &self.guid)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("address", &self.address)
            .field("tenant_id", &self.tenant_id)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Read access to device records.
#[async_trait]
pub trait DeviceRepo: Send + Sync {
    /// Fetch a device by GUID, scoped to a tenant (empty tenant matches
    /// any). `Ok(None)` when the GUID is unknown.
    async fn get_by_id(&self, guid: &str, tenant: &str)
        -> Result<Option<Device>, RedirectError>;
}

/// Decrypts stored device secrets.
pub trait Cryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, RedirectError>;
}

/// In-memory repository over the configured device inventory.
pub struct StaticDeviceRepo {
    devices: HashMap<String, Device>,
}

impl StaticDeviceRepo {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|d| (d.guid.clone(), d))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl DeviceRepo for StaticDeviceRepo {
    async fn get_by_id(
        &self,
        guid: &str,
        tenant: &str,
    ) -> Result<Option<Device>, RedirectError> {
        Ok(self
            .devices
            .get(guid)
            .filter(|d| tenant.is_empty() || d.tenant_id == tenant)
            .cloned())
    }
}

/// Cryptor for inventories that store the password in the clear (the config
/// file lives on the console host). Deployments with an encrypting store
/// inject their own implementation.
pub struct PassthroughCryptor;

impl Cryptor for PassthroughCryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<String, RedirectError> {
        Ok(ciphertext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(guid: &str, tenant: &str) -> Device {
        Device {
            guid: guid.to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            address: "192.168.1.50".to_string(),
            tenant_id: tenant.to_string(),
            use_tls: true,
        }
    }

    #[tokio::test]
    async fn lookup_by_guid() {
        let repo = StaticDeviceRepo::new([device("a", ""), device("b", "")]);
        let found = repo.get_by_id("a", "").await.unwrap();
        assert_eq!(found.unwrap().guid, "a");
        assert!(repo.get_by_id("missing", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_scoping() {
        let repo = StaticDeviceRepo::new([device("a", "acme")]);
        assert!(repo.get_by_id("a", "acme").await.unwrap().is_some());
        assert!(repo.get_by_id("a", "other").await.unwrap().is_none());
        // empty tenant matches any
        assert!(repo.get_by_id("a", "").await.unwrap().is_some());
    }

    #[test]
    fn passthrough_cryptor_returns_input() {
        assert_eq!(PassthroughCryptor.decrypt("s3cret").unwrap(), "s3cret");
    }

    #[test]
    fn debug_output_redacts_the_password() {
        let mut d = device("a", "");
        d.password = "hunter2".to_string();
        let rendered = format!("{d:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
