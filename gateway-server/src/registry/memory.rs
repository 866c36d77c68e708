//! Map-backed registry for tests and local runs

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Certificate, ChargeStation, DeviceRegistry, RegistryError};

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    charge_stations: RwLock<HashMap<String, ChargeStation>>,
    certificates: RwLock<HashMap<String, Certificate>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_charge_station(&self, station: ChargeStation) {
        self.charge_stations
            .write()
            .insert(station.client_id.clone(), station);
    }

    pub fn add_certificate(&self, certificate_hash: impl Into<String>, certificate: Certificate) {
        self.certificates
            .write()
            .insert(certificate_hash.into(), certificate);
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn lookup_charge_station(
        &self,
        client_id: &str,
    ) -> Result<Option<ChargeStation>, RegistryError> {
        Ok(self.charge_stations.read().get(client_id).cloned())
    }

    async fn lookup_certificate(
        &self,
        certificate_hash: &str,
    ) -> Result<Option<Certificate>, RegistryError> {
        Ok(self.certificates.read().get(certificate_hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SecurityProfile;

    #[tokio::test]
    async fn test_lookup_registered_station() {
        let registry = InMemoryRegistry::new();
        registry.add_charge_station(
            ChargeStation::new("cs001", SecurityProfile::TlsWithBasicAuth)
                .with_password_hash("DEADBEEF"),
        );

        let station = registry.lookup_charge_station("cs001").await.unwrap().unwrap();
        assert_eq!(station.security_profile, SecurityProfile::TlsWithBasicAuth);
        assert_eq!(station.base64_sha256_password.as_deref(), Some("DEADBEEF"));

        assert!(registry.lookup_charge_station("cs002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_certificate() {
        let registry = InMemoryRegistry::new();
        registry.add_certificate("hash", Certificate::from_der(vec![1, 2, 3]));

        let cert = registry.lookup_certificate("hash").await.unwrap().unwrap();
        assert_eq!(cert.der(), &[1, 2, 3]);
        assert!(registry.lookup_certificate("other").await.unwrap().is_none());
    }
}
