//! Per-session identity verification for addressed devices.
//!
//! When several devices share one transport, an address only tells us where
//! to send a command, not which physical unit will execute it. Addresses can
//! be reassigned out of band, so the serial number answering at each address
//! is checked against the configured one before anything is written there.

use crate::error::{DeviceError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error};

/// Transports able to ask the device at an address for its serial number.
#[async_trait]
pub trait IdentityQuery: Send {
    async fn query_identity(&mut self, address: &str) -> Result<String>;
}

/// Expected serial numbers and which addresses were confirmed this session.
#[derive(Debug, Clone, Default)]
pub struct IdentityVerifier {
    expected: BTreeMap<String, String>,
    verified: HashSet<String>,
}

impl IdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `serial_number` at `address`.
    pub fn expect(&mut self, address: impl Into<String>, serial_number: impl Into<String>) {
        let address = address.into();
        self.verified.remove(&address);
        self.expected.insert(address, serial_number.into());
    }

    pub fn is_verified(&self, address: &str) -> bool {
        self.verified.contains(address)
    }

    /// Forget all confirmations, e.g. after the transport was reopened.
    pub fn start_session(&mut self) {
        self.verified.clear();
    }

    /// Check one address unless it was already confirmed this session.
    /// Addresses without an expectation pass.
    pub async fn verify<Q: IdentityQuery + ?Sized>(&mut self, link: &mut Q, address: &str) -> Result<()> {
        if self.verified.contains(address) {
            return Ok(());
        }
        let Some(expected) = self.expected.get(address) else {
            return Ok(());
        };

        let actual = link.query_identity(address).await?;
        if actual.trim() != expected.trim() {
            error!(address, expected = %expected, actual = %actual, "Device identity mismatch");
            return Err(DeviceError::IdentityMismatch {
                address: address.to_string(),
                expected: expected.clone(),
                actual: actual.trim().to_string(),
            });
        }

        debug!(address, serial_number = %actual, "Device identity confirmed");
        self.verified.insert(address.to_string());
        Ok(())
    }

    /// Check every address with an expectation.
    pub async fn verify_all<Q: IdentityQuery + ?Sized>(&mut self, link: &mut Q) -> Result<()> {
        let addresses: Vec<String> = self.expected.keys().cloned().collect();
        for address in addresses {
            self.verify(link, &address).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Bus {
        serials: HashMap<String, String>,
        queries: usize,
    }

    #[async_trait]
    impl IdentityQuery for Bus {
        async fn query_identity(&mut self, address: &str) -> Result<String> {
            self.queries += 1;
            self.serials
                .get(address)
                .cloned()
                .ok_or_else(|| DeviceError::transport("bus", format!("no device at {address}")))
        }
    }

    #[tokio::test]
    async fn test_verified_once_per_session() {
        let mut bus = Bus::default();
        bus.serials.insert("0".into(), "11400101".into());
        let mut verifier = IdentityVerifier::new();
        verifier.expect("0", "11400101");

        verifier.verify(&mut bus, "0").await.unwrap();
        verifier.verify(&mut bus, "0").await.unwrap();
        assert_eq!(bus.queries, 1);

        verifier.start_session();
        verifier.verify(&mut bus, "0").await.unwrap();
        assert_eq!(bus.queries, 2);
    }

    #[tokio::test]
    async fn test_mismatch_leaves_address_unverified() {
        let mut bus = Bus::default();
        bus.serials.insert("2".into(), "99999999".into());
        let mut verifier = IdentityVerifier::new();
        verifier.expect("2", "11400101");

        let err = verifier.verify_all(&mut bus).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::IdentityMismatch { ref actual, .. } if actual == "99999999"
        ));
        assert!(!verifier.is_verified("2"));
    }

    #[tokio::test]
    async fn test_address_without_expectation_passes() {
        let mut bus = Bus::default();
        let mut verifier = IdentityVerifier::new();
        verifier.verify(&mut bus, "5").await.unwrap();
        assert_eq!(bus.queries, 0);
    }
}
