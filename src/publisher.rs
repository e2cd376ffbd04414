//! Publishers are notified of certificate and CRL lifecycle events.

use std::fmt;

use log::info;

use crate::commons::api::{
    CaCertificate, CertWithRevocationInfo, CrlInfo, RevocationInfo, Serial,
};


//------------ PublishError --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishError(String);

impl PublishError {
    pub fn new(msg: impl fmt::Display) -> Self {
        PublishError(msg.to_string())
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PublishError {}

/// `Ok(false)` means the publisher declined without failing outright. The
/// engine treats it like an error and queues the event for a retry.
pub type PublishResult = Result<bool, PublishError>;


//------------ Publisher -----------------------------------------------------

pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Asynchronous publishers are never called directly by issuance and
    /// revocation. Their events always go through the publish queue.
    fn is_asynchronous(&self) -> bool;

    fn is_healthy(&self) -> bool;

    fn certificate_added(&self, cert: &CertWithRevocationInfo) -> PublishResult;

    fn certificate_revoked(&self, cert: &CertWithRevocationInfo) -> PublishResult;

    fn certificate_unrevoked(&self, cert: &CertWithRevocationInfo) -> PublishResult;

    fn certificate_removed(&self, serial: Serial) -> PublishResult;

    fn crl_added(&self, crl: &CrlInfo) -> PublishResult;

    fn ca_revoked(&self, ca: &CaCertificate, revocation: &RevocationInfo) -> PublishResult;

    fn ca_unrevoked(&self, ca: &CaCertificate) -> PublishResult;
}


//------------ LogPublisher --------------------------------------------------

/// Writes every event to the log.
pub struct LogPublisher {
    name: String,
}

impl LogPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        LogPublisher { name: name.into() }
    }
}

impl Publisher for LogPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_asynchronous(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn certificate_added(&self, cert: &CertWithRevocationInfo) -> PublishResult {
        info!(
            "[{}] added certificate {} for '{}' (profile {})",
            self.name,
            cert.cert().serial(),
            cert.cert().subject(),
            cert.cert().profile()
        );
        Ok(true)
    }

    fn certificate_revoked(&self, cert: &CertWithRevocationInfo) -> PublishResult {
        let reason = cert.revocation().map(|r| r.reason().to_string()).unwrap_or_default();
        info!(
            "[{}] revoked certificate {} with reason {}",
            self.name,
            cert.cert().serial(),
            reason
        );
        Ok(true)
    }

    fn certificate_unrevoked(&self, cert: &CertWithRevocationInfo) -> PublishResult {
        info!("[{}] unrevoked certificate {}", self.name, cert.cert().serial());
        Ok(true)
    }

    fn certificate_removed(&self, serial: Serial) -> PublishResult {
        info!("[{}] removed certificate {}", self.name, serial);
        Ok(true)
    }

    fn crl_added(&self, crl: &CrlInfo) -> PublishResult {
        info!(
            "[{}] added {} CRL {}",
            self.name,
            if crl.is_delta() { "delta" } else { "full" },
            crl.crl_number()
        );
        Ok(true)
    }

    fn ca_revoked(&self, ca: &CaCertificate, revocation: &RevocationInfo) -> PublishResult {
        info!(
            "[{}] CA '{}' revoked with reason {}",
            self.name,
            ca.subject(),
            revocation.reason()
        );
        Ok(true)
    }

    fn ca_unrevoked(&self, ca: &CaCertificate) -> PublishResult {
        info!("[{}] CA '{}' unrevoked", self.name, ca.subject());
        Ok(true)
    }
}
