//! Revocation state transitions of issued certificates and of the CA itself.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::commons::api::{
    CertWithRevocationInfo, CrlReason, Permission, RevocationInfo, Serial,
};
use crate::commons::{CaResult, Error};

use super::publishing::CertEvent;
use super::{AuditEvent, X509Ca};


impl X509Ca {
    /// Revokes a certificate.
    ///
    /// A certificate on hold may be revoked for another reason, in which
    /// case it keeps the time it was put on hold. Any other revoked
    /// certificate is only revoked again if `force` is set.
    pub fn revoke_cert(
        &self,
        serial: Serial,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
        force: bool,
    ) -> CaResult<CertWithRevocationInfo> {
        let mut audit = AuditEvent::start("revoke_cert", &self.name());
        audit.param("serial", serial);
        audit.param("reason", reason);
        if force {
            audit.param("force", force);
        }

        let result = self.revoke_cert_checked(serial, reason, invalidity_time, force);
        audit.finish(&result);
        result
    }

    fn revoke_cert_checked(
        &self,
        serial: Serial,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
        force: bool,
    ) -> CaResult<CertWithRevocationInfo> {
        self.check_master()?;
        let _in_flight = self.in_flight();

        let ca = self.info();
        ca.check_permission(Permission::RevokeCert)?;
        if reason.is_ca_only() {
            return Err(Error::not_permitted(format!(
                "reason {} is reserved for CA certificates",
                reason
            )));
        }
        if serial == ca.cert().serial() {
            return Err(Error::not_permitted(
                "the CA certificate cannot be revoked as an issued certificate",
            ));
        }

        self.revoke_cert_internal(serial, reason, invalidity_time, force)
    }

    fn revoke_cert_internal(
        &self,
        serial: Serial,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
        force: bool,
    ) -> CaResult<CertWithRevocationInfo> {
        let revoked = {
            let _lock = self.ctx.revocation_lock.lock().expect("poisoned lock");
            let current = self
                .ctx
                .store
                .get_cert_with_revocation_info(serial)?
                .ok_or(Error::UnknownCert(serial))?;

            let revocation = match current.revocation() {
                None => RevocationInfo::new(reason, Utc::now(), invalidity_time),
                Some(held) if held.reason().is_hold() => {
                    if reason.is_hold() {
                        return Err(Error::CertRevoked(serial, held.reason()));
                    }
                    RevocationInfo::new(
                        reason,
                        held.revocation_time(),
                        held.invalidity_time().or(invalidity_time),
                    )
                }
                Some(existing) if !force => {
                    return Err(Error::CertRevoked(serial, existing.reason()));
                }
                Some(_) => RevocationInfo::new(reason, Utc::now(), invalidity_time),
            };

            self.ctx.store.revoke_cert(serial, revocation)?
        };

        self.add_to_delta_crl_cache(serial);
        self.notify_publishers(&revoked, CertEvent::Revoked);
        info!("CA '{}' revoked certificate {} with reason {}", self.name(), serial, reason);
        Ok(revoked)
    }

    /// Takes a certificate off hold. Certificates revoked for any other
    /// reason are only unrevoked if `force` is set.
    pub fn unrevoke_cert(&self, serial: Serial, force: bool) -> CaResult<CertWithRevocationInfo> {
        let mut audit = AuditEvent::start("unrevoke_cert", &self.name());
        audit.param("serial", serial);
        if force {
            audit.param("force", force);
        }

        let result = self.unrevoke_cert_checked(serial, force);
        audit.finish(&result);
        result
    }

    fn unrevoke_cert_checked(&self, serial: Serial, force: bool) -> CaResult<CertWithRevocationInfo> {
        self.check_master()?;
        let _in_flight = self.in_flight();
        self.info().check_permission(Permission::UnrevokeCert)?;
        self.unrevoke_cert_internal(serial, force)
    }

    fn unrevoke_cert_internal(&self, serial: Serial, force: bool) -> CaResult<CertWithRevocationInfo> {
        let unrevoked = {
            let _lock = self.ctx.revocation_lock.lock().expect("poisoned lock");
            let current = self
                .ctx
                .store
                .get_cert_with_revocation_info(serial)?
                .ok_or(Error::UnknownCert(serial))?;

            match current.revocation() {
                None => return Err(Error::CertUnrevoked(serial)),
                Some(revocation) if !revocation.reason().is_hold() && !force => {
                    return Err(Error::not_permitted(format!(
                        "certificate {} is revoked with reason {} and cannot be unrevoked",
                        serial,
                        revocation.reason()
                    )));
                }
                Some(_) => {}
            }

            self.ctx.store.unrevoke_cert(serial)?
        };

        self.add_to_delta_crl_cache(serial);
        self.notify_publishers(&unrevoked, CertEvent::Unrevoked);
        info!("CA '{}' unrevoked certificate {}", self.name(), serial);
        Ok(unrevoked)
    }

    /// Removes a certificate from the store.
    ///
    /// Every publisher must confirm the removal first. If one does not,
    /// the certificate stays.
    pub fn remove_cert(&self, serial: Serial) -> CaResult<()> {
        let mut audit = AuditEvent::start("remove_cert", &self.name());
        audit.param("serial", serial);

        let result = self
            .check_master()
            .and_then(|_| self.info().check_permission(Permission::RemoveCert))
            .and_then(|_| self.remove_cert_internal(serial));
        audit.finish(&result);
        result
    }

    pub(super) fn remove_cert_internal(&self, serial: Serial) -> CaResult<()> {
        if self.ctx.store.get_cert_with_revocation_info(serial)?.is_none() {
            return Err(Error::UnknownCert(serial));
        }

        for publisher in self.publishers() {
            match publisher.certificate_removed(serial) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(Error::system(format!(
                        "publisher '{}' did not remove certificate {}",
                        publisher.name(),
                        serial
                    )));
                }
                Err(e) => {
                    return Err(Error::system(format!(
                        "publisher '{}' could not remove certificate {}: {}",
                        publisher.name(),
                        serial,
                        e
                    )));
                }
            }
        }

        self.ctx.store.remove_cert(serial)?;
        debug!("CA '{}' removed certificate {}", self.name(), serial);
        Ok(())
    }

    /// Revokes the CA itself.
    ///
    /// Publishers are told about it. A self-signed CA also revokes its own
    /// certificate if the store holds it.
    pub fn revoke_ca(
        &self,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
    ) -> CaResult<()> {
        let mut audit = AuditEvent::start("revoke_ca", &self.name());
        audit.param("reason", reason);

        let result = self.revoke_ca_checked(reason, invalidity_time);
        audit.finish(&result);
        result
    }

    fn revoke_ca_checked(
        &self,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
    ) -> CaResult<()> {
        self.check_master()?;
        let _in_flight = self.in_flight();

        let revocation = RevocationInfo::new(reason, Utc::now(), invalidity_time);
        let ca = {
            let mut info = self.ctx.info.write().expect("poisoned lock");
            info.check_permission(Permission::RevokeCert)?;
            if let Some(existing) = info.revocation() {
                return Err(Error::CertRevoked(info.cert().serial(), existing.reason()));
            }
            info.set_revocation(Some(revocation));
            info.clone()
        };

        for publisher in self.publishers() {
            if let Err(e) = publisher.ca_revoked(ca.cert(), &revocation) {
                warn!("Publisher '{}' failed to process revocation of the CA: {}", publisher.name(), e);
            }
        }

        if ca.cert().is_self_signed() {
            match self.revoke_cert_internal(ca.cert().serial(), reason, invalidity_time, true) {
                Ok(_) | Err(Error::UnknownCert(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("CA '{}' revoked with reason {}", ca.name(), reason);
        Ok(())
    }

    pub fn unrevoke_ca(&self) -> CaResult<()> {
        let audit = AuditEvent::start("unrevoke_ca", &self.name());
        let result = self.unrevoke_ca_checked();
        audit.finish(&result);
        result
    }

    fn unrevoke_ca_checked(&self) -> CaResult<()> {
        self.check_master()?;
        let _in_flight = self.in_flight();

        let ca = {
            let mut info = self.ctx.info.write().expect("poisoned lock");
            info.check_permission(Permission::UnrevokeCert)?;
            if info.revocation().is_none() {
                return Err(Error::CertUnrevoked(info.cert().serial()));
            }
            info.set_revocation(None);
            info.clone()
        };

        for publisher in self.publishers() {
            if let Err(e) = publisher.ca_unrevoked(ca.cert()) {
                warn!("Publisher '{}' failed to process unrevocation of the CA: {}", publisher.name(), e);
            }
        }

        if ca.cert().is_self_signed() {
            match self.unrevoke_cert_internal(ca.cert().serial(), true) {
                Ok(_) | Err(Error::UnknownCert(_)) | Err(Error::CertUnrevoked(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("CA '{}' unrevoked", ca.name());
        Ok(())
    }

    /// Records a revocation change for the next delta CRL.
    fn add_to_delta_crl_cache(&self, serial: Serial) {
        let delta_enabled = self
            .ctx
            .info
            .read()
            .expect("poisoned lock")
            .crl_control()
            .is_some_and(|control| control.delta_enabled());
        if delta_enabled {
            if let Err(e) = self.ctx.store.add_to_delta_crl_cache(serial) {
                warn!("Could not add certificate {} to the delta CRL cache: {}", serial, e);
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test;
    use crate::commons::ErrorKind;

    #[test]
    fn ca_only_reasons_are_rejected() {
        let env = test::TestCa::builder().build();
        let issued = env.ca.issue(&env.request("tls", "CN=host")).unwrap();

        let err = env
            .ca
            .revoke_cert(issued.serial(), CrlReason::CaCompromise, None, false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotPermitted);
    }

    #[test]
    fn unknown_serial() {
        let env = test::TestCa::builder().build();
        let err = env
            .ca
            .revoke_cert(Serial::from(4711), CrlReason::KeyCompromise, None, false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownCert);
    }

    #[test]
    fn double_hold_is_rejected() {
        let env = test::TestCa::builder().build();
        let serial = env.ca.issue(&env.request("tls", "CN=host")).unwrap().serial();

        env.ca.revoke_cert(serial, CrlReason::CertificateHold, None, false).unwrap();
        let err = env
            .ca
            .revoke_cert(serial, CrlReason::CertificateHold, None, false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::CertRevoked);
    }

    #[test]
    fn revoked_is_only_revoked_again_with_force() {
        let env = test::TestCa::builder().build();
        let serial = env.ca.issue(&env.request("tls", "CN=host")).unwrap().serial();

        env.ca.revoke_cert(serial, CrlReason::Superseded, None, false).unwrap();
        let err = env
            .ca
            .revoke_cert(serial, CrlReason::KeyCompromise, None, false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::CertRevoked);

        let revoked = env.ca.revoke_cert(serial, CrlReason::KeyCompromise, None, true).unwrap();
        assert_eq!(revoked.revocation().unwrap().reason(), CrlReason::KeyCompromise);
    }

    #[test]
    fn unrevoke_of_good_cert_fails() {
        let env = test::TestCa::builder().build();
        let serial = env.ca.issue(&env.request("tls", "CN=host")).unwrap().serial();
        let err = env.ca.unrevoke_cert(serial, false).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CertUnrevoked);
    }

    #[test]
    fn revoke_and_unrevoke_ca() {
        let env = test::TestCa::builder().build();
        env.ca.revoke_ca(CrlReason::CaCompromise, None).unwrap();
        assert!(env.ca.info().revocation().is_some());

        let err = env.ca.issue(&env.request("tls", "CN=host")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotPermitted);

        env.ca.unrevoke_ca().unwrap();
        assert!(env.ca.info().revocation().is_none());
        assert!(env.ca.issue(&env.request("tls", "CN=host")).is_ok());
    }

    #[test]
    fn missing_permission() {
        let env = test::TestCa::builder()
            .permissions(&[crate::commons::api::Permission::EnrollCert])
            .build();
        let serial = env.ca.issue(&env.request("tls", "CN=host")).unwrap().serial();
        let err = env
            .ca
            .revoke_cert(serial, CrlReason::KeyCompromise, None, false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InsufficientPermission);
    }
}
