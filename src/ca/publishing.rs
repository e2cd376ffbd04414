//! Notifying publishers and retrying through the publish queue.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::commons::api::{CertWithRevocationInfo, IssuedCertificate};
use crate::commons::{CaResult, Error};
use crate::constants::PUBLISH_QUEUE_BATCH_SIZE;
use crate::publisher::{PublishResult, Publisher};

use super::X509Ca;


//------------ CertEvent -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum CertEvent {
    Added,
    Revoked,
    Unrevoked,
}

impl CertEvent {
    fn send(self, publisher: &dyn Publisher, cert: &CertWithRevocationInfo) -> PublishResult {
        match self {
            CertEvent::Added => publisher.certificate_added(cert),
            CertEvent::Revoked => publisher.certificate_revoked(cert),
            CertEvent::Unrevoked => publisher.certificate_unrevoked(cert),
        }
    }
}


//------------ Publishing ----------------------------------------------------

impl X509Ca {
    /// Stores a newly issued certificate and notifies the publishers.
    pub(super) fn publish_certificate(&self, cert: &IssuedCertificate) -> CaResult<()> {
        self.ctx.store.add_certificate(cert)?;
        let cert = CertWithRevocationInfo::new(cert.clone(), None);
        self.notify_publishers(&cert, CertEvent::Added);
        Ok(())
    }

    /// Notifies all publishers of a certificate event.
    ///
    /// Asynchronous publishers only get a queue entry. A synchronous
    /// publisher that fails or declines gets one as well, so that the
    /// event is retried later.
    pub(super) fn notify_publishers(&self, cert: &CertWithRevocationInfo, event: CertEvent) {
        let serial = cert.cert().serial();
        for publisher in self.publishers() {
            if !publisher.is_asynchronous() {
                match event.send(publisher.as_ref(), cert) {
                    Ok(true) => continue,
                    Ok(false) => warn!(
                        "Publisher '{}' declined {:?} of certificate {}, queueing it",
                        publisher.name(),
                        event,
                        serial
                    ),
                    Err(e) => warn!(
                        "Publisher '{}' failed {:?} of certificate {}, queueing it: {}",
                        publisher.name(),
                        event,
                        serial,
                        e
                    ),
                }
            }
            if let Err(e) = self.ctx.store.add_to_publish_queue(publisher.name(), serial) {
                error!(
                    "Could not queue certificate {} for publisher '{}': {}",
                    serial,
                    publisher.name(),
                    e
                );
            }
        }
    }

    /// Retries queued events for all healthy publishers.
    ///
    /// Each queued certificate is published in its current state. A
    /// publisher whose retry fails is left alone until the next run.
    pub fn publish_certs_in_queue(&self) -> CaResult<()> {
        self.check_master()?;
        for publisher in self.publishers() {
            if !publisher.is_healthy() {
                debug!("Skipping publish queue of unhealthy publisher '{}'", publisher.name());
                continue;
            }
            self.publish_queue_for(&publisher)?;
        }
        Ok(())
    }

    fn publish_queue_for(&self, publisher: &Arc<dyn Publisher>) -> CaResult<()> {
        let store = &self.ctx.store;
        let name = publisher.name();
        let mut published = 0;

        loop {
            let serials = store.get_publish_queue_entries(name, PUBLISH_QUEUE_BATCH_SIZE)?;
            if serials.is_empty() {
                break;
            }
            for serial in serials {
                let Some(cert) = store.get_cert_with_revocation_info(serial)? else {
                    debug!("Dropping queued certificate {} which no longer exists", serial);
                    store.remove_from_publish_queue(name, serial)?;
                    continue;
                };
                let event = if cert.is_revoked() { CertEvent::Revoked } else { CertEvent::Added };
                match event.send(publisher.as_ref(), &cert) {
                    Ok(true) => {
                        store.remove_from_publish_queue(name, serial)?;
                        published += 1;
                    }
                    Ok(false) => {
                        warn!("Publisher '{}' declined queued certificate {}", name, serial);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            "Publisher '{}' failed queued certificate {}: {}",
                            name, serial, e
                        );
                        return Ok(());
                    }
                }
            }
        }

        if published > 0 {
            info!("Published {} queued certificates to '{}'", published, name);
        }
        Ok(())
    }

    /// Clears the publish queue of the named publishers, or of all of them
    /// if `publishers` is None.
    pub fn clear_publish_queue(&self, publishers: Option<&[String]>) -> CaResult<()> {
        self.check_master()?;
        match publishers {
            None => self.ctx.store.clear_publish_queue(None)?,
            Some(names) => {
                let known = self.publishers();
                for name in names {
                    if !known.iter().any(|p| p.name() == name) {
                        return Err(Error::UnknownPublisher(name.clone()));
                    }
                }
                for name in names {
                    self.ctx.store.clear_publish_queue(Some(name))?;
                }
            }
        }
        Ok(())
    }
}
