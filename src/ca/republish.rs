//! Republishing all certificates of a CA.

use std::sync::Arc;
use std::thread;

use log::{debug, info};

use crate::commons::api::{CaStatus, CertWithRevocationInfo};
use crate::commons::{CaResult, Error};
use crate::constants::{QUIESCENCE_POLL_INTERVAL, REPUBLISH_BATCH_SIZE};
use crate::publisher::{PublishResult, Publisher};
use crate::store::SerialFilter;

use super::{AuditEvent, RunGuard, X509Ca};


//------------ StatusGuard ---------------------------------------------------

/// Restores the CA status it was created with when dropped.
struct StatusGuard<'a> {
    ca: &'a X509Ca,
    status: CaStatus,
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.ca.set_status(self.status);
    }
}


//------------ Republishing --------------------------------------------------

impl X509Ca {
    /// Pushes every certificate to the given publishers, or to all of them
    /// if `publishers` is None.
    ///
    /// Issuance is suspended until all running requests are done and for
    /// as long as republishing takes. The first certificate a publisher
    /// does not accept aborts the whole run. Fails with
    /// `SystemUnavailable` while another republishing runs.
    pub fn republish_certs(&self, publishers: Option<&[String]>) -> CaResult<()> {
        let mut audit = AuditEvent::start("republish_certs", &self.name());
        if let Some(names) = publishers {
            audit.param("publishers", names.join(","));
        }

        let result = self.republish_certs_checked(publishers);
        if let Ok(count) = &result {
            audit.param("certificates", count);
        }
        audit.finish(&result);
        result.map(|_| ())
    }

    fn republish_certs_checked(&self, names: Option<&[String]>) -> CaResult<usize> {
        self.check_master()?;
        let publishers = self.resolve_publishers(names)?;
        if publishers.is_empty() {
            return Ok(0);
        }

        let Some(_running) = RunGuard::acquire(&self.ctx.republish_running) else {
            return Err(Error::SystemUnavailable(
                "republishing is already running, try again later".to_string(),
            ));
        };

        let _restore = StatusGuard { ca: self, status: self.status() };
        self.set_status(CaStatus::Inactive);
        while self.in_flight_count() > 0 {
            debug!(
                "Waiting for {} running requests before republishing",
                self.in_flight_count()
            );
            thread::sleep(QUIESCENCE_POLL_INTERVAL);
        }

        for publisher in &publishers {
            self.ctx.store.clear_publish_queue(Some(publisher.name()))?;
        }

        let ca = self.info();
        if let Some(revocation) = ca.revocation() {
            for publisher in &publishers {
                let result = publisher.ca_revoked(ca.cert(), revocation);
                accepted(publisher.as_ref(), "the CA revocation", result)?;
            }
        }

        let filter = SerialFilter::default();
        let mut after = None;
        let mut count = 0;
        loop {
            let serials = self.ctx.store.get_serials(after, REPUBLISH_BATCH_SIZE, &filter)?;
            let Some(last) = serials.last() else {
                break;
            };
            after = Some(*last);
            let done = serials.len() < REPUBLISH_BATCH_SIZE;

            for serial in serials {
                let Some(cert) = self.ctx.store.get_cert_with_revocation_info(serial)? else {
                    continue;
                };
                for publisher in &publishers {
                    republish_cert(publisher.as_ref(), &cert)?;
                }
                count += 1;
            }
            if done {
                break;
            }
        }

        info!(
            "CA '{}' republished {} certificates to {} publishers",
            ca.name(),
            count,
            publishers.len()
        );
        Ok(count)
    }

    fn resolve_publishers(&self, names: Option<&[String]>) -> CaResult<Vec<Arc<dyn Publisher>>> {
        let all = self.publishers();
        let Some(names) = names else {
            return Ok(all);
        };
        names
            .iter()
            .map(|name| {
                all.iter()
                    .find(|p| p.name() == name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownPublisher(name.clone()))
            })
            .collect()
    }
}

fn republish_cert(publisher: &dyn Publisher, cert: &CertWithRevocationInfo) -> CaResult<()> {
    let serial = cert.cert().serial();
    let result = if cert.is_revoked() {
        publisher.certificate_revoked(cert)
    } else {
        publisher.certificate_added(cert)
    };
    accepted(publisher, &format!("certificate {}", serial), result)
}

fn accepted(
    publisher: &dyn Publisher,
    what: &str,
    result: PublishResult,
) -> CaResult<()> {
    match result {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::system(format!(
            "publisher '{}' did not accept {}",
            publisher.name(),
            what
        ))),
        Err(e) => Err(Error::system(format!(
            "publisher '{}' failed to publish {}: {}",
            publisher.name(),
            what,
            e
        ))),
    }
}
