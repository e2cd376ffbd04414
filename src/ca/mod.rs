//! The issuing engine of one certificate authority.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::commons::api::{
    oid, CaCertificate, CaInfo, CaName, CaStatus, Certificate,
    CertWithRevocationInfo, CrlInfo, CrlNumber, Extension, ExtensionValue,
    IssuedCertificate, Serial, TbsCertificate, Validity, X500Name,
};
use crate::commons::crypto::{verify_signature, SignerPool};
use crate::commons::{CaResult, Error};
use crate::profile::ProfileRegistry;
use crate::publisher::Publisher;
use crate::store::CertificateStore;

mod audit;
pub use self::audit::{AuditEvent, AuditStatus};

mod crl;
pub use self::crl::{crl_decision, next_update_after, CrlDecision, CrlKind};

mod issuance;
pub use self::issuance::PendingRequestRegistry;

mod manager;
pub use self::manager::{CaManager, StaticCaManager};

mod publishing;

mod reaper;
pub use self::reaper::RemoveExpiredCertsTask;

mod republish;

mod revocation;


//------------ CrlSigner -----------------------------------------------------

/// The key CRLs are signed with.
///
/// Without a certificate the CA key itself signs. A certificate with a
/// subject other than the CA's makes the CRLs indirect.
pub struct CrlSigner {
    signer: Arc<SignerPool>,
    certificate: Option<CaCertificate>,
}

impl CrlSigner {
    pub fn new(signer: Arc<SignerPool>, certificate: Option<CaCertificate>) -> Self {
        CrlSigner { signer, certificate }
    }

    pub fn signer(&self) -> &SignerPool {
        &self.signer
    }

    pub fn certificate(&self) -> Option<&CaCertificate> {
        self.certificate.as_ref()
    }

    pub fn is_indirect(&self, ca: &CaInfo) -> bool {
        self.certificate
            .as_ref()
            .is_some_and(|cert| cert.subject() != ca.subject())
    }
}


//------------ Self-signed CA certificates ----------------------------------

/// Creates a self-signed CA certificate for the key of `signer`.
///
/// The serial should come from the store the CA issues into, so that no
/// issued certificate ever shares it.
pub fn self_signed_ca_certificate(
    subject: X500Name,
    validity: Validity,
    serial: Serial,
    signer: &SignerPool,
) -> CaResult<CaCertificate> {
    let public_key = signer.public_key().clone();
    let key_id = public_key.key_identifier();
    let extensions = vec![
        Extension::new(oid::BASIC_CONSTRAINTS, true, ExtensionValue::Flag(true)),
        Extension::new(
            oid::SUBJECT_KEY_IDENTIFIER,
            false,
            ExtensionValue::KeyIdentifier(key_id.clone()),
        ),
        Extension::new(
            oid::AUTHORITY_KEY_IDENTIFIER,
            false,
            ExtensionValue::KeyIdentifier(key_id),
        ),
    ];
    let tbs = TbsCertificate::new(
        serial,
        subject.clone(),
        subject,
        validity,
        public_key,
        extensions,
    );

    let data = tbs.encode()?;
    let signature = signer.sign(&data)?;
    if !verify_signature(signer.public_key(), signer.algorithm(), &data, &signature)? {
        return Err(Error::system("self-signed CA certificate does not verify"));
    }
    CaCertificate::new(Certificate::new(tbs, signer.algorithm(), signature))
}


//------------ CaContext -----------------------------------------------------

/// State shared by every operation on a CA.
struct CaContext {
    info: RwLock<CaInfo>,
    store: Arc<dyn CertificateStore>,
    signer: Arc<SignerPool>,
    crl_signer: Option<CrlSigner>,
    profiles: ProfileRegistry,
    manager: Arc<dyn CaManager>,
    pending: PendingRequestRegistry,

    // Issuance and revocation calls currently running.
    in_flight: AtomicUsize,

    crl_generation_running: AtomicBool,
    republish_running: AtomicBool,
    reaper_running: AtomicBool,
    remove_expired_tasks: Mutex<VecDeque<RemoveExpiredCertsTask>>,

    // Serializes revocation state transitions.
    revocation_lock: Mutex<()>,
}


//------------ X509Ca --------------------------------------------------------

/// The issuing engine for one CA.
///
/// Cloning is cheap, clones share all state.
#[derive(Clone)]
pub struct X509Ca {
    ctx: Arc<CaContext>,
}

impl X509Ca {
    pub fn build(
        info: CaInfo,
        store: Arc<dyn CertificateStore>,
        signer: Arc<SignerPool>,
        profiles: ProfileRegistry,
        manager: Arc<dyn CaManager>,
        crl_signer: Option<CrlSigner>,
    ) -> CaResult<Self> {
        if signer.public_key() != info.cert().public_key() {
            return Err(Error::system(format!(
                "signer key does not match the certificate of CA '{}'",
                info.name()
            )));
        }

        let mut info = info;
        if let Some(state) = manager.load_crl_interval(info.name())? {
            info.set_crl_interval(state);
        }

        Ok(X509Ca {
            ctx: Arc::new(CaContext {
                info: RwLock::new(info),
                store,
                signer,
                crl_signer,
                profiles,
                manager,
                pending: PendingRequestRegistry::default(),
                in_flight: AtomicUsize::new(0),
                crl_generation_running: AtomicBool::new(false),
                republish_running: AtomicBool::new(false),
                reaper_running: AtomicBool::new(false),
                remove_expired_tasks: Mutex::new(VecDeque::new()),
                revocation_lock: Mutex::new(()),
            }),
        })
    }

    /// A snapshot of the current CA information.
    pub fn info(&self) -> CaInfo {
        self.ctx.info.read().expect("poisoned lock").clone()
    }

    pub fn name(&self) -> CaName {
        self.ctx.info.read().expect("poisoned lock").name().clone()
    }

    pub fn status(&self) -> CaStatus {
        self.ctx.info.read().expect("poisoned lock").status()
    }

    pub fn set_status(&self, status: CaStatus) {
        self.ctx.info.write().expect("poisoned lock").set_status(status);
    }

    pub fn get_cert(&self, serial: Serial) -> CaResult<Option<IssuedCertificate>> {
        Ok(self
            .get_cert_with_revocation_info(serial)?
            .map(CertWithRevocationInfo::into_cert))
    }

    pub fn get_cert_with_revocation_info(
        &self,
        serial: Serial,
    ) -> CaResult<Option<CertWithRevocationInfo>> {
        Ok(self.ctx.store.get_cert_with_revocation_info(serial)?)
    }

    /// The most recent full CRL.
    pub fn get_current_crl(&self) -> CaResult<Option<CrlInfo>> {
        Ok(self.ctx.store.get_latest_crl(false)?)
    }

    pub fn get_current_delta_crl(&self) -> CaResult<Option<CrlInfo>> {
        Ok(self.ctx.store.get_latest_crl(true)?)
    }

    pub fn get_crl(&self, crl_number: CrlNumber) -> CaResult<Option<CrlInfo>> {
        Ok(self.ctx.store.get_crl(crl_number)?)
    }

    pub fn health_check(&self) -> HealthCheckResult {
        let signer = self.ctx.signer.is_healthy()
            && self
                .ctx
                .crl_signer
                .as_ref()
                .is_none_or(|crl_signer| crl_signer.signer().is_healthy());
        let publishers: BTreeMap<String, bool> = self
            .publishers()
            .iter()
            .map(|p| (p.name().to_string(), p.is_healthy()))
            .collect();
        let healthy = signer && publishers.values().all(|ok| *ok);
        HealthCheckResult { healthy, signer, publishers }
    }
}

/// # Helpers shared by the operations
impl X509Ca {
    fn publishers(&self) -> Vec<Arc<dyn Publisher>> {
        self.ctx.manager.publishers(&self.name())
    }

    fn check_master(&self) -> CaResult<()> {
        if self.ctx.manager.is_master() {
            Ok(())
        } else {
            Err(Error::not_permitted("this instance is not the master"))
        }
    }

    fn in_flight(&self) -> InFlightGuard<'_> {
        InFlightGuard::new(&self.ctx.in_flight)
    }

    fn in_flight_count(&self) -> usize {
        self.ctx.in_flight.load(Ordering::SeqCst)
    }
}


//------------ HealthCheckResult ---------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub signer: bool,
    pub publishers: BTreeMap<String, bool>,
}


//------------ InFlightGuard -------------------------------------------------

/// Counts an operation as running for as long as it lives.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}


//------------ RunGuard ------------------------------------------------------

/// Holds a run flag for as long as it lives.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    /// Returns None if the flag was already set.
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}


//------------ Tests ---------------------------------------------------------
