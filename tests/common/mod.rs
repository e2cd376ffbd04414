#![allow(dead_code)] // Different tests use different parts.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};

use caengine::ca::{self_signed_ca_certificate, CrlSigner, StaticCaManager, X509Ca};
use caengine::commons::api::{
    CaCertificate, CaInfo, CaName, CertWithRevocationInfo, Certificate,
    CertificateRequest, IssuedCertificate, TbsCertificate,
    CrlControl, CrlInfo, CrlIntervalState, DuplicationMode, KeyAlgorithm, RevocationInfo,
    Serial, SignatureAlgorithm, SubjectPublicKeyInfo, Validity, ValidityMode,
    X500Name,
};
use caengine::commons::crypto::{
    ContentSigner, OpenSslKeyPair, OpenSslSignerFactory, SignerError,
    SignerFactory, SignerPool,
};
use caengine::profile::{ConfiguredProfile, ProfileRegistry};
use caengine::publisher::{PublishError, PublishResult, Publisher};
use caengine::store::{CertificateStore, MemoryCertStore};


//------------ Logging -------------------------------------------------------

/// Logs to stderr if `CAENGINE_TEST_LOG` is set.
pub fn init_logging() {
    if env::var("CAENGINE_TEST_LOG").is_ok() {
        let _ = stderrlog::new().verbosity(4).init();
    }
}


//------------ Names and keys ------------------------------------------------

pub fn name(s: &str) -> X500Name {
    X500Name::from_str(s).unwrap()
}

pub fn new_public_key() -> SubjectPublicKeyInfo {
    OpenSslKeyPair::build(KeyAlgorithm::Ec)
        .unwrap()
        .subject_public_key_info()
        .unwrap()
}


//------------ Gate ----------------------------------------------------------

/// Holds signers before they sign while closed.
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    cond: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.cond.notify_all();
    }

    pub fn wait_for_arrival(&self) {
        while self.waiting.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn pass(&self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            while *closed {
                closed = self.cond.wait(closed).unwrap();
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}


//------------ CountingSignerFactory -----------------------------------------

pub struct CountingSignerFactory {
    inner: OpenSslSignerFactory,
    signatures: Arc<AtomicUsize>,
    gate: Arc<Gate>,
    failing: Arc<AtomicBool>,
}

struct CountingSigner {
    inner: Box<dyn ContentSigner>,
    signatures: Arc<AtomicUsize>,
    gate: Arc<Gate>,
    failing: Arc<AtomicBool>,
}

impl ContentSigner for CountingSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        self.inner.algorithm()
    }

    fn sign(&mut self, data: &[u8]) -> Result<Bytes, SignerError> {
        self.gate.pass();
        if self.failing.load(Ordering::SeqCst) {
            return Err(SignerError::other("signer is down"));
        }
        self.signatures.fetch_add(1, Ordering::SeqCst);
        self.inner.sign(data)
    }
}

impl SignerFactory for CountingSignerFactory {
    fn new_signer(&self) -> Result<Box<dyn ContentSigner>, SignerError> {
        Ok(Box::new(CountingSigner {
            inner: self.inner.new_signer()?,
            signatures: self.signatures.clone(),
            gate: self.gate.clone(),
            failing: self.failing.clone(),
        }))
    }

    fn public_key(&self) -> &SubjectPublicKeyInfo {
        self.inner.public_key()
    }

    fn is_healthy(&self) -> bool {
        true
    }
}


//------------ RecordingPublisher --------------------------------------------

/// Records every notification as a short string, e.g. `revoked 0a`.
pub struct RecordingPublisher {
    name: String,
    asynchronous: bool,
    healthy: AtomicBool,
    failing: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    pub fn asynchronous(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    fn build(name: &str, asynchronous: bool) -> Arc<Self> {
        Arc::new(RecordingPublisher {
            name: name.to_string(),
            asynchronous,
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            events: Mutex::new(vec![]),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    fn record(&self, event: String) -> PublishResult {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::new(format!("{} failed", event)));
        }
        self.events.lock().unwrap().push(event);
        Ok(true)
    }
}

impl Publisher for RecordingPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn certificate_added(&self, cert: &CertWithRevocationInfo) -> PublishResult {
        self.record(format!("added {}", cert.cert().serial()))
    }

    fn certificate_revoked(&self, cert: &CertWithRevocationInfo) -> PublishResult {
        self.record(format!("revoked {}", cert.cert().serial()))
    }

    fn certificate_unrevoked(&self, cert: &CertWithRevocationInfo) -> PublishResult {
        self.record(format!("unrevoked {}", cert.cert().serial()))
    }

    fn certificate_removed(&self, serial: Serial) -> PublishResult {
        self.record(format!("removed {}", serial))
    }

    fn crl_added(&self, crl: &CrlInfo) -> PublishResult {
        self.record(format!("crl {}", crl.crl_number()))
    }

    fn ca_revoked(&self, _ca: &CaCertificate, _revocation: &RevocationInfo) -> PublishResult {
        self.record("ca_revoked".to_string())
    }

    fn ca_unrevoked(&self, _ca: &CaCertificate) -> PublishResult {
        self.record("ca_unrevoked".to_string())
    }
}


//------------ TestEnv -------------------------------------------------------

/// A CA on a memory store with a `tls` profile and whatever else the
/// builder adds.
pub struct TestEnv {
    pub ca: X509Ca,
    pub store: Arc<MemoryCertStore>,
    pub gate: Arc<Gate>,

    /// The certificate of the separate CRL signer, if the builder set one.
    pub crl_signer_cert: Option<CaCertificate>,
    signatures: Arc<AtomicUsize>,
    signer_failing: Arc<AtomicBool>,
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    pub fn request(&self, profile: &str, subject: &str) -> CertificateRequest {
        CertificateRequest::new(profile, name(subject), new_public_key())
    }

    /// Stores a certificate that expired `ago` before now, bypassing
    /// issuance.
    pub fn add_expired_cert(&self, profile: &str, subject: &str, ago: TimeDelta) -> Serial {
        let now = Utc::now();
        let serial = self.store.next_serial().unwrap();
        let tbs = TbsCertificate::new(
            serial,
            self.ca.info().subject().clone(),
            name(subject),
            Validity::new(now - ago - TimeDelta::days(30), now - ago),
            new_public_key(),
            vec![],
        );
        let cert = Certificate::new(tbs, SignatureAlgorithm::EcdsaSha256, Bytes::from_static(b"sig"));
        let issued =
            IssuedCertificate::new(cert, profile, name(subject), None, false).unwrap();
        self.store.add_certificate(&issued).unwrap();
        serial
    }

    /// The number of signatures made since the CA was built.
    pub fn signatures(&self) -> usize {
        self.signatures.load(Ordering::SeqCst)
    }

    /// Makes every signature of the CA key fail until reset.
    pub fn set_signer_failing(&self, failing: bool) {
        self.signer_failing.store(failing, Ordering::SeqCst);
    }
}

pub struct TestEnvBuilder {
    profiles: Vec<ConfiguredProfile>,
    duplicate_key_mode: DuplicationMode,
    duplicate_subject_mode: DuplicationMode,
    validity_mode: ValidityMode,
    max_validity: TimeDelta,
    validity: Option<Validity>,
    crl_control: Option<CrlControl>,
    crl_interval: Option<CrlIntervalState>,
    publishers: Vec<Arc<dyn Publisher>>,
    keep_expired_certs_days: Option<i64>,
    expired_certs_overlap: Option<TimeDelta>,
    indirect_crl_signer: bool,
    crl_state_dir: Option<PathBuf>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        TestEnvBuilder {
            profiles: vec![ConfiguredProfile::named("tls")],
            duplicate_key_mode: DuplicationMode::Permitted,
            duplicate_subject_mode: DuplicationMode::Permitted,
            validity_mode: ValidityMode::Strict,
            max_validity: TimeDelta::days(365),
            validity: None,
            crl_control: None,
            crl_interval: None,
            publishers: vec![],
            keep_expired_certs_days: None,
            expired_certs_overlap: None,
            indirect_crl_signer: false,
            crl_state_dir: None,
        }
    }
}

impl TestEnvBuilder {
    pub fn profile(mut self, profile: ConfiguredProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn duplicate_key_mode(mut self, mode: DuplicationMode) -> Self {
        self.duplicate_key_mode = mode;
        self
    }

    pub fn duplicate_subject_mode(mut self, mode: DuplicationMode) -> Self {
        self.duplicate_subject_mode = mode;
        self
    }

    pub fn validity_mode(mut self, mode: ValidityMode) -> Self {
        self.validity_mode = mode;
        self
    }

    pub fn max_validity(mut self, max_validity: TimeDelta) -> Self {
        self.max_validity = max_validity;
        self
    }

    pub fn validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.validity = Some(Validity::new(not_before, not_after));
        self
    }

    pub fn crl_control(mut self, control: CrlControl) -> Self {
        self.crl_control = Some(control);
        self
    }

    /// Pretends the CRL schedule stopped at this state.
    pub fn crl_interval(mut self, state: CrlIntervalState) -> Self {
        self.crl_interval = Some(state);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn keep_expired_certs_days(mut self, days: i64) -> Self {
        self.keep_expired_certs_days = Some(days);
        self
    }

    pub fn expired_certs_overlap(mut self, overlap: TimeDelta) -> Self {
        self.expired_certs_overlap = Some(overlap);
        self
    }

    /// Signs CRLs with a key of their own, certified by a separate
    /// self-signed certificate.
    pub fn indirect_crl_signer(mut self) -> Self {
        self.indirect_crl_signer = true;
        self
    }

    /// Where the CA manager writes the CRL interval state.
    pub fn crl_state_dir(mut self, dir: PathBuf) -> Self {
        self.crl_state_dir = Some(dir);
        self
    }

    pub fn build(self) -> TestEnv {
        init_logging();

        let signatures = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Gate::default());
        let signer_failing = Arc::new(AtomicBool::new(false));
        let factory = CountingSignerFactory {
            inner: OpenSslSignerFactory::new(
                OpenSslKeyPair::build(KeyAlgorithm::Ec).unwrap(),
            )
            .unwrap(),
            signatures: signatures.clone(),
            gate: gate.clone(),
            failing: signer_failing.clone(),
        };
        let signer = Arc::new(
            SignerPool::build(Arc::new(factory), 4, Duration::from_secs(10)).unwrap(),
        );

        let store = Arc::new(MemoryCertStore::new());
        let now = Utc::now();
        let validity = self.validity.unwrap_or_else(|| {
            Validity::new(now - TimeDelta::days(1), now + TimeDelta::days(3650))
        });
        let cert = self_signed_ca_certificate(
            name("CN=Integration CA,O=Example"),
            validity,
            store.next_serial().unwrap(),
            &signer,
        )
        .unwrap();
        signatures.store(0, Ordering::SeqCst);

        let ca_name = CaName::from("integration");
        let mut info = CaInfo::new(ca_name.clone(), cert)
            .with_duplicate_key_mode(self.duplicate_key_mode)
            .with_duplicate_subject_mode(self.duplicate_subject_mode)
            .with_validity_mode(self.validity_mode)
            .with_max_validity(self.max_validity);
        if let Some(control) = self.crl_control {
            info = info.with_crl_control(control);
        }
        if let Some(state) = self.crl_interval {
            info = info.with_crl_interval(state);
        }
        if let Some(days) = self.keep_expired_certs_days {
            info = info.with_keep_expired_certs_days(days);
        }
        if let Some(overlap) = self.expired_certs_overlap {
            info = info.with_expired_certs_overlap(overlap);
        }

        let mut manager = StaticCaManager::new(true);
        if let Some(dir) = self.crl_state_dir {
            manager = manager.with_state_dir(dir);
        }
        for publisher in self.publishers {
            manager = manager.with_publisher(&ca_name, publisher);
        }

        let (crl_signer, crl_signer_cert) = if self.indirect_crl_signer {
            let pool = Arc::new(
                SignerPool::build(
                    Arc::new(
                        OpenSslSignerFactory::new(
                            OpenSslKeyPair::build(KeyAlgorithm::Ec).unwrap(),
                        )
                        .unwrap(),
                    ),
                    2,
                    Duration::from_secs(10),
                )
                .unwrap(),
            );
            let cert = self_signed_ca_certificate(
                name("CN=CRL Signer,O=Example"),
                validity,
                store.next_serial().unwrap(),
                &pool,
            )
            .unwrap();
            (CrlSigner::new(pool, Some(cert.clone())), Some(cert))
        } else {
            (CrlSigner::new(signer.clone(), None), None)
        };

        let ca = X509Ca::build(
            info,
            store.clone(),
            signer,
            ProfileRegistry::from_configured(&self.profiles),
            Arc::new(manager),
            Some(crl_signer),
        )
        .unwrap();

        TestEnv { ca, store, gate, crl_signer_cert, signatures, signer_failing }
    }
}
