//! The CA itself: identity, policy and mutable runtime state.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::commons::{CaResult, Error};
use crate::constants::{
    DEFAULT_EXPIRED_CERTS_OVERLAP_SECONDS, DEFAULT_KEEP_EXPIRED_CERTS_DAYS,
    DEFAULT_NUM_CRLS, SERIAL_INCREMENT_MAX_ATTEMPTS,
};

use super::{
    Certificate, CrlControl, RevocationInfo, Serial, SubjectPublicKeyInfo,
    Validity, X500Name,
};


//------------ CaName --------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct CaName(String);

impl CaName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CaName {
    fn from(s: &str) -> Self {
        CaName(s.to_string())
    }
}

impl FromStr for CaName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            Err(format!("invalid CA name '{}'", s))
        } else {
            Ok(CaName(s.to_string()))
        }
    }
}

impl fmt::Display for CaName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ CaStatus ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaStatus {
    Active,
    Inactive,
}


//------------ ValidityMode --------------------------------------------------

/// What to do with a certificate that would outlive the CA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityMode {
    /// Refuse to issue.
    Strict,

    /// Issue anyway.
    Lax,

    /// Truncate to the CA's notAfter.
    Cutoff,
}


//------------ DuplicationMode -----------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicationMode {
    Permitted,
    Forbidden,
    ForbiddenWithinProfile,
}


//------------ Permission ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    EnrollCert,
    RevokeCert,
    UnrevokeCert,
    RemoveCert,
    GenCrl,
}

impl Permission {
    pub fn all() -> HashSet<Permission> {
        [
            Permission::EnrollCert,
            Permission::RevokeCert,
            Permission::UnrevokeCert,
            Permission::RemoveCert,
            Permission::GenCrl,
        ]
        .into_iter()
        .collect()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Permission::EnrollCert => "enroll_cert",
            Permission::RevokeCert => "revoke_cert",
            Permission::UnrevokeCert => "unrevoke_cert",
            Permission::RemoveCert => "remove_cert",
            Permission::GenCrl => "gen_crl",
        };
        f.write_str(s)
    }
}


//------------ CaUris --------------------------------------------------------

/// URIs embedded into issued certificates.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CaUris {
    #[serde(default)]
    pub ocsp: Vec<String>,

    #[serde(default)]
    pub ca_issuers: Vec<String>,

    #[serde(default)]
    pub crl: Vec<String>,

    #[serde(default)]
    pub delta_crl: Vec<String>,
}


//------------ CaCertificate -------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaCertificate {
    certificate: Certificate,
    encoded: Bytes,
}

impl CaCertificate {
    pub fn new(certificate: Certificate) -> CaResult<Self> {
        let encoded = certificate.encode()?;
        Ok(CaCertificate { certificate, encoded })
    }

    pub fn decode(encoded: Bytes) -> CaResult<Self> {
        let certificate = Certificate::decode(&encoded)?;
        Ok(CaCertificate { certificate, encoded })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    pub fn serial(&self) -> Serial {
        self.certificate.tbs().serial()
    }

    pub fn subject(&self) -> &X500Name {
        self.certificate.tbs().subject()
    }

    pub fn validity(&self) -> Validity {
        self.certificate.tbs().validity()
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfo {
        self.certificate.tbs().public_key()
    }

    pub fn key_identifier(&self) -> Bytes {
        self.public_key().key_identifier()
    }

    pub fn is_self_signed(&self) -> bool {
        self.certificate.tbs().issuer() == self.certificate.tbs().subject()
    }
}


//------------ CrlIntervalState ----------------------------------------------

/// Where the CRL scheduler left off.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CrlIntervalState {
    pub last_interval: u64,
    pub last_interval_date: Option<DateTime<Utc>>,
}


//------------ CaInfo --------------------------------------------------------

/// Everything the engine knows about the CA it issues for.
#[derive(Clone, Debug)]
pub struct CaInfo {
    name: CaName,
    cert: CaCertificate,
    max_validity: TimeDelta,
    validity_mode: ValidityMode,
    duplicate_key_mode: DuplicationMode,
    duplicate_subject_mode: DuplicationMode,
    no_new_certificate_after: Option<DateTime<Utc>>,
    status: CaStatus,
    revocation: Option<RevocationInfo>,
    permissions: HashSet<Permission>,
    uris: CaUris,
    issuer_alt_names: Vec<String>,
    crl_control: Option<CrlControl>,
    keep_expired_certs_days: i64,
    expired_certs_overlap: TimeDelta,
    num_crls: usize,
    serial_increment_max_attempts: u32,
    crl_interval: CrlIntervalState,
}

impl CaInfo {
    pub fn new(name: CaName, cert: CaCertificate) -> Self {
        CaInfo {
            name,
            cert,
            max_validity: TimeDelta::days(365),
            validity_mode: ValidityMode::Strict,
            duplicate_key_mode: DuplicationMode::Permitted,
            duplicate_subject_mode: DuplicationMode::Permitted,
            no_new_certificate_after: None,
            status: CaStatus::Active,
            revocation: None,
            permissions: Permission::all(),
            uris: CaUris::default(),
            issuer_alt_names: vec![],
            crl_control: None,
            keep_expired_certs_days: DEFAULT_KEEP_EXPIRED_CERTS_DAYS,
            expired_certs_overlap: TimeDelta::seconds(DEFAULT_EXPIRED_CERTS_OVERLAP_SECONDS),
            num_crls: DEFAULT_NUM_CRLS,
            serial_increment_max_attempts: SERIAL_INCREMENT_MAX_ATTEMPTS,
            crl_interval: CrlIntervalState::default(),
        }
    }

    pub fn with_max_validity(mut self, max_validity: TimeDelta) -> Self {
        self.max_validity = max_validity;
        self
    }

    pub fn with_validity_mode(mut self, mode: ValidityMode) -> Self {
        self.validity_mode = mode;
        self
    }

    pub fn with_duplicate_key_mode(mut self, mode: DuplicationMode) -> Self {
        self.duplicate_key_mode = mode;
        self
    }

    pub fn with_duplicate_subject_mode(mut self, mode: DuplicationMode) -> Self {
        self.duplicate_subject_mode = mode;
        self
    }

    pub fn with_no_new_certificate_after(mut self, cutoff: DateTime<Utc>) -> Self {
        self.no_new_certificate_after = Some(cutoff);
        self
    }

    pub fn with_permissions(mut self, permissions: HashSet<Permission>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_uris(mut self, uris: CaUris) -> Self {
        self.uris = uris;
        self
    }

    pub fn with_issuer_alt_names(mut self, names: Vec<String>) -> Self {
        self.issuer_alt_names = names;
        self
    }

    pub fn with_crl_control(mut self, control: CrlControl) -> Self {
        self.crl_control = Some(control);
        self
    }

    pub fn with_keep_expired_certs_days(mut self, days: i64) -> Self {
        self.keep_expired_certs_days = days;
        self
    }

    pub fn with_expired_certs_overlap(mut self, overlap: TimeDelta) -> Self {
        self.expired_certs_overlap = overlap;
        self
    }

    pub fn with_num_crls(mut self, num_crls: usize) -> Self {
        self.num_crls = num_crls;
        self
    }

    pub fn with_serial_increment_max_attempts(mut self, attempts: u32) -> Self {
        self.serial_increment_max_attempts = attempts;
        self
    }

    pub fn with_crl_interval(mut self, state: CrlIntervalState) -> Self {
        self.crl_interval = state;
        self
    }
}

impl CaInfo {
    pub fn name(&self) -> &CaName {
        &self.name
    }

    pub fn cert(&self) -> &CaCertificate {
        &self.cert
    }

    pub fn subject(&self) -> &X500Name {
        self.cert.subject()
    }

    pub fn validity(&self) -> Validity {
        self.cert.validity()
    }

    pub fn max_validity(&self) -> TimeDelta {
        self.max_validity
    }

    pub fn validity_mode(&self) -> ValidityMode {
        self.validity_mode
    }

    pub fn duplicate_key_mode(&self) -> DuplicationMode {
        self.duplicate_key_mode
    }

    pub fn duplicate_subject_mode(&self) -> DuplicationMode {
        self.duplicate_subject_mode
    }

    pub fn no_new_certificate_after(&self) -> Option<DateTime<Utc>> {
        self.no_new_certificate_after
    }

    pub fn status(&self) -> CaStatus {
        self.status
    }

    pub fn revocation(&self) -> Option<&RevocationInfo> {
        self.revocation.as_ref()
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn check_permission(&self, permission: Permission) -> CaResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(Error::InsufficientPermission(format!(
                "CA '{}' lacks permission {}",
                self.name, permission
            )))
        }
    }

    pub fn uris(&self) -> &CaUris {
        &self.uris
    }

    pub fn issuer_alt_names(&self) -> &[String] {
        &self.issuer_alt_names
    }

    pub fn crl_control(&self) -> Option<&CrlControl> {
        self.crl_control.as_ref()
    }

    pub fn keep_expired_certs_days(&self) -> i64 {
        self.keep_expired_certs_days
    }

    pub fn expired_certs_overlap(&self) -> TimeDelta {
        self.expired_certs_overlap
    }

    pub fn num_crls(&self) -> usize {
        self.num_crls
    }

    pub fn serial_increment_max_attempts(&self) -> u32 {
        self.serial_increment_max_attempts
    }

    pub fn crl_interval(&self) -> CrlIntervalState {
        self.crl_interval
    }
}

impl CaInfo {
    pub fn set_status(&mut self, status: CaStatus) {
        self.status = status;
    }

    pub fn set_revocation(&mut self, revocation: Option<RevocationInfo>) {
        self.revocation = revocation;
    }

    pub fn set_crl_interval(&mut self, state: CrlIntervalState) {
        self.crl_interval = state;
    }
}
