//! Revocation reasons and revocation state of issued certificates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::IssuedCertificate;


//------------ CrlReason -----------------------------------------------------

/// The reason codes of RFC 5280, section 5.3.1.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CrlReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl CrlReason {
    pub fn code(self) -> u8 {
        match self {
            CrlReason::Unspecified => 0,
            CrlReason::KeyCompromise => 1,
            CrlReason::CaCompromise => 2,
            CrlReason::AffiliationChanged => 3,
            CrlReason::Superseded => 4,
            CrlReason::CessationOfOperation => 5,
            CrlReason::CertificateHold => 6,
            CrlReason::RemoveFromCrl => 8,
            CrlReason::PrivilegeWithdrawn => 9,
            CrlReason::AaCompromise => 10,
        }
    }

    /// Reasons which may only be used for the CA itself.
    pub fn is_ca_only(self) -> bool {
        matches!(
            self,
            CrlReason::CaCompromise
                | CrlReason::AaCompromise
                | CrlReason::RemoveFromCrl
        )
    }

    pub fn is_hold(self) -> bool {
        self == CrlReason::CertificateHold
    }

    fn name(self) -> &'static str {
        match self {
            CrlReason::Unspecified => "unspecified",
            CrlReason::KeyCompromise => "keyCompromise",
            CrlReason::CaCompromise => "cACompromise",
            CrlReason::AffiliationChanged => "affiliationChanged",
            CrlReason::Superseded => "superseded",
            CrlReason::CessationOfOperation => "cessationOfOperation",
            CrlReason::CertificateHold => "certificateHold",
            CrlReason::RemoveFromCrl => "removeFromCRL",
            CrlReason::PrivilegeWithdrawn => "privilegeWithdrawn",
            CrlReason::AaCompromise => "aACompromise",
        }
    }
}

impl fmt::Display for CrlReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CrlReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            CrlReason::Unspecified,
            CrlReason::KeyCompromise,
            CrlReason::CaCompromise,
            CrlReason::AffiliationChanged,
            CrlReason::Superseded,
            CrlReason::CessationOfOperation,
            CrlReason::CertificateHold,
            CrlReason::RemoveFromCrl,
            CrlReason::PrivilegeWithdrawn,
            CrlReason::AaCompromise,
        ];
        all.into_iter()
            .find(|r| {
                r.name().eq_ignore_ascii_case(s)
                    || u8::from_str(s).map(|c| c == r.code()).unwrap_or(false)
            })
            .ok_or_else(|| format!("unknown CRL reason '{}'", s))
    }
}


//------------ RevocationInfo ------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RevocationInfo {
    reason: CrlReason,
    revocation_time: DateTime<Utc>,
    invalidity_time: Option<DateTime<Utc>>,
}

impl RevocationInfo {
    pub fn new(
        reason: CrlReason,
        revocation_time: DateTime<Utc>,
        invalidity_time: Option<DateTime<Utc>>,
    ) -> Self {
        RevocationInfo { reason, revocation_time, invalidity_time }
    }

    pub fn reason(&self) -> CrlReason {
        self.reason
    }

    pub fn revocation_time(&self) -> DateTime<Utc> {
        self.revocation_time
    }

    pub fn invalidity_time(&self) -> Option<DateTime<Utc>> {
        self.invalidity_time
    }
}


//------------ CertStatus ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertStatus {
    Good,
    Revoked(CrlReason),
}


//------------ CertWithRevocationInfo ----------------------------------------

/// An issued certificate together with its current revocation state.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertWithRevocationInfo {
    cert: IssuedCertificate,
    revocation: Option<RevocationInfo>,
}

impl CertWithRevocationInfo {
    pub fn new(cert: IssuedCertificate, revocation: Option<RevocationInfo>) -> Self {
        CertWithRevocationInfo { cert, revocation }
    }

    pub fn cert(&self) -> &IssuedCertificate {
        &self.cert
    }

    pub fn revocation(&self) -> Option<&RevocationInfo> {
        self.revocation.as_ref()
    }

    pub fn status(&self) -> CertStatus {
        match &self.revocation {
            None => CertStatus::Good,
            Some(info) => CertStatus::Revoked(info.reason()),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn into_cert(self) -> IssuedCertificate {
        self.cert
    }
}


//------------ Tests ---------------------------------------------------------
