//! CRL control settings and the CRL structures produced by the engine.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::commons::util::ext_serde;
use crate::commons::{CaResult, Error};

use super::{CrlReason, SignatureAlgorithm, Serial, X500Name};


//------------ CrlNumber -----------------------------------------------------

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub struct CrlNumber(u64);

impl CrlNumber {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CrlNumber {
    fn from(v: u64) -> Self {
        CrlNumber(v)
    }
}

impl fmt::Display for CrlNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


//------------ CrlUpdateMode -------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrlUpdateMode {
    Interval,
    OnDemand,
}


//------------ CrlScope ------------------------------------------------------

/// Which kind of certificates a CRL covers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrlScope {
    All,
    CaCertsOnly,
    UserCertsOnly,
}


//------------ CrlControl ----------------------------------------------------

/// Controls when CRLs are generated and what goes into them.
///
/// Time is divided into intervals of `interval_minutes`. Every interval
/// whose number is a multiple of `full_crl_intervals` gets a full CRL,
/// every other interval whose number is a multiple of
/// `delta_crl_intervals` gets a delta CRL. A `delta_crl_intervals` of zero
/// disables delta CRLs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CrlControl {
    #[serde(default = "CrlControl::dflt_update_mode")]
    pub update_mode: CrlUpdateMode,

    #[serde(default = "CrlControl::dflt_full_crl_intervals")]
    pub full_crl_intervals: u64,

    #[serde(default)]
    pub delta_crl_intervals: u64,

    #[serde(default = "CrlControl::dflt_interval_minutes")]
    pub interval_minutes: u64,

    /// Aligns intervals to this time of day (UTC) when set.
    #[serde(default)]
    pub interval_day_time: Option<NaiveTime>,

    #[serde(default = "CrlControl::dflt_overlap_minutes")]
    pub overlap_minutes: i64,

    /// A delta CRL's nextUpdate points at the next full CRL.
    #[serde(default)]
    pub extended_next_update: bool,

    /// Embed the certificates themselves in full CRLs.
    #[serde(default)]
    pub include_certs: bool,

    #[serde(default)]
    pub include_expired_certs: bool,

    #[serde(default = "CrlControl::dflt_scope")]
    pub scope: CrlScope,
}

impl CrlControl {
    fn dflt_update_mode() -> CrlUpdateMode {
        CrlUpdateMode::Interval
    }

    fn dflt_full_crl_intervals() -> u64 {
        1
    }

    fn dflt_interval_minutes() -> u64 {
        24 * 60
    }

    fn dflt_overlap_minutes() -> i64 {
        10
    }

    fn dflt_scope() -> CrlScope {
        CrlScope::All
    }

    pub fn interval(&self) -> TimeDelta {
        TimeDelta::minutes(self.interval_minutes as i64)
    }

    pub fn overlap(&self) -> TimeDelta {
        TimeDelta::minutes(self.overlap_minutes)
    }

    pub fn delta_enabled(&self) -> bool {
        self.delta_crl_intervals > 0
    }

    pub fn verify(&self) -> Result<(), String> {
        if self.interval_minutes == 0 {
            return Err("CRL interval_minutes must be positive".to_string());
        }
        if self.full_crl_intervals == 0 {
            return Err("full_crl_intervals must be positive".to_string());
        }
        if self.delta_enabled() {
            if self.delta_crl_intervals >= self.full_crl_intervals {
                return Err(
                    "delta_crl_intervals must be smaller than full_crl_intervals"
                        .to_string(),
                );
            }
            if self.full_crl_intervals % self.delta_crl_intervals != 0 {
                return Err(
                    "full_crl_intervals must be a multiple of delta_crl_intervals"
                        .to_string(),
                );
            }
        }
        if self.overlap_minutes < 0 {
            return Err("overlap_minutes must not be negative".to_string());
        }
        if self.interval_day_time.is_some() && self.interval_minutes % (24 * 60) != 0 {
            return Err(
                "interval_day_time requires interval_minutes to be whole days"
                    .to_string(),
            );
        }
        Ok(())
    }
}

impl Default for CrlControl {
    fn default() -> Self {
        CrlControl {
            update_mode: Self::dflt_update_mode(),
            full_crl_intervals: Self::dflt_full_crl_intervals(),
            delta_crl_intervals: 0,
            interval_minutes: Self::dflt_interval_minutes(),
            interval_day_time: None,
            overlap_minutes: Self::dflt_overlap_minutes(),
            extended_next_update: false,
            include_certs: false,
            include_expired_certs: false,
            scope: Self::dflt_scope(),
        }
    }
}


//------------ RevokedEntry --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RevokedEntry {
    pub serial: Serial,
    pub revocation_date: DateTime<Utc>,
    pub reason: CrlReason,
    pub invalidity_date: Option<DateTime<Utc>>,

    /// Only present on the first entry of an indirect CRL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_issuer: Option<X500Name>,
}


//------------ CrlCertEntry --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CrlCertEntry {
    pub serial: Serial,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    pub encoded: Bytes,
}


//------------ IssuingDistributionPoint --------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct IssuingDistributionPoint {
    pub only_contains_ca_certs: bool,
    pub only_contains_user_certs: bool,
    pub indirect_crl: bool,
}

impl IssuingDistributionPoint {
    pub fn is_empty(&self) -> bool {
        !(self.only_contains_ca_certs
            || self.only_contains_user_certs
            || self.indirect_crl)
    }
}


//------------ TbsCrl --------------------------------------------------------

/// The to-be-signed part of a CRL.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TbsCrl {
    pub issuer: X500Name,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub entries: Vec<RevokedEntry>,
    pub crl_number: CrlNumber,

    /// Set for delta CRLs, the number of the full CRL it builds on.
    pub base_crl_number: Option<CrlNumber>,

    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    pub authority_key_id: Bytes,

    pub issuing_distribution_point: Option<IssuingDistributionPoint>,

    #[serde(default)]
    pub freshest_crl: Vec<String>,

    #[serde(default)]
    pub certs: Vec<CrlCertEntry>,
}

impl TbsCrl {
    pub fn encode(&self) -> CaResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::crl(format!("cannot encode CRL: {}", e)))
    }
}


//------------ X509Crl -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct X509Crl {
    tbs: TbsCrl,
    signature_algorithm: SignatureAlgorithm,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    signature: Bytes,
}

impl X509Crl {
    pub fn new(
        tbs: TbsCrl,
        signature_algorithm: SignatureAlgorithm,
        signature: Bytes,
    ) -> Self {
        X509Crl { tbs, signature_algorithm, signature }
    }

    pub fn tbs(&self) -> &TbsCrl {
        &self.tbs
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn encode(&self) -> CaResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::crl(format!("cannot encode CRL: {}", e)))
    }

    pub fn decode(data: &[u8]) -> CaResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::crl(format!("cannot decode CRL: {}", e)))
    }
}


//------------ CrlInfo -------------------------------------------------------

/// A generated CRL as it is kept in the store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CrlInfo {
    crl_number: CrlNumber,
    base_crl_number: Option<CrlNumber>,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    encoded: Bytes,
}

impl CrlInfo {
    pub fn new(crl: &X509Crl, encoded: Bytes) -> Self {
        CrlInfo {
            crl_number: crl.tbs().crl_number,
            base_crl_number: crl.tbs().base_crl_number,
            this_update: crl.tbs().this_update,
            next_update: crl.tbs().next_update,
            encoded,
        }
    }

    pub fn crl_number(&self) -> CrlNumber {
        self.crl_number
    }

    pub fn base_crl_number(&self) -> Option<CrlNumber> {
        self.base_crl_number
    }

    pub fn is_delta(&self) -> bool {
        self.base_crl_number.is_some()
    }

    pub fn this_update(&self) -> DateTime<Utc> {
        self.this_update
    }

    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }
}


//------------ Tests ---------------------------------------------------------
