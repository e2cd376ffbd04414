//! The certificate store contract.
//!
//! The engine never talks to a database directly. Everything it persists
//! (issued certificates, revocation state, CRLs, the per-publisher retry
//! queue and the delta CRL cache) goes through [`CertificateStore`]. All
//! methods may be called concurrently from several threads.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::commons::api::{
    CertWithRevocationInfo, CrlInfo, CrlNumber, CrlScope, Fingerprint,
    IssuedCertificate, RevocationInfo, Serial,
};

mod memory;
pub use self::memory::MemoryCertStore;

pub type StoreResult<T> = Result<T, StoreError>;


//------------ StoreError ----------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    NotFound(Serial),
    Duplicate(Serial),
    Other(String),
}

impl StoreError {
    pub fn other(msg: impl fmt::Display) -> Self {
        StoreError::Other(msg.to_string())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NotFound(serial) => {
                write!(f, "no certificate with serial {}", serial)
            }
            StoreError::Duplicate(serial) => {
                write!(f, "a certificate with serial {} already exists", serial)
            }
            StoreError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for StoreError {}


//------------ SerialFilter --------------------------------------------------

/// Narrows a serial number scan.
#[derive(Clone, Debug, Default)]
pub struct SerialFilter {
    pub revoked_only: bool,

    /// Only certificates whose notAfter lies before this time.
    pub expired_before: Option<DateTime<Utc>>,

    pub profile: Option<String>,

    /// A SQL LIKE pattern (`%` and `_`) matched against the requestor.
    pub user_like: Option<String>,
}


//------------ IssuedQuery ---------------------------------------------------

/// Looks up previously issued certificates by fingerprint.
///
/// Unset fields match everything. If several certificates match, the one
/// with the lowest serial is returned.
#[derive(Clone, Copy, Debug, Default)]
pub struct IssuedQuery<'a> {
    pub subject: Option<Fingerprint>,
    pub key: Option<Fingerprint>,
    pub profile: Option<&'a str>,
}


//------------ RevokedCertInfo -----------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevokedCertInfo {
    pub serial: Serial,
    pub revocation: RevocationInfo,
    pub not_after: DateTime<Utc>,
    pub ca: bool,
}


//------------ CertificateStore ----------------------------------------------

pub trait CertificateStore: Send + Sync {
    //--- Numbers

    /// Allocates the next serial number. Never returns a number twice.
    fn next_serial(&self) -> StoreResult<Serial>;

    /// The number the next CRL gets: one more than the highest CRL number
    /// ever stored.
    ///
    /// Nothing is reserved. The number is only used up once a CRL carrying
    /// it is passed to `add_crl`, so callers must not generate CRLs
    /// concurrently.
    fn next_crl_number(&self) -> StoreResult<CrlNumber>;

    //--- Certificates

    fn add_certificate(&self, cert: &IssuedCertificate) -> StoreResult<()>;

    fn get_cert_with_revocation_info(
        &self,
        serial: Serial,
    ) -> StoreResult<Option<CertWithRevocationInfo>>;

    fn find_issued(
        &self,
        query: IssuedQuery,
    ) -> StoreResult<Option<CertWithRevocationInfo>>;

    /// The earliest notBefore of any certificate issued under `profile`
    /// whose requested subject carried the common name `cn`.
    fn earliest_not_before(
        &self,
        cn: &str,
        profile: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Sets the revocation information, replacing any earlier one.
    fn revoke_cert(
        &self,
        serial: Serial,
        revocation: RevocationInfo,
    ) -> StoreResult<CertWithRevocationInfo>;

    fn unrevoke_cert(&self, serial: Serial) -> StoreResult<CertWithRevocationInfo>;

    /// Deletes the certificate and any publish queue entries for it.
    fn remove_cert(&self, serial: Serial) -> StoreResult<()>;

    /// Returns up to `limit` serials greater than `after`, ascending.
    fn get_serials(
        &self,
        after: Option<Serial>,
        limit: usize,
        filter: &SerialFilter,
    ) -> StoreResult<Vec<Serial>>;

    fn count_serials(&self, filter: &SerialFilter) -> StoreResult<usize>;

    /// Returns up to `limit` revoked certificates with a serial greater than
    /// `after` which did not expire before `not_expired_before`, ascending.
    fn get_revoked_certs(
        &self,
        not_expired_before: DateTime<Utc>,
        after: Option<Serial>,
        limit: usize,
        scope: CrlScope,
    ) -> StoreResult<Vec<RevokedCertInfo>>;

    /// Whether any CA (`ca` is true) or end entity certificates exist.
    fn has_certs_of_type(&self, ca: bool) -> StoreResult<bool>;

    /// Returns up to `limit` certificates with a serial greater than
    /// `after`, ascending. Certificates that expired before
    /// `not_expired_before` are skipped if it is set.
    fn get_certs(
        &self,
        after: Option<Serial>,
        limit: usize,
        not_expired_before: Option<DateTime<Utc>>,
        scope: CrlScope,
    ) -> StoreResult<Vec<IssuedCertificate>>;

    //--- CRLs

    /// Stores a CRL. Fails if its number is not above every number
    /// stored before.
    fn add_crl(&self, crl: CrlInfo) -> StoreResult<()>;

    fn get_crl(&self, crl_number: CrlNumber) -> StoreResult<Option<CrlInfo>>;

    /// The most recent full or delta CRL.
    fn get_latest_crl(&self, delta: bool) -> StoreResult<Option<CrlInfo>>;

    fn max_full_crl_number(&self) -> StoreResult<Option<CrlNumber>>;

    /// Keeps the `keep` most recent full CRLs and the deltas based on
    /// them, deleting the rest. Returns the number of deleted CRLs.
    fn cleanup_crls(&self, keep: usize) -> StoreResult<usize>;

    //--- Publish queue

    fn add_to_publish_queue(&self, publisher: &str, serial: Serial) -> StoreResult<()>;

    fn remove_from_publish_queue(&self, publisher: &str, serial: Serial) -> StoreResult<()>;

    /// Returns up to `limit` queued serials for `publisher`, ascending.
    fn get_publish_queue_entries(
        &self,
        publisher: &str,
        limit: usize,
    ) -> StoreResult<Vec<Serial>>;

    /// Clears the queue of one publisher, or of all if `publisher` is None.
    fn clear_publish_queue(&self, publisher: Option<&str>) -> StoreResult<()>;

    //--- Delta CRL cache

    fn add_to_delta_crl_cache(&self, serial: Serial) -> StoreResult<()>;

    /// Distinct serials in the cache greater than `after`, ascending.
    fn get_delta_crl_cache(
        &self,
        after: Option<Serial>,
        limit: usize,
    ) -> StoreResult<Vec<Serial>>;

    /// The id of the newest cache entry, if any.
    fn max_delta_crl_cache_id(&self) -> StoreResult<Option<u64>>;

    /// Deletes all cache entries with an id up to and including `id`.
    fn clear_delta_crl_cache(&self, id: u64) -> StoreResult<()>;
}
