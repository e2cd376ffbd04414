//! Various engine-wide constants.

use std::time::Duration;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `caengine` binary.
pub const CAENGINE_SERVER_APP: &str = "CA Engine";

/// The version of this crate.
pub const CAENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the engine config file.
pub const CAENGINE_DEFAULT_CONFIG_FILE: &str = "/etc/caengine.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const CAENGINE_ENV_LOG_LEVEL: &str = "CAENGINE_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::daemon::config::LogType]. It will be overwritten by
/// the config file. The default is “file.”
pub const CAENGINE_ENV_LOG_TYPE: &str = "CAENGINE_LOG_TYPE";


//------------ Logging -------------------------------------------------------

/// The log target used for audit events.
pub const AUDIT_LOG_TARGET: &str = "caengine::audit";


//------------ Issuance ------------------------------------------------------

/// The number of attempts made to find a unique subject by appending an
/// incrementing serialNumber RDN.
pub const SERIAL_INCREMENT_MAX_ATTEMPTS: u32 = 100;

/// How long the republisher waits between checks for in-flight requests.
pub const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_secs(1);


//------------ Batches -------------------------------------------------------

/// Page size used when walking revoked certificates for a CRL.
pub const CRL_ENTRY_BATCH_SIZE: usize = 1000;

/// Page size used when embedding certificates in a full CRL.
pub const CRL_CERT_BATCH_SIZE: usize = 100;

/// Page size used when walking expired certificates for removal.
pub const REMOVE_EXPIRED_BATCH_SIZE: usize = 100;

/// Page size used when republishing certificates.
pub const REPUBLISH_BATCH_SIZE: usize = 100;

/// Page size used when draining a publisher's retry queue.
pub const PUBLISH_QUEUE_BATCH_SIZE: usize = 100;


//------------ CRLs ----------------------------------------------------------

/// The minimum distance between `thisUpdate` and `nextUpdate` of a CRL.
pub const CRL_MIN_VALIDITY_SECONDS: i64 = 60;

/// Certificates which expired less than this long ago are still listed
/// on a full CRL.
pub const CRL_EXPIRED_CERT_BUFFER_SECONDS: i64 = 10 * 60;


//------------ Defaults ------------------------------------------------------

/// Default number of seconds subtracted from the removal cutoff.
pub const DEFAULT_EXPIRED_CERTS_OVERLAP_SECONDS: i64 = 24 * 3600;

/// Default number of days expired certificates are kept.
pub const DEFAULT_KEEP_EXPIRED_CERTS_DAYS: i64 = 365;

/// Default number of CRLs kept in the store.
pub const DEFAULT_NUM_CRLS: usize = 30;
