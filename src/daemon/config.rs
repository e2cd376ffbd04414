use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use chrono::{DateTime, TimeDelta, Utc};
use log::{error, info, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::commons::api::{
    CaCertificate, CaInfo, CaName, CaUris, CrlControl, DuplicationMode,
    KeyAlgorithm, Permission, ValidityMode, X500Name,
};
use crate::commons::util::ext_serde;
use crate::constants::*;
use crate::profile::{ConfiguredProfile, ProfileRegistry};


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(CAENGINE_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        CAENGINE_ENV_LOG_LEVEL
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(CAENGINE_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log type in env var {}",
                        CAENGINE_ENV_LOG_TYPE
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LogType::File,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./caengine.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn master() -> bool {
        true
    }

    fn crl_tick_seconds() -> u64 {
        60
    }

    fn expired_certs_tick_seconds() -> u64 {
        60
    }

    fn publish_queue_tick_seconds() -> u64 {
        60
    }

    fn signer_pool_size() -> u32 {
        4
    }

    fn signer_borrow_timeout_seconds() -> u64 {
        30
    }

    fn serial_increment_max_attempts() -> u32 {
        SERIAL_INCREMENT_MAX_ATTEMPTS
    }

    fn key_algorithm() -> KeyAlgorithm {
        KeyAlgorithm::Ec
    }

    fn ca_validity_days() -> i64 {
        3650
    }

    fn max_validity_days() -> i64 {
        365
    }

    fn validity_mode() -> ValidityMode {
        ValidityMode::Strict
    }

    fn duplication_mode() -> DuplicationMode {
        DuplicationMode::Permitted
    }

    fn keep_expired_certs_days() -> i64 {
        DEFAULT_KEEP_EXPIRED_CERTS_DAYS
    }

    fn num_crls() -> usize {
        DEFAULT_NUM_CRLS
    }

    fn expired_certs_overlap_seconds() -> i64 {
        DEFAULT_EXPIRED_CERTS_OVERLAP_SECONDS
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the engine daemon.
///
/// Read from a TOML file, every setting but the `[ca]` section has a
/// default.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    syslog_facility: String,

    /// Where the CRL schedule is kept between restarts.
    pub state_dir: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::master")]
    pub master: bool,

    #[serde(default = "ConfigDefaults::crl_tick_seconds")]
    pub crl_tick_seconds: u64,

    #[serde(default = "ConfigDefaults::expired_certs_tick_seconds")]
    pub expired_certs_tick_seconds: u64,

    #[serde(default = "ConfigDefaults::publish_queue_tick_seconds")]
    pub publish_queue_tick_seconds: u64,

    #[serde(default = "ConfigDefaults::signer_pool_size")]
    pub signer_pool_size: u32,

    #[serde(default = "ConfigDefaults::signer_borrow_timeout_seconds")]
    pub signer_borrow_timeout_seconds: u64,

    #[serde(default = "ConfigDefaults::serial_increment_max_attempts")]
    pub serial_increment_max_attempts: u32,

    pub ca: CaConfig,

    #[serde(default)]
    pub profiles: Vec<ConfiguredProfile>,
}


//------------ CaConfig ------------------------------------------------------

/// The `[ca]` section.
#[derive(Clone, Debug, Deserialize)]
pub struct CaConfig {
    pub name: CaName,

    /// The subject of the self-signed CA certificate.
    pub subject: String,

    /// The PEM encoded private key, created if it does not exist.
    pub key_file: PathBuf,

    #[serde(default = "ConfigDefaults::key_algorithm")]
    pub key_algorithm: KeyAlgorithm,

    #[serde(default = "ConfigDefaults::ca_validity_days")]
    pub validity_days: i64,

    #[serde(default = "ConfigDefaults::max_validity_days")]
    pub max_validity_days: i64,

    #[serde(default = "ConfigDefaults::validity_mode")]
    pub validity_mode: ValidityMode,

    #[serde(default = "ConfigDefaults::duplication_mode")]
    pub duplicate_key_mode: DuplicationMode,

    #[serde(default = "ConfigDefaults::duplication_mode")]
    pub duplicate_subject_mode: DuplicationMode,

    #[serde(default)]
    pub no_new_certificate_after: Option<DateTime<Utc>>,

    #[serde(default = "ConfigDefaults::keep_expired_certs_days")]
    pub keep_expired_certs_days: i64,

    #[serde(default = "ConfigDefaults::num_crls")]
    pub num_crls: usize,

    #[serde(default = "ConfigDefaults::expired_certs_overlap_seconds")]
    pub expired_certs_overlap_seconds: i64,

    #[serde(default)]
    pub uris: CaUris,

    #[serde(default)]
    pub issuer_alt_names: Vec<String>,

    /// All permissions if not set.
    #[serde(default)]
    pub permissions: Option<HashSet<Permission>>,

    #[serde(default)]
    pub crl_control: Option<CrlControl>,
}

impl CaConfig {
    pub fn subject(&self) -> Result<X500Name, ConfigError> {
        X500Name::from_str(&self.subject).map_err(|e| {
            ConfigError::Other(format!("Invalid CA subject '{}': {}", self.subject, e))
        })
    }
}


//------------ Config: Loading -----------------------------------------------

impl Config {
    /// Reads, verifies and applies the config file at startup.
    pub fn create(config_file: &str) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == CAENGINE_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to specify its location.",
                    ))
                } else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file, e
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!("{} uses configuration file: {}", CAENGINE_SERVER_APP, config_file);
                Ok(config)
            }
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file, e
            ))
        })?;
        Ok(config)
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::from)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.signer_pool_size == 0 {
            return Err(ConfigError::other("signer_pool_size must be at least 1"));
        }
        if self.crl_tick_seconds == 0
            || self.expired_certs_tick_seconds == 0
            || self.publish_queue_tick_seconds == 0
        {
            return Err(ConfigError::other("tick intervals must be at least 1 second"));
        }
        if self.serial_increment_max_attempts == 0 {
            return Err(ConfigError::other(
                "serial_increment_max_attempts must be at least 1",
            ));
        }

        self.ca.subject()?;
        if self.ca.validity_days < 1 {
            return Err(ConfigError::other("ca.validity_days must be at least 1"));
        }
        if self.ca.max_validity_days < 1 {
            return Err(ConfigError::other("ca.max_validity_days must be at least 1"));
        }
        if self.ca.keep_expired_certs_days < 0 {
            return Err(ConfigError::other(
                "ca.keep_expired_certs_days must not be negative",
            ));
        }
        if self.ca.expired_certs_overlap_seconds < 0 {
            return Err(ConfigError::other(
                "ca.expired_certs_overlap_seconds must not be negative",
            ));
        }
        if self.ca.num_crls == 0 {
            return Err(ConfigError::other("ca.num_crls must be at least 1"));
        }
        if let Some(control) = &self.ca.crl_control {
            control.verify().map_err(ConfigError::Other)?;
        }

        let mut names = HashMap::new();
        for profile in &self.profiles {
            profile.verify().map_err(|e| {
                ConfigError::Other(format!("Invalid profile '{}': {}", profile.name, e))
            })?;
            if names.insert(profile.name.to_lowercase(), ()).is_some() {
                return Err(ConfigError::Other(format!(
                    "Duplicate profile '{}'",
                    profile.name
                )));
            }
        }
        if self.profiles.is_empty() {
            return Err(ConfigError::other("At least one profile must be configured"));
        }

        Ok(())
    }

    /// The CA settings for the given CA certificate.
    pub fn ca_info(&self, cert: CaCertificate) -> CaInfo {
        let ca = &self.ca;
        let mut info = CaInfo::new(ca.name.clone(), cert)
            .with_max_validity(TimeDelta::days(ca.max_validity_days))
            .with_validity_mode(ca.validity_mode)
            .with_duplicate_key_mode(ca.duplicate_key_mode)
            .with_duplicate_subject_mode(ca.duplicate_subject_mode)
            .with_uris(ca.uris.clone())
            .with_issuer_alt_names(ca.issuer_alt_names.clone())
            .with_keep_expired_certs_days(ca.keep_expired_certs_days)
            .with_expired_certs_overlap(TimeDelta::seconds(ca.expired_certs_overlap_seconds))
            .with_num_crls(ca.num_crls)
            .with_serial_increment_max_attempts(self.serial_increment_max_attempts);
        if let Some(cutoff) = ca.no_new_certificate_after {
            info = info.with_no_new_certificate_after(cutoff);
        }
        if let Some(permissions) = &ca.permissions {
            info = info.with_permissions(permissions.clone());
        }
        if let Some(control) = &ca.crl_control {
            info = info.with_crl_control(control.clone());
        }
        info
    }

    pub fn profile_registry(&self) -> ProfileRegistry {
        ProfileRegistry::from_configured(&self.profiles)
    }
}


//------------ Config: Logging -----------------------------------------------

impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other(
                "syslog is not supported on this platform",
            )),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string =
                    format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("caengine"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates a fern logger with the level tweaks applied.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target =
            self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("r2d2", framework_level)
            .level_for("tokio", framework_level)
            .level_for("mio", framework_level)
    }
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ Tests ---------------------------------------------------------
