//! Certificate profiles decide what goes into a certificate.
//!
//! The engine decides *whether* and *when* a certificate is issued. What the
//! certificate contains (the granted subject, key constraints and the
//! extensions) is delegated to a [`CertProfile`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::TimeDelta;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::commons::api::{
    oid, Extension, ExtensionValue, KeyAlgorithm, Oid, RdnType,
    SubjectPublicKeyInfo, X500Name,
};
use crate::commons::{CaResult, Error};


//------------ SerialNumberMode ----------------------------------------------

/// Whether a `serialNumber` RDN may appear in the subject.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialNumberMode {
    #[default]
    Denied,
    Allowed,

    /// The engine appends an incrementing `serialNumber` RDN when the
    /// subject would otherwise be a duplicate.
    AutoIncrement,
}


//------------ SpecialBehavior -----------------------------------------------

/// Limits the total lifetime of all certificates issued for one common name.
///
/// The first certificate issued for a common name starts the clock. No
/// later certificate for it is valid beyond that start plus `max_lifetime`,
/// and every granted common name carries a `-YYYYMMDD` suffix with the
/// start date.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpecialBehavior {
    pub max_lifetime: TimeDelta,
}


//------------ ExtensionControl ----------------------------------------------

/// How the engine handles one of the extensions it produces itself.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExtensionControl {
    pub oid: Oid,

    #[serde(default)]
    pub critical: bool,

    /// Fail issuance if the extension cannot be produced.
    #[serde(default)]
    pub required: bool,
}

impl ExtensionControl {
    pub fn new(oid: &str, critical: bool, required: bool) -> Self {
        ExtensionControl { oid: Oid::from(oid), critical, required }
    }
}


//------------ Granted -------------------------------------------------------

/// A value granted by a profile, possibly with a warning for the requestor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Granted<T> {
    pub value: T,
    pub warning: Option<String>,
}

impl<T> Granted<T> {
    pub fn new(value: T, warning: Option<String>) -> Self {
        Granted { value, warning }
    }
}


//------------ CertProfile ---------------------------------------------------

pub trait CertProfile: Send + Sync {
    fn name(&self) -> &str;

    /// Only registration authorities may request certificates.
    fn is_ra_only(&self) -> bool;

    /// Issues CA certificates.
    fn is_ca(&self) -> bool;

    fn serial_number_mode(&self) -> SerialNumberMode;

    fn duplicate_key_permitted(&self) -> bool;

    fn duplicate_subject_permitted(&self) -> bool;

    /// The validity of issued certificates, the CA default if None.
    fn validity(&self) -> Option<TimeDelta>;

    /// notBefore snaps to midnight and notAfter to the end of a day.
    fn has_midnight_not_before(&self) -> bool;

    fn special_behavior(&self) -> Option<SpecialBehavior>;

    /// The engine produced extensions to include.
    fn extension_controls(&self) -> &[ExtensionControl];

    fn check_public_key(&self, key: &SubjectPublicKeyInfo) -> CaResult<()>;

    fn grant_subject(&self, requested: &X500Name) -> CaResult<Granted<X500Name>>;

    fn extensions_for(
        &self,
        subject: &X500Name,
        requested: &[Extension],
    ) -> CaResult<Granted<Vec<Extension>>>;
}


//------------ ConfiguredProfile ---------------------------------------------

/// A profile defined in the configuration file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfiguredProfile {
    pub name: String,

    #[serde(default)]
    pub ra_only: bool,

    #[serde(default)]
    pub ca: bool,

    #[serde(default)]
    pub validity_days: Option<i64>,

    #[serde(default)]
    pub not_before_midnight: bool,

    #[serde(default)]
    pub serial_number: SerialNumberMode,

    #[serde(default)]
    pub duplicate_key_permitted: bool,

    #[serde(default)]
    pub duplicate_subject_permitted: bool,

    #[serde(default = "ConfiguredProfile::dflt_key_algorithms")]
    pub key_algorithms: Vec<KeyAlgorithm>,

    #[serde(default = "ConfiguredProfile::dflt_min_rsa_bits")]
    pub min_rsa_bits: u32,

    #[serde(default = "ConfiguredProfile::dflt_required_rdns")]
    pub required_rdns: Vec<String>,

    /// RDN types kept in the granted subject. All types are kept if empty.
    #[serde(default)]
    pub allowed_rdns: Vec<String>,

    /// Requested extensions that are copied into the certificate.
    #[serde(default)]
    pub allowed_extensions: Vec<Oid>,

    #[serde(default = "ConfiguredProfile::dflt_extensions")]
    pub extensions: Vec<ExtensionControl>,

    #[serde(default)]
    pub max_lifetime_days: Option<i64>,
}

impl ConfiguredProfile {
    fn dflt_key_algorithms() -> Vec<KeyAlgorithm> {
        vec![KeyAlgorithm::Rsa, KeyAlgorithm::Ec, KeyAlgorithm::Ed25519]
    }

    fn dflt_min_rsa_bits() -> u32 {
        2048
    }

    fn dflt_required_rdns() -> Vec<String> {
        vec!["CN".to_string()]
    }

    fn dflt_extensions() -> Vec<ExtensionControl> {
        vec![
            ExtensionControl::new(oid::SUBJECT_KEY_IDENTIFIER, false, true),
            ExtensionControl::new(oid::AUTHORITY_KEY_IDENTIFIER, false, true),
            ExtensionControl::new(oid::AUTHORITY_INFO_ACCESS, false, false),
            ExtensionControl::new(oid::CRL_DISTRIBUTION_POINTS, false, false),
            ExtensionControl::new(oid::FRESHEST_CRL, false, false),
        ]
    }

    /// A profile with defaults for everything but the name.
    pub fn named(name: &str) -> Self {
        ConfiguredProfile {
            name: name.to_string(),
            ra_only: false,
            ca: false,
            validity_days: None,
            not_before_midnight: false,
            serial_number: SerialNumberMode::default(),
            duplicate_key_permitted: false,
            duplicate_subject_permitted: false,
            key_algorithms: Self::dflt_key_algorithms(),
            min_rsa_bits: Self::dflt_min_rsa_bits(),
            required_rdns: Self::dflt_required_rdns(),
            allowed_rdns: vec![],
            allowed_extensions: vec![],
            extensions: Self::dflt_extensions(),
            max_lifetime_days: None,
        }
    }

    pub fn verify(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("profile name must not be empty".to_string());
        }
        if matches!(self.validity_days, Some(days) if days <= 0) {
            return Err(format!("profile '{}': validity_days must be positive", self.name));
        }
        if matches!(self.max_lifetime_days, Some(days) if days <= 0) {
            return Err(format!(
                "profile '{}': max_lifetime_days must be positive",
                self.name
            ));
        }
        if self.key_algorithms.is_empty() {
            return Err(format!("profile '{}': no key algorithms allowed", self.name));
        }
        for rdn in self.required_rdns.iter().chain(self.allowed_rdns.iter()) {
            RdnType::from_str(rdn).map_err(|e| format!("profile '{}': {}", self.name, e))?;
        }
        Ok(())
    }

    fn parse_rdns(names: &[String]) -> Vec<RdnType> {
        names.iter().filter_map(|name| RdnType::from_str(name).ok()).collect()
    }
}

impl CertProfile for ConfiguredProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ra_only(&self) -> bool {
        self.ra_only
    }

    fn is_ca(&self) -> bool {
        self.ca
    }

    fn serial_number_mode(&self) -> SerialNumberMode {
        self.serial_number
    }

    fn duplicate_key_permitted(&self) -> bool {
        self.duplicate_key_permitted
    }

    fn duplicate_subject_permitted(&self) -> bool {
        self.duplicate_subject_permitted
    }

    fn validity(&self) -> Option<TimeDelta> {
        self.validity_days.map(TimeDelta::days)
    }

    fn has_midnight_not_before(&self) -> bool {
        self.not_before_midnight
    }

    fn special_behavior(&self) -> Option<SpecialBehavior> {
        self.max_lifetime_days.map(|days| SpecialBehavior {
            max_lifetime: TimeDelta::days(days),
        })
    }

    fn extension_controls(&self) -> &[ExtensionControl] {
        &self.extensions
    }

    fn check_public_key(&self, key: &SubjectPublicKeyInfo) -> CaResult<()> {
        if !self.key_algorithms.contains(&key.algorithm()) {
            return Err(Error::bad_template(format!(
                "key algorithm {} is not allowed by profile '{}'",
                key.algorithm(),
                self.name
            )));
        }
        if key.algorithm() == KeyAlgorithm::Rsa && key.bits() < self.min_rsa_bits {
            return Err(Error::bad_template(format!(
                "RSA key of {} bits is shorter than the {} bits required",
                key.bits(),
                self.min_rsa_bits
            )));
        }
        Ok(())
    }

    fn grant_subject(&self, requested: &X500Name) -> CaResult<Granted<X500Name>> {
        for kind in Self::parse_rdns(&self.required_rdns) {
            if !requested.contains(&kind) {
                return Err(Error::bad_template(format!(
                    "required RDN {} is missing from subject",
                    kind
                )));
            }
        }

        let allowed = Self::parse_rdns(&self.allowed_rdns);
        if allowed.is_empty() {
            return Ok(Granted::new(requested.clone(), None));
        }

        let mut subject = requested.clone();
        let mut removed = vec![];
        for rdn in requested.rdns() {
            if !allowed.contains(rdn.kind()) {
                subject = subject.without(rdn.kind());
                removed.push(rdn.kind().to_string());
            }
        }
        let warning = if removed.is_empty() {
            None
        } else {
            debug!("Profile '{}' removed RDNs {:?}", self.name, removed);
            Some(format!("subject RDNs removed: {}", removed.join(",")))
        };
        Ok(Granted::new(subject, warning))
    }

    fn extensions_for(
        &self,
        _subject: &X500Name,
        requested: &[Extension],
    ) -> CaResult<Granted<Vec<Extension>>> {
        let mut extensions = vec![];
        let mut dropped = vec![];

        if self.ca {
            extensions.push(Extension::new(
                oid::BASIC_CONSTRAINTS,
                true,
                ExtensionValue::Flag(true),
            ));
        }

        for ext in requested {
            if self.allowed_extensions.contains(ext.oid()) {
                extensions.push(ext.clone());
            } else {
                dropped.push(ext.oid().to_string());
            }
        }

        let warning = if dropped.is_empty() {
            None
        } else {
            Some(format!("requested extensions not permitted: {}", dropped.join(",")))
        };
        Ok(Granted::new(extensions, warning))
    }
}


//------------ ProfileRegistry -----------------------------------------------

#[derive(Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<dyn CertProfile>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configured(profiles: &[ConfiguredProfile]) -> Self {
        let mut registry = Self::new();
        for profile in profiles {
            registry.register(Arc::new(profile.clone()));
        }
        registry
    }

    pub fn register(&mut self, profile: Arc<dyn CertProfile>) {
        self.profiles.insert(profile.name().to_ascii_lowercase(), profile);
    }

    /// Looks up a profile, ignoring case.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CertProfile>> {
        self.profiles.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.values().map(|p| p.name().to_string()).collect();
        names.sort();
        names
    }
}


//------------ Tests ---------------------------------------------------------
