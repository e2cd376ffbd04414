//! Certificate related data types: names, keys, extensions, requests and
//! the certificates themselves.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use openssl::pkey::{Id, PKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::commons::util::ext_serde;
use crate::commons::{CaResult, Error};


//------------ Serial --------------------------------------------------------

/// A certificate serial number.
///
/// Serial numbers are assigned by the certificate store and are strictly
/// increasing per CA.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub struct Serial(u64);

impl Serial {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Serial(self.0 + 1)
    }
}

impl From<u64> for Serial {
    fn from(v: u64) -> Self {
        Serial(v)
    }
}

impl FromStr for Serial {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(Serial)
            .map_err(|_| format!("invalid serial number: {}", s))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}


//------------ Fingerprint ---------------------------------------------------

/// A short hash of a subject name or public key used as a lookup key.
///
/// This is the first eight octets of the SHA-256 digest of the input.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        let digest = openssl::sha::sha256(data);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_be_bytes(head))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}


//------------ RdnType -------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RdnType {
    CommonName,
    SerialNumber,
    Country,
    Organization,
    OrganizationalUnit,
    Locality,
    State,
    Email,
    Other(String),
}

impl RdnType {
    fn short_name(&self) -> &str {
        match self {
            RdnType::CommonName => "CN",
            RdnType::SerialNumber => "SERIALNUMBER",
            RdnType::Country => "C",
            RdnType::Organization => "O",
            RdnType::OrganizationalUnit => "OU",
            RdnType::Locality => "L",
            RdnType::State => "ST",
            RdnType::Email => "E",
            RdnType::Other(name) => name.as_str(),
        }
    }
}

impl FromStr for RdnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty RDN attribute type".to_string());
        }
        Ok(match s.to_ascii_uppercase().as_str() {
            "CN" => RdnType::CommonName,
            "SERIALNUMBER" | "SN" => RdnType::SerialNumber,
            "C" => RdnType::Country,
            "O" => RdnType::Organization,
            "OU" => RdnType::OrganizationalUnit,
            "L" => RdnType::Locality,
            "ST" => RdnType::State,
            "E" | "EMAIL" => RdnType::Email,
            _ => RdnType::Other(s.to_string()),
        })
    }
}

impl fmt::Display for RdnType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.short_name())
    }
}


//------------ Rdn -----------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Rdn {
    kind: RdnType,
    value: String,
}

impl Rdn {
    pub fn new(kind: RdnType, value: impl Into<String>) -> Self {
        Rdn { kind, value: value.into() }
    }

    pub fn kind(&self) -> &RdnType {
        &self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}


//------------ X500Name ------------------------------------------------------

/// A distinguished name, kept as an ordered list of RDNs.
///
/// The textual form is `TYPE=value` pairs separated by commas, for example
/// `CN=host.example.com,O=Example,C=NL`.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct X500Name(Vec<Rdn>);

impl X500Name {
    pub fn new(rdns: Vec<Rdn>) -> Self {
        X500Name(rdns)
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy without RDNs that have an empty value.
    pub fn normalize(&self) -> Self {
        X500Name(
            self.0
                .iter()
                .filter(|rdn| !rdn.value.trim().is_empty())
                .map(|rdn| Rdn::new(rdn.kind.clone(), rdn.value.trim()))
                .collect(),
        )
    }

    pub fn first(&self, kind: &RdnType) -> Option<&str> {
        self.0
            .iter()
            .find(|rdn| &rdn.kind == kind)
            .map(|rdn| rdn.value.as_str())
    }

    pub fn common_name(&self) -> Option<&str> {
        self.first(&RdnType::CommonName)
    }

    pub fn contains(&self, kind: &RdnType) -> bool {
        self.first(kind).is_some()
    }

    pub fn with_rdn(&self, kind: RdnType, value: impl Into<String>) -> Self {
        let mut rdns = self.0.clone();
        rdns.push(Rdn::new(kind, value));
        X500Name(rdns)
    }

    /// Returns a copy where every RDN of the given type carries `value`.
    pub fn with_replaced(&self, kind: &RdnType, value: &str) -> Self {
        X500Name(
            self.0
                .iter()
                .map(|rdn| {
                    if &rdn.kind == kind {
                        Rdn::new(kind.clone(), value)
                    } else {
                        rdn.clone()
                    }
                })
                .collect(),
        )
    }

    pub fn without(&self, kind: &RdnType) -> Self {
        X500Name(
            self.0.iter().filter(|rdn| &rdn.kind != kind).cloned().collect(),
        )
    }

    /// The fingerprint over the canonical, case-insensitive form.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.to_string().to_lowercase().as_bytes())
    }
}

impl FromStr for X500Name {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rdns = vec![];
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let (kind, value) = part
                .split_once('=')
                .ok_or_else(|| format!("invalid RDN '{}' in '{}'", part, s))?;
            rdns.push(Rdn::new(RdnType::from_str(kind)?, value.trim()));
        }
        Ok(X500Name(rdns))
    }
}

impl fmt::Display for X500Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, rdn) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", rdn.kind, rdn.value)?;
        }
        Ok(())
    }
}

impl Serialize for X500Name {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for X500Name {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        X500Name::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ KeyAlgorithm --------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("rsa"),
            KeyAlgorithm::Ec => f.write_str("ec"),
            KeyAlgorithm::Ed25519 => f.write_str("ed25519"),
        }
    }
}


//------------ SubjectPublicKeyInfo ------------------------------------------

/// A DER encoded public key together with the properties profiles check.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubjectPublicKeyInfo {
    algorithm: KeyAlgorithm,
    bits: u32,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    der: Bytes,
}

impl SubjectPublicKeyInfo {
    /// Parses a DER encoded SubjectPublicKeyInfo.
    pub fn from_der(der: impl Into<Bytes>) -> CaResult<Self> {
        let der = der.into();
        let pkey = PKey::public_key_from_der(&der)
            .map_err(|e| Error::bad_template(format!("invalid public key: {}", e)))?;
        let algorithm = match pkey.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            Id::EC => KeyAlgorithm::Ec,
            Id::ED25519 => KeyAlgorithm::Ed25519,
            other => {
                return Err(Error::bad_template(format!(
                    "unsupported public key algorithm {:?}",
                    other
                )))
            }
        };
        Ok(SubjectPublicKeyInfo { algorithm, bits: pkey.bits(), der })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.der)
    }

    /// The SHA-1 over the encoded key, used for key identifiers.
    pub fn key_identifier(&self) -> Bytes {
        Bytes::copy_from_slice(&openssl::sha::sha1(&self.der))
    }
}


//------------ Oid -----------------------------------------------------------

/// An object identifier in dotted form.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Oid(String);

impl Oid {
    pub fn new(s: impl Into<String>) -> Self {
        Oid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Oid {
    fn from(s: &str) -> Self {
        Oid(s.to_string())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object identifiers of the extensions the engine adds itself.
pub mod oid {
    pub const SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
    pub const ISSUER_ALT_NAME: &str = "2.5.29.18";
    pub const BASIC_CONSTRAINTS: &str = "2.5.29.19";
    pub const CRL_NUMBER: &str = "2.5.29.20";
    pub const CRL_REASON: &str = "2.5.29.21";
    pub const INVALIDITY_DATE: &str = "2.5.29.24";
    pub const DELTA_CRL_INDICATOR: &str = "2.5.29.27";
    pub const ISSUING_DISTRIBUTION_POINT: &str = "2.5.29.28";
    pub const CERTIFICATE_ISSUER: &str = "2.5.29.29";
    pub const CRL_DISTRIBUTION_POINTS: &str = "2.5.29.31";
    pub const AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";
    pub const FRESHEST_CRL: &str = "2.5.29.46";
    pub const AUTHORITY_INFO_ACCESS: &str = "1.3.6.1.5.5.7.1.1";
    pub const XIPKI_CRL_CERTSET: &str = "1.3.6.1.4.1.45522.1.1";
}


//------------ Extension -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionValue {
    KeyIdentifier(
        #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
        Bytes,
    ),
    Uris(Vec<String>),
    Names(Vec<String>),
    Integer(u64),
    Flag(bool),
    Raw(
        #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
        Bytes,
    ),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Extension {
    oid: Oid,
    critical: bool,
    value: ExtensionValue,
}

impl Extension {
    pub fn new(oid: impl Into<Oid>, critical: bool, value: ExtensionValue) -> Self {
        Extension { oid: oid.into(), critical, value }
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn critical(&self) -> bool {
        self.critical
    }

    pub fn value(&self) -> &ExtensionValue {
        &self.value
    }
}


//------------ Validity ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Validity {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Validity { not_before, not_after }
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}


//------------ CertificateRequest --------------------------------------------

/// A request for a new certificate, as handed to the engine by a front end.
#[derive(Clone, Debug)]
pub struct CertificateRequest {
    profile: String,
    subject: X500Name,
    public_key: SubjectPublicKeyInfo,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
    extensions: Vec<Extension>,
    ra_origin: bool,
    requestor: Option<String>,
}

impl CertificateRequest {
    pub fn new(
        profile: impl Into<String>,
        subject: X500Name,
        public_key: SubjectPublicKeyInfo,
    ) -> Self {
        CertificateRequest {
            profile: profile.into(),
            subject,
            public_key,
            not_before: None,
            not_after: None,
            extensions: vec![],
            ra_origin: false,
            requestor: None,
        }
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    pub fn with_not_after(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Marks the request as coming from a registration authority.
    pub fn from_ra(mut self) -> Self {
        self.ra_origin = true;
        self
    }

    pub fn with_requestor(mut self, requestor: impl Into<String>) -> Self {
        self.requestor = Some(requestor.into());
        self
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn subject(&self) -> &X500Name {
        &self.subject
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfo {
        &self.public_key
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn is_ra_origin(&self) -> bool {
        self.ra_origin
    }

    pub fn requestor(&self) -> Option<&str> {
        self.requestor.as_deref()
    }
}


//------------ SignatureAlgorithm --------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha256,
    EcdsaSha256,
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn for_key(algorithm: KeyAlgorithm) -> Self {
        match algorithm {
            KeyAlgorithm::Rsa => SignatureAlgorithm::RsaSha256,
            KeyAlgorithm::Ec => SignatureAlgorithm::EcdsaSha256,
            KeyAlgorithm::Ed25519 => SignatureAlgorithm::Ed25519,
        }
    }
}


//------------ TbsCertificate ------------------------------------------------

/// The to-be-signed part of a certificate.
///
/// The engine does not do DER: the signed octets are the stable JSON
/// encoding of this structure, and encoders further down the line are
/// expected to work from the decoded form.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TbsCertificate {
    serial: Serial,
    issuer: X500Name,
    subject: X500Name,
    validity: Validity,
    public_key: SubjectPublicKeyInfo,
    extensions: Vec<Extension>,
}

impl TbsCertificate {
    pub fn new(
        serial: Serial,
        issuer: X500Name,
        subject: X500Name,
        validity: Validity,
        public_key: SubjectPublicKeyInfo,
        extensions: Vec<Extension>,
    ) -> Self {
        TbsCertificate { serial, issuer, subject, validity, public_key, extensions }
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn issuer(&self) -> &X500Name {
        &self.issuer
    }

    pub fn subject(&self) -> &X500Name {
        &self.subject
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfo {
        &self.public_key
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn find_extension(&self, oid: &str) -> Option<&Extension> {
        self.extensions.iter().find(|ext| ext.oid.as_str() == oid)
    }

    pub fn encode(&self) -> CaResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::system(format!("cannot encode certificate: {}", e)))
    }
}


//------------ Certificate ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Certificate {
    tbs: TbsCertificate,
    signature_algorithm: SignatureAlgorithm,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    signature: Bytes,
}

impl Certificate {
    pub fn new(
        tbs: TbsCertificate,
        signature_algorithm: SignatureAlgorithm,
        signature: Bytes,
    ) -> Self {
        Certificate { tbs, signature_algorithm, signature }
    }

    pub fn tbs(&self) -> &TbsCertificate {
        &self.tbs
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn encode(&self) -> CaResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::system(format!("cannot encode certificate: {}", e)))
    }

    pub fn decode(data: &[u8]) -> CaResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::bad_template(format!("cannot decode certificate: {}", e)))
    }
}


//------------ IssuedCertificate ---------------------------------------------

/// A certificate issued by the engine, with the lookup data kept alongside.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IssuedCertificate {
    certificate: Certificate,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    encoded: Bytes,
    profile: String,
    requested_subject: X500Name,
    subject_fingerprint: Fingerprint,
    key_fingerprint: Fingerprint,
    requestor: Option<String>,
    ca: bool,

    /// Set when a duplicate request returned this earlier certificate.
    #[serde(default)]
    already_issued: bool,

    #[serde(default)]
    warning: Option<String>,
}

impl IssuedCertificate {
    pub fn new(
        certificate: Certificate,
        profile: impl Into<String>,
        requested_subject: X500Name,
        requestor: Option<String>,
        ca: bool,
    ) -> CaResult<Self> {
        let encoded = certificate.encode()?;
        let subject_fingerprint = certificate.tbs().subject().fingerprint();
        let key_fingerprint = certificate.tbs().public_key().fingerprint();
        Ok(IssuedCertificate {
            certificate,
            encoded,
            profile: profile.into(),
            requested_subject,
            subject_fingerprint,
            key_fingerprint,
            requestor,
            ca,
            already_issued: false,
            warning: None,
        })
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

    pub fn issuer(&self) -> &X500Name {
        self.certificate.tbs().issuer()
    }

    pub fn validity(&self) -> Validity {
        self.certificate.tbs().validity()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.validity().not_after()
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn requested_subject(&self) -> &X500Name {
        &self.requested_subject
    }

    pub fn subject_fingerprint(&self) -> Fingerprint {
        self.subject_fingerprint
    }

    pub fn key_fingerprint(&self) -> Fingerprint {
        self.key_fingerprint
    }

    pub fn requestor(&self) -> Option<&str> {
        self.requestor.as_deref()
    }

    pub fn is_ca(&self) -> bool {
        self.ca
    }

    pub fn already_issued(&self) -> bool {
        self.already_issued
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn mark_already_issued(mut self) -> Self {
        self.already_issued = true;
        self
    }

    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }
}


//------------ Tests ---------------------------------------------------------
