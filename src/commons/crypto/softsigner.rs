//! Support for signing with software keys through openssl.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::sign::Verifier;
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};

use crate::commons::api::{KeyAlgorithm, SignatureAlgorithm, SubjectPublicKeyInfo};

use super::{ContentSigner, SignerError, SignerFactory};


//------------ OpenSslKeyPair ------------------------------------------------

/// An openssl based key pair.
#[derive(Clone)]
pub struct OpenSslKeyPair {
    pkey: PKey<Private>,
}

impl OpenSslKeyPair {
    pub fn build(algorithm: KeyAlgorithm) -> Result<OpenSslKeyPair, SignerError> {
        let pkey = match algorithm {
            KeyAlgorithm::Rsa => PKey::from_rsa(Rsa::generate(2048)?)?,
            KeyAlgorithm::Ec => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
            KeyAlgorithm::Ed25519 => PKey::generate_ed25519()?,
        };
        Ok(OpenSslKeyPair { pkey })
    }

    pub fn from_pem(pem: &[u8]) -> Result<OpenSslKeyPair, SignerError> {
        let pkey = PKey::private_key_from_pem(pem)
            .map_err(|e| SignerError::KeyError(format!("cannot parse private key: {}", e)))?;
        Ok(OpenSslKeyPair { pkey })
    }

    pub fn to_pem(&self) -> Result<Vec<u8>, SignerError> {
        Ok(self.pkey.private_key_to_pem_pkcs8()?)
    }

    /// Loads a PEM key from `path`, creating and saving a new key of the
    /// given algorithm if the file does not exist.
    pub fn load_or_create(
        path: &Path,
        algorithm: KeyAlgorithm,
    ) -> Result<OpenSslKeyPair, SignerError> {
        if path.exists() {
            let pem = fs::read(path).map_err(|e| {
                SignerError::KeyError(format!(
                    "Could not read key file '{}': {}",
                    path.to_string_lossy(),
                    e
                ))
            })?;
            Self::from_pem(&pem)
        } else {
            let key_pair = Self::build(algorithm)?;
            fs::write(path, key_pair.to_pem()?).map_err(|e| {
                SignerError::KeyError(format!(
                    "Could not create key file '{}': {}",
                    path.to_string_lossy(),
                    e
                ))
            })?;
            Ok(key_pair)
        }
    }

    pub fn subject_public_key_info(&self) -> Result<SubjectPublicKeyInfo, SignerError> {
        let der = self.pkey.public_key_to_der()?;
        SubjectPublicKeyInfo::from_der(der).map_err(|e| SignerError::KeyError(e.to_string()))
    }

    fn pkey(&self) -> &PKeyRef<Private> {
        self.pkey.as_ref()
    }
}

impl Serialize for OpenSslKeyPair {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes: Vec<u8> = self.pkey.private_key_to_der().map_err(ser::Error::custom)?;
        BASE64.encode(bytes).serialize(s)
    }
}

impl<'de> Deserialize<'de> for OpenSslKeyPair {
    fn deserialize<D>(d: D) -> Result<OpenSslKeyPair, D::Error>
    where
        D: Deserializer<'de>,
    {
        let base64 = String::deserialize(d)?;
        let bytes = BASE64.decode(base64).map_err(de::Error::custom)?;
        let pkey = PKey::private_key_from_der(&bytes).map_err(de::Error::custom)?;
        Ok(OpenSslKeyPair { pkey })
    }
}


//------------ OpenSslSigner -------------------------------------------------

/// A signing handle over a software key.
pub struct OpenSslSigner {
    key_pair: OpenSslKeyPair,
    algorithm: SignatureAlgorithm,
}

impl OpenSslSigner {
    pub fn new(key_pair: OpenSslKeyPair, algorithm: SignatureAlgorithm) -> Self {
        OpenSslSigner { key_pair, algorithm }
    }

    fn sign_with_key_internal(
        pkey: &PKeyRef<Private>,
        data: &[u8],
    ) -> Result<Bytes, SignerError> {
        let signature = if pkey.id() == Id::ED25519 {
            let mut signer = openssl::sign::Signer::new_without_digest(pkey)?;
            signer.sign_oneshot_to_vec(data)?
        } else {
            let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), pkey)?;
            signer.update(data)?;
            signer.sign_to_vec()?
        };
        Ok(Bytes::from(signature))
    }
}

impl ContentSigner for OpenSslSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn sign(&mut self, data: &[u8]) -> Result<Bytes, SignerError> {
        Self::sign_with_key_internal(self.key_pair.pkey(), data)
    }
}


//------------ OpenSslSignerFactory ------------------------------------------

pub struct OpenSslSignerFactory {
    key_pair: OpenSslKeyPair,
    public_key: SubjectPublicKeyInfo,
}

impl OpenSslSignerFactory {
    pub fn new(key_pair: OpenSslKeyPair) -> Result<Self, SignerError> {
        let public_key = key_pair.subject_public_key_info()?;
        Ok(OpenSslSignerFactory { key_pair, public_key })
    }
}

impl SignerFactory for OpenSslSignerFactory {
    fn new_signer(&self) -> Result<Box<dyn ContentSigner>, SignerError> {
        let algorithm = SignatureAlgorithm::for_key(self.public_key.algorithm());
        Ok(Box::new(OpenSslSigner::new(self.key_pair.clone(), algorithm)))
    }

    fn public_key(&self) -> &SubjectPublicKeyInfo {
        &self.public_key
    }

    fn is_healthy(&self) -> bool {
        true
    }
}


//------------ verify_signature ----------------------------------------------

/// Checks `signature` over `data` against `public_key`.
pub fn verify_signature(
    public_key: &SubjectPublicKeyInfo,
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, SignerError> {
    let pkey = PKey::public_key_from_der(public_key.der())?;
    let valid = match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let mut verifier = Verifier::new_without_digest(&pkey)?;
            verifier.verify_oneshot(signature, data)?
        }
        SignatureAlgorithm::RsaSha256 | SignatureAlgorithm::EcdsaSha256 => {
            let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey)?;
            verifier.update(data)?;
            verifier.verify(signature)?
        }
    };
    Ok(valid)
}


//------------ Tests ---------------------------------------------------------
