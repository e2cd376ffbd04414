//! Defines all engine side errors.

use std::{error, fmt};

use crate::commons::api::{CrlReason, Serial};
use crate::commons::crypto::SignerError;
use crate::store::StoreError;


//------------ ErrorKind -----------------------------------------------------

/// The category of an [`Error`].
///
/// Front ends map these onto their own status codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    BadCertTemplate,
    UnknownProfile,
    UnknownCert,
    UnknownPublisher,
    AlreadyIssued,
    CertRevoked,
    CertUnrevoked,
    NotPermitted,
    InsufficientPermission,
    InvalidExtension,
    CrlFailure,
    SystemUnavailable,
    SystemFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::BadCertTemplate => "bad certificate template",
            ErrorKind::UnknownProfile => "unknown profile",
            ErrorKind::UnknownCert => "unknown certificate",
            ErrorKind::UnknownPublisher => "unknown publisher",
            ErrorKind::AlreadyIssued => "already issued",
            ErrorKind::CertRevoked => "certificate revoked",
            ErrorKind::CertUnrevoked => "certificate not revoked",
            ErrorKind::NotPermitted => "not permitted",
            ErrorKind::InsufficientPermission => "insufficient permission",
            ErrorKind::InvalidExtension => "invalid extension",
            ErrorKind::CrlFailure => "CRL failure",
            ErrorKind::SystemUnavailable => "system unavailable",
            ErrorKind::SystemFailure => "system failure",
        };
        f.write_str(s)
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Request Issues
    //-----------------------------------------------------------------
    BadCertTemplate(String),
    UnknownProfile(String),
    UnknownCert(Serial),
    UnknownPublisher(String),
    InvalidExtension(String),

    //-----------------------------------------------------------------
    // State Issues
    //-----------------------------------------------------------------
    AlreadyIssued(String),
    CertRevoked(Serial, CrlReason),
    CertUnrevoked(Serial),

    //-----------------------------------------------------------------
    // Policy Issues
    //-----------------------------------------------------------------
    NotPermitted(String),
    InsufficientPermission(String),

    //-----------------------------------------------------------------
    // CRL Issues
    //-----------------------------------------------------------------
    CrlFailure(String),

    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------
    SystemUnavailable(String),
    SystemFailure(String),
    Store(StoreError),
    Signer(SignerError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadCertTemplate(_) => ErrorKind::BadCertTemplate,
            Error::UnknownProfile(_) => ErrorKind::UnknownProfile,
            Error::UnknownCert(_) => ErrorKind::UnknownCert,
            Error::UnknownPublisher(_) => ErrorKind::UnknownPublisher,
            Error::InvalidExtension(_) => ErrorKind::InvalidExtension,
            Error::AlreadyIssued(_) => ErrorKind::AlreadyIssued,
            Error::CertRevoked(..) => ErrorKind::CertRevoked,
            Error::CertUnrevoked(_) => ErrorKind::CertUnrevoked,
            Error::NotPermitted(_) => ErrorKind::NotPermitted,
            Error::InsufficientPermission(_) => {
                ErrorKind::InsufficientPermission
            }
            Error::CrlFailure(_) => ErrorKind::CrlFailure,
            Error::SystemUnavailable(_) => ErrorKind::SystemUnavailable,
            Error::SystemFailure(_)
            | Error::Store(_)
            | Error::Signer(_) => ErrorKind::SystemFailure,
        }
    }

    pub fn bad_template(msg: impl fmt::Display) -> Self {
        Error::BadCertTemplate(msg.to_string())
    }

    pub fn already_issued(msg: impl fmt::Display) -> Self {
        Error::AlreadyIssued(msg.to_string())
    }

    pub fn not_permitted(msg: impl fmt::Display) -> Self {
        Error::NotPermitted(msg.to_string())
    }

    pub fn invalid_extension(msg: impl fmt::Display) -> Self {
        Error::InvalidExtension(msg.to_string())
    }

    pub fn crl(msg: impl fmt::Display) -> Self {
        Error::CrlFailure(msg.to_string())
    }

    pub fn system(msg: impl fmt::Display) -> Self {
        Error::SystemFailure(msg.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadCertTemplate(msg) => {
                write!(f, "Bad certificate template: {}", msg)
            }
            Error::UnknownProfile(name) => {
                write!(f, "Unknown certificate profile '{}'", name)
            }
            Error::UnknownCert(serial) => {
                write!(f, "Unknown certificate with serial {}", serial)
            }
            Error::UnknownPublisher(name) => {
                write!(f, "Unknown publisher '{}'", name)
            }
            Error::InvalidExtension(msg) => {
                write!(f, "Invalid extension: {}", msg)
            }
            Error::AlreadyIssued(msg) => write!(f, "Already issued: {}", msg),
            Error::CertRevoked(serial, reason) => {
                write!(
                    f, "Certificate {} is already revoked with reason {}",
                    serial, reason
                )
            }
            Error::CertUnrevoked(serial) => {
                write!(f, "Certificate {} is not revoked", serial)
            }
            Error::NotPermitted(msg) => write!(f, "Not permitted: {}", msg),
            Error::InsufficientPermission(msg) => {
                write!(f, "Insufficient permission: {}", msg)
            }
            Error::CrlFailure(msg) => write!(f, "CRL failure: {}", msg),
            Error::SystemUnavailable(msg) => {
                write!(f, "System unavailable: {}", msg)
            }
            Error::SystemFailure(msg) => write!(f, "System failure: {}", msg),
            Error::Store(e) => write!(f, "Certificate store issue: {}", e),
            Error::Signer(e) => write!(f, "Signing issue: {}", e),
        }
    }
}

impl error::Error for Error {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<SignerError> for Error {
    fn from(e: SignerError) -> Self {
        Error::Signer(e)
    }
}


//------------ Tests ---------------------------------------------------------
