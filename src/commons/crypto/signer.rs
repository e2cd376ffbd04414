//! The signer contract and the bounded pool signers are borrowed from.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use openssl::error::ErrorStack;

use crate::commons::api::{SignatureAlgorithm, SubjectPublicKeyInfo};


//------------ SignerError ---------------------------------------------------

#[derive(Debug)]
pub enum SignerError {
    OpenSslError(ErrorStack),
    KeyError(String),
    SignerUnavailable,
    PoolError(String),
    Other(String),
}

impl SignerError {
    pub fn other(msg: impl fmt::Display) -> Self {
        SignerError::Other(msg.to_string())
    }
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignerError::OpenSslError(e) => write!(f, "OpenSsl Error: {}", e),
            SignerError::KeyError(e) => write!(f, "Key error: {}", e),
            SignerError::SignerUnavailable => write!(f, "Signer is unavailable"),
            SignerError::PoolError(e) => {
                write!(f, "Could not borrow signer from pool: {}", e)
            }
            SignerError::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for SignerError {}

impl From<ErrorStack> for SignerError {
    fn from(e: ErrorStack) -> Self {
        SignerError::OpenSslError(e)
    }
}

impl From<r2d2::Error> for SignerError {
    fn from(e: r2d2::Error) -> Self {
        SignerError::PoolError(e.to_string())
    }
}


//------------ ContentSigner -------------------------------------------------

/// A single signing handle.
///
/// Handles are not shared between threads. They live in a [`SignerPool`]
/// and are borrowed for the duration of one signing operation.
pub trait ContentSigner: Send {
    fn algorithm(&self) -> SignatureAlgorithm;

    fn sign(&mut self, data: &[u8]) -> Result<Bytes, SignerError>;

    fn is_healthy(&self) -> bool {
        true
    }
}


//------------ SignerFactory -------------------------------------------------

/// Creates signing handles for one key.
pub trait SignerFactory: Send + Sync + 'static {
    fn new_signer(&self) -> Result<Box<dyn ContentSigner>, SignerError>;

    /// The public key matching the private key the handles sign with.
    fn public_key(&self) -> &SubjectPublicKeyInfo;

    fn is_healthy(&self) -> bool;
}


//------------ SignerConnectionManager ---------------------------------------

/// Lets r2d2 manage signing handles like it manages connections.
pub struct SignerConnectionManager {
    factory: Arc<dyn SignerFactory>,
}

impl r2d2::ManageConnection for SignerConnectionManager {
    type Connection = Box<dyn ContentSigner>;
    type Error = SignerError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.factory.new_signer()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        if conn.is_healthy() {
            Ok(())
        } else {
            Err(SignerError::SignerUnavailable)
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_healthy()
    }
}


//------------ SignerPool ----------------------------------------------------

pub type PooledSigner = r2d2::PooledConnection<SignerConnectionManager>;

/// A bounded pool of interchangeable signing handles.
///
/// A borrowed handle goes back to the pool when the [`PooledSigner`] is
/// dropped, so it is returned on every path out of the caller.
pub struct SignerPool {
    pool: r2d2::Pool<SignerConnectionManager>,
    factory: Arc<dyn SignerFactory>,
    public_key: SubjectPublicKeyInfo,
    algorithm: SignatureAlgorithm,
}

impl SignerPool {
    pub fn build(
        factory: Arc<dyn SignerFactory>,
        size: u32,
        borrow_timeout: Duration,
    ) -> Result<Self, SignerError> {
        let public_key = factory.public_key().clone();
        let algorithm = SignatureAlgorithm::for_key(public_key.algorithm());
        let manager = SignerConnectionManager { factory: factory.clone() };
        let pool = r2d2::Pool::builder()
            .max_size(size)
            .min_idle(Some(0))
            .connection_timeout(borrow_timeout)
            .build(manager)?;

        Ok(SignerPool { pool, factory, public_key, algorithm })
    }

    /// Borrows a handle, blocking while all handles are in use.
    pub fn borrow(&self) -> Result<PooledSigner, SignerError> {
        self.pool.get().map_err(SignerError::from)
    }

    /// Signs with a borrowed handle which is returned before this returns.
    pub fn sign(&self, data: &[u8]) -> Result<Bytes, SignerError> {
        let mut signer = self.borrow()?;
        signer.sign(data)
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfo {
        &self.public_key
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn is_healthy(&self) -> bool {
        self.factory.is_healthy()
    }
}

impl fmt::Debug for SignerPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignerPool")
            .field("algorithm", &self.algorithm)
            .field("state", &self.pool.state())
            .finish()
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::commons::api::KeyAlgorithm;
    use crate::commons::crypto::{OpenSslKeyPair, OpenSslSignerFactory};

    fn pool(size: u32) -> SignerPool {
        let key = OpenSslKeyPair::build(KeyAlgorithm::Ec).unwrap();
        let factory = OpenSslSignerFactory::new(key).unwrap();
        SignerPool::build(Arc::new(factory), size, Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn borrow_times_out_when_pool_is_exhausted() {
        let pool = pool(1);
        let borrowed = pool.borrow().unwrap();

        match pool.borrow() {
            Err(SignerError::PoolError(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("borrowed from an exhausted pool"),
        }

        drop(borrowed);
        let signature = pool.sign(b"tbs").unwrap();
        assert!(!signature.is_empty());
        assert!(pool.is_healthy());
    }
}
