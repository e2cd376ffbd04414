//! Signing: the signer contract, the signer pool and the openssl soft signer.

mod signer;
pub use self::signer::*;

mod softsigner;
pub use self::softsigner::*;
