//! Data structures shared by the engine, its collaborators and front ends.

mod ca;
pub use self::ca::*;

mod cert;
pub use self::cert::*;

mod crl;
pub use self::crl::*;

mod revocation;
pub use self::revocation::*;
