//! Common types used by the various engine components.
pub mod api;
pub mod crypto;
pub mod error;
pub mod util;


pub use self::error::{Error, ErrorKind};

//------------ Response Aliases ----------------------------------------------

pub type CaEmptyResult = std::result::Result<(), self::error::Error>;
pub type CaResult<T> = std::result::Result<T, self::error::Error>;
