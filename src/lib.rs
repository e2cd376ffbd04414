//! The issuing engine of an X.509 Certificate Authority.

pub mod ca;
pub mod commons;
pub mod constants;
pub mod daemon;
pub mod profile;
pub mod publisher;
pub mod store;
