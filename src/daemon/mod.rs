//! The engine daemon: configuration, logging and the periodic tasks.

pub mod config;
pub mod scheduler;
pub mod start;
