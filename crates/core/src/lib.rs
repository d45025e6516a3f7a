#![forbid(unsafe_code)]

//! Domain model for course content progression.
//!
//! This crate is pure: no I/O, no async. Storage and orchestration live in the
//! `storage` and `services` crates.

pub mod model;
pub mod policy;
pub mod quiz;
pub mod stats;
pub mod time;

pub use time::Clock;
