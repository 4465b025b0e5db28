//! Application layer: store contracts and binary-level errors.

pub mod error;
pub mod repos;
