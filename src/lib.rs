//! Multi-tenant object cache kept coherent by a change-record log.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
