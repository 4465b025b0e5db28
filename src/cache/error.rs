//! Errors surfaced by the cache consumer API.

use thiserror::Error;

/// Error type returned by factories and `Cacheable::initialize`.
pub type BuildError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to build cache entry `{type_name}`: {source}")]
    Construction {
        type_name: &'static str,
        #[source]
        source: BuildError,
    },
    #[error("cache contract violated for `{type_name}`: {reason}")]
    Contract {
        type_name: &'static str,
        reason: &'static str,
    },
    #[error("no factory registered for `{type_name}`")]
    MissingFactory { type_name: &'static str },
    #[error("no free object id for `{type_name}` after {attempts} attempts")]
    UniqueIdExhausted {
        type_name: &'static str,
        attempts: u32,
    },
    #[error("cached entry does not hold a `{type_name}`")]
    TypeMismatch { type_name: &'static str },
}

impl CacheError {
    pub fn construction(type_name: &'static str, source: BuildError) -> Self {
        Self::Construction { type_name, source }
    }

    pub fn contract(type_name: &'static str, reason: &'static str) -> Self {
        Self::Contract { type_name, reason }
    }
}
