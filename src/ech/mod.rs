//! ECH configuration values and their cache

mod cache;
pub(crate) mod config;

pub use cache::{CacheStats, EchConfigCache};
pub use config::EchConfiguration;
