//! Common utilities and types shared across coordkv

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, StoreConfig};
pub use error::{Error, Result};
pub use utils::{is_valid_as_key_path, lock_key, parse_duration, retry_with_backoff, LOCK_KEY_PREFIX};
