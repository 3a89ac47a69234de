pub mod config;
pub mod transport;

pub use config::*;
pub use transport::*;

/// Common result type for holepunch operations
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
