pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod priority;
pub mod rate_limiter;
pub mod url_hash;

pub use config::*;
pub use error::*;
pub use models::*;
pub use priority::*;
pub use rate_limiter::*;
