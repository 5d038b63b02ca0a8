//! Arca Common Library
//!
//! Shared foundation for the arca preservation workspace:
//!
//! - **Error Handling**: the `ArcaError` type and `Result` alias
//! - **Logging**: tracing-based logging setup shared by all worker binaries
//! - **Checksums**: single-pass MD5/SHA-256 digest utilities

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ArcaError, Result};
