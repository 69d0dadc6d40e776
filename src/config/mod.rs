//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GraceConfig (validated, immutable)
//!
//! On restart signal:
//!     restart hook reloads and validates the file
//!     → a broken file is logged, the successor is started anyway and fails fast
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes take effect in the next generation
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{GraceConfig, LifecycleConfig, ObservabilityConfig, ServerConfig, TlsConfig};
pub use validation::{validate_config, ValidationError};
