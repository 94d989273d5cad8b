// Parser module for pipeline specs, version rules and trigger events
// Provides YAML parsing and validation

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
pub use loader::{SpecParser, SpecValidator};
pub use models::*;
