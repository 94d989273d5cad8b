// Version Propagation
// Cross-format, idempotent version string rewrites with crash-safe backups

pub mod engine;
pub mod report;
pub mod rules;
pub mod transaction;

pub use engine::{Propagator, RewritePlan, DEFAULT_STAGING};
pub use report::{FileReport, FileStatus, RewriteOutcome, RewriteReport};
pub use rules::{compile_rules, CompiledRule};
pub use transaction::{restore, RestoreReport, RewriteBatch, RewriteTransaction, StagingLock};
