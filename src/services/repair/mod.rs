//! Post-error SQL recovery: parsed errors, deterministic templates, and the
//! learned-fix store. The repair loop itself lives in the orchestrator.

pub mod error_parser;
pub mod learned;
pub mod templates;

pub use error_parser::{ParsedSqlError, parse_sql_error};
pub use learned::{LearnedFix, LearnedFixStore, error_signature};
pub use templates::{
    append_top_level_rownum_cap, apply_sql_error_templates, sample_heavy_tables_for_timeout,
};
