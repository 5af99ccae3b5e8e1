//! Shared utility functions.
//!
//! Structured-output extraction from model replies, shell-safety checks for
//! identifiers, and text helpers for logs and observations.

pub mod ident;
pub mod json_extraction;
pub mod text;

pub use ident::{derive_instance_id, validate_file_path, validate_git_ref, validate_repo_name};
pub use json_extraction::{
    extract_code_block, find_matching_brace, try_extract_json_from_response,
    JsonExtractionResult,
};
pub use text::{sha256_hex, truncate, truncate_lines, OBSERVATION_EDGE_LINES};
