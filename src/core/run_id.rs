//! Run identifiers of the form `YYYYMMDD_HHMMSS_xxxxxxxx`.
//!
//! Identifiers sort chronologically as plain strings, which is what the
//! disk-only garbage collection pass relies on.

use chrono::{NaiveDateTime, Utc};

pub const RUN_ID_LEN: usize = 24;

/// New run identifier from the current UTC time and 8 random hex digits
pub fn generate_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

pub fn is_valid_run_id(candidate: &str) -> bool {
    if candidate.len() != RUN_ID_LEN || !candidate.is_ascii() {
        return false;
    }
    let (stamp, rest) = candidate.split_at(15);
    let Some(suffix) = rest.strip_prefix('_') else {
        return false;
    };
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok()
        && suffix.len() == 8
        && suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
