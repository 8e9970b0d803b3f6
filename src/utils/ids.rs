// src/utils/ids.rs
//! Identifier generation

use crate::runtime::types::HandlerType;
use rand::distributions::Alphanumeric;
use rand::Rng;

const CORRELATION_SUFFIX_LEN: usize = 9;

/// Generate a correlation id of the form `{type}-{unixMillis}-{rand9}`
pub fn correlation_id(handler_type: HandlerType) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_SUFFIX_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();

    format!(
        "{}-{}-{}",
        handler_type,
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

/// Generate a unique handler instance id
pub fn instance_id() -> String {
    ulid::Ulid::new().to_string()
}
