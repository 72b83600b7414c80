//! Identifier rules for state GUIDs, logic ids and dependency input names.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Longest accepted logic id, in characters.
pub const MAX_LOGIC_ID_LEN: usize = 128;

/// Fresh time-ordered GUID (UUID v7).
pub fn new_guid() -> String {
    Uuid::now_v7().to_string()
}

/// Parse any textual UUID and return its lowercase hyphenated form.
pub fn normalize_guid(raw: &str) -> Result<String> {
    Uuid::parse_str(raw.trim())
        .map(|u| u.hyphenated().to_string())
        .map_err(|e| Error::InvalidArgument(format!("invalid guid '{raw}': {e}")))
}

pub fn validate_logic_id(logic_id: &str) -> Result<()> {
    let len = logic_id.chars().count();
    if len == 0 {
        return Err(Error::InvalidArgument("logic id must not be empty".into()));
    }
    if len > MAX_LOGIC_ID_LEN {
        return Err(Error::InvalidArgument(format!(
            "logic id is {len} characters, maximum is {MAX_LOGIC_ID_LEN}"
        )));
    }
    if let Some(bad) = logic_id.chars().find(|c| c.is_control() || *c == '/') {
        return Err(Error::InvalidArgument(format!(
            "logic id contains forbidden character {bad:?}"
        )));
    }
    Ok(())
}

/// Derive a Terraform-safe input name from an output key.
///
/// Lowercases, maps every non-alphanumeric character to `_`, and prefixes
/// a leading digit with `_`.
pub fn sanitize_input_name(output: &str) -> String {
    let mut name: String = output
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}
