use lazy_static::lazy_static;
use regex::Regex;

use crate::shared::constants::{FALLBACK_FILENAME, MAX_FILENAME_LEN};

lazy_static! {
    /// Anything outside this allow-set is replaced with `_` during sanitization
    static ref UNSAFE_FILENAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._ -]").unwrap();

    /// Runs of whitespace collapse to a single space
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

/// Sanitize a client-supplied filename for storage and download.
///
/// Strips directory components (both separator styles), replaces anything
/// outside the safe allow-set with `_`, collapses whitespace, drops leading
/// dots, and truncates to `MAX_FILENAME_LEN` while preserving the extension.
/// Pure and deterministic; never returns an empty string.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(base, "_");
    let collapsed = WHITESPACE_RUN
        .replace_all(cleaned.trim(), " ")
        .trim_start_matches('.')
        .to_string();

    if collapsed.is_empty() {
        return FALLBACK_FILENAME.to_string();
    }

    if collapsed.len() <= MAX_FILENAME_LEN {
        return collapsed;
    }

    match collapsed.rfind('.') {
        Some(pos) if pos > 0 => {
            let (stem, ext) = collapsed.split_at(pos);
            let keep = MAX_FILENAME_LEN.saturating_sub(ext.len()).max(1);
            let stem: String = stem.chars().take(keep).collect();
            format!("{}{}", stem, ext)
        }
        _ => collapsed.chars().take(MAX_FILENAME_LEN).collect(),
    }
}

/// Extract the lowercase extension (with leading dot) from a filename.
///
/// Returns `None` for names with no extension, a bare leading dot, or a
/// trailing dot.
pub fn file_extension(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(name[idx..].to_ascii_lowercase())
}
