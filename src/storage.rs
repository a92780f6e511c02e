//! Flat-file JSON persistence.
//!
//! Whole documents only: presets, settings. A missing or unparsable file
//! reads as `None` so callers can fall back to defaults instead of dying on
//! a half-written or hand-edited document.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn ensure_dir(p: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(p)
}

pub fn read_json<T: DeserializeOwned>(p: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(p).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Pretty-printed with a trailing newline — the on-disk document shape is a
/// compatibility surface, keep it stable.
pub fn write_json<T: Serialize>(p: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(p, text)
}
