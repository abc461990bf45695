//! JAR manifest reading and writing.
//!
//! Only the main section is modelled; per-entry sections carry signature
//! digests that a rewritten archive cannot keep. Attribute names compare
//! case-insensitively, as the JAR format requires.

use chrono::{DateTime, Local};
use serde::Serialize;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const MANIFEST_DIR: &str = "META-INF/";
pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const CLASS_PATH: &str = "Class-Path";

/// Digest of the archive before this engine rewrote it.
pub const ORIGINAL_DIGEST: &str = "original-digest";
/// Time at which this engine rewrote the archive.
pub const MODIFIED_AT: &str = "modified-at";

pub const CLASS_INSTR_STATS: &str = "class-instr-stats";
pub const CONSTRUCT_STATS: &str = "construct-stats";
pub const APP_CONTEXT: &str = "app-context";

const SIGNATURE_SUFFIXES: [&str; 4] = [".sf", ".dsa", ".rsa", ".ec"];
const MAX_LINE: usize = 72;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub original_digest: String,
    pub modified_at: String,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient parse: malformed lines are ignored, continuation lines are
    /// joined, parsing stops at the end of the main section.
    pub fn parse(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let mut main: Vec<(String, String)> = Vec::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                if main.is_empty() {
                    continue;
                }
                break;
            }
            if let Some(rest) = line.strip_prefix(' ') {
                if let Some((_, value)) = main.last_mut() {
                    value.push_str(rest);
                }
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                let value = value.strip_prefix(' ').unwrap_or(value);
                main.push((key.to_string(), value.to_string()));
            }
        }

        Self { main }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.main
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.main.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some((_, v)) => *v = value,
            None => self.main.push((key.to_string(), value)),
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.main.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    /// Both provenance attributes, if this engine already rewrote the archive.
    pub fn provenance(&self) -> Option<Provenance> {
        Some(Provenance {
            original_digest: self.get(ORIGINAL_DIGEST)?.to_string(),
            modified_at: self.get(MODIFIED_AT)?.to_string(),
        })
    }

    pub fn is_rewritten(&self) -> bool {
        self.provenance().is_some()
    }

    pub fn stamp_provenance(&mut self, original_digest: &str, now: DateTime<Local>) {
        self.set(ORIGINAL_DIGEST, original_digest);
        self.set(MODIFIED_AT, format_timestamp(now));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let version = self.get(MANIFEST_VERSION).unwrap_or("1.0");
        write_attribute(&mut out, MANIFEST_VERSION, version);
        for (k, v) in &self.main {
            if k.eq_ignore_ascii_case(MANIFEST_VERSION) {
                continue;
            }
            write_attribute(&mut out, k, v);
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

pub fn format_timestamp(now: DateTime<Local>) -> String {
    now.format("%-d %b %Y %H:%M:%S").to_string()
}

/// Signature related files below `META-INF/` that must not survive a rewrite.
pub fn is_signature_entry(name: &str) -> bool {
    if !name.starts_with(MANIFEST_DIR) {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    SIGNATURE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

fn write_attribute(out: &mut String, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let mut first = true;
    let mut rest = line.as_str();
    while !rest.is_empty() {
        let budget = if first { MAX_LINE } else { MAX_LINE - 1 };
        let mut cut = rest.len().min(budget);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if !first {
            out.push(' ');
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n");
        rest = &rest[cut..];
        first = false;
    }
}
