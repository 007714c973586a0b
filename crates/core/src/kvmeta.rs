//! `KEY=value` metadata files
//!
//! Backup `.meta` files and restore point `metadata` files share this plain
//! text format with the older shell tooling, which greps them line by line.
//! Values are written unquoted on a single line; newlines and backslashes
//! are escaped. Double-quoted values written by the old scripts are accepted
//! on read.

use crate::error::{EngineError, Result};
use crate::store::atomic_write;
use std::path::Path;

/// Which keys a document must / may carry
#[derive(Debug, Clone, Copy)]
pub struct KvSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl KvSchema {
    fn knows(&self, key: &str) -> bool {
        self.required.contains(&key) || self.optional.contains(&key)
    }
}

/// Ordered key/value document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvDocument {
    entries: Vec<(String, String)>,
}

impl KvDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, replacing an earlier value in place
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        debug_assert!(valid_key(key), "invalid metadata key {key}");
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Fetch a key that the schema marked as required
    pub fn require(&self, key: &str, path: &Path) -> Result<&str> {
        self.get(key).ok_or_else(|| EngineError::Metadata {
            path: path.to_path_buf(),
            reason: format!("missing {key}"),
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize to the on-disk text form
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        }
        out
    }

    /// Parse and check against `schema`. `path` is only used for errors.
    pub fn parse(text: &str, schema: &KvSchema, path: &Path) -> Result<Self> {
        let malformed = |reason: String| EngineError::Metadata {
            path: path.to_path_buf(),
            reason,
        };

        let mut doc = Self::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| malformed(format!("line {}: expected KEY=value", lineno + 1)))?;
            let key = key.trim();

            if !valid_key(key) {
                return Err(malformed(format!("line {}: invalid key '{key}'", lineno + 1)));
            }
            if !schema.knows(key) {
                return Err(malformed(format!("unexpected key {key}")));
            }
            if doc.get(key).is_some() {
                return Err(malformed(format!("duplicate key {key}")));
            }

            doc.entries.push((key.to_string(), unescape(strip_quotes(value))));
        }

        for key in schema.required {
            if doc.get(key).is_none() {
                return Err(malformed(format!("missing {key}")));
            }
        }

        Ok(doc)
    }

    /// Read and parse a metadata file
    pub fn read(path: &Path, schema: &KvSchema) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::parse(&text, schema, path)
    }

    /// Atomically write the document; temp files go to `tmp_dir`
    pub fn write(&self, tmp_dir: &Path, path: &Path) -> Result<()> {
        atomic_write(tmp_dir, path, self.render().as_bytes())
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
