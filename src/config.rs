//! Declarative configuration store.
//!
//! Replaces the original's embedded scripting layer with a small two
//! directive grammar:
//!
//! ```text
//! ns_section ns/server/default/module/kiss
//! ns_param   pageroot   /var/www/html
//! ns_param   directoryfile  index.html,index.htm
//! ```
//!
//! `#` starts a comment, blank lines are skipped. A section name stays
//! current until the next `ns_section` line; `ns_param` before any section
//! is a load error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// One `ns_section` block: an ordered list of key/value pairs. Kept as a
/// `Vec` rather than a map — sections are small (a handful of params) and a
/// linear scan is both simpler and, for the given N, at least as fast as
/// hashing.
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl ConfigSection {
    fn push(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    /// Case-insensitive lookup of the first matching key, like
    /// `Ns_ConfigGetValue`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Exact-case lookup, like `Ns_ConfigGetValueExact`.
    pub fn get_exact(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The loaded config: every section keyed by its normalized name.
pub struct ConfigStore {
    sections: HashMap<String, ConfigSection>,
}

/// Trim, lowercase ASCII, and turn backslashes into forward slashes —
/// the same normalization the original applies to section names before
/// using them as hash keys.
fn normalize_section_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c == '\\' { '/' } else { c.to_ascii_lowercase() })
        .collect()
}

impl ConfigStore {
    /// Parse a config file's contents. Fatal layout errors (a bare
    /// `ns_param` before any section, or a directive missing required
    /// arguments) are reported as `ConfigError`; anything else (unknown
    /// directives, extra whitespace) is tolerated.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, ConfigSection> = HashMap::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let directive = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("").trim();

            match directive {
                "ns_section" => {
                    if rest.is_empty() {
                        return Err(ConfigError::SectionMissingName { line: line_no });
                    }
                    let name = normalize_section_name(rest);
                    sections.entry(name.clone()).or_insert_with(|| ConfigSection {
                        name: name.clone(),
                        entries: Vec::new(),
                    });
                    current = Some(name);
                }
                "ns_param" => {
                    let sect_name = current
                        .as_ref()
                        .ok_or(ConfigError::ParamWithoutSection { line: line_no })?;
                    let mut kv = rest.splitn(2, char::is_whitespace);
                    let key = kv.next().unwrap_or("").trim();
                    let value = kv.next().unwrap_or("").trim();
                    if key.is_empty() || value.is_empty() {
                        return Err(ConfigError::ParamMissingValue { line: line_no });
                    }
                    sections
                        .get_mut(sect_name)
                        .expect("section inserted on ns_section")
                        .push(key.to_string(), value.to_string());
                }
                _ => {
                    log::debug!("config: ignoring unknown directive at line {line_no}: {directive}");
                }
            }
        }

        Ok(ConfigStore { sections })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).unwrap_or_else(|e| {
            log::error!("config: failed to read {}: {e}", path.display());
            std::process::abort();
        });
        Self::parse(&text)
    }

    pub fn sections(&self) -> impl Iterator<Item = &ConfigSection> {
        self.sections.values()
    }

    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.get(&normalize_section_name(name))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn get_exact(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get_exact(key))
    }

    pub fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        self.get(section, key).and_then(|v| v.trim().parse::<i64>().ok())
    }

    /// `Ns_ConfigGetBool`: accepts the usual truthy/falsy words, then falls
    /// back to treating the value as a signed integer (nonzero is true).
    /// Anything else leaves the caller's default untouched.
    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        let raw = self.get(section, key)?;
        let lower = raw.trim().to_ascii_lowercase();
        match lower.as_str() {
            "1" | "y" | "yes" | "on" | "t" | "true" => Some(true),
            "0" | "n" | "no" | "off" | "f" | "false" => Some(false),
            other => other.parse::<i64>().ok().map(|n| n != 0),
        }
    }

    /// Builds `"ns/server/<server>/module/<module>/<seg1>/<seg2>/..."`,
    /// stripping leading and trailing slashes from every path segment
    /// before joining, like `Ns_ConfigGetPath`.
    pub fn config_path(server: &str, module: &str, segments: &[&str]) -> String {
        let mut out = format!("ns/server/{server}/module/{module}");
        for seg in segments {
            let trimmed = seg.trim_matches('/');
            if !trimmed.is_empty() {
                out.push('/');
                out.push_str(trimmed);
            }
        }
        out
    }
}
