//! Alias configuration: static maps from an alias name to one or more
//! resolution targets, loaded from JSON files matched by a glob pattern.
//!
//! A target is either a literal IP, accepted verbatim at resolution time, or
//! another name resolved through the record set. Any load failure is fatal
//! at startup.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::DnsError;
use crate::records::fqdn;

/// The alias map. Lookups for non-aliases return nothing.
#[derive(Debug, Clone, Default)]
pub struct AliasConfig {
    aliases: HashMap<String, Vec<String>>,
}

impl AliasConfig {
    /// Load and merge every alias file matching `pattern`.
    pub fn from_glob(pattern: &str) -> Result<Self, DnsError> {
        let mut config = Self::default();

        let paths =
            glob::glob(pattern).map_err(|e| DnsError::Config(format!("alias glob: {e}")))?;
        for path in paths {
            let path = path.map_err(|e| DnsError::Config(format!("alias glob: {e}")))?;
            config.load_file(&path)?;
        }

        info!(aliases = config.aliases.len(), pattern, "loaded alias configuration");
        Ok(config)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), DnsError> {
        let contents = std::fs::read(path)?;
        let entries: HashMap<String, Vec<String>> = serde_json::from_slice(&contents)?;

        for (alias, targets) in entries {
            if targets.is_empty() {
                return Err(DnsError::Config(format!(
                    "alias {alias:?} in {} has no resolution targets",
                    path.display()
                )));
            }
            self.aliases.insert(
                fqdn(&alias),
                targets.iter().map(|t| normalize_target(t)).collect(),
            );
        }

        Ok(())
    }

    /// Insert a single alias. Used by tests and programmatic construction.
    pub fn insert(&mut self, alias: &str, targets: Vec<String>) {
        self.aliases.insert(
            fqdn(alias),
            targets.iter().map(|t| normalize_target(t)).collect(),
        );
    }

    /// The resolution targets for `fqdn_name`; empty for non-aliases.
    pub fn resolutions(&self, fqdn_name: &str) -> Vec<String> {
        self.aliases
            .get(&fqdn(fqdn_name))
            .cloned()
            .unwrap_or_default()
    }

    /// All configured alias names.
    pub fn alias_hosts(&self) -> Vec<String> {
        self.aliases.keys().cloned().collect()
    }

    /// Whether any aliases are configured.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Literal IP targets stay as written; name targets are normalized to FQDNs.
fn normalize_target(target: &str) -> String {
    if target.parse::<std::net::IpAddr>().is_ok() {
        target.to_string()
    } else {
        fqdn(target)
    }
}
