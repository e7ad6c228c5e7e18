//! Credentials forwarded to the target.
//!
//! Values are collected once at the entry boundary (see `main`) and threaded
//! down explicitly; nothing below this module reads the environment.

use std::fmt;

use anyhow::{Result, bail};

/// Named secret values. `Debug` never prints the values.
#[derive(Clone, Default)]
pub struct Credentials {
    entries: Vec<(String, Option<String>)>,
}

impl Credentials {
    /// Look up each required name through `lookup` (normally `std::env::var`).
    pub fn collect<F>(names: &[String], mut lookup: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let entries = names
            .iter()
            .map(|name| {
                let value = lookup(name).filter(|value| !value.trim().is_empty());
                (name.clone(), value)
            })
            .collect();
        Self { entries }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(name, value)| (name.into(), Some(value.into())))
                .collect(),
        }
    }

    /// Fail fast, naming every missing credential.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("missing required credentials: {}", missing.join(", "));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// `export NAME='value' ...` for every present credential, or `None`
    /// when there is nothing to export. `GITHUB_TOKEN` is mirrored to
    /// `GH_TOKEN` for the `gh` CLI.
    pub fn export_line(&self) -> Option<String> {
        let mut assignments: Vec<String> = self
            .entries
            .iter()
            .filter_map(|(name, value)| value.as_deref().map(|value| assign(name, value)))
            .collect();
        if self.get("GH_TOKEN").is_none()
            && let Some(token) = self.get("GITHUB_TOKEN")
        {
            assignments.push(assign("GH_TOKEN", token));
        }
        if assignments.is_empty() {
            return None;
        }
        Some(format!("export {}", assignments.join(" ")))
    }
}

fn assign(name: &str, value: &str) -> String {
    format!("{name}={}", shell_escape::unix::escape(value.into()))
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.entries {
            map.entry(name, &if value.is_some() { "<redacted>" } else { "<missing>" });
        }
        map.finish()
    }
}
