//! Warden configuration, read from `.warden/config.toml` by default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::remote::{
    CommandTransport, SCRIPT_PLACEHOLDER, SCRIPT_SH_PLACEHOLDER, default_transport_argv,
};
use crate::offrails::OffRailsConfig;

pub const DEFAULT_CONFIG_PATH: &str = ".warden/config.toml";

/// Warden configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults;
/// CLI flags override individual values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardenConfig {
    pub dispatch: DispatchConfig,
    pub offrails: OffRailsSettings,
    pub wait: WaitConfig,
    pub transport: TransportConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Requested session runtime; the grace period is added on top.
    pub timeout_secs: u64,
    /// Iteration cap forwarded to the remote loop as `MAX_ITERATIONS`.
    pub max_iterations: u32,
    /// Directory on the target holding repo checkouts and the loop script.
    pub workspace_root: String,
    /// Loop script file name under `workspace_root`; its presence marks a
    /// bootstrapped target.
    pub loop_script: String,
    /// Optional task template overriding the built-in one.
    pub prompt_template: Option<PathBuf>,
    /// Remediation shown when the target is not bootstrapped. `{target}` and
    /// `{repo}` are substituted.
    pub setup_hint: String,
    /// Timeout for short probes (connectivity, guard, markers).
    pub probe_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub verify_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            max_iterations: 50,
            workspace_root: "/home/sprite/workspace".to_string(),
            loop_script: ".ralph.sh".to_string(),
            prompt_template: None,
            setup_hint: "run: bb setup {target} --repo {repo}".to_string(),
            probe_timeout_secs: 15,
            sync_timeout_secs: 2 * 60,
            verify_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OffRailsSettings {
    /// Abort after this much silence; 0 disables the abort.
    pub silence_abort_secs: u64,
    pub silence_warn_secs: u64,
    pub error_repeat: u32,
    pub check_interval_secs: u64,
}

impl Default for OffRailsSettings {
    fn default() -> Self {
        Self {
            silence_abort_secs: 5 * 60,
            silence_warn_secs: 45,
            error_repeat: 3,
            check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WaitConfig {
    pub settle_secs: u64,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            settle_secs: 5,
            poll_interval_secs: 5,
            timeout_secs: 60 * 60,
            probe_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Argv template; see [`CommandTransport`] for placeholders.
    pub command: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command: default_transport_argv(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Environment variables that must be set before dispatching.
    pub required: Vec<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            required: vec!["GITHUB_TOKEN".to_string()],
        }
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        let dispatch = &self.dispatch;
        if dispatch.timeout_secs == 0 {
            return Err(anyhow!("dispatch.timeout_secs must be > 0"));
        }
        if dispatch.max_iterations == 0 {
            return Err(anyhow!("dispatch.max_iterations must be > 0"));
        }
        if dispatch.probe_timeout_secs == 0
            || dispatch.sync_timeout_secs == 0
            || dispatch.verify_timeout_secs == 0
        {
            return Err(anyhow!("dispatch probe/sync/verify timeouts must be > 0"));
        }
        if !dispatch.workspace_root.starts_with('/') {
            return Err(anyhow!("dispatch.workspace_root must be an absolute path"));
        }
        if dispatch.loop_script.trim().is_empty() || dispatch.loop_script.contains('/') {
            return Err(anyhow!("dispatch.loop_script must be a plain file name"));
        }
        if self.wait.poll_interval_secs == 0 || self.wait.timeout_secs == 0 {
            return Err(anyhow!("wait.poll_interval_secs and wait.timeout_secs must be > 0"));
        }
        if self.wait.probe_timeout_secs == 0 {
            return Err(anyhow!("wait.probe_timeout_secs must be > 0"));
        }
        let command = &self.transport.command;
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(anyhow!("transport.command must be a non-empty array"));
        }
        if !command
            .iter()
            .any(|arg| arg.contains(SCRIPT_PLACEHOLDER) || arg.contains(SCRIPT_SH_PLACEHOLDER))
        {
            return Err(anyhow!(
                "transport.command must contain {SCRIPT_PLACEHOLDER} or {SCRIPT_SH_PLACEHOLDER}"
            ));
        }

        let offrails = &self.offrails;
        if offrails.silence_abort_secs > 0 && offrails.silence_warn_secs > offrails.silence_abort_secs
        {
            warn!(
                silence_warn_secs = offrails.silence_warn_secs,
                silence_abort_secs = offrails.silence_abort_secs,
                "silence warning fires after the abort threshold"
            );
        }
        Ok(())
    }

    pub fn offrails_config(&self) -> OffRailsConfig {
        let settings = &self.offrails;
        OffRailsConfig {
            silence_abort: Duration::from_secs(settings.silence_abort_secs),
            silence_warn: Duration::from_secs(settings.silence_warn_secs),
            error_repeat: settings.error_repeat,
            check_interval: Duration::from_secs(settings.check_interval_secs),
        }
        .with_defaults()
    }

    pub fn transport(&self) -> Result<CommandTransport> {
        CommandTransport::new(self.transport.command.clone()).context("build transport")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WardenConfig::default()`.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        let cfg = WardenConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WardenConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
