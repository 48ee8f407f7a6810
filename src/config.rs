//! Settings for the language client.
//!
//! Settings live in an optional `.jusu-lsp.json` file. Every field has a
//! default, so a partial file (or none at all) is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::lsp::{DocumentFilter, DocumentSelector, LaunchConfig, SessionOptions, StderrMode};

/// File name looked up in the working directory.
pub const SETTINGS_FILE: &str = ".jusu-lsp.json";

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Interpreter or executable that runs the server.
    pub server_command: String,
    /// Server entry point, relative to the extension root.
    pub server_script: PathBuf,
    /// URI scheme served by the session.
    pub document_scheme: String,
    /// Language identifier served by the session.
    pub language_id: String,
    /// File extensions (without the dot) treated as `language_id`.
    pub file_extensions: Vec<String>,
    /// Initialize handshake bound, in milliseconds.
    pub init_timeout_ms: u64,
    /// Per-request bound, in milliseconds.
    pub request_timeout_ms: u64,
    /// Grace period for shutdown and for process exit, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// What happens to the server's stderr.
    pub stderr: StderrMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_command: "python".to_string(),
            server_script: PathBuf::from("../tools/lsp_server.py"),
            document_scheme: "file".to_string(),
            language_id: "jusu".to_string(),
            file_extensions: vec!["jusu".to_string(), "jusu++".to_string()],
            init_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            shutdown_timeout_ms: 2_000,
            stderr: StderrMode::Inherit,
        }
    }
}

impl Settings {
    /// Reads and validates a settings file.
    ///
    /// ## Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds invalid values.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    ///
    /// ## Errors
    /// Same as [`load`](Self::load) for a file that exists.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Checks values serde cannot.
    ///
    /// ## Errors
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.server_command.trim().is_empty() {
            bail!("server_command must not be empty");
        }
        if self.language_id.is_empty() || self.document_scheme.is_empty() {
            bail!("document_scheme and language_id must not be empty");
        }
        for (name, value) in [
            ("init_timeout_ms", self.init_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }

    /// Launch configuration running `server_command <script>`.
    ///
    /// `script` is the server entry point already resolved to an absolute path.
    pub fn launch_config(&self, script: &Path) -> LaunchConfig {
        LaunchConfig::new(&self.server_command)
            .arg(script.to_string_lossy())
            .stderr(self.stderr)
    }

    /// Selector for the configured scheme and language.
    pub fn selector(&self) -> DocumentSelector {
        DocumentSelector::new([DocumentFilter::new(
            &self.document_scheme,
            &self.language_id,
        )])
    }

    /// Session timeouts.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            ..SessionOptions::default()
        }
    }

    /// Language id for a file, judged by extension; `plaintext` otherwise.
    pub fn language_for(&self, path: &Path) -> &str {
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.file_extensions.iter().any(|known| known == ext));
        if matches { &self.language_id } else { "plaintext" }
    }
}

/// Writes a default settings file into `dir`.
///
/// The file is written to a temporary name and renamed into place.
///
/// ## Errors
/// Returns an error if a settings file already exists or on I/O failure.
pub fn configure(dir: &Path) -> Result<PathBuf> {
    let config_file = dir.join(SETTINGS_FILE);
    if config_file.exists() {
        bail!(
            "{} already exists\n\n\
            To reconfigure, remove it first, then run:\n  \
            jusu-lsp config",
            config_file.display()
        );
    }

    let json = serde_json::to_string_pretty(&Settings::default())
        .context("failed to serialize settings")?;
    let temp_file = config_file.with_extension("tmp");
    fs::write(&temp_file, json).context("failed to write temporary settings file")?;
    fs::rename(&temp_file, &config_file).context("failed to rename temporary settings file")?;

    Ok(config_file)
}
