//! jusu-lsp - command-line host for the Jusu++ language client.
//!
//! Plays the editor's part: activates the client, feeds it documents from
//! disk, prints what the language server answers, and deactivates.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use jusu_lsp::config::{self, SETTINGS_FILE, Settings};
use jusu_lsp::extension::{self, DocumentEvent, Extension, Host};
use jusu_lsp::lsp::types::{from_lsp_position, path_to_url, to_lsp_position};
use jusu_lsp::lsp::{ClientSession, DiagnosticSeverity, Url};
use lsp_types::notification::PublishDiagnostics;
use lsp_types::{
    CompletionResponse, Diagnostic, HoverContents, MarkedString, PublishDiagnosticsParams,
};
use tokio::sync::mpsc;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Language client for Jusu++.
#[derive(Parser, Debug)]
#[command(name = "jusu-lsp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory the server script path is resolved against.
    #[arg(long, global = true, default_value = ".")]
    extension_root: PathBuf,

    /// Settings file. Defaults to `.jusu-lsp.json` if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open files in the language server and print its diagnostics.
    Check {
        /// Files to check.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// How long to wait for diagnostics, in milliseconds.
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,
    },
    /// Show hover information at a 1-indexed position.
    Hover {
        /// Document to query.
        file: PathBuf,
        /// Line number (1-indexed).
        line: u32,
        /// Column number (1-indexed).
        column: u32,
    },
    /// List completions at a 1-indexed position.
    Complete {
        /// Document to query.
        file: PathBuf,
        /// Line number (1-indexed).
        line: u32,
        /// Column number (1-indexed).
        column: u32,
    },
    /// Write a default `.jusu-lsp.json` into the current directory.
    Config,
}

impl Args {
    /// Parses the log level string into a tracing Level.
    fn parse_log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => bail!("invalid log level: {other}"),
        }
    }

    fn load_settings(&self) -> Result<Settings> {
        match &self.config {
            Some(path) => Settings::load(path),
            None => Settings::load_or_default(Path::new(SETTINGS_FILE)),
        }
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("jusu_lsp={level}")));

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(false),
        )
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}

/// The command line standing in for an editor.
struct CliHost {
    extension_root: PathBuf,
    settings: Settings,
    diagnostics: mpsc::UnboundedSender<PublishDiagnosticsParams>,
}

impl Host for CliHost {
    fn as_absolute_path(&self, relative: &Path) -> PathBuf {
        let joined = self.extension_root.join(relative);
        joined.canonicalize().unwrap_or(joined)
    }

    fn report_error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    fn settings(&self) -> Settings {
        self.settings.clone()
    }

    fn register_handlers(&self, session: &ClientSession) {
        let diagnostics = self.diagnostics.clone();
        session.on_notification_typed::<PublishDiagnostics>(move |params| {
            let _ = diagnostics.send(params);
        });
    }
}

/// Activates the client; the host has already shown why if this fails.
async fn activate_client(extension: &Extension, host: Arc<dyn Host>) -> bool {
    match extension.activate(host).await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "activation failed");
            false
        }
    }
}

/// Reads a file from disk and opens it in the active session.
///
/// Returns `None` when the selector does not serve the file.
async fn open_document(settings: &Settings, path: &Path) -> Result<Option<Url>> {
    let uri = path_to_url(path)?;
    let language_id = settings.language_for(path);
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let routed = extension::route(DocumentEvent::opened(uri.clone(), language_id, text)).await?;
    if routed {
        Ok(Some(uri))
    } else {
        warn!(path = %path.display(), language_id, "not a document this client serves");
        Ok(None)
    }
}

fn severity_label(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(DiagnosticSeverity::ERROR) => "error",
        Some(DiagnosticSeverity::WARNING) => "warning",
        Some(DiagnosticSeverity::INFORMATION) => "info",
        Some(DiagnosticSeverity::HINT) => "hint",
        _ => "note",
    }
}

fn display_path(uri: &Url) -> String {
    uri.to_file_path()
        .map_or_else(|()| uri.to_string(), |p| p.display().to_string())
}

/// Prints diagnostics as `path:line:col: severity: message`.
///
/// Returns the number of errors printed.
fn print_diagnostics(diagnostics: &BTreeMap<String, Vec<Diagnostic>>) -> usize {
    let mut errors = 0;
    for (path, items) in diagnostics {
        for diagnostic in items {
            let (line, column) = from_lsp_position(diagnostic.range.start);
            let severity = severity_label(diagnostic.severity);
            if diagnostic.severity == Some(DiagnosticSeverity::ERROR) {
                errors += 1;
            }
            println!("{path}:{line}:{column}: {severity}: {}", diagnostic.message);
        }
    }
    errors
}

async fn check(
    settings: &Settings,
    files: &[PathBuf],
    settle: Duration,
    diagnostics_rx: &mut mpsc::UnboundedReceiver<PublishDiagnosticsParams>,
) -> Result<usize> {
    let mut expected = HashSet::new();
    for file in files {
        if let Some(uri) = open_document(settings, file).await? {
            expected.insert(uri);
        }
    }
    if expected.is_empty() {
        bail!("none of the given files is a {} document", settings.language_id);
    }

    let mut collected = BTreeMap::new();
    let deadline = tokio::time::Instant::now() + settle;
    while !expected.is_empty() {
        match tokio::time::timeout_at(deadline, diagnostics_rx.recv()).await {
            Ok(Some(params)) => {
                expected.remove(&params.uri);
                collected.insert(display_path(&params.uri), params.diagnostics);
            }
            Ok(None) => break,
            Err(_) => {
                debug!(missing = expected.len(), "stopped waiting for diagnostics");
                break;
            }
        }
    }

    Ok(print_diagnostics(&collected))
}

fn render_hover(contents: HoverContents) -> String {
    let marked = |m: MarkedString| match m {
        MarkedString::String(s) => s,
        MarkedString::LanguageString(ls) => ls.value,
    };
    match contents {
        HoverContents::Scalar(m) => marked(m),
        HoverContents::Array(items) => items.into_iter().map(marked).collect::<Vec<_>>().join("\n"),
        HoverContents::Markup(markup) => markup.value,
    }
}

async fn query(settings: &Settings, command: Command) -> Result<()> {
    let (Command::Hover { file, line, column } | Command::Complete { file, line, column }) =
        &command
    else {
        return Ok(());
    };

    let position = to_lsp_position(*line, *column)?;
    let Some(uri) = open_document(settings, file).await? else {
        bail!("{} is not a {} document", file.display(), settings.language_id);
    };
    let session = extension::extension()
        .session()
        .context("language client is not active")?;

    match command {
        Command::Hover { .. } => match session.hover(uri, position).await? {
            Some(hover) => println!("{}", render_hover(hover.contents)),
            None => println!("no hover information"),
        },
        Command::Complete { .. } => {
            let items = match session.completion(uri, position).await? {
                Some(CompletionResponse::Array(items)) => items,
                Some(CompletionResponse::List(list)) => list.items,
                None => Vec::new(),
            };
            for item in items {
                match item.detail {
                    Some(detail) => println!("{}\t{detail}", item.label),
                    None => println!("{}", item.label),
                }
            }
        }
        Command::Check { .. } | Command::Config => {}
    }
    Ok(())
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let log_level = args.parse_log_level()?;
    init_tracing(log_level)?;

    if let Command::Config = args.command {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        let path = config::configure(&cwd)?;
        println!("Created {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let settings = args.load_settings()?;
    let (diagnostics_tx, mut diagnostics_rx) = mpsc::unbounded_channel();
    let host = Arc::new(CliHost {
        extension_root: args.extension_root.clone(),
        settings: settings.clone(),
        diagnostics: diagnostics_tx,
    });

    info!(
        extension_root = %args.extension_root.display(),
        server_command = %settings.server_command,
        "activating language client"
    );
    if !activate_client(extension::extension(), host).await {
        return Ok(ExitCode::FAILURE);
    }

    let result = match args.command {
        Command::Check { files, settle_ms } => {
            check(&settings, &files, Duration::from_millis(settle_ms), &mut diagnostics_rx)
                .await
                .map(|errors| errors == 0)
        }
        command => query(&settings, command).await.map(|()| true),
    };

    let outcome = extension::deactivate().await;
    debug!(?outcome, "language client deactivated");

    if result? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
