//! What the extension needs from the editor hosting it.

use std::path::{Path, PathBuf};

use lsp_types::Url;

use crate::config::Settings;
use crate::lsp::ClientSession;

/// Services the hosting editor provides to the extension.
pub trait Host: Send + Sync + 'static {
    /// Resolves a path relative to the extension's install directory.
    fn as_absolute_path(&self, relative: &Path) -> PathBuf;

    /// Shows an error to the user.
    fn report_error(&self, message: &str);

    /// Settings for this activation.
    fn settings(&self) -> Settings {
        Settings::default()
    }

    /// Called once the session is built and before it starts, so handlers
    /// see every notification the server sends.
    fn register_handlers(&self, _session: &ClientSession) {}
}

/// A document lifecycle event raised by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEvent {
    /// Document URI; its scheme is matched against the selector.
    pub uri: Url,
    /// Language identifier the host assigned to the document.
    pub language_id: String,
    /// What happened.
    pub kind: DocumentEventKind,
}

/// Kinds of [`DocumentEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEventKind {
    /// The document was opened with this content.
    Opened {
        /// Full text.
        text: String,
    },
    /// The document content changed.
    Changed {
        /// Full new text.
        text: String,
    },
    /// The document was saved.
    Saved,
    /// The document was closed.
    Closed,
}

impl DocumentEvent {
    /// Creates an event.
    pub fn new(uri: Url, language_id: impl Into<String>, kind: DocumentEventKind) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            kind,
        }
    }

    /// Shorthand for an [`DocumentEventKind::Opened`] event.
    pub fn opened(uri: Url, language_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(uri, language_id, DocumentEventKind::Opened { text: text.into() })
    }
}
