//! Jusu++ language client
//!
//! Launches the Jusu++ language server as a child process, speaks the
//! Language Server Protocol with it over stdio, and routes the host
//! editor's documents into the session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  activate / route   ┌─────────────────┐
//! │   Host editor   │────────────────────►│    Extension    │
//! │  (or the CLI)   │◄────────────────────│   controller    │
//! └─────────────────┘   errors, events    └────────┬────────┘
//!                                                  │
//!                                           ┌──────▼──────┐
//!                                           │   Client    │
//!                                           │   session   │
//!                                           └──────┬──────┘
//!                                                  │ Content-Length framed
//!                                                  │ JSON-RPC over stdio
//!                                           ┌──────▼────────┐
//!                                           │ python        │
//!                                           │ lsp_server.py │
//!                                           └───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types for the entire crate
//! - [`lsp`] - Process launcher, transport, selector and client session
//! - [`extension`] - Activation, deactivation and document routing
//! - [`config`] - Settings file handling
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! jusu_lsp::activate(Arc::new(MyHost::new())).await?;
//! jusu_lsp::route(DocumentEvent::opened(uri, "jusu", text)).await?;
//! jusu_lsp::deactivate().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod extension;
pub mod lsp;

pub use error::{Error, Result};
pub use extension::{DocumentEvent, DocumentEventKind, Extension, Host, activate, deactivate, route};
