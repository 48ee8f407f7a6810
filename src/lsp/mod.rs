//! Language server client.
//!
//! # Architecture
//!
//! Leaves first:
//! - `launcher`: spawns the server and owns the child process
//! - `transport`: `Content-Length` framing over the child's stdio
//! - `selector`: decides which documents the session serves
//! - `pending`: request-id bookkeeping
//! - `client`: the session state machine tying the above together
//! - `types`: JSON-RPC envelopes and position/URI helpers
//!
//! # Usage
//!
//! ```ignore
//! use jusu_lsp::lsp::{ClientSession, LaunchConfig};
//!
//! let session = ClientSession::builder(LaunchConfig::new("python").arg(script)).build();
//! session.start().await?;
//! session.did_open(uri, "jusu", text).await?;
//! session.stop().await;
//! ```

pub mod client;
pub mod launcher;
mod pending;
pub mod selector;
pub mod transport;
pub mod types;

pub use client::{
    ClientSession, ClientSessionBuilder, SessionEvent, SessionOptions, SessionState, StopOutcome,
};
pub use launcher::{LaunchConfig, ProcessHandle, StderrMode, Termination, TransportKind, launch};
pub use selector::{DocumentFilter, DocumentSelector};
pub use transport::{FrameReader, FrameWriter, Transport};

pub use lsp_types::{Diagnostic, DiagnosticSeverity, Position, Url};
