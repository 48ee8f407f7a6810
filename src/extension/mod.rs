//! Editor-facing entry points.
//!
//! An editor loads the extension, calls [`activate`] once with its [`Host`],
//! routes document events through [`route`], and awaits [`deactivate`] on
//! unload. The session lives in a process-wide [`Extension`] holder between
//! those calls.

mod controller;
mod host;

pub use controller::{Extension, activate, deactivate, extension, route};
pub use host::{DocumentEvent, DocumentEventKind, Host};
