//! # evald: Persistent Evaluation Daemon Core
//!
//! evald keeps long-lived evaluation sessions, one per caller-supplied context
//! key, and evaluates short snippets of source against them. Later snippets
//! see the bindings of earlier ones under the same key; different keys never
//! interfere.
//!
//! ## Request Pipeline
//!
//! ```text
//! bytes → codec → service → registry → supervisor → engine
//!                                          ↓
//! bytes ← codec ← service ← formatter + captured output
//! ```
//!
//! - Framing: [`codec`] decodes the keyed and legacy wire formats.
//! - Dispatch: [`service`] short-circuits empty input, resolves the session
//!   through the [`registry`] and maps outcomes to responses.
//! - Execution: [`supervisor`] serializes requests per key, enforces the
//!   deadline and handles incomplete statements.
//! - Evaluation: [`engine`] defines the interpreter traits and ships the
//!   built-in script engine.
//! - Output: [`capture`] buffers emitted text, [`formatter`] renders values.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. On timeout the engine is asked to stop and
//! is given a grace period; a worker that ignores the request is abandoned
//! rather than killed. This crate is not a sandbox.

pub mod capture;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod formatter;
pub mod registry;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod value;

// Re-exports
pub use codec::{Protocol, Request, Response};
pub use config::DaemonConfig;
pub use error::*;
pub use service::EvalService;
pub use supervisor::EvalOutcome;
pub use value::Value;
