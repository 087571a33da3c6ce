//! Colloquy is the streaming orchestration core of an AI chat client.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation state machine: the send pipeline,
//!   adaptive stream buffering, tool-call tracking, parallel fan-out, and
//!   the typed event bus observers subscribe to.
//! - [`security`] provides prompt-injection screening, per-conversation
//!   threat escalation, and reversible redaction of sensitive substrings.
//! - [`api`] defines the backend streaming seam ([`api::ChatBackend`]) plus
//!   an OpenAI-compatible SSE adapter.
//! - [`tools`] wraps tool invocation with backoff-aware retry.
//! - [`storage`] defines the conversation store seam and ships an in-memory
//!   reference implementation.
//!
//! Embedders construct a [`core::orchestrator::StreamOrchestrator`] with
//! their backend, store, and tool client, then drive it through the returned
//! [`core::orchestrator::OrchestratorHandle`].

pub mod api;
pub mod core;
pub mod logging;
pub mod security;
pub mod storage;
pub mod tools;
pub mod utils;
