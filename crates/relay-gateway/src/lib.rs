// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP/WebSocket gateway for orchestrating tool-using agent sessions.
//!
//! This crate owns session lifecycle and the external transport surface —
//! it has no opinion on which model provider an agent talks to. Callers
//! supply an [`control::AgentFactory`] (and, optionally, a
//! [`gateway::RouterHandle`]) already wired up to concrete provider
//! adapters and credentials.

pub mod config;
pub mod control;
pub mod crypto;
pub mod gateway;
pub mod http;

pub use config::GatewayConfig;
pub use control::{AgentFactory, ControlService};
pub use gateway::{run, RouterHandle};
