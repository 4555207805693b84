//! # TernDB Testkit
//!
//! Shared fixtures for TernDB tests: temp-directory databases, schema
//! helpers, and a scripted sync server that drives the far end of an
//! in-process transport.

#![deny(unsafe_code)]

mod fixtures;
mod server;

pub use fixtures::{init_tracing, DbFixture};
pub use server::{ScriptedServer, ServerKnobs, ServerStats};
