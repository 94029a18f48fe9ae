//! tally HTTP server.
//!
//! This crate wires the ledger, conversation store and chat agent to
//! Postgres, the filesystem blob store and an OpenAI-compatible provider,
//! and exposes them over a small HTTP API.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
