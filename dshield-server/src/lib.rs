//! DShield MCP server library
//!
//! Exposes the SIEM engine and threat intelligence orchestrator to AI
//! assistants over the model-context tool protocol, on a local stdio
//! transport or an authenticated TCP transport.

pub mod auth;
pub mod health;
pub mod mcp;
pub mod rpc;
pub mod state;
pub mod tools;
pub mod transport;

pub use state::ServerState;
