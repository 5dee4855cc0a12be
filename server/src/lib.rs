//! Switchboard session-routing and signaling-relay server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod files;
pub mod proto;
pub mod relay;
pub mod routes;
pub mod routing;
pub mod state;
pub mod voice;
pub mod ws;
