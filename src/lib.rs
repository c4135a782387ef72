//! Colosseum Library
//!
//! A competitive evolution engine for trading patterns and the agents
//! that use them.
//!
//! # Layout
//!
//! - `core`: patterns, agents, arenas, evolution and the scheduler
//! - `data`: price sources and the SQLite evolution store
//! - `status`: snapshots and audit exports

pub mod core;
pub mod data;
pub mod config;
pub mod error;
pub mod status;
