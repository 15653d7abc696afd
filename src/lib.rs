//! Fencer - Brute-Force Detection Service
//!
//! Clients report hits, a value seen under a named direction, and get back
//! whether that value has exceeded its allowed rate within a sliding time
//! window. State is in memory and local to one process.

pub mod config;
pub mod error;
pub mod hitcounter;
pub mod server;
