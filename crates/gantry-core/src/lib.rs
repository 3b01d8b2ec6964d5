//! Gantry Core
//!
//! Core domain types, traits, and error handling for the Gantry workflow
//! engine. This crate has minimal dependencies and defines the shared
//! vocabulary used across the workspace: workflow definitions, run and
//! instance state, lifecycle events, and the ports the engine talks
//! through.

pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod run;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;
