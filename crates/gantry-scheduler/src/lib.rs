//! Job-graph scheduling and execution for the Gantry workflow engine.
//!
//! The entry point is [`engine::Engine`]: submit a
//! [`gantry_core::workflow::WorkflowDefinition`], get back a run id,
//! and await its terminal [`gantry_core::run::RunReport`]. Everything
//! else in this crate is a stage of that path: structural validation
//! ([`graph`]), matrix fan-out ([`matrix`]), cross-run admission
//! ([`concurrency`]), and status rollup ([`aggregate`]).

pub mod aggregate;
pub mod bus;
pub mod concurrency;
pub mod engine;
pub mod graph;
pub mod matrix;

pub use engine::{Engine, RetryPolicy};
