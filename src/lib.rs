//! Autonomous browser agent that finds used-vehicle listings on unfamiliar
//! marketplace sites.
//!
//! A visit drives one Chrome tab through a few phases. Each phase is a bounded
//! loop of accessibility snapshot, backend decision and UI action. The
//! final snapshot is mined for listing links.

pub mod agent;
pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod events;
pub mod extract;
pub mod hands;
pub mod orchestrator;
pub mod page;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, ScoutError};
