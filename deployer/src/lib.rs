//! Orchestration core for deploying, discovering and migrating contracts
//! across many independent networks.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod governance;
pub mod manager;
pub mod migration;
pub mod network;
pub mod retry;
pub mod rpc;
mod solidity;
pub mod spider;
pub mod types;
mod utils;

pub use solidity::{encode_args, encode_call, selector};

// Re-exported so that `migration!` can expand in downstream crates
#[doc(hidden)]
pub use inventory;
