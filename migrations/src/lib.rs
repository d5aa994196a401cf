//! Migrations for lending market deployments, and the CLI that runs them

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod cli;
pub mod commands;
pub mod constants;
pub mod migrations;
pub mod relations;
pub mod utils;
