//! The migrations this binary can run, registered at link time

pub mod set_pause_guardian;
pub mod upgrade_market_implementation;

use deployer::{errors::DeployerError, migration::MigrationRegistry};

pub use set_pause_guardian::SetPauseGuardian;
pub use upgrade_market_implementation::UpgradeMarketImplementation;

deployer::migration!(UpgradeMarketImplementation);
deployer::migration!(SetPauseGuardian);

/// Load every migration registered in this crate
pub fn registry() -> Result<MigrationRegistry, DeployerError> {
    MigrationRegistry::from_inventory()
}
