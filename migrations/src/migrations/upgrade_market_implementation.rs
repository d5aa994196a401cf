//! Deploys a new market implementation and proposes upgrading the market
//! proxy to it

use alloy_primitives::Address;
use async_trait::async_trait;
use deployer::{
    constants::EIP1967_IMPLEMENTATION_SLOT,
    governance::{propose, ProposalAction},
    manager::DeploymentManager,
    migration::Migration,
    types::AbiValue,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::{
    BASE_TOKEN_ALIAS, BASE_TOKEN_SIGNATURE, GOVERNOR_ALIAS, MARKET_ADMIN_ALIAS, MARKET_ALIAS,
    MARKET_BUILD, NEXT_MARKET_IMPLEMENTATION, UPGRADE_SIGNATURE,
};

/// Upgrade the market proxy to a freshly deployed implementation
pub struct UpgradeMarketImplementation;

/// What `prepare` deployed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeVars {
    /// The new implementation
    pub implementation: Address,
}

#[async_trait]
impl Migration for UpgradeMarketImplementation {
    type Vars = UpgradeVars;

    fn name(&self) -> &str {
        "001_upgrade_market_implementation"
    }

    async fn prepare(&self, deployment: &DeploymentManager) -> eyre::Result<UpgradeVars> {
        let base_token = deployment.address(BASE_TOKEN_ALIAS).await?;
        let build = deployment.build(MARKET_BUILD)?;

        let record = deployment
            .deploy(
                NEXT_MARKET_IMPLEMENTATION,
                build,
                &[AbiValue::Address(base_token)],
                false,
            )
            .await?;

        Ok(UpgradeVars {
            implementation: record.address,
        })
    }

    async fn enact(
        &self,
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
        vars: &UpgradeVars,
    ) -> eyre::Result<()> {
        let admin = deployment.address(MARKET_ADMIN_ALIAS).await?;
        let market = deployment.address(MARKET_ALIAS).await?;

        let action = ProposalAction::call(
            admin,
            UPGRADE_SIGNATURE,
            vec![AbiValue::Address(market), AbiValue::Address(vars.implementation)],
        );
        let description = format!(
            "# Upgrade {} market\n\nUpgrades the market on {} to implementation {}.",
            deployment.scope().deployment,
            deployment.network(),
            vars.implementation
        );

        let submission = propose(governance, GOVERNOR_ALIAS, &[action], &description).await?;
        info!(proposal_id = ?submission.proposal_id, "proposed market upgrade");
        Ok(())
    }

    async fn enacted(&self, deployment: &DeploymentManager) -> eyre::Result<bool> {
        let Some(next) = deployment.artifact(NEXT_MARKET_IMPLEMENTATION) else {
            return Ok(false);
        };

        let current = deployment
            .storage_address(MARKET_ALIAS, EIP1967_IMPLEMENTATION_SLOT)
            .await?;
        Ok(current == next.address)
    }

    async fn verify(&self, deployment: &DeploymentManager, vars: &UpgradeVars) -> eyre::Result<()> {
        let current = deployment
            .storage_address(MARKET_ALIAS, EIP1967_IMPLEMENTATION_SLOT)
            .await?;
        eyre::ensure!(
            current == vars.implementation,
            "market implementation is {}, expected {}",
            current,
            vars.implementation
        );

        // The upgraded market must still answer for its base token
        let base_token = deployment.address(BASE_TOKEN_ALIAS).await?;
        let reported = deployment
            .read_address(MARKET_ALIAS, BASE_TOKEN_SIGNATURE, &[])
            .await?;
        eyre::ensure!(
            reported == base_token,
            "market reports base token {}, expected {}",
            reported,
            base_token
        );

        Ok(())
    }
}
