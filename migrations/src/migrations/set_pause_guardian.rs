//! Hands the market's pause guardian role to the deployment's guardian

use async_trait::async_trait;
use deployer::{
    governance::{propose, ProposalAction},
    manager::DeploymentManager,
    migration::Migration,
    types::AbiValue,
};

use crate::constants::{
    GOVERNOR_ALIAS, GUARDIAN_ALIAS, MARKET_ALIAS, PAUSE_GUARDIAN_SIGNATURE,
    SET_PAUSE_GUARDIAN_SIGNATURE,
};

/// Set the market's pause guardian to the address aliased `guardian`
pub struct SetPauseGuardian;

#[async_trait]
impl Migration for SetPauseGuardian {
    type Vars = ();

    fn name(&self) -> &str {
        "002_set_pause_guardian"
    }

    async fn prepare(&self, deployment: &DeploymentManager) -> eyre::Result<()> {
        // Fail early if the guardian was never registered
        deployment.address(GUARDIAN_ALIAS).await?;
        Ok(())
    }

    async fn enact(
        &self,
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
        _: &(),
    ) -> eyre::Result<()> {
        let market = deployment.address(MARKET_ALIAS).await?;
        let guardian = deployment.address(GUARDIAN_ALIAS).await?;

        let action = ProposalAction::call(
            market,
            SET_PAUSE_GUARDIAN_SIGNATURE,
            vec![AbiValue::Address(guardian)],
        );
        let description = format!(
            "# Set {} pause guardian\n\nSets the pause guardian of the market on {} to {}.",
            deployment.scope().deployment,
            deployment.network(),
            guardian
        );

        propose(governance, GOVERNOR_ALIAS, &[action], &description).await?;
        Ok(())
    }

    async fn enacted(&self, deployment: &DeploymentManager) -> eyre::Result<bool> {
        let guardian = deployment.address(GUARDIAN_ALIAS).await?;
        let current = deployment
            .read_address(MARKET_ALIAS, PAUSE_GUARDIAN_SIGNATURE, &[])
            .await?;
        Ok(current == guardian)
    }
}
