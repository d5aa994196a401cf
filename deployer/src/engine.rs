//! The migration lifecycle engine.
//!
//! Drives each selected migration through
//! `Registered -> Prepared -> Enacted -> Verified`, with a shortcut to
//! `AlreadyEnacted` when the change is live before `enact` ever runs.
//! Progress is checkpointed in the artifact cache so a crashed run can be
//! re-entered without preparing twice or blindly resubmitting a proposal.

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    errors::DeployerError,
    manager::DeploymentManager,
    migration::{DynMigration, MigrationRegistry},
    network::ClientError,
};

/// How far a migration got in a previous run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    /// `prepare` completed and its vars were persisted
    Prepared,
    /// `enact` was started; whether it submitted anything is unknown
    EnactAttempted,
    /// `enact` completed
    Enacted,
    /// `verify` passed
    Verified,
}

/// The persisted progress of one migration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// How far the migration got
    pub status: CheckpointStatus,
    /// The vars `prepare` produced
    #[serde(default)]
    pub vars: Value,
}

/// The state a run leaves a migration in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationState {
    /// Loaded but not run
    Registered,
    /// Prepared, not enacted
    Prepared,
    /// Enacted; the change may still be awaiting execution
    Enacted,
    /// The change was live before this tool enacted it
    AlreadyEnacted,
    /// Enacted and verified
    Verified,
}

/// A lifecycle stage that can fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// `prepare`
    Prepare,
    /// The `enacted` predicate
    Enacted,
    /// `enact`
    Enact,
    /// `verify`
    Verify,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Prepare => write!(f, "prepare"),
            Stage::Enacted => write!(f, "enacted check"),
            Stage::Enact => write!(f, "enact"),
            Stage::Verify => write!(f, "verify"),
        }
    }
}

/// Options for one engine run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after `prepare`
    pub prepare_only: bool,
    /// Run `verify` once a change is live
    pub verify: bool,
    /// Enact again even if a previous attempt's outcome is unknown
    pub force_enact: bool,
    /// The deadline for the whole run, confirmation waits included
    pub run_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prepare_only: false,
            verify: true,
            force_enact: false,
            run_timeout: None,
        }
    }
}

/// The outcome of running one migration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    /// The migration name
    pub name: String,
    /// The state the run left it in
    pub state: MigrationState,
}

/// Runs migrations from a registry against a deployment
pub struct MigrationEngine<'a> {
    /// The loaded migrations
    registry: &'a MigrationRegistry,
    /// The run options
    options: RunOptions,
}

impl<'a> MigrationEngine<'a> {
    /// Construct an engine over a registry
    pub fn new(registry: &'a MigrationRegistry, options: RunOptions) -> Self {
        Self { registry, options }
    }

    /// Run the named migrations in the given order, stopping at the first
    /// failure.
    ///
    /// Unknown names fail before any network interaction.
    pub async fn run<S: AsRef<str>>(
        &self,
        names: &[S],
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
    ) -> Result<Vec<MigrationReport>, DeployerError> {
        let migrations = self.registry.select(names)?;

        let run = async {
            let mut reports = Vec::with_capacity(migrations.len());
            for migration in migrations {
                reports.push(self.run_one(migration, deployment, governance).await?);
            }
            Ok::<_, DeployerError>(reports)
        };

        match self.options.run_timeout {
            Some(timeout) => tokio::time::timeout(timeout, run)
                .await
                .map_err(|_| DeployerError::RunTimedOut(timeout))?,
            None => run.await,
        }
    }

    /// Drive one migration as far as it can go in this run
    pub async fn run_one(
        &self,
        migration: &dyn DynMigration,
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
    ) -> Result<MigrationReport, DeployerError> {
        let name = migration.name();
        let report = |state| {
            info!(migration = name, state = ?state, "migration run finished");
            Ok(MigrationReport {
                name: name.to_string(),
                state,
            })
        };

        let checkpoint = deployment.cache().checkpoint(deployment.scope(), name);
        let status = checkpoint.as_ref().map(|c| c.status);
        if status == Some(CheckpointStatus::Verified) {
            return report(MigrationState::Verified);
        }

        let submitted = matches!(
            status,
            Some(CheckpointStatus::EnactAttempted | CheckpointStatus::Enacted)
        );
        let vars = checkpoint.and_then(|c| usable_vars(migration, c));

        let live = migration
            .enacted(deployment)
            .await
            .map_err(stage_error(name, Stage::Enacted))?;

        if live {
            return match vars {
                // This tool submitted the change and it has since executed
                Some(vars) if submitted && self.options.verify && !self.options.prepare_only => {
                    self.verify_and_record(migration, deployment, &vars).await?;
                    report(MigrationState::Verified)
                }
                _ if submitted => report(MigrationState::Enacted),
                _ => report(MigrationState::AlreadyEnacted),
            };
        }

        // A submitted change is never enacted again unless forced, whether or
        // not its vars are still readable
        match status {
            Some(CheckpointStatus::Enacted) if !self.options.force_enact => {
                info!(migration = name, "enacted previously, awaiting execution");
                return report(MigrationState::Enacted);
            }
            Some(CheckpointStatus::EnactAttempted) if !self.options.force_enact => {
                return Err(DeployerError::EnactOutcomeUnknown(name.to_string()));
            }
            _ => {}
        }

        let vars = match vars {
            Some(vars) => {
                info!(migration = name, status = ?status, "resuming from checkpoint");
                vars
            }
            None => {
                info!(migration = name, "preparing");
                let vars = migration
                    .prepare(deployment)
                    .await
                    .map_err(stage_error(name, Stage::Prepare))?;
                self.record(deployment, name, CheckpointStatus::Prepared, &vars)?;
                vars
            }
        };

        if self.options.prepare_only {
            return report(MigrationState::Prepared);
        }

        self.record(deployment, name, CheckpointStatus::EnactAttempted, &vars)?;
        info!(migration = name, "enacting");
        if let Err(e) = migration.enact(deployment, governance, &vars).await {
            if nothing_submitted(&e) {
                self.record(deployment, name, CheckpointStatus::Prepared, &vars)?;
            }
            return Err(stage_error(name, Stage::Enact)(e));
        }
        self.record(deployment, name, CheckpointStatus::Enacted, &vars)?;

        let live = migration
            .enacted(deployment)
            .await
            .map_err(stage_error(name, Stage::Enacted))?;
        if !live {
            info!(migration = name, "enacted, awaiting execution");
            return report(MigrationState::Enacted);
        }

        if !self.options.verify {
            return report(MigrationState::Enacted);
        }

        self.verify_and_record(migration, deployment, &vars).await?;
        report(MigrationState::Verified)
    }

    /// Query whether a migration's change is live
    pub async fn enacted(
        &self,
        name: &str,
        deployment: &DeploymentManager,
    ) -> Result<bool, DeployerError> {
        self.registry
            .get(name)?
            .enacted(deployment)
            .await
            .map_err(stage_error(name, Stage::Enacted))
    }

    /// Verify a migration using the vars of its checkpoint
    pub async fn verify(
        &self,
        name: &str,
        deployment: &DeploymentManager,
    ) -> Result<MigrationReport, DeployerError> {
        let migration = self.registry.get(name)?;
        let vars = deployment
            .cache()
            .checkpoint(deployment.scope(), name)
            .and_then(|c| usable_vars(migration, c))
            .ok_or_else(|| {
                DeployerError::Configuration(format!("`{}` has no usable prepared vars", name))
            })?;

        self.verify_and_record(migration, deployment, &vars).await?;
        Ok(MigrationReport {
            name: name.to_string(),
            state: MigrationState::Verified,
        })
    }

    /// The checkpoint status of every registered migration
    pub fn statuses(
        &self,
        deployment: &DeploymentManager,
    ) -> Vec<(String, Option<CheckpointStatus>)> {
        let checkpoints = deployment.cache().checkpoints(deployment.scope());
        self.registry
            .names()
            .map(|name| (name.to_string(), checkpoints.get(name).map(|c| c.status)))
            .collect()
    }

    /// Run `verify` and record the result
    async fn verify_and_record(
        &self,
        migration: &dyn DynMigration,
        deployment: &DeploymentManager,
        vars: &Value,
    ) -> Result<(), DeployerError> {
        let name = migration.name();
        info!(migration = name, "verifying");
        migration
            .verify(deployment, vars)
            .await
            .map_err(stage_error(name, Stage::Verify))?;

        self.record(deployment, name, CheckpointStatus::Verified, vars)
    }

    /// Persist a checkpoint
    fn record(
        &self,
        deployment: &DeploymentManager,
        name: &str,
        status: CheckpointStatus,
        vars: &Value,
    ) -> Result<(), DeployerError> {
        let checkpoint = Checkpoint {
            status,
            vars: vars.clone(),
        };
        deployment
            .cache()
            .put_checkpoint(deployment.scope(), name, &checkpoint)
    }
}

/// The vars of a checkpoint, if they still decode into the migration's vars
fn usable_vars(migration: &dyn DynMigration, checkpoint: Checkpoint) -> Option<Value> {
    if migration.accepts_vars(&checkpoint.vars) {
        return Some(checkpoint.vars);
    }

    warn!(
        migration = migration.name(),
        status = ?checkpoint.status,
        "discarding stale checkpoint vars"
    );
    None
}

/// Whether an `enact` failure proves nothing reached the chain: a
/// configuration problem, calldata that could not be built, or a reverted
/// submission
fn nothing_submitted(err: &eyre::Report) -> bool {
    match err.downcast_ref::<DeployerError>() {
        Some(DeployerError::Network(ClientError::Revert { .. }))
        | Some(DeployerError::CalldataConstruction(_)) => true,
        Some(e) => e.is_configuration(),
        None => false,
    }
}

/// Wrap a migration failure with the stage it happened in
fn stage_error(
    migration: &str,
    stage: Stage,
) -> impl FnOnce(eyre::Report) -> DeployerError + '_ {
    move |source| DeployerError::Stage {
        migration: migration.to_string(),
        stage,
        source,
    }
}
