//! The migration lifecycle, driven against a mock network

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy_primitives::Address;
use async_trait::async_trait;
use deployer::{
    engine::{Checkpoint, CheckpointStatus, MigrationEngine, MigrationState, RunOptions, Stage},
    errors::DeployerError,
    manager::DeploymentManager,
    migration::{DynMigration, Migration, MigrationRegistry},
};
use serde::{Deserialize, Serialize};
use test_helpers::TestDeployment;

/// Shared observations of a test migration
#[derive(Default)]
struct Probe {
    live: AtomicBool,
    /// Whether enact fails for lack of an alias, before submitting anything
    missing_alias: AtomicBool,
    prepared: AtomicUsize,
    enacted: AtomicUsize,
    verified: AtomicUsize,
}

impl Probe {
    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Serialize, Deserialize)]
struct ToggleVars {
    target: Address,
}

/// Flips a flag when enacted
struct Toggle {
    name: &'static str,
    probe: Arc<Probe>,
    /// Whether enact makes the change live immediately, rather than queueing
    /// it behind governance
    immediate: bool,
    fail_verify: bool,
    enact_delay: Option<Duration>,
}

impl Toggle {
    fn new(name: &'static str, probe: Arc<Probe>) -> Self {
        Self {
            name,
            probe,
            immediate: true,
            fail_verify: false,
            enact_delay: None,
        }
    }
}

#[async_trait]
impl Migration for Toggle {
    type Vars = ToggleVars;

    fn name(&self) -> &str {
        self.name
    }

    async fn prepare(&self, _: &DeploymentManager) -> eyre::Result<ToggleVars> {
        self.probe.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(ToggleVars {
            target: Address::repeat_byte(7),
        })
    }

    async fn enact(
        &self,
        _: &DeploymentManager,
        _: &DeploymentManager,
        vars: &ToggleVars,
    ) -> eyre::Result<()> {
        assert_eq!(vars.target, Address::repeat_byte(7));
        if self.probe.missing_alias.load(Ordering::SeqCst) {
            return Err(DeployerError::MissingAlias("governor".to_string()).into());
        }
        if let Some(delay) = self.enact_delay {
            tokio::time::sleep(delay).await;
        }

        self.probe.enacted.fetch_add(1, Ordering::SeqCst);
        if self.immediate {
            self.probe.live.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn enacted(&self, _: &DeploymentManager) -> eyre::Result<bool> {
        Ok(self.probe.live.load(Ordering::SeqCst))
    }

    async fn verify(&self, _: &DeploymentManager, _: &ToggleVars) -> eyre::Result<()> {
        self.probe.verified.fetch_add(1, Ordering::SeqCst);
        if self.fail_verify {
            eyre::bail!("target not set");
        }
        Ok(())
    }
}

fn registry(migrations: Vec<Toggle>) -> MigrationRegistry {
    let boxed = migrations
        .into_iter()
        .map(|m| Box::new(m) as Box<dyn DynMigration>);
    MigrationRegistry::load(boxed).unwrap()
}

fn checkpoint_status(manager: &DeploymentManager, name: &str) -> Option<CheckpointStatus> {
    manager
        .cache()
        .checkpoint(manager.scope(), name)
        .map(|c| c.status)
}

#[tokio::test]
async fn test_full_lifecycle() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 1);
    assert_eq!(Probe::count(&probe.enacted), 1);
    assert_eq!(Probe::count(&probe.verified), 1);
    assert_eq!(checkpoint_status(&manager, "001_toggle"), Some(CheckpointStatus::Verified));

    // A verified migration is a no-op
    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.enacted), 1);
}

#[tokio::test]
async fn test_already_enacted_short_circuits() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    probe.live.store(true, Ordering::SeqCst);
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::AlreadyEnacted);
    assert_eq!(Probe::count(&probe.prepared), 0);
    assert_eq!(Probe::count(&probe.enacted), 0);
    assert!(engine.enacted("001_toggle", &manager).await.unwrap());
}

#[tokio::test]
async fn test_queued_change_resumes_from_checkpoint() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let mut toggle = Toggle::new("001_toggle", probe.clone());
    toggle.immediate = false;
    let registry = registry(vec![toggle]);
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    // Enacted, awaiting governance
    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Enacted);
    assert_eq!(checkpoint_status(&manager, "001_toggle"), Some(CheckpointStatus::Enacted));

    // Still pending: nothing is resubmitted
    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Enacted);
    assert_eq!(Probe::count(&probe.enacted), 1);

    // Executed: verified with the persisted vars
    probe.live.store(true, Ordering::SeqCst);
    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 1);
    assert_eq!(Probe::count(&probe.enacted), 1);
    assert_eq!(Probe::count(&probe.verified), 1);
}

#[tokio::test]
async fn test_prepare_only_then_resume() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);

    let options = RunOptions {
        prepare_only: true,
        ..Default::default()
    };
    let reports = MigrationEngine::new(&registry, options)
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap();
    assert_eq!(reports[0].state, MigrationState::Prepared);
    assert_eq!(Probe::count(&probe.enacted), 0);

    let reports = MigrationEngine::new(&registry, RunOptions::default())
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 1);
}

#[tokio::test]
async fn test_interrupted_enact_is_not_repeated() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);

    let checkpoint = Checkpoint {
        status: CheckpointStatus::EnactAttempted,
        vars: serde_json::json!({ "target": Address::repeat_byte(7) }),
    };
    manager
        .cache()
        .put_checkpoint(manager.scope(), "001_toggle", &checkpoint)
        .unwrap();

    let err = MigrationEngine::new(&registry, RunOptions::default())
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployerError::EnactOutcomeUnknown(_)));
    assert_eq!(Probe::count(&probe.enacted), 0);

    let options = RunOptions {
        force_enact: true,
        ..Default::default()
    };
    let reports = MigrationEngine::new(&registry, options)
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 0);
    assert_eq!(Probe::count(&probe.enacted), 1);
}

#[tokio::test]
async fn test_stale_vars_are_prepared_again() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);

    let checkpoint = Checkpoint {
        status: CheckpointStatus::Prepared,
        vars: serde_json::json!({ "market": "usdc" }),
    };
    manager
        .cache()
        .put_checkpoint(manager.scope(), "001_toggle", &checkpoint)
        .unwrap();

    let reports = MigrationEngine::new(&registry, RunOptions::default())
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 1);
}

#[tokio::test]
async fn test_stale_vars_do_not_reopen_a_submitted_change() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    let put = |status| {
        let checkpoint = Checkpoint {
            status,
            vars: serde_json::json!({ "old": 1 }),
        };
        manager
            .cache()
            .put_checkpoint(manager.scope(), "001_toggle", &checkpoint)
            .unwrap();
    };

    // The proposal is queued; its vars no longer decode
    put(CheckpointStatus::Enacted);
    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Enacted);
    assert_eq!(Probe::count(&probe.prepared), 0);
    assert_eq!(Probe::count(&probe.enacted), 0);

    put(CheckpointStatus::EnactAttempted);
    let err = engine.run(&["001_toggle"], &manager, &manager).await.unwrap_err();
    assert!(matches!(err, DeployerError::EnactOutcomeUnknown(_)));
    assert_eq!(Probe::count(&probe.enacted), 0);

    // Forcing prepares fresh vars before enacting
    let options = RunOptions {
        force_enact: true,
        ..Default::default()
    };
    let reports = MigrationEngine::new(&registry, options)
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 1);
    assert_eq!(Probe::count(&probe.enacted), 1);
}

#[tokio::test]
async fn test_enact_failing_before_submission_can_be_retried() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    probe.missing_alias.store(true, Ordering::SeqCst);
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    let err = engine.run(&["001_toggle"], &manager, &manager).await.unwrap_err();
    assert!(matches!(err, DeployerError::Stage { stage: Stage::Enact, .. }));
    assert_eq!(checkpoint_status(&manager, "001_toggle"), Some(CheckpointStatus::Prepared));

    // Once the alias is registered a plain rerun enacts
    probe.missing_alias.store(false, Ordering::SeqCst);
    let reports = engine.run(&["001_toggle"], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(Probe::count(&probe.prepared), 1);
    assert_eq!(Probe::count(&probe.enacted), 1);
}

#[tokio::test]
async fn test_verify_failure_is_reported_distinctly() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let mut toggle = Toggle::new("001_toggle", probe.clone());
    toggle.fail_verify = true;
    let registry = registry(vec![toggle]);

    let err = MigrationEngine::new(&registry, RunOptions::default())
        .run(&["001_toggle"], &manager, &manager)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployerError::Stage { stage: Stage::Verify, .. }));
    assert!(err.to_string().contains("manual inspection"));
    assert_eq!(checkpoint_status(&manager, "001_toggle"), Some(CheckpointStatus::Enacted));
}

#[tokio::test]
async fn test_runs_stop_at_first_failure() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let failing = Arc::new(Probe::default());
    let after = Arc::new(Probe::default());

    let mut first = Toggle::new("001_fails", failing.clone());
    first.fail_verify = true;
    let registry = registry(vec![first, Toggle::new("002_after", after.clone())]);

    let res = MigrationEngine::new(&registry, RunOptions::default())
        .run(&["001_fails", "002_after"], &manager, &manager)
        .await;
    assert!(res.is_err());
    assert_eq!(Probe::count(&after.prepared), 0);
}

#[tokio::test]
async fn test_unknown_migration_fails_before_running() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let registry = registry(vec![Toggle::new("001_toggle", probe.clone())]);

    let err = MigrationEngine::new(&registry, RunOptions::default())
        .run(&["001_toggle", "002_missing"], &manager, &manager)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployerError::UnknownMigration(_)));
    assert_eq!(Probe::count(&probe.prepared), 0);
}

#[tokio::test]
async fn test_run_timeout() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let probe = Arc::new(Probe::default());
    let mut toggle = Toggle::new("001_slow", probe.clone());
    toggle.enact_delay = Some(Duration::from_secs(5));
    let registry = registry(vec![toggle]);

    let options = RunOptions {
        run_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let err = MigrationEngine::new(&registry, options)
        .run(&["001_slow"], &manager, &manager)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployerError::RunTimedOut(_)));
    assert_eq!(Probe::count(&probe.enacted), 0);
    assert_eq!(
        checkpoint_status(&manager, "001_slow"),
        Some(CheckpointStatus::EnactAttempted)
    );
}

#[tokio::test]
async fn test_statuses() {
    let test = TestDeployment::new();
    let manager = test.manager("mainnet", "usdc");
    let registry = registry(vec![
        Toggle::new("001_a", Arc::new(Probe::default())),
        Toggle::new("002_b", Arc::new(Probe::default())),
    ]);
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    engine.run(&["002_b"], &manager, &manager).await.unwrap();
    assert_eq!(
        engine.statuses(&manager),
        vec![
            ("001_a".to_string(), None),
            ("002_b".to_string(), Some(CheckpointStatus::Verified)),
        ]
    );

    let report = engine.verify("002_b", &manager).await.unwrap();
    assert_eq!(report.state, MigrationState::Verified);
    assert!(engine.verify("001_a", &manager).await.unwrap_err().is_configuration());
}
