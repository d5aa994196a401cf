//! Defines the migration interface and the registry migrations are loaded into

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{errors::DeployerError, manager::DeploymentManager};

/// A named unit of on-chain change with a prepare / enact / verify lifecycle
#[async_trait]
pub trait Migration: Send + Sync + 'static {
    /// The intermediate state `prepare` hands to `enact`, persisted between
    /// runs so that `enact` can be re-entered without preparing again
    type Vars: Serialize + DeserializeOwned + Send + Sync;

    /// The unique name of the migration
    fn name(&self) -> &str;

    /// Deploy or look up everything `enact` needs
    async fn prepare(&self, deployment: &DeploymentManager) -> eyre::Result<Self::Vars>;

    /// Submit the change, typically as one governance proposal
    async fn enact(
        &self,
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
        vars: &Self::Vars,
    ) -> eyre::Result<()>;

    /// Whether the change is live on-chain; must not write
    async fn enacted(&self, deployment: &DeploymentManager) -> eyre::Result<bool>;

    /// Check post-conditions once the change is live; must not write
    async fn verify(
        &self,
        _deployment: &DeploymentManager,
        _vars: &Self::Vars,
    ) -> eyre::Result<()> {
        Ok(())
    }
}

/// The object-safe form of [`Migration`], with vars carried as JSON
#[async_trait]
pub trait DynMigration: Send + Sync {
    /// The unique name of the migration
    fn name(&self) -> &str;

    /// Run `prepare`, returning its vars as JSON
    async fn prepare(&self, deployment: &DeploymentManager) -> eyre::Result<Value>;

    /// Whether persisted vars still decode into this migration's vars type
    fn accepts_vars(&self, vars: &Value) -> bool;

    /// Run `enact` with JSON vars
    async fn enact(
        &self,
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
        vars: &Value,
    ) -> eyre::Result<()>;

    /// Query the `enacted` predicate
    async fn enacted(&self, deployment: &DeploymentManager) -> eyre::Result<bool>;

    /// Run `verify` with JSON vars
    async fn verify(&self, deployment: &DeploymentManager, vars: &Value) -> eyre::Result<()>;
}

#[async_trait]
impl<M: Migration> DynMigration for M {
    fn name(&self) -> &str {
        Migration::name(self)
    }

    async fn prepare(&self, deployment: &DeploymentManager) -> eyre::Result<Value> {
        let vars = Migration::prepare(self, deployment).await?;
        Ok(serde_json::to_value(vars)?)
    }

    fn accepts_vars(&self, vars: &Value) -> bool {
        serde_json::from_value::<M::Vars>(vars.clone()).is_ok()
    }

    async fn enact(
        &self,
        deployment: &DeploymentManager,
        governance: &DeploymentManager,
        vars: &Value,
    ) -> eyre::Result<()> {
        let vars: M::Vars = serde_json::from_value(vars.clone())?;
        Migration::enact(self, deployment, governance, &vars).await
    }

    async fn enacted(&self, deployment: &DeploymentManager) -> eyre::Result<bool> {
        Migration::enacted(self, deployment).await
    }

    async fn verify(&self, deployment: &DeploymentManager, vars: &Value) -> eyre::Result<()> {
        let vars: M::Vars = serde_json::from_value(vars.clone())?;
        Migration::verify(self, deployment, &vars).await
    }
}

/// A migration registered at link time
pub struct MigrationEntry {
    /// Constructs the migration
    pub constructor: fn() -> Box<dyn DynMigration>,
}

// Collect the registered migrations into an iterable
inventory::collect!(MigrationEntry);

/// Macro to register a migration
#[macro_export]
macro_rules! migration {
    ($migration:expr) => {
        $crate::inventory::submit!($crate::migration::MigrationEntry {
            constructor: || -> ::std::boxed::Box<dyn $crate::migration::DynMigration> {
                ::std::boxed::Box::new($migration)
            },
        });
    };
}

/// The loaded migrations, keyed by name
#[derive(Default)]
pub struct MigrationRegistry {
    /// The migrations, by name
    migrations: BTreeMap<String, Box<dyn DynMigration>>,
}

impl MigrationRegistry {
    /// Load a set of migrations.
    ///
    /// Duplicate names fail the whole load, so nothing is registered.
    pub fn load(
        migrations: impl IntoIterator<Item = Box<dyn DynMigration>>,
    ) -> Result<Self, DeployerError> {
        let mut loaded = BTreeMap::new();
        for migration in migrations {
            let name = migration.name().to_string();
            if loaded.contains_key(&name) {
                return Err(DeployerError::DuplicateMigration(name));
            }
            loaded.insert(name, migration);
        }

        Ok(Self { migrations: loaded })
    }

    /// Load every migration registered with [`migration!`]
    pub fn from_inventory() -> Result<Self, DeployerError> {
        let migrations = inventory::iter::<MigrationEntry>
            .into_iter()
            .map(|entry| (entry.constructor)());
        Self::load(migrations)
    }

    /// Look up a migration
    pub fn get(&self, name: &str) -> Result<&dyn DynMigration, DeployerError> {
        self.migrations
            .get(name)
            .map(|m| m.as_ref())
            .ok_or_else(|| DeployerError::UnknownMigration(name.to_string()))
    }

    /// The names of all migrations, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.migrations.keys().map(String::as_str)
    }

    /// The number of migrations
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Resolve migration names, keeping the caller's order
    pub fn select<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<&dyn DynMigration>, DeployerError> {
        names.iter().map(|name| self.get(name.as_ref())).collect()
    }
}
