//! The artifact cache: durable records of what has been deployed or discovered
//! for each (network, deployment) pair.
//!
//! Layout under the cache root, one directory per scope:
//!
//! ```text
//! <root>/<network>/<deployment>/artifacts.json    name -> ArtifactRecord
//! <root>/<network>/<deployment>/roots.json        alias -> crawl root address
//! <root>/<network>/<deployment>/manifest.json     the last RelationManifest
//! <root>/<network>/<deployment>/checkpoints.json  migration -> Checkpoint
//! <root>/<network>/<deployment>/pending.json      name -> PendingCreation
//! ```
//!
//! Every read-modify-write holds an advisory lock on `<file>.lock`, so
//! concurrent processes writing different keys of one file never drop each
//! other's entries.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_primitives::Address;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    constants::{ARTIFACTS_FILE, CHECKPOINTS_FILE, MANIFEST_FILE, PENDING_FILE, ROOTS_FILE},
    engine::Checkpoint,
    errors::DeployerError,
    spider::manifest::RelationManifest,
    types::{ArtifactKey, ArtifactRecord, DeploymentScope, PendingCreation},
    utils::{lock_file, read_json_object, write_json_atomic},
};

/// A file-backed store of artifact records, crawl roots, manifests and
/// migration checkpoints
#[derive(Debug)]
pub struct ArtifactCache {
    /// The root directory of the cache
    root: PathBuf,
}

impl ArtifactCache {
    /// Open a cache rooted at `root`; nothing is read or created until used
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of the cache
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of one of a scope's files
    fn path(&self, scope: &DeploymentScope, file: &str) -> PathBuf {
        self.root
            .join(&scope.network)
            .join(&scope.deployment)
            .join(file)
    }

    // -------------
    // | Artifacts |
    // -------------

    /// Look up the record for `key`; corrupt or missing records are absent
    pub fn get(&self, key: &ArtifactKey) -> Option<ArtifactRecord> {
        let record = self.records(&key.scope()).remove(&key.name);
        debug!(key = %key, hit = record.is_some(), "artifact cache lookup");
        record
    }

    /// All readable records of a scope
    pub fn records(&self, scope: &DeploymentScope) -> BTreeMap<String, ArtifactRecord> {
        read_entries(&self.path(scope, ARTIFACTS_FILE))
    }

    /// Durably store the record for `key`, replacing any previous one.
    ///
    /// Replacing a record with a different one is logged, so that a redeploy
    /// under an existing name is always visible.
    pub fn put(&self, key: &ArtifactKey, record: &ArtifactRecord) -> Result<(), DeployerError> {
        let path = self.path(&key.scope(), ARTIFACTS_FILE);
        let _lock = lock_file(&path)?;

        let mut entries = read_json_object(&path);
        let previous = entries
            .get(&key.name)
            .and_then(|v| serde_json::from_value::<ArtifactRecord>(v.clone()).ok());

        if let Some(previous) = previous.filter(|p| p != record) {
            warn!(
                key = %key,
                old_address = %previous.address,
                new_address = %record.address,
                old_build = ?previous.build_id,
                new_build = ?record.build_id,
                "replacing artifact record"
            );
        }

        entries.insert(key.name.clone(), to_value(record)?);
        write_json_atomic(&path, &entries)
    }

    // ---------
    // | Roots |
    // ---------

    /// The crawl roots of a scope
    pub fn roots(&self, scope: &DeploymentScope) -> BTreeMap<String, Address> {
        read_entries(&self.path(scope, ROOTS_FILE))
    }

    /// Durably store a crawl root
    pub fn put_root(
        &self,
        scope: &DeploymentScope,
        alias: &str,
        address: Address,
    ) -> Result<(), DeployerError> {
        self.update(&self.path(scope, ROOTS_FILE), alias, &address)
    }

    // ------------
    // | Manifest |
    // ------------

    /// The last stored relation manifest of a scope, if it is readable
    pub fn manifest(&self, scope: &DeploymentScope) -> Option<RelationManifest> {
        let path = self.path(scope, MANIFEST_FILE);
        let map = read_json_object(&path);
        if map.is_empty() {
            return None;
        }

        match serde_json::from_value(Value::Object(map)) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), cause = %e, "dropping unreadable manifest");
                None
            }
        }
    }

    /// Durably store the relation manifest of a scope
    pub fn put_manifest(
        &self,
        scope: &DeploymentScope,
        manifest: &RelationManifest,
    ) -> Result<(), DeployerError> {
        let path = self.path(scope, MANIFEST_FILE);
        let _lock = lock_file(&path)?;
        write_json_atomic(&path, manifest)
    }

    // ---------------
    // | Checkpoints |
    // ---------------

    /// All readable migration checkpoints of a scope
    pub fn checkpoints(&self, scope: &DeploymentScope) -> BTreeMap<String, Checkpoint> {
        read_entries(&self.path(scope, CHECKPOINTS_FILE))
    }

    /// The checkpoint of one migration
    pub fn checkpoint(&self, scope: &DeploymentScope, migration: &str) -> Option<Checkpoint> {
        self.checkpoints(scope).remove(migration)
    }

    /// Durably store the checkpoint of one migration
    pub fn put_checkpoint(
        &self,
        scope: &DeploymentScope,
        migration: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), DeployerError> {
        self.update(&self.path(scope, CHECKPOINTS_FILE), migration, checkpoint)
    }

    // ---------------------
    // | Pending creations |
    // ---------------------

    /// The creation submitted for `key` whose receipt has not been recorded
    pub fn pending(&self, key: &ArtifactKey) -> Option<PendingCreation> {
        read_entries(&self.path(&key.scope(), PENDING_FILE)).remove(&key.name)
    }

    /// Durably record a submitted creation before waiting on it
    pub fn put_pending(
        &self,
        key: &ArtifactKey,
        pending: &PendingCreation,
    ) -> Result<(), DeployerError> {
        self.update(&self.path(&key.scope(), PENDING_FILE), &key.name, pending)
    }

    /// Forget the pending creation of `key`
    pub fn clear_pending(&self, key: &ArtifactKey) -> Result<(), DeployerError> {
        let path = self.path(&key.scope(), PENDING_FILE);
        let _lock = lock_file(&path)?;

        let mut entries = read_json_object(&path);
        if entries.remove(&key.name).is_none() {
            return Ok(());
        }
        write_json_atomic(&path, &entries)
    }

    /// Re-read a keyed file, set one entry and write it back
    fn update<T: Serialize>(&self, path: &Path, key: &str, value: &T) -> Result<(), DeployerError> {
        let _lock = lock_file(path)?;

        let mut entries = read_json_object(path);
        entries.insert(key.to_string(), to_value(value)?);
        write_json_atomic(path, &entries)
    }
}

/// Serialize a cache entry
fn to_value<T: Serialize>(value: &T) -> Result<Value, DeployerError> {
    serde_json::to_value(value).map_err(|e| DeployerError::Cache(e.to_string()))
}

/// Read a keyed file, dropping entries that do not parse
fn read_entries<T: DeserializeOwned>(path: &Path) -> BTreeMap<String, T> {
    read_json_object(path)
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(entry) => Some((key, entry)),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    key = %key,
                    cause = %e,
                    "dropping unreadable cache entry"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc, thread};

    use alloy_primitives::{address, Address, B256};
    use serde_json::json;

    use crate::{
        constants::ARTIFACTS_FILE,
        engine::{Checkpoint, CheckpointStatus},
        types::{ArtifactRecord, DeploymentScope, PendingCreation},
    };

    use super::ArtifactCache;

    const COMET: Address = address!("c3d688b66703497daa19211eedff47f25384cdc3");
    const USDC: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");

    fn scope() -> DeploymentScope {
        DeploymentScope::new("mainnet", "usdc")
    }

    fn artifacts_path(cache: &ArtifactCache) -> std::path::PathBuf {
        cache.root().join("mainnet").join("usdc").join(ARTIFACTS_FILE)
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let key = scope().key("comet");

        assert_eq!(cache.get(&key), None);

        let record = ArtifactRecord::existing(COMET, Some(B256::repeat_byte(1)));
        cache.put(&key, &record).unwrap();
        assert_eq!(cache.get(&key), Some(record.clone()));

        // A fresh handle over the same directory sees the record
        let reopened = ArtifactCache::new(dir.path());
        assert_eq!(reopened.get(&key), Some(record));
    }

    #[test]
    fn test_replace_is_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let key = scope().key("comet");

        cache.put(&key, &ArtifactRecord::existing(COMET, None)).unwrap();
        cache.put(&key, &ArtifactRecord::existing(USDC, None)).unwrap();

        assert_eq!(cache.get(&key).unwrap().address, USDC);
        assert_eq!(cache.records(&scope()).len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let path = artifacts_path(&cache);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"comet": {"address": "0xc3d688b6"#).unwrap();

        assert_eq!(cache.get(&scope().key("comet")), None);

        // The next put heals the file
        let record = ArtifactRecord::existing(COMET, None);
        cache.put(&scope().key("comet"), &record).unwrap();
        assert_eq!(cache.get(&scope().key("comet")), Some(record));
    }

    #[test]
    fn test_torn_record_only_drops_that_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let path = artifacts_path(&cache);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let contents = json!({
            "comet": { "address": COMET },
            "usdc": { "address": "0xa0b8" },
        });
        fs::write(&path, contents.to_string()).unwrap();

        let records = cache.records(&scope());
        assert_eq!(records.len(), 1);
        assert_eq!(records["comet"].address, COMET);
        assert_eq!(cache.get(&scope().key("usdc")), None);
    }

    #[test]
    fn test_concurrent_puts_of_different_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ArtifactCache::new(dir.path()));

        let handles = (0..8u8)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let record = ArtifactRecord::existing(Address::repeat_byte(i + 1), None);
                    cache.put(&scope().key(format!("c{i}")), &record).unwrap();
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().unwrap());

        assert_eq!(cache.records(&scope()).len(), 8);
    }

    #[test]
    fn test_independent_handles_keep_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        // Each writer opens its own handle, as separate processes would
        let handles = (0..8u8)
            .map(|i| {
                let root = root.clone();
                thread::spawn(move || {
                    let cache = ArtifactCache::new(root);
                    for j in 0..4u8 {
                        let record = ArtifactRecord::existing(Address::repeat_byte(i + 1), None);
                        cache.put(&scope().key(format!("c{i}-{j}")), &record).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().unwrap());

        assert_eq!(ArtifactCache::new(dir.path()).records(&scope()).len(), 32);
    }

    #[test]
    fn test_pending_creations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let key = scope().key("comet");

        assert_eq!(cache.pending(&key), None);

        let pending = PendingCreation {
            tx_hash: Some(B256::repeat_byte(7)),
            constructor_args: vec![],
            build_id: Some(B256::repeat_byte(1)),
        };
        cache.put_pending(&key, &pending).unwrap();
        assert_eq!(ArtifactCache::new(dir.path()).pending(&key), Some(pending));
        assert_eq!(cache.get(&key), None);

        cache.clear_pending(&key).unwrap();
        assert_eq!(cache.pending(&key), None);
        cache.clear_pending(&key).unwrap();
    }

    #[test]
    fn test_scopes_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());

        cache.put(&scope().key("comet"), &ArtifactRecord::existing(COMET, None)).unwrap();

        let other = DeploymentScope::new("base", "usdc");
        assert_eq!(cache.get(&other.key("comet")), None);
    }

    #[test]
    fn test_roots_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());

        cache.put_root(&scope(), "comet", COMET).unwrap();
        assert_eq!(cache.roots(&scope()).get("comet"), Some(&COMET));

        let checkpoint = Checkpoint {
            status: CheckpointStatus::Prepared,
            vars: json!({ "implementation": COMET }),
        };
        cache.put_checkpoint(&scope(), "001_upgrade", &checkpoint).unwrap();
        assert_eq!(cache.checkpoint(&scope(), "001_upgrade"), Some(checkpoint));
        assert_eq!(cache.checkpoint(&scope(), "002_other"), None);
    }
}
