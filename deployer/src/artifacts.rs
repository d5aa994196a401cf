//! Compiled contract builds and the registry they are loaded into

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy::{
    dyn_abi::{DynSolType, Specifier},
    json_abi::JsonAbi,
};
use alloy_primitives::{keccak256, Bytes};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    errors::DeployerError,
    solidity::encode_params,
    types::{AbiValue, BuildId},
};

/// A compiled contract: its interface and creation bytecode
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractBuild {
    /// The contract name
    name: String,
    /// The JSON ABI
    abi: Value,
    /// The creation bytecode, without constructor arguments
    bytecode: Bytes,
    /// The content hash of the ABI and bytecode
    id: BuildId,
}

impl ContractBuild {
    /// Construct a build, computing its id
    pub fn new(name: impl ToString, abi: Value, bytecode: Bytes) -> Self {
        let mut preimage = abi.to_string().into_bytes();
        preimage.extend_from_slice(&bytecode);
        let id = keccak256(&preimage);

        Self {
            name: name.to_string(),
            abi,
            bytecode,
            id,
        }
    }

    /// Parse a Foundry (`{abi, bytecode: {object}}`) or Hardhat
    /// (`{abi, bytecode}`) compilation artifact
    pub fn from_artifact_json(name: &str, json: &str) -> Result<Self, DeployerError> {
        let artifact: Value =
            serde_json::from_str(json).map_err(|e| DeployerError::ArtifactParsing(e.to_string()))?;

        let abi = artifact
            .get("abi")
            .filter(|abi| abi.is_array())
            .cloned()
            .ok_or_else(|| DeployerError::ArtifactParsing(format!("{}: missing abi", name)))?;

        let bytecode = match artifact.get("bytecode") {
            Some(Value::String(s)) => s.as_str(),
            Some(Value::Object(o)) => o.get("object").and_then(Value::as_str).unwrap_or_default(),
            _ => "",
        };
        let bytecode = Bytes::from_str(bytecode)
            .map_err(|e| DeployerError::ArtifactParsing(format!("{}: {}", name, e)))?;

        let name = artifact
            .get("contractName")
            .and_then(Value::as_str)
            .unwrap_or(name);

        Ok(Self::new(name, abi, bytecode))
    }

    /// The contract name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The JSON ABI
    pub fn abi(&self) -> &Value {
        &self.abi
    }

    /// The creation bytecode, without constructor arguments
    pub fn bytecode(&self) -> &Bytes {
        &self.bytecode
    }

    /// The content hash of the ABI and bytecode
    pub fn id(&self) -> BuildId {
        self.id
    }

    /// The constructor parameter types
    fn constructor_params(&self) -> Result<Vec<DynSolType>, DeployerError> {
        let abi: JsonAbi = serde_json::from_value(self.abi.clone())
            .map_err(|e| DeployerError::ArtifactParsing(format!("{}: {}", self.name, e)))?;

        let Some(constructor) = abi.constructor() else {
            return Ok(Vec::new());
        };

        constructor
            .inputs
            .iter()
            .map(|param| {
                param.resolve().map_err(|e| {
                    DeployerError::ArtifactParsing(format!("{}: {}", self.name, e))
                })
            })
            .collect()
    }

    /// The creation code with ABI-encoded constructor arguments appended
    pub fn creation_code(&self, args: &[AbiValue]) -> Result<Bytes, DeployerError> {
        if self.bytecode.is_empty() {
            return Err(DeployerError::ContractDeployment(format!(
                "{} has no creation bytecode",
                self.name
            )));
        }

        let encoded = encode_params(&self.constructor_params()?, args)?;
        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(&encoded);
        Ok(code.into())
    }
}

/// The compiled builds available to migrations, keyed by contract name
#[derive(Clone, Debug, Default)]
pub struct BuildRegistry {
    /// The builds, by contract name
    builds: BTreeMap<String, ContractBuild>,
}

impl BuildRegistry {
    /// Load every compilation artifact under `dir`.
    ///
    /// Files that are not contract artifacts (build info, abstract contracts
    /// without bytecode) are skipped. When two files define the same
    /// contract name the first in path order wins.
    pub fn load(dir: &Path) -> Result<Self, DeployerError> {
        let mut paths = Vec::new();
        collect_json_files(dir, &mut paths)?;
        paths.sort();

        let mut registry = Self::default();
        for path in paths {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            let json = fs::read_to_string(&path)
                .map_err(|e| DeployerError::ArtifactParsing(e.to_string()))?;

            let build = match ContractBuild::from_artifact_json(&name, &json) {
                Ok(build) if !build.bytecode().is_empty() => build,
                Ok(_) => continue,
                Err(e) => {
                    debug!(path = %path.display(), cause = %e, "skipping non-artifact file");
                    continue;
                }
            };

            if registry.builds.contains_key(build.name()) {
                warn!(path = %path.display(), name = build.name(), "duplicate build, keeping first");
                continue;
            }
            registry.insert(build);
        }

        info!(dir = %dir.display(), builds = registry.builds.len(), "loaded contract builds");
        Ok(registry)
    }

    /// Add a build, replacing any build of the same name
    pub fn insert(&mut self, build: ContractBuild) {
        self.builds.insert(build.name().to_string(), build);
    }

    /// Look up a build by contract name
    pub fn get(&self, name: &str) -> Result<&ContractBuild, DeployerError> {
        self.builds
            .get(name)
            .ok_or_else(|| DeployerError::MissingBuild(name.to_string()))
    }

    /// The names of all loaded builds
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builds.keys().map(String::as_str)
    }
}

/// Recursively collect the JSON files under `dir`
fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DeployerError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| DeployerError::Configuration(format!("{}: {}", dir.display(), e)))?;

    for entry in entries {
        let path = entry
            .map_err(|e| DeployerError::ArtifactParsing(e.to_string()))?
            .path();

        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }

    Ok(())
}
