//! Definitions of errors that can occur while deploying, crawling and migrating

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    time::Duration,
};

use crate::{engine::Stage, network::ClientError};

/// Errors that can occur in the orchestration core
#[derive(Debug)]
pub enum DeployerError {
    /// A configuration problem, detected before any network interaction
    Configuration(String),
    /// Two migrations were registered under the same name
    DuplicateMigration(String),
    /// A migration was requested that is not registered
    UnknownMigration(String),
    /// An alias was requested that resolves to no contract
    MissingAlias(String),
    /// A contract build was requested that is not in the build registry
    MissingBuild(String),
    /// Error initializing the network client
    ClientInitialization(String),
    /// A network call failed terminally, or exhausted its retry budget
    Network(ClientError),
    /// Error writing to the artifact cache
    Cache(String),
    /// Error parsing a compilation artifact
    ArtifactParsing(String),
    /// Error constructing calldata for a contract method
    CalldataConstruction(String),
    /// Error decoding the return data of a contract call
    ReturnDecoding(String),
    /// Error deploying a contract
    ContractDeployment(String),
    /// A crawl discovered more contracts than it is allowed to
    CrawlLimit(usize),
    /// A previous run attempted `enact` and its outcome could not be confirmed
    EnactOutcomeUnknown(String),
    /// A migration stage failed
    Stage {
        /// The name of the migration
        migration: String,
        /// The stage that failed
        stage: Stage,
        /// The failure reported by the migration
        source: eyre::Report,
    },
    /// The run did not complete within its overall timeout
    RunTimedOut(Duration),
}

impl DeployerError {
    /// Whether this error is a configuration error, raised before any network
    /// interaction
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DeployerError::Configuration(_)
                | DeployerError::DuplicateMigration(_)
                | DeployerError::UnknownMigration(_)
                | DeployerError::MissingAlias(_)
                | DeployerError::MissingBuild(_)
        )
    }
}

impl Display for DeployerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeployerError::Configuration(s) => write!(f, "configuration error: {}", s),
            DeployerError::DuplicateMigration(s) => {
                write!(f, "configuration error: duplicate migration `{}`", s)
            }
            DeployerError::UnknownMigration(s) => {
                write!(f, "configuration error: unknown migration `{}`", s)
            }
            DeployerError::MissingAlias(s) => {
                write!(f, "configuration error: no contract aliased `{}`", s)
            }
            DeployerError::MissingBuild(s) => {
                write!(f, "configuration error: no build named `{}`", s)
            }
            DeployerError::ClientInitialization(s) => write!(f, "error initializing client: {}", s),
            DeployerError::Network(e) => write!(f, "network error: {}", e),
            DeployerError::Cache(s) => write!(f, "error writing artifact cache: {}", s),
            DeployerError::ArtifactParsing(s) => write!(f, "error parsing artifact: {}", s),
            DeployerError::CalldataConstruction(s) => write!(f, "error constructing calldata: {}", s),
            DeployerError::ReturnDecoding(s) => write!(f, "error decoding return data: {}", s),
            DeployerError::ContractDeployment(s) => write!(f, "error deploying contract: {}", s),
            DeployerError::CrawlLimit(n) => write!(f, "crawl exceeded {} contracts", n),
            DeployerError::EnactOutcomeUnknown(s) => write!(
                f,
                "migration `{}` attempted enact previously and it has not landed on-chain; \
                 inspect pending proposals and re-run with --force-enact to submit again",
                s
            ),
            DeployerError::Stage {
                migration,
                stage: Stage::Verify,
                source,
            } => write!(
                f,
                "verification of `{}` failed, on-chain state needs manual inspection: {:#}",
                migration, source
            ),
            DeployerError::Stage {
                migration,
                stage,
                source,
            } => write!(f, "{} of `{}` failed: {:#}", stage, migration, source),
            DeployerError::RunTimedOut(d) => write!(f, "run timed out after {:?}", d),
        }
    }
}

impl Error for DeployerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DeployerError::Network(e) => Some(e),
            DeployerError::Stage { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<ClientError> for DeployerError {
    fn from(e: ClientError) -> Self {
        DeployerError::Network(e)
    }
}
