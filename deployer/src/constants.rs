//! Constants used throughout the orchestration core

use std::time::Duration;

use alloy_primitives::{b256, B256};

/// The storage slot holding the implementation address of an upgradeable proxy.
///
/// This is specified in EIP1967: https://eips.ethereum.org/EIPS/eip-1967#logic-contract-address
pub const EIP1967_IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// The storage slot containing the proxy admin contract address in the upgradeable proxy.
///
/// This is specified in EIP1967: https://eips.ethereum.org/EIPS/eip-1967#admin-address
pub const EIP1967_ADMIN_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// The number of bytes stored in a single storage slot
pub const NUM_BYTES_STORAGE_SLOT: usize = 32;

/// The number of bytes in an Ethereum address
pub const NUM_BYTES_ADDRESS: usize = 20;

/// The number of bytes in a function selector
pub const NUM_BYTES_SELECTOR: usize = 4;

// ---------
// | Cache |
// ---------

/// The default root directory of the artifact cache
pub const DEFAULT_CACHE_DIR: &str = "deployments";

/// The file holding artifact records for one network / deployment pair
pub const ARTIFACTS_FILE: &str = "artifacts.json";

/// The file holding the crawl roots for one network / deployment pair
pub const ROOTS_FILE: &str = "roots.json";

/// The file holding the last relation manifest for one network / deployment pair
pub const MANIFEST_FILE: &str = "manifest.json";

/// The file holding migration checkpoints for one network / deployment pair
pub const CHECKPOINTS_FILE: &str = "checkpoints.json";

/// The file holding submitted but unrecorded creations for one network / deployment pair
pub const PENDING_FILE: &str = "pending.json";

/// The alias suffix marking a contract that sits behind a proxy
pub const IMPLEMENTATION_SUFFIX: &str = ":implementation";

// ---------
// | Retry |
// ---------

/// The default wall-clock budget for one retried network call
pub const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(120);

/// The default backoff before the first retry
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// The default upper bound on a single backoff
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(15);

/// The interval at which transaction receipts are polled
pub const DEFAULT_CONFIRMATION_POLL: Duration = Duration::from_millis(500);

// ----------
// | Spider |
// ----------

/// The default number of contracts probed concurrently during a crawl
pub const DEFAULT_CRAWL_CONCURRENCY: usize = 4;

/// The default cap on the number of contracts a single crawl may discover
pub const DEFAULT_MAX_CRAWL_NODES: usize = 512;

/// The alias given to the root of a single-root crawl
pub const DEFAULT_ROOT_ALIAS: &str = "root";

/// The alias label of an implementation edge
pub const IMPLEMENTATION_LABEL: &str = "implementation";

/// The kind assigned to contracts no rule identifies
pub const UNKNOWN_KIND: &str = "unknown";
