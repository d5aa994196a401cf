//! Constants used by the migrations and the CLI

/// The default path of the network registry
pub const DEFAULT_NETWORKS_FILE: &str = "networks.json";

/// The default directory compiled contract artifacts are read from
pub const DEFAULT_ARTIFACTS_DIR: &str = "out";

// ------------------
// | Contract kinds |
// ------------------

/// A lending market proxy
pub const MARKET_KIND: &str = "market";

/// An OpenZeppelin-style proxy admin
pub const PROXY_ADMIN_KIND: &str = "proxy-admin";

/// An ERC-20 token
pub const TOKEN_KIND: &str = "token";

/// A Bravo-style governor
pub const GOVERNOR_KIND: &str = "governor";

/// A timelock executing governor proposals
pub const TIMELOCK_KIND: &str = "timelock";

// -----------
// | Aliases |
// -----------

/// The market proxy
pub const MARKET_ALIAS: &str = "market";

/// The admin of the market proxy
pub const MARKET_ADMIN_ALIAS: &str = "market-admin";

/// The market's base token
pub const BASE_TOKEN_ALIAS: &str = "base-token";

/// The governor
pub const GOVERNOR_ALIAS: &str = "governor";

/// The timelock
pub const TIMELOCK_ALIAS: &str = "timelock";

/// The address expected to hold the market's pause guardian role
pub const GUARDIAN_ALIAS: &str = "guardian";

// ----------
// | Builds |
// ----------

/// The build of the market implementation
pub const MARKET_BUILD: &str = "Comet";

/// The cache key the next market implementation is deployed under
pub const NEXT_MARKET_IMPLEMENTATION: &str = "market:next:implementation";

// --------------
// | Signatures |
// --------------

/// The market's base token getter
pub const BASE_TOKEN_SIGNATURE: &str = "baseToken()";

/// The market's pause guardian getter
pub const PAUSE_GUARDIAN_SIGNATURE: &str = "pauseGuardian()";

/// The market's pause guardian setter
pub const SET_PAUSE_GUARDIAN_SIGNATURE: &str = "setPauseGuardian(address)";

/// The proxy admin's upgrade method
pub const UPGRADE_SIGNATURE: &str = "upgrade(address,address)";
