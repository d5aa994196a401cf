//! The crawl rules describing a lending market deployment and its
//! governance contracts

use std::sync::Arc;

use deployer::{
    constants::{EIP1967_ADMIN_SLOT, EIP1967_IMPLEMENTATION_SLOT},
    spider::{ContractKind, ContractRule, EdgeKind, RelationSpec, RuleSet, SignatureRule},
};

use crate::constants::{
    BASE_TOKEN_ALIAS, BASE_TOKEN_SIGNATURE, GOVERNOR_ALIAS, GOVERNOR_KIND, MARKET_ADMIN_ALIAS,
    MARKET_KIND, PAUSE_GUARDIAN_SIGNATURE, PROXY_ADMIN_KIND, TIMELOCK_ALIAS, TIMELOCK_KIND,
    TOKEN_KIND,
};

/// The rules for every contract kind a market deployment is made of
pub fn rules() -> RuleSet {
    let rules: [(&str, SignatureRule); 5] = [
        (MARKET_KIND, market()),
        (PROXY_ADMIN_KIND, proxy_admin()),
        (TOKEN_KIND, token()),
        (GOVERNOR_KIND, governor()),
        (TIMELOCK_KIND, timelock()),
    ];

    rules
        .into_iter()
        .map(|(kind, rule)| (ContractKind::new(kind), Arc::new(rule) as Arc<dyn ContractRule>))
        .collect()
}

/// A market proxy: implementation and admin in the EIP-1967 slots
fn market() -> SignatureRule {
    SignatureRule::new()
        .fingerprint(BASE_TOKEN_SIGNATURE)
        .implementation_slot(EIP1967_IMPLEMENTATION_SLOT)
        .relation(
            RelationSpec::slot("admin", EIP1967_ADMIN_SLOT)
                .alias(MARKET_ADMIN_ALIAS)
                .target_kind(PROXY_ADMIN_KIND),
        )
        .relation(
            RelationSpec::getter("base-token", BASE_TOKEN_SIGNATURE)
                .kind(EdgeKind::UnderlyingOf)
                .alias(BASE_TOKEN_ALIAS)
                .target_kind(TOKEN_KIND),
        )
        .relation(
            RelationSpec::getter("governor", "governor()")
                .alias(GOVERNOR_ALIAS)
                .target_kind(GOVERNOR_KIND),
        )
        .relation(RelationSpec::getter("pause-guardian", PAUSE_GUARDIAN_SIGNATURE))
}

/// A proxy admin, owned by the timelock
fn proxy_admin() -> SignatureRule {
    SignatureRule::new()
        .fingerprint("owner()")
        .fingerprint("UPGRADE_INTERFACE_VERSION()")
        .relation(
            RelationSpec::getter("owner", "owner()")
                .alias(TIMELOCK_ALIAS)
                .target_kind(TIMELOCK_KIND),
        )
}

/// A token, possibly wrapping another
fn token() -> SignatureRule {
    SignatureRule::new()
        .fingerprint("decimals()")
        .relation(
            RelationSpec::getter("underlying", "underlying()")
                .kind(EdgeKind::UnderlyingOf)
                .target_kind(TOKEN_KIND),
        )
}

/// A governor and the timelock executing its proposals
fn governor() -> SignatureRule {
    SignatureRule::new()
        .fingerprint("proposalCount()")
        .relation(
            RelationSpec::getter("timelock", "timelock()")
                .alias(TIMELOCK_ALIAS)
                .target_kind(TIMELOCK_KIND),
        )
}

/// A timelock and its admin
fn timelock() -> SignatureRule {
    SignatureRule::new()
        .fingerprint("delay()")
        .relation(RelationSpec::getter("admin", "admin()"))
}
