//! End-to-end runs of the registered migrations against a mock deployment

use std::sync::Arc;

use alloy_primitives::{keccak256, Address, Bytes, U256};
use deployer::{
    artifacts::{BuildRegistry, ContractBuild},
    constants::{EIP1967_ADMIN_SLOT, EIP1967_IMPLEMENTATION_SLOT},
    engine::{MigrationEngine, MigrationState, RunOptions, Stage},
    errors::DeployerError,
    manager::DeploymentManager,
    selector,
};
use migrations::{
    constants::NEXT_MARKET_IMPLEMENTATION, migrations::registry, relations::rules,
};
use serde_json::json;
use test_helpers::{MockNetwork, TestDeployment};

const PROPOSE: &str = "propose(address[],uint256[],string[],bytes[],string)";
const UPGRADE: &str = "001_upgrade_market_implementation";
const PAUSE_GUARDIAN: &str = "002_set_pause_guardian";

const MARKET: Address = Address::repeat_byte(1);
const BASE_TOKEN: Address = Address::repeat_byte(2);
const IMPLEMENTATION: Address = Address::repeat_byte(3);
const ADMIN: Address = Address::repeat_byte(4);
const GOVERNOR: Address = Address::repeat_byte(5);
const OLD_GUARDIAN: Address = Address::repeat_byte(6);
const TIMELOCK: Address = Address::repeat_byte(7);
const GUARDIAN: Address = Address::repeat_byte(9);

/// Script a market proxy with its admin, token and governance
fn script_deployment(network: &MockNetwork) {
    network.returns_address(MARKET, "baseToken()", BASE_TOKEN);
    network.returns_address(MARKET, "governor()", GOVERNOR);
    network.returns_address(MARKET, "pauseGuardian()", OLD_GUARDIAN);
    network.set_storage_address(MARKET, EIP1967_IMPLEMENTATION_SLOT, IMPLEMENTATION);
    network.set_storage_address(MARKET, EIP1967_ADMIN_SLOT, ADMIN);

    network.returns_uint(BASE_TOKEN, "decimals()", 6);

    network.returns_address(ADMIN, "owner()", TIMELOCK);
    network.returns_uint(ADMIN, "UPGRADE_INTERFACE_VERSION()", 5);

    network.returns_uint(GOVERNOR, "proposalCount()", 6);
    network.returns_address(GOVERNOR, "timelock()", TIMELOCK);

    network.returns_uint(TIMELOCK, "delay()", 172_800);
    network.returns_address(TIMELOCK, "admin()", GOVERNOR);

    // The governor announces each proposal
    network.on_send(GOVERNOR, PROPOSE, |network| {
        let topic = keccak256(
            "ProposalCreated(uint256,address,address[],uint256[],string[],bytes[],uint256,uint256,string)",
        );
        let data = Bytes::from(U256::from(7).to_be_bytes::<32>().to_vec());
        network.emit(GOVERNOR, vec![topic], data);
    });
}

fn market_build() -> ContractBuild {
    let abi = json!([{
        "type": "constructor",
        "inputs": [{ "name": "baseToken", "type": "address", "internalType": "address" }],
        "stateMutability": "nonpayable"
    }]);
    ContractBuild::new("Comet", abi, Bytes::from_static(&[0x60, 0x80]))
}

fn manager(test: &TestDeployment) -> DeploymentManager {
    let mut builds = BuildRegistry::default();
    builds.insert(market_build());

    let manager = test
        .manager("mainnet", "usdc")
        .with_builds(Arc::new(builds))
        .with_rules(Arc::new(rules()));
    manager.set_root("market", MARKET).unwrap();
    manager
}

#[test]
fn test_migrations_are_registered() {
    let registry = registry().unwrap();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec![UPGRADE, PAUSE_GUARDIAN]);
}

#[tokio::test]
async fn test_deployment_is_discovered() {
    let test = TestDeployment::new();
    script_deployment(&test.network);
    let manager = manager(&test);

    let table = manager.contracts().await.unwrap();
    assert_eq!(table.address("market"), Some(MARKET));
    assert_eq!(table.address("market:implementation"), Some(IMPLEMENTATION));
    assert_eq!(table.address("market-admin"), Some(ADMIN));
    assert_eq!(table.address("base-token"), Some(BASE_TOKEN));
    assert_eq!(table.address("governor"), Some(GOVERNOR));
    assert_eq!(table.address("timelock"), Some(TIMELOCK));
    assert_eq!(table.address("market:pause-guardian"), Some(OLD_GUARDIAN));
}

#[tokio::test]
async fn test_upgrade_waits_for_governance() {
    let test = TestDeployment::new();
    script_deployment(&test.network);
    let manager = manager(&test);
    let registry = registry().unwrap();
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    // Deploys and proposes, but the proposal has not executed
    let reports = engine.run(&[UPGRADE], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Enacted);

    let next = manager.artifact(NEXT_MARKET_IMPLEMENTATION).unwrap();
    assert!(next.is_proxy_target);
    assert_eq!(test.network.deployments(), 1);

    let sent = test.network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].to, Some(GOVERNOR));
    assert_eq!(&sent[1].data[..4], selector(PROPOSE).as_slice());

    // Nothing is resubmitted while the proposal is pending
    let reports = engine.run(&[UPGRADE], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Enacted);
    assert_eq!(test.network.sent().len(), 2);

    // The timelock executes the upgrade
    test.network
        .set_storage_address(MARKET, EIP1967_IMPLEMENTATION_SLOT, next.address);
    let reports = engine.run(&[UPGRADE], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(test.network.sent().len(), 2);
}

#[tokio::test]
async fn test_pause_guardian_requires_guardian_alias() {
    let test = TestDeployment::new();
    script_deployment(&test.network);
    let manager = manager(&test);
    let registry = registry().unwrap();
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    let err = engine
        .run(&[PAUSE_GUARDIAN], &manager, &manager)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployerError::Stage { stage: Stage::Enacted, .. }));
    assert!(test.network.sent().is_empty());
}

#[tokio::test]
async fn test_pause_guardian_lifecycle() {
    let test = TestDeployment::new();
    script_deployment(&test.network);
    // The proposal executes as soon as it is made
    test.network.on_send(GOVERNOR, PROPOSE, |network| {
        network.returns_address(MARKET, "pauseGuardian()", GUARDIAN);
    });

    let manager = manager(&test);
    manager.existing("guardian", GUARDIAN, Some("mainnet"), None).unwrap();
    let registry = registry().unwrap();
    let engine = MigrationEngine::new(&registry, RunOptions::default());

    let reports = engine.run(&[PAUSE_GUARDIAN], &manager, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::Verified);
    assert_eq!(test.network.sent().len(), 1);

    // A second deployment whose guardian is already set is left alone
    let other = test.manager("mainnet", "weth").with_rules(Arc::new(rules()));
    other.existing("market", MARKET, None, None).unwrap();
    other.existing("guardian", GUARDIAN, None, None).unwrap();
    let reports = engine.run(&[PAUSE_GUARDIAN], &other, &manager).await.unwrap();
    assert_eq!(reports[0].state, MigrationState::AlreadyEnacted);
    assert_eq!(test.network.sent().len(), 1);
}
