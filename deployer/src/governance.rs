//! Helpers for packaging a migration's change as one governance proposal

use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_sol_types::{SolCall, SolEvent};
use tracing::{info, warn};

use crate::{
    errors::DeployerError,
    manager::DeploymentManager,
    network::{LogEntry, LogQuery},
    solidity::{encode_params, first_word_uint, signature_params, IGovernorBravo},
    types::AbiValue,
};

/// One call a proposal makes when executed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposalAction {
    /// Call `signature` on `target`; the governor prepends the selector
    Call {
        /// The contract to call
        target: Address,
        /// The function signature, e.g. `setPauseGuardian(address)`
        signature: String,
        /// The call arguments
        args: Vec<AbiValue>,
        /// The value to send
        value: U256,
    },
    /// Send prebuilt calldata to `target`
    Raw {
        /// The contract to call
        target: Address,
        /// The full calldata, selector included
        calldata: Bytes,
        /// The value to send
        value: U256,
    },
}

impl ProposalAction {
    /// A call with no value attached
    pub fn call(target: Address, signature: impl ToString, args: Vec<AbiValue>) -> Self {
        ProposalAction::Call {
            target,
            signature: signature.to_string(),
            args,
            value: U256::ZERO,
        }
    }
}

/// The parallel arrays a Bravo-style governor takes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedProposal {
    /// The call targets
    pub targets: Vec<Address>,
    /// The values sent with each call
    pub values: Vec<U256>,
    /// The function signatures, empty for raw calls
    pub signatures: Vec<String>,
    /// The call arguments, or the full calldata for raw calls
    pub calldatas: Vec<Bytes>,
}

/// Encode a list of actions into the governor's proposal arrays
pub fn encode_proposal(actions: &[ProposalAction]) -> Result<EncodedProposal, DeployerError> {
    let mut proposal = EncodedProposal::default();
    for action in actions {
        let (target, signature, calldata, value) = match action {
            ProposalAction::Call {
                target,
                signature,
                args,
                value,
            } => {
                let params = encode_params(&signature_params(signature)?, args)?;
                (*target, signature.clone(), params, *value)
            }
            ProposalAction::Raw {
                target,
                calldata,
                value,
            } => (*target, String::new(), calldata.clone(), *value),
        };

        proposal.targets.push(target);
        proposal.values.push(value);
        proposal.signatures.push(signature);
        proposal.calldatas.push(calldata);
    }

    Ok(proposal)
}

/// A submitted proposal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalSubmission {
    /// The proposing transaction
    pub tx_hash: TxHash,
    /// The proposal ID, if the creation event could be found
    pub proposal_id: Option<U256>,
}

/// The lifecycle state of a proposal, as a Bravo-style governor reports it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalState {
    /// Created, voting not yet open
    Pending,
    /// Voting is open
    Active,
    /// Canceled by the proposer or guardian
    Canceled,
    /// Voting closed without passing
    Defeated,
    /// Passed, not yet queued
    Succeeded,
    /// Queued in the timelock
    Queued,
    /// Queued but not executed in time
    Expired,
    /// Executed
    Executed,
}

impl TryFrom<u8> for ProposalState {
    type Error = DeployerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ProposalState::Pending,
            1 => ProposalState::Active,
            2 => ProposalState::Canceled,
            3 => ProposalState::Defeated,
            4 => ProposalState::Succeeded,
            5 => ProposalState::Queued,
            6 => ProposalState::Expired,
            7 => ProposalState::Executed,
            v => {
                return Err(DeployerError::ReturnDecoding(format!(
                    "unknown proposal state {}",
                    v
                )))
            }
        })
    }
}

/// Submit `actions` as one proposal to the governor aliased `governor` in
/// the governance deployment
pub async fn propose(
    governance: &DeploymentManager,
    governor: &str,
    actions: &[ProposalAction],
    description: &str,
) -> Result<ProposalSubmission, DeployerError> {
    let governor = governance.address(governor).await?;
    let proposal = encode_proposal(actions)?;

    let calldata = IGovernorBravo::proposeCall {
        targets: proposal.targets,
        values: proposal.values,
        signatures: proposal.signatures,
        calldatas: proposal.calldatas,
        description: description.to_string(),
    }
    .abi_encode();

    let receipt = governance
        .send_to(governor, calldata.into(), U256::ZERO)
        .await?;

    let mut proposal_id = find_proposal_id(&receipt.logs, governor, receipt.tx_hash);
    if proposal_id.is_none() {
        if let Some(block) = receipt.block_number {
            let query = LogQuery {
                address: governor,
                topic0: Some(IGovernorBravo::ProposalCreated::SIGNATURE_HASH),
                from_block: block,
                to_block: Some(block),
            };
            let client = governance.client();
            let query = &query;
            let logs = governance
                .retry_policy()
                .run("logs", move || client.logs(query.clone()))
                .await?;
            proposal_id = find_proposal_id(&logs, governor, receipt.tx_hash);
        }
    }

    match proposal_id {
        Some(id) => info!(
            governor = %governor,
            proposal_id = %id,
            tx_hash = %receipt.tx_hash,
            "submitted proposal"
        ),
        None => warn!(
            governor = %governor,
            tx_hash = %receipt.tx_hash,
            "submitted proposal, but found no creation event"
        ),
    }

    Ok(ProposalSubmission {
        tx_hash: receipt.tx_hash,
        proposal_id,
    })
}

/// Read the state of a proposal
pub async fn proposal_state(
    governance: &DeploymentManager,
    governor: &str,
    proposal_id: U256,
) -> Result<ProposalState, DeployerError> {
    let data = governance
        .call(governor, "state(uint256)", &[AbiValue::Uint(proposal_id)])
        .await?;

    let state = first_word_uint(&data)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| DeployerError::ReturnDecoding(format!("state(uint256) on `{}`", governor)))?;
    ProposalState::try_from(state)
}

/// Pick the proposal ID out of the creation event emitted by `tx_hash`
fn find_proposal_id(logs: &[LogEntry], governor: Address, tx_hash: TxHash) -> Option<U256> {
    logs.iter()
        .filter(|log| log.address == governor)
        .filter(|log| log.tx_hash.map_or(true, |hash| hash == tx_hash))
        .find(|log| log.topics.first() == Some(&IGovernorBravo::ProposalCreated::SIGNATURE_HASH))
        .and_then(|log| first_word_uint(&log.data))
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, Bytes, B256, U256};
    use alloy_sol_types::SolEvent;

    use crate::{network::LogEntry, selector, solidity::IGovernorBravo, types::AbiValue};

    use super::{encode_proposal, find_proposal_id, ProposalAction, ProposalState};

    #[test]
    fn test_encode_proposal() {
        let market = address!("c3d688b66703497daa19211eedff47f25384cdc3");
        let guardian = address!("00000000000000000000000000000000000000aa");
        let raw = Bytes::from(selector("pause()").to_vec());

        let actions = vec![
            ProposalAction::call(
                market,
                "setPauseGuardian(address)",
                vec![AbiValue::Address(guardian)],
            ),
            ProposalAction::Raw {
                target: market,
                calldata: raw.clone(),
                value: U256::from(1),
            },
        ];

        let proposal = encode_proposal(&actions).unwrap();
        assert_eq!(proposal.targets, vec![market, market]);
        assert_eq!(proposal.values, vec![U256::ZERO, U256::from(1)]);
        assert_eq!(proposal.signatures, vec!["setPauseGuardian(address)".to_string(), String::new()]);

        // Signed actions carry only the arguments
        assert_eq!(proposal.calldatas[0].len(), 32);
        assert_eq!(&proposal.calldatas[0][12..], guardian.as_slice());
        assert_eq!(proposal.calldatas[1], raw);
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let market = address!("c3d688b66703497daa19211eedff47f25384cdc3");
        let actions = vec![ProposalAction::call(market, "setPauseGuardian(address)", vec![])];
        assert!(encode_proposal(&actions).is_err());
    }

    #[test]
    fn test_find_proposal_id() {
        let governor = address!("309a862bbc1a00e45506cb8a802d1ff10004c8c0");
        let tx_hash = B256::repeat_byte(7);
        let mut data = U256::from(42).to_be_bytes::<32>().to_vec();
        data.extend_from_slice(&[0u8; 32]);

        let created = LogEntry {
            address: governor,
            topics: vec![IGovernorBravo::ProposalCreated::SIGNATURE_HASH],
            data: data.into(),
            block_number: Some(10),
            tx_hash: Some(tx_hash),
        };
        let other = LogEntry {
            topics: vec![B256::repeat_byte(1)],
            ..created.clone()
        };

        assert_eq!(find_proposal_id(&[other.clone(), created], governor, tx_hash), Some(U256::from(42)));
        assert_eq!(find_proposal_id(&[other], governor, tx_hash), None);
    }

    #[test]
    fn test_proposal_state() {
        assert_eq!(ProposalState::try_from(5).unwrap(), ProposalState::Queued);
        assert!(ProposalState::try_from(8).is_err());
    }
}
