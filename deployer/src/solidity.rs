//! Solidity definitions and ABI encoding helpers

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{keccak256, Address, Bytes, Selector, I256, U256};

use crate::{
    constants::{NUM_BYTES_ADDRESS, NUM_BYTES_SELECTOR, NUM_BYTES_STORAGE_SLOT},
    errors::DeployerError,
    types::AbiValue,
};

#[allow(missing_docs, clippy::missing_docs_in_private_items)]
mod abi {
    use alloy_sol_types::sol;

    sol! {
        interface IGovernorBravo {
            function propose(address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, string description) external returns (uint256);

            event ProposalCreated(uint256 id, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description);
        }
    }
}

pub(crate) use abi::IGovernorBravo;

/// Strip whitespace from a human-readable signature
fn normalize(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

/// The 4-byte selector of a function signature, e.g. `transfer(address,uint256)`
pub fn selector(signature: &str) -> Selector {
    let digest = keccak256(normalize(signature).as_bytes());
    Selector::from_slice(&digest[..NUM_BYTES_SELECTOR])
}

/// The parameter types of a function signature
pub(crate) fn signature_params(signature: &str) -> Result<Vec<DynSolType>, DeployerError> {
    let signature = normalize(signature);
    let open = signature.find('(').ok_or_else(|| {
        DeployerError::CalldataConstruction(format!("malformed signature `{}`", signature))
    })?;

    let ty = DynSolType::parse(&signature[open..])
        .map_err(|e| DeployerError::CalldataConstruction(format!("{}: {}", signature, e)))?;

    match ty {
        DynSolType::Tuple(tys) => Ok(tys),
        ty => Ok(vec![ty]),
    }
}

/// Convert a value into the exact ABI type it is encoded as
fn coerce(value: &AbiValue, ty: &DynSolType) -> Result<DynSolValue, DeployerError> {
    let coerced = match (value, ty) {
        (AbiValue::Address(a), DynSolType::Address) => DynSolValue::Address(*a),
        (AbiValue::Uint(v), DynSolType::Uint(size)) if v.bit_len() <= *size => {
            DynSolValue::Uint(*v, *size)
        }
        (AbiValue::Int(v), DynSolType::Int(size)) if fits_int(v, *size) => {
            DynSolValue::Int(*v, *size)
        }
        (AbiValue::Bool(b), DynSolType::Bool) => DynSolValue::Bool(*b),
        (AbiValue::Bytes(b), DynSolType::Bytes) => DynSolValue::Bytes(b.to_vec()),
        (AbiValue::Word(w), DynSolType::FixedBytes(size)) => DynSolValue::FixedBytes(*w, *size),
        (AbiValue::String(s), DynSolType::String) => DynSolValue::String(s.clone()),
        (AbiValue::Array(vs), DynSolType::Array(inner)) => DynSolValue::Array(
            vs.iter()
                .map(|v| coerce(v, inner))
                .collect::<Result<_, _>>()?,
        ),
        (AbiValue::Array(vs), DynSolType::FixedArray(inner, len)) if vs.len() == *len => {
            DynSolValue::FixedArray(
                vs.iter()
                    .map(|v| coerce(v, inner))
                    .collect::<Result<_, _>>()?,
            )
        }
        (AbiValue::Tuple(vs), DynSolType::Tuple(tys)) if vs.len() == tys.len() => {
            DynSolValue::Tuple(
                vs.iter()
                    .zip(tys)
                    .map(|(v, t)| coerce(v, t))
                    .collect::<Result<_, _>>()?,
            )
        }
        _ => {
            return Err(DeployerError::CalldataConstruction(format!(
                "{:?} is not a valid `{}`",
                value,
                ty.sol_type_name()
            )))
        }
    };

    Ok(coerced)
}

/// Whether `v` is representable as an `int<size>`
fn fits_int(v: &I256, size: usize) -> bool {
    if size >= 256 {
        return true;
    }

    // int<N> spans [-2^(N-1), 2^(N-1) - 1]
    let bound = U256::from(1) << (size - 1);
    let magnitude = v.unsigned_abs();
    if v.is_negative() {
        magnitude <= bound
    } else {
        magnitude < bound
    }
}

/// ABI-encode `args` as the parameters `tys`
pub(crate) fn encode_params(tys: &[DynSolType], args: &[AbiValue]) -> Result<Bytes, DeployerError> {
    if tys.len() != args.len() {
        return Err(DeployerError::CalldataConstruction(format!(
            "expected {} arguments, got {}",
            tys.len(),
            args.len()
        )));
    }

    if args.is_empty() {
        return Ok(Bytes::new());
    }

    let values = args
        .iter()
        .zip(tys)
        .map(|(v, t)| coerce(v, t))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DynSolValue::Tuple(values).abi_encode_params().into())
}

/// ABI-encode `args` using their natural types, with no signature to check against
pub fn encode_args(args: &[AbiValue]) -> Bytes {
    if args.is_empty() {
        return Bytes::new();
    }

    let values = args.iter().map(AbiValue::to_sol_value).collect();
    DynSolValue::Tuple(values).abi_encode_params().into()
}

/// Build the calldata for calling `signature` with `args`
pub fn encode_call(signature: &str, args: &[AbiValue]) -> Result<Bytes, DeployerError> {
    let tys = signature_params(signature)?;
    let encoded = encode_params(&tys, args)?;

    let mut calldata = Vec::with_capacity(NUM_BYTES_SELECTOR + encoded.len());
    calldata.extend_from_slice(selector(signature).as_slice());
    calldata.extend_from_slice(&encoded);
    Ok(calldata.into())
}

/// Decode return data as the given types, `None` if it does not decode
pub(crate) fn decode_returns(tys: Vec<DynSolType>, data: &[u8]) -> Option<Vec<DynSolValue>> {
    match DynSolType::Tuple(tys).abi_decode_params(data).ok()? {
        DynSolValue::Tuple(values) => Some(values),
        _ => None,
    }
}

/// Interpret a 32-byte word as a left-padded address
pub(crate) fn word_to_address(word: &[u8]) -> Option<Address> {
    if word.len() != NUM_BYTES_STORAGE_SLOT {
        return None;
    }

    let (padding, address) = word.split_at(NUM_BYTES_STORAGE_SLOT - NUM_BYTES_ADDRESS);
    if padding.iter().any(|b| *b != 0) {
        return None;
    }

    Some(Address::from_slice(address))
}

/// Interpret the first 32-byte word of `data` as an unsigned integer
pub(crate) fn first_word_uint(data: &[u8]) -> Option<U256> {
    data.get(..NUM_BYTES_STORAGE_SLOT).map(U256::from_be_slice)
}
