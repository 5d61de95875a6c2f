//! Typed ABI values and calldata encoding.

use std::fmt;

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes, Selector, U256, keccak256},
};
use serde::{Deserialize, Serialize};

/// A single ABI-encodable argument.
///
/// Recorded constructor arguments are stored in this form, so the serialized
/// representation must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AbiArg {
    Address(Address),
    Uint(U256),
    Bool(bool),
    String(String),
    Bytes(Bytes),
}

impl AbiArg {
    /// The Solidity type name used when building a function signature.
    pub const fn sol_type(&self) -> &'static str {
        match self {
            Self::Address(_) => "address",
            Self::Uint(_) => "uint256",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }

    fn to_dyn(&self) -> DynSolValue {
        match self {
            Self::Address(address) => DynSolValue::Address(*address),
            Self::Uint(value) => DynSolValue::Uint(*value, 256),
            Self::Bool(value) => DynSolValue::Bool(*value),
            Self::String(value) => DynSolValue::String(value.clone()),
            Self::Bytes(value) => DynSolValue::Bytes(value.to_vec()),
        }
    }
}

impl fmt::Display for AbiArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Bytes(value) => write!(f, "{value}"),
        }
    }
}

impl From<Address> for AbiArg {
    fn from(value: Address) -> Self {
        Self::Address(value)
    }
}

impl From<U256> for AbiArg {
    fn from(value: U256) -> Self {
        Self::Uint(value)
    }
}

impl From<u64> for AbiArg {
    fn from(value: u64) -> Self {
        Self::Uint(U256::from(value))
    }
}

impl From<bool> for AbiArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for AbiArg {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AbiArg {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Builds the canonical signature of `method` for the given arguments.
///
/// A method that already carries a parameter list (`"hasPool(address)"`) is
/// returned unchanged.
pub fn signature(method: &str, args: &[AbiArg]) -> String {
    if method.contains('(') {
        return method.to_string();
    }
    let types = args.iter().map(AbiArg::sol_type).collect::<Vec<_>>();
    format!("{method}({})", types.join(","))
}

/// The 4-byte function selector for a canonical signature.
pub fn selector(signature: &str) -> Selector {
    Selector::from_slice(&keccak256(signature.as_bytes())[..4])
}

/// ABI-encodes arguments as a function parameter list.
pub fn encode_params(args: &[AbiArg]) -> Vec<u8> {
    if args.is_empty() {
        return Vec::new();
    }
    DynSolValue::Tuple(args.iter().map(AbiArg::to_dyn).collect()).abi_encode_params()
}

/// Calldata for invoking `method` with `args`.
pub fn encode_call(method: &str, args: &[AbiArg]) -> Bytes {
    let signature = signature(method, args);
    let mut data = selector(&signature).to_vec();
    data.extend(encode_params(args));
    data.into()
}

/// Creation input: bytecode followed by the encoded constructor arguments.
pub fn encode_deploy(bytecode: &Bytes, args: &[AbiArg]) -> Bytes {
    let mut data = bytecode.to_vec();
    data.extend(encode_params(args));
    data.into()
}
