//! Creation bytecode lookup from compiled contract artifacts.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use alloy_core::primitives::Bytes;
use serde_json::Value;

use crate::error::{DeployError, Result};

/// Directories produced by the compiler that never hold contract artifacts.
const SKIPPED_DIRS: [&str; 2] = ["build-info", "cache"];

/// Resolves contract names to creation bytecode.
///
/// Understands both the Hardhat layout (`artifacts/**/Foo.json` with a
/// `"bytecode": "0x..."` field) and the Foundry layout (`out/**/Foo.json` with
/// `"bytecode": {"object": "0x..."}`).
#[derive(Debug, Default)]
pub struct ContractSource {
    root: Option<PathBuf>,
    cache: Mutex<HashMap<String, Bytes>>,
}

impl ContractSource {
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            cache: Mutex::default(),
        }
    }

    /// A source backed only by the given bytecode.
    pub fn in_memory<I, S>(contracts: I) -> Self
    where
        I: IntoIterator<Item = (S, Bytes)>,
        S: Into<String>,
    {
        Self {
            root: None,
            cache: Mutex::new(
                contracts
                    .into_iter()
                    .map(|(name, bytecode)| (name.into(), bytecode))
                    .collect(),
            ),
        }
    }

    /// Creation bytecode of `contract`.
    pub fn bytecode(&self, contract: &str) -> Result<Bytes> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bytecode) = cache.get(contract) {
            return Ok(bytecode.clone());
        }

        let root = self
            .root
            .as_deref()
            .ok_or_else(|| DeployError::ContractNotFound(contract.to_string()))?;
        let path = find_artifact(root, &format!("{contract}.json"))?
            .ok_or_else(|| DeployError::ContractNotFound(contract.to_string()))?;
        let bytecode = parse_bytecode(&path, contract)?;

        tracing::debug!(contract, path = %path.display(), size = bytecode.len(), "Loaded contract bytecode");

        cache.insert(contract.to_string(), bytecode.clone());
        Ok(bytecode)
    }
}

fn find_artifact(dir: &Path, file_name: &str) -> Result<Option<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| DeployError::io(dir, e))?;

    let mut subdirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DeployError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            let skipped = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| SKIPPED_DIRS.contains(&name));
            if !skipped {
                subdirs.push(path);
            }
        } else if path.file_name().and_then(|name| name.to_str()) == Some(file_name) {
            return Ok(Some(path));
        }
    }

    subdirs.sort();
    for subdir in subdirs {
        if let Some(found) = find_artifact(&subdir, file_name)? {
            return Ok(Some(found));
        }
    }

    Ok(None)
}

fn parse_bytecode(path: &Path, contract: &str) -> Result<Bytes> {
    let content = std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
    let json: Value = serde_json::from_str(&content).map_err(|e| DeployError::serde(path, e))?;

    let encoded = match &json["bytecode"] {
        Value::String(hex) => hex.as_str(),
        Value::Object(object) => object
            .get("object")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        _ => "",
    };

    let bytecode = hex::decode(encoded.trim_start_matches("0x"))
        .map_err(|e| DeployError::InvalidArgument(format!("{}: {e}", path.display())))?;

    // Interfaces and abstract contracts compile to empty bytecode.
    if bytecode.is_empty() {
        return Err(DeployError::ContractNotFound(contract.to_string()));
    }

    Ok(bytecode.into())
}
