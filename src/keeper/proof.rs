//! Proof request preparation.
//!
//! The keeper never computes proofs. It checks the request is well formed,
//! makes sure the caller may use the active identity, and hands the proof
//! engine the serialized identity plus the circuit artifact locations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::requests::RequestType;
use crate::types::{Result, WalletError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofProtocol {
    Semaphore,
    Rln,
}

impl ProofProtocol {
    pub fn request_type(self) -> RequestType {
        match self {
            Self::Semaphore => RequestType::SemaphoreProof,
            Self::Rln => RequestType::RlnProof,
        }
    }

    fn artifact_name(self) -> &'static str {
        match self {
            Self::Semaphore => "semaphore",
            Self::Rln => "rln",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProofArtifacts {
    pub leaves: Vec<String>,
    pub depth: u32,
    pub leaves_per_node: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofRequest {
    pub protocol: ProofProtocol,
    pub external_nullifier: String,
    pub signal: String,
    #[serde(default)]
    pub merkle_storage_address: Option<String>,
    #[serde(default)]
    pub merkle_proof_artifacts: Option<MerkleProofArtifacts>,
    #[serde(default)]
    pub rln_identifier: Option<String>,
}

/// Circuit files for one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitPaths {
    pub circuit_file_path: String,
    pub zkey_file_path: String,
    pub verification_key: String,
}

impl CircuitPaths {
    pub fn new(artifacts_dir: &str, protocol: ProofProtocol) -> Self {
        let base = artifacts_dir.trim_end_matches('/');
        let name = protocol.artifact_name();
        Self {
            circuit_file_path: format!("{base}/{name}/{name}.wasm"),
            zkey_file_path: format!("{base}/{name}/{name}.zkey"),
            verification_key: format!("{base}/{name}/{name}.json"),
        }
    }
}

/// Check the inputs the proof engine relies on.
pub fn validate(request: &ProofRequest) -> Result<()> {
    if request.external_nullifier.trim().is_empty() {
        return Err(WalletError::BadRequest("externalNullifier is required".into()));
    }
    if request.signal.is_empty() {
        return Err(WalletError::BadRequest("signal is required".into()));
    }

    match (&request.merkle_storage_address, &request.merkle_proof_artifacts) {
        (Some(address), None) => {
            if address.trim().is_empty() {
                return Err(WalletError::BadRequest("merkleStorageAddress is empty".into()));
            }
        }
        (None, Some(artifacts)) => {
            if artifacts.leaves.is_empty() {
                return Err(WalletError::BadRequest("merkleProofArtifacts.leaves is empty".into()));
            }
            if artifacts.depth == 0 || artifacts.leaves_per_node < 2 {
                return Err(WalletError::BadRequest(
                    "merkleProofArtifacts has invalid tree dimensions".into(),
                ));
            }
        }
        (Some(_), Some(_)) => {
            return Err(WalletError::BadRequest(
                "provide either merkleStorageAddress or merkleProofArtifacts, not both".into(),
            ))
        }
        (None, None) => {
            return Err(WalletError::BadRequest(
                "merkleStorageAddress or merkleProofArtifacts is required".into(),
            ))
        }
    }

    if request.protocol == ProofProtocol::Rln
        && request.rln_identifier.as_deref().map_or(true, str::is_empty)
    {
        return Err(WalletError::BadRequest("rlnIdentifier is required for rln proofs".into()));
    }
    Ok(())
}

/// The caller's payload with the circuit paths merged in.
pub fn enrich(payload: Value, paths: &CircuitPaths) -> Result<Value> {
    let mut object = match payload {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    let Value::Object(extra) = serde_json::to_value(paths)? else {
        return Err(WalletError::Internal("circuit paths are not an object".into()));
    };
    object.extend(extra);
    Ok(Value::Object(object))
}
