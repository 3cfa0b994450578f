//! Adapter artifacts - canonical safetensors container for LoRA weight deltas
//!
//! The fine-tuning backend may emit `adapter_model.safetensors` (validated and
//! passed through) or a raw `adapter_model.bin` (wrapped into a single-tensor
//! safetensors container). Either way the result lands at one canonical path,
//! written under a temporary name and renamed into place; the intermediate is
//! removed only after the rename.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::write_atomic;
use crate::error::{EvolutionError, EvolutionResult};

/// Backend output file names, in order of preference
pub const SAFETENSORS_OUTPUT: &str = "adapter_model.safetensors";
pub const RAW_OUTPUT: &str = "adapter_model.bin";

/// Tensor name used when wrapping raw weights
const RAW_TENSOR_NAME: &str = "adapter.raw";

/// Format the backend produced before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Safetensors,
    Raw,
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactFormat::Safetensors => write!(f, "safetensors"),
            ArtifactFormat::Raw => write!(f, "raw"),
        }
    }
}

/// A validated adapter at its canonical path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterArtifact {
    pub path: PathBuf,
    /// Hex SHA-256 of the canonical file
    pub sha256: String,
    pub size_bytes: u64,
    pub source_format: ArtifactFormat,
}

impl AdapterArtifact {
    /// Load and validate an existing canonical artifact
    pub fn open(path: &Path) -> EvolutionResult<Self> {
        if !path.exists() {
            return Err(EvolutionError::AdapterMissing(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        validate_safetensors(&bytes).map_err(|reason| {
            EvolutionError::AdapterMissing(format!("{} is not a valid adapter: {}", path.display(), reason))
        })?;

        let source_format = if matches!(tensor_names(&bytes), Some(names) if names == [RAW_TENSOR_NAME]) {
            ArtifactFormat::Raw
        } else {
            ArtifactFormat::Safetensors
        };

        Ok(Self {
            path: path.to_path_buf(),
            sha256: digest(&bytes),
            size_bytes: bytes.len() as u64,
            source_format,
        })
    }

    /// Check the file on disk is still the one that was normalized
    pub fn verify(&self) -> EvolutionResult<()> {
        if !self.path.exists() {
            return Err(EvolutionError::AdapterMissing(self.path.display().to_string()));
        }
        let bytes = std::fs::read(&self.path)?;
        if digest(&bytes) != self.sha256 {
            return Err(EvolutionError::AdapterMissing(format!(
                "{} changed since it was produced",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// Convert whatever the backend left in `output_dir` into the canonical artifact
pub fn normalize(output_dir: &Path, canonical: &Path) -> EvolutionResult<AdapterArtifact> {
    let safetensors = output_dir.join(SAFETENSORS_OUTPUT);
    let raw = output_dir.join(RAW_OUTPUT);

    let (intermediate, format, container) = if safetensors.exists() {
        let bytes = std::fs::read(&safetensors)?;
        validate_safetensors(&bytes).map_err(|reason| {
            EvolutionError::TrainingBackendFailure(format!("invalid {}: {}", SAFETENSORS_OUTPUT, reason))
        })?;
        (safetensors, ArtifactFormat::Safetensors, bytes)
    } else if raw.exists() {
        let bytes = std::fs::read(&raw)?;
        if bytes.is_empty() {
            return Err(EvolutionError::TrainingBackendFailure(format!("{} is empty", RAW_OUTPUT)));
        }
        (raw, ArtifactFormat::Raw, wrap_raw(&bytes))
    } else {
        return Err(EvolutionError::TrainingBackendFailure(format!(
            "no adapter output in {}",
            output_dir.display()
        )));
    };

    if let Some(parent) = canonical.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(canonical, &container)?;

    if let Err(e) = std::fs::remove_file(&intermediate) {
        warn!("Could not remove intermediate adapter {}: {}", intermediate.display(), e);
    }

    let artifact = AdapterArtifact {
        path: canonical.to_path_buf(),
        sha256: digest(&container),
        size_bytes: container.len() as u64,
        source_format: format,
    };
    info!(
        "Adapter normalized from {} to {} ({} bytes, sha256 {})",
        format,
        canonical.display(),
        artifact.size_bytes,
        &artifact.sha256[..12]
    );
    Ok(artifact)
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Split a safetensors file into its parsed header and data section
fn parse_header(bytes: &[u8]) -> Result<(serde_json::Map<String, serde_json::Value>, usize), String> {
    if bytes.len() < 8 {
        return Err("file shorter than header length prefix".to_string());
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let header_len = u64::from_le_bytes(len_bytes);
    let header_end = 8u64
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len() as u64)
        .ok_or_else(|| format!("header length {} exceeds file size", header_len))? as usize;

    let header: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes[8..header_end])
        .map_err(|e| format!("header is not a JSON object: {}", e))?;
    Ok((header, bytes.len() - header_end))
}

/// Check the container structure: a JSON header whose tensors all fit the data section
pub fn validate_safetensors(bytes: &[u8]) -> Result<(), String> {
    let (header, data_len) = parse_header(bytes)?;

    let mut tensors = 0;
    for (name, info) in &header {
        if name == "__metadata__" {
            continue;
        }
        let offsets = info
            .get("data_offsets")
            .and_then(|v| v.as_array())
            .filter(|a| a.len() == 2)
            .ok_or_else(|| format!("tensor {} has no data_offsets", name))?;
        let begin = offsets[0].as_u64().ok_or_else(|| format!("tensor {} has a bad offset", name))?;
        let end = offsets[1].as_u64().ok_or_else(|| format!("tensor {} has a bad offset", name))?;
        if begin > end || end > data_len as u64 {
            return Err(format!("tensor {} data [{}, {}) outside {} data bytes", name, begin, end, data_len));
        }
        tensors += 1;
    }

    if tensors == 0 {
        return Err("container holds no tensors".to_string());
    }
    Ok(())
}

fn tensor_names(bytes: &[u8]) -> Option<Vec<String>> {
    let (header, _) = parse_header(bytes).ok()?;
    Some(header.keys().filter(|k| *k != "__metadata__").cloned().collect())
}

/// Wrap raw weight bytes as a single `U8` tensor
fn wrap_raw(raw: &[u8]) -> Vec<u8> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("format".to_string(), "raw".into());
    metadata.insert("source".to_string(), RAW_OUTPUT.into());

    let mut header = serde_json::Map::new();
    header.insert("__metadata__".to_string(), metadata.into());
    header.insert(
        RAW_TENSOR_NAME.to_string(),
        serde_json::json!({
            "dtype": "U8",
            "shape": [raw.len()],
            "data_offsets": [0, raw.len()],
        }),
    );
    let mut header = serde_json::Value::Object(header).to_string().into_bytes();
    // Data section starts 8-byte aligned
    while header.len() % 8 != 0 {
        header.push(b' ');
    }

    let mut out = Vec::with_capacity(8 + header.len() + raw.len());
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(raw);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safetensors_fixture() -> Vec<u8> {
        let header = br#"{"lora_A":{"dtype":"F32","shape":[2],"data_offsets":[0,8]}}"#;
        let mut out = Vec::new();
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(header);
        out.extend_from_slice(&1.0f32.to_le_bytes());
        out.extend_from_slice(&2.0f32.to_le_bytes());
        out
    }

    #[test]
    fn test_normalize_passes_safetensors_through() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(output.join(SAFETENSORS_OUTPUT), safetensors_fixture()).unwrap();
        let canonical = dir.path().join("models").join("latest_lora.safetensors");

        let artifact = normalize(&output, &canonical).unwrap();

        assert_eq!(artifact.source_format, ArtifactFormat::Safetensors);
        assert_eq!(std::fs::read(&canonical).unwrap(), safetensors_fixture());
        assert!(!output.join(SAFETENSORS_OUTPUT).exists());
        assert_eq!(artifact.sha256.len(), 64);
    }

    #[test]
    fn test_normalize_wraps_raw_bin() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(output.join(RAW_OUTPUT), b"lora weights").unwrap();
        let canonical = dir.path().join("latest_lora.safetensors");

        let artifact = normalize(&output, &canonical).unwrap();

        assert_eq!(artifact.source_format, ArtifactFormat::Raw);
        assert!(!output.join(RAW_OUTPUT).exists());
        let bytes = std::fs::read(&canonical).unwrap();
        assert!(validate_safetensors(&bytes).is_ok());
        assert!(bytes.ends_with(b"lora weights"));

        let reopened = AdapterArtifact::open(&canonical).unwrap();
        assert_eq!(reopened, artifact);
    }

    #[test]
    fn test_normalize_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = normalize(dir.path(), &dir.path().join("latest_lora.safetensors")).unwrap_err();
        assert_eq!(err.kind(), "TrainingBackendFailure");
    }

    #[test]
    fn test_invalid_safetensors_keeps_intermediate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAFETENSORS_OUTPUT), b"not a container").unwrap();
        let canonical = dir.path().join("latest_lora.safetensors");

        assert!(normalize(dir.path(), &canonical).is_err());
        assert!(!canonical.exists());
        assert!(dir.path().join(SAFETENSORS_OUTPUT).exists());
    }

    #[test]
    fn test_validate_rejects_out_of_range_offsets() {
        let header = br#"{"w":{"dtype":"U8","shape":[4],"data_offsets":[0,4]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(b"ab");
        assert!(validate_safetensors(&bytes).is_err());
    }

    #[test]
    fn test_open_missing_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest_lora.safetensors");
        assert_eq!(AdapterArtifact::open(&path).unwrap_err().kind(), "AdapterMissing");

        std::fs::write(&path, safetensors_fixture()).unwrap();
        let artifact = AdapterArtifact::open(&path).unwrap();
        assert!(artifact.verify().is_ok());

        std::fs::remove_file(&path).unwrap();
        assert_eq!(artifact.verify().unwrap_err().kind(), "AdapterMissing");
    }
}
