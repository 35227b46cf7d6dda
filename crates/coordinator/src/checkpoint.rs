//! Durable record of completed DKG epochs.
//!
//! One row per epoch: `{ epoch_id, group_secret_share, last_random_seed }`.
//! A node that finds a checkpoint for its epoch at startup skips the DKG.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use beacon_dkg::GroupSecretShare;
use beacon_types::{EpochId, RandomSeed};

use crate::epoch::EpochMetadata;
use crate::error::CheckpointError;

/// Persisted outcome of an epoch's DKG.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCheckpoint {
    pub epoch_id: EpochId,
    /// Hex of the 32-byte little-endian scalar
    pub group_secret_share: String,
    pub last_random_seed: i64,
}

impl EpochCheckpoint {
    pub fn new(share: &GroupSecretShare, last_seed: RandomSeed) -> Self {
        Self {
            epoch_id: share.epoch(),
            group_secret_share: share.to_hex(),
            last_random_seed: last_seed.0,
        }
    }

    pub fn group_secret_share(&self) -> Result<GroupSecretShare, CheckpointError> {
        GroupSecretShare::from_hex(self.epoch_id, &self.group_secret_share)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))
    }

    pub fn last_seed(&self) -> RandomSeed {
        RandomSeed(self.last_random_seed)
    }
}

impl fmt::Debug for EpochCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochCheckpoint")
            .field("epoch_id", &self.epoch_id)
            .field("last_random_seed", &self.last_random_seed)
            .finish_non_exhaustive()
    }
}

/// Storage backend for epoch checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn put(&self, checkpoint: &EpochCheckpoint) -> Result<(), CheckpointError>;

    fn get(&self, epoch: EpochId) -> Result<Option<EpochCheckpoint>, CheckpointError>;

    /// Persist the outcome of `epoch`.
    fn save(
        &self,
        epoch: EpochId,
        share: &GroupSecretShare,
        last_seed: RandomSeed,
    ) -> Result<(), CheckpointError> {
        if share.epoch() != epoch {
            return Err(CheckpointError::EpochMismatch {
                expected: epoch,
                got: share.epoch(),
            });
        }
        self.put(&EpochCheckpoint::new(share, last_seed))
    }

    /// Load the share and last seed of `epoch`, if a checkpoint exists.
    fn load(
        &self,
        epoch: EpochId,
    ) -> Result<Option<(GroupSecretShare, RandomSeed)>, CheckpointError> {
        let Some(checkpoint) = self.get(epoch)? else {
            return Ok(None);
        };
        if checkpoint.epoch_id != epoch {
            return Err(CheckpointError::EpochMismatch {
                expected: epoch,
                got: checkpoint.epoch_id,
            });
        }
        Ok(Some((checkpoint.group_secret_share()?, checkpoint.last_seed())))
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    rows: RwLock<HashMap<EpochId, EpochCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, checkpoint: &EpochCheckpoint) -> Result<(), CheckpointError> {
        self.rows
            .write()
            .insert(checkpoint.epoch_id, checkpoint.clone());
        Ok(())
    }

    fn get(&self, epoch: EpochId) -> Result<Option<EpochCheckpoint>, CheckpointError> {
        Ok(self.rows.read().get(&epoch).cloned())
    }
}

/// One JSON file per epoch under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_path(&self, epoch: EpochId) -> PathBuf {
        self.dir.join(format!("epoch-{epoch}.json"))
    }

    fn metadata_path(&self, epoch: EpochId) -> PathBuf {
        self.dir.join(format!("epoch-{epoch}.meta.json"))
    }

    /// Store the epoch's public metadata next to its checkpoint.
    pub fn save_metadata(&self, metadata: &EpochMetadata) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.metadata_path(metadata.epoch), &json)
    }

    pub fn load_metadata(&self, epoch: EpochId) -> Result<Option<EpochMetadata>, CheckpointError> {
        read_json(&self.metadata_path(epoch))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put(&self, checkpoint: &EpochCheckpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let path = self.checkpoint_path(checkpoint.epoch_id);
        write_atomic(&path, &json)?;
        info!(epoch = checkpoint.epoch_id, path = %path.display(), "Saved epoch checkpoint");
        Ok(())
    }

    fn get(&self, epoch: EpochId) -> Result<Option<EpochCheckpoint>, CheckpointError> {
        read_json(&self.checkpoint_path(epoch))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    if !path.exists() {
        debug!(path = %path.display(), "No file at path");
        return Ok(None);
    }
    let data = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bls12_381::Scalar;

    fn share(epoch: EpochId) -> GroupSecretShare {
        GroupSecretShare::new(epoch, Scalar::from(123_456u64))
    }

    fn roundtrip(store: &dyn CheckpointStore) {
        assert!(store.load(8).unwrap().is_none());

        store.save(8, &share(8), RandomSeed(-5)).unwrap();
        let (loaded, seed) = store.load(8).unwrap().unwrap();
        assert_eq!(loaded, share(8));
        assert_eq!(seed, RandomSeed(-5));

        assert!(matches!(
            store.save(9, &share(8), RandomSeed(0)),
            Err(CheckpointError::EpochMismatch { expected: 9, got: 8 })
        ));
    }

    #[test]
    fn test_memory_store() {
        roundtrip(&MemoryCheckpointStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints")).unwrap();
        roundtrip(&store);

        let raw = fs::read_to_string(store.dir().join("epoch-8.json")).unwrap();
        assert!(raw.contains("\"last_random_seed\": -5"));
        assert!(!store.dir().join("epoch-8.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();

        store
            .put(&EpochCheckpoint {
                epoch_id: 2,
                group_secret_share: "zz".to_string(),
                last_random_seed: 0,
            })
            .unwrap();
        assert!(matches!(store.load(2), Err(CheckpointError::Corrupt(_))));

        fs::write(dir.path().join("epoch-3.json"), b"{not json").unwrap();
        assert!(matches!(store.load(3), Err(CheckpointError::Serde(_))));
    }

    #[test]
    fn test_debug_hides_secret() {
        let checkpoint = EpochCheckpoint::new(&share(1), RandomSeed(3));
        assert!(!format!("{checkpoint:?}").contains(&checkpoint.group_secret_share));
    }
}
