//! Persisted signer store.
//!
//! One directory per keep under the configured data dir, one
//! `membership_<N>` file per member slot, `N` being this member's index in
//! the canonical group ordering. The first byte of a file is the schema
//! version; the rest is the serialized signer. Writes are durable (file and
//! directory fsynced) and read-back verified before they are reported
//! successful. The lifecycle manager must never publish a public key whose
//! backing share could still be lost.

use crate::domain::ThresholdSigner;
use crate::foundation::{OperatorError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const SCHEMA_VERSION: u8 = 1;
const MEMBERSHIP_FILE_PREFIX: &str = "membership_";

pub trait SignerStorage: Send + Sync {
    /// Durably persists a signer. Returns only after the bytes are synced
    /// to stable storage and read back verbatim.
    fn save(&self, signer: &ThresholdSigner) -> Result<()>;

    /// Loads the signer persisted for one keep, if any.
    fn load(&self, keep_id: &str) -> Result<Option<ThresholdSigner>>;

    /// Loads every persisted signer. A corrupt entry fails only its own
    /// keep: it is logged and skipped.
    fn load_all(&self) -> Result<Vec<ThresholdSigner>>;
}

pub struct FileSignerStorage {
    data_dir: PathBuf,
}

impl FileSignerStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .map_err(|err| OperatorError::persistence("create data dir", err.to_string()))?;
        Ok(Self { data_dir })
    }

    fn keep_dir(&self, keep_id: &str) -> PathBuf {
        self.data_dir.join(keep_id)
    }

    fn encode(signer: &ThresholdSigner) -> Result<Vec<u8>> {
        let mut bytes = vec![SCHEMA_VERSION];
        bytes.extend(bincode::serialize(signer)?);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<ThresholdSigner> {
        match bytes.split_first() {
            Some((&SCHEMA_VERSION, body)) => Ok(bincode::deserialize(body)?),
            Some((&version, _)) => Err(OperatorError::persistence(
                "decode signer",
                format!("unsupported schema version [{}]", version),
            )),
            None => Err(OperatorError::persistence("decode signer", "empty signer file")),
        }
    }

    fn read_signer_file(path: &Path) -> Result<ThresholdSigner> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }

    fn membership_file(dir: &Path) -> Result<Option<PathBuf>> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_membership = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(MEMBERSHIP_FILE_PREFIX))
                .unwrap_or(false);
            if is_membership {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

impl SignerStorage for FileSignerStorage {
    fn save(&self, signer: &ThresholdSigner) -> Result<()> {
        let dir = self.keep_dir(signer.group_id());
        fs::create_dir_all(&dir)?;

        let bytes = Self::encode(signer)?;
        let path = dir.join(format!("{}{}", MEMBERSHIP_FILE_PREFIX, signer.group().this_member_index()));

        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        File::open(&dir)?.sync_all()?;

        // The persisted share is the only copy; a mangled write must
        // surface before the key is published.
        let mut stored = Vec::new();
        File::open(&path)?.read_to_end(&mut stored)?;
        if stored != bytes {
            return Err(OperatorError::persistence(
                "verify signer",
                format!("read-back mismatch for keep [{}]", signer.group_id()),
            ));
        }
        Ok(())
    }

    fn load(&self, keep_id: &str) -> Result<Option<ThresholdSigner>> {
        let dir = self.keep_dir(keep_id);
        if !dir.exists() {
            return Ok(None);
        }
        match Self::membership_file(&dir)? {
            Some(path) => Self::read_signer_file(&path).map(Some),
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<Vec<ThresholdSigner>> {
        let mut signers = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let keep_id = dir.file_name().and_then(|name| name.to_str()).unwrap_or_default().to_string();
            let file = match Self::membership_file(&dir) {
                Ok(Some(path)) => path,
                Ok(None) => {
                    warn!(keep = %keep_id, "keep directory without membership file; skipping");
                    continue;
                }
                Err(err) => {
                    error!(keep = %keep_id, %err, "failed to scan keep directory; skipping");
                    continue;
                }
            };
            match Self::read_signer_file(&file) {
                Ok(signer) => signers.push(signer),
                Err(err) => {
                    error!(keep = %keep_id, %err, "corrupt signer file; keep unavailable until restored");
                }
            }
        }
        Ok(signers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GroupInfo, KeygenOutput, Presignature};
    use crate::foundation::MemberId;

    fn sample_signer(keep_id: &str) -> ThresholdSigner {
        let members = vec![MemberId::new(vec![1]), MemberId::new(vec![2]), MemberId::new(vec![3])];
        let group = GroupInfo::new(keep_id, MemberId::new(vec![2]), members, 1).expect("group");
        let keygen = KeygenOutput {
            share: [7u8; 32],
            group_public_key: vec![3u8; 33],
            dishonest_threshold: 1,
            presignatures: vec![Presignature { big_r: vec![2u8; 33], k: [4u8; 32], sigma: [5u8; 32] }],
        };
        ThresholdSigner::new(group, keygen)
    }

    #[test]
    fn signer_round_trips_byte_for_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSignerStorage::new(dir.path()).expect("storage");
        let signer = sample_signer("0x00000000000000000000000000000000000000aa");

        storage.save(&signer).expect("save");
        let loaded = storage.load(signer.group_id()).expect("load").expect("present");
        assert_eq!(loaded, signer);

        // membership_<N> carries the member's canonical index.
        let file = dir.path().join(signer.group_id()).join("membership_1");
        assert!(file.exists());
        assert_eq!(std::fs::read(&file).expect("read")[0], SCHEMA_VERSION);
    }

    #[test]
    fn presignature_reservation_survives_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSignerStorage::new(dir.path()).expect("storage");
        let signer = sample_signer("0x00000000000000000000000000000000000000cc").with_presignatures_used(3);

        storage.save(&signer).expect("save");
        let loaded = storage.load(signer.group_id()).expect("load").expect("present");
        assert_eq!(loaded.presignatures_used(), 3);
    }

    #[test]
    fn load_missing_keep_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSignerStorage::new(dir.path()).expect("storage");
        assert!(storage.load("0xdoesnotexist").expect("load").is_none());
    }

    #[test]
    fn corrupt_file_fails_only_its_keep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSignerStorage::new(dir.path()).expect("storage");

        let healthy = sample_signer("0x00000000000000000000000000000000000000aa");
        let doomed = sample_signer("0x00000000000000000000000000000000000000bb");
        storage.save(&healthy).expect("save healthy");
        storage.save(&doomed).expect("save doomed");

        let corrupt_path = dir.path().join(doomed.group_id()).join("membership_1");
        std::fs::write(&corrupt_path, [SCHEMA_VERSION, 0xFF, 0xFF]).expect("corrupt");

        let loaded = storage.load_all().expect("load_all");
        assert_eq!(loaded, vec![healthy]);
    }

    #[test]
    fn unsupported_schema_version_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSignerStorage::new(dir.path()).expect("storage");
        let signer = sample_signer("0x00000000000000000000000000000000000000aa");
        storage.save(&signer).expect("save");

        let path = dir.path().join(signer.group_id()).join("membership_1");
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[0] = 99;
        std::fs::write(&path, bytes).expect("rewrite");

        let err = storage.load(signer.group_id()).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }
}
