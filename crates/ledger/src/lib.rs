//! Moral Integrity Ledger: append-only, hash-chained evidence store with a
//! single global append point. Every record is durably written to its own
//! evidence file before the chain head advances, so a crash loses at most
//! the unlinked tail.
#![forbid(unsafe_code)]

mod bundle;

pub use bundle::{BundlePaths, MANIFEST_FILE, MANIFEST_HEADER_PREFIX, SIGNATURE_FILE};

use std::fs;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use guardian_protocol::{
    canonical_bytes, decision_record_hash, digest_value, genesis_hash, guardian, hex32,
    to_digest32,
};
use prost::Message;
use thiserror::Error;

pub const RECORDS_SUBDIR: &str = "records";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger integrity violation: {0}")]
    Integrity(String),
    #[error("ledger io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger codec failure: {0}")]
    Codec(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub sequence: u64,
    pub record_hash: [u8; 32],
}

#[derive(Debug)]
struct Inner {
    records: Vec<guardian::v1::DecisionRecord>,
    head: [u8; 32],
    poisoned: bool,
}

#[derive(Debug)]
pub struct Ledger {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Ledger {
    /// Open (or create) a ledger under `dir`, replaying any existing
    /// evidence files and re-verifying the full chain.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        let records_dir = dir.join(RECORDS_SUBDIR);
        fs::create_dir_all(&records_dir)?;

        let mut paths: Vec<PathBuf> = fs::read_dir(&records_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "bin").unwrap_or(false))
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        let mut head = genesis_hash();
        for (index, path) in paths.iter().enumerate() {
            let bytes = fs::read(path)?;
            let record = guardian::v1::DecisionRecord::decode(bytes.as_slice())?;

            if record.sequence != index as u64 {
                return Err(LedgerError::Integrity(format!(
                    "record file {} carries sequence {}, expected {}",
                    path.display(),
                    record.sequence,
                    index
                )));
            }
            if digest_value(&record.previous_hash) != head {
                return Err(LedgerError::Integrity(format!(
                    "record {} does not chain from its predecessor",
                    record.sequence
                )));
            }
            let computed = decision_record_hash(&record);
            if digest_value(&record.record_hash) != computed {
                return Err(LedgerError::Integrity(format!(
                    "record {} stored hash does not match its content",
                    record.sequence
                )));
            }

            head = computed;
            records.push(record);
        }

        log::info!(
            target: "ledger",
            "opened ledger at {} with {} records",
            dir.display(),
            records.len()
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                records,
                head,
                poisoned: false,
            }),
        })
    }

    /// Append one decision record. `record_id`, `sequence` and
    /// `record_hash` are assigned here; a caller-supplied `previous_hash`
    /// is checked against the chain head and any mismatch is fatal
    /// corruption: the ledger poisons itself and refuses further writes.
    /// Callers that leave `previous_hash` unset receive the head under
    /// the append lock.
    pub fn append(
        &self,
        mut record: guardian::v1::DecisionRecord,
    ) -> Result<AppendReceipt, LedgerError> {
        let mut inner = self.lock();
        if inner.poisoned {
            return Err(LedgerError::Integrity(
                "ledger is poisoned after a prior integrity failure".into(),
            ));
        }

        // The tail must still hash to the head before anything new chains
        // onto it.
        if let Some(last) = inner.records.last() {
            if decision_record_hash(last) != inner.head {
                inner.poisoned = true;
                return Err(LedgerError::Integrity(
                    "chain head no longer matches the last record".into(),
                ));
            }
        }

        if let Some(supplied) = &record.previous_hash {
            if supplied.value != inner.head {
                inner.poisoned = true;
                return Err(LedgerError::Integrity(format!(
                    "supplied previous_hash {} does not match chain head {}",
                    short_hex(&supplied.value),
                    short_hex(&inner.head)
                )));
            }
        }

        let sequence = inner.records.len() as u64;
        record.record_id = record_id(sequence);
        record.sequence = sequence;
        record.previous_hash = Some(to_digest32(inner.head));
        let hash = decision_record_hash(&record);
        record.record_hash = Some(to_digest32(hash));

        self.write_record_file(&record)?;

        inner.head = hash;
        inner.records.push(record);

        log::info!(
            target: "ledger",
            "appended record seq={} hash={}",
            sequence,
            &hex32(hash)[..12]
        );

        Ok(AppendReceipt {
            sequence,
            record_hash: hash,
        })
    }

    /// Ordered records within `range`, cloned from an atomic snapshot.
    pub fn read(&self, range: impl RangeBounds<u64>) -> Vec<guardian::v1::DecisionRecord> {
        let inner = self.lock();
        let len = inner.records.len() as u64;
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len) as usize;
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .min(len) as usize;

        inner.records[start..end.max(start)].to_vec()
    }

    pub fn len(&self) -> u64 {
        self.lock().records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current chain head (genesis when empty).
    pub fn head(&self) -> [u8; 32] {
        self.lock().head
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().poisoned
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_record_file(&self, record: &guardian::v1::DecisionRecord) -> Result<(), LedgerError> {
        let records_dir = self.dir.join(RECORDS_SUBDIR);
        let final_path = records_dir.join(record_file_name(record.sequence));
        let tmp_path = records_dir.join(format!(".rec_{:08}.tmp", record.sequence));

        fs::write(&tmp_path, canonical_bytes(record))?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

pub fn record_file_name(sequence: u64) -> String {
    format!("rec_{sequence:08}.bin")
}

/// Deterministic identifier for the record at `sequence`. Nothing random
/// enters the hashed record; correlation ids belong in log events.
pub fn record_id(sequence: u64) -> String {
    format!("grd:{sequence:08}")
}

fn short_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}
