//! Bundle export: snapshot a ledger slice plus a digest manifest so a
//! third party can re-verify custody offline.

use std::fs;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey};
use guardian_protocol::{canonical_bytes, file_digest, hex32, manifest_signing_preimage};

use crate::{record_file_name, Ledger, LedgerError, RECORDS_SUBDIR};

pub const MANIFEST_FILE: &str = "manifest.txt";
pub const SIGNATURE_FILE: &str = "manifest.sig";
pub const MANIFEST_HEADER_PREFIX: &str = "guardian-bundle v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub record_count: u64,
}

impl Ledger {
    /// Snapshot `range` into `out_root/bundle_<created_ms>/`: one evidence
    /// file per record plus a manifest pairing each file's digest to its
    /// path. The manifest header declares the record count so truncation
    /// of records or manifest lines is detectable.
    pub fn export_bundle(
        &self,
        out_root: impl AsRef<Path>,
        range: impl RangeBounds<u64>,
        created_ms: u64,
    ) -> Result<BundlePaths, LedgerError> {
        self.export_bundle_inner(out_root.as_ref(), self.read(range), created_ms, None)
    }

    /// As [`Ledger::export_bundle`], additionally writing an ed25519
    /// signature over the manifest digest.
    pub fn export_bundle_signed(
        &self,
        out_root: impl AsRef<Path>,
        range: impl RangeBounds<u64>,
        created_ms: u64,
        signing_key: &SigningKey,
    ) -> Result<BundlePaths, LedgerError> {
        self.export_bundle_inner(
            out_root.as_ref(),
            self.read(range),
            created_ms,
            Some(signing_key),
        )
    }

    fn export_bundle_inner(
        &self,
        out_root: &Path,
        records: Vec<guardian_protocol::guardian::v1::DecisionRecord>,
        created_ms: u64,
        signing_key: Option<&SigningKey>,
    ) -> Result<BundlePaths, LedgerError> {
        let root = out_root.join(format!("bundle_{created_ms}"));
        let records_dir = root.join(RECORDS_SUBDIR);
        fs::create_dir_all(&records_dir)?;

        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            let bytes = canonical_bytes(record);
            let rel_path = format!("{RECORDS_SUBDIR}/{}", record_file_name(record.sequence));
            fs::write(root.join(&rel_path), &bytes)?;
            entries.push((hex32(file_digest(&bytes)), rel_path));
        }
        entries.sort_by(|a, b| a.1.cmp(&b.1));

        let mut manifest = format!(
            "{MANIFEST_HEADER_PREFIX} {} {created_ms}\n",
            records.len()
        );
        for (digest_hex, rel_path) in &entries {
            manifest.push_str(digest_hex);
            manifest.push(' ');
            manifest.push_str(rel_path);
            manifest.push('\n');
        }

        let manifest_path = root.join(MANIFEST_FILE);
        fs::write(&manifest_path, manifest.as_bytes())?;

        if let Some(key) = signing_key {
            let signature = key.sign(&manifest_signing_preimage(manifest.as_bytes()));
            fs::write(root.join(SIGNATURE_FILE), signature.to_bytes())?;
        }

        log::info!(
            target: "ledger",
            "exported bundle with {} records to {}",
            records.len(),
            root.display()
        );

        Ok(BundlePaths {
            root,
            manifest: manifest_path,
            record_count: records.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_test_utils::make_record_draft as draft;

    #[test]
    fn manifest_declares_count_and_lists_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger")).unwrap();
        for i in 0..3 {
            ledger.append(draft(&format!("r{i}"))).unwrap();
        }

        let bundle = ledger
            .export_bundle(dir.path().join("out"), .., 1_700_000_000_000)
            .unwrap();
        assert_eq!(bundle.record_count, 3);

        let manifest = fs::read_to_string(&bundle.manifest).unwrap();
        let mut lines = manifest.lines();
        assert_eq!(
            lines.next().unwrap(),
            "guardian-bundle v1 3 1700000000000"
        );

        let entries: Vec<&str> = lines.collect();
        assert_eq!(entries.len(), 3);
        for (i, line) in entries.iter().enumerate() {
            let (digest_hex, rel_path) = line.split_once(' ').unwrap();
            assert_eq!(digest_hex.len(), 64);
            assert_eq!(rel_path, &format!("records/rec_{i:08}.bin"));

            let bytes = fs::read(bundle.root.join(rel_path)).unwrap();
            assert_eq!(hex32(file_digest(&bytes)), digest_hex);
        }
    }

    #[test]
    fn signed_export_writes_verifiable_signature() {
        use ed25519_dalek::{Signature, Verifier};
        use guardian_test_utils::seeded_signing_key;

        let key = seeded_signing_key(7);

        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger")).unwrap();
        ledger.append(draft("r0")).unwrap();

        let bundle = ledger
            .export_bundle_signed(dir.path().join("out"), .., 42, &key)
            .unwrap();

        let manifest = fs::read(&bundle.manifest).unwrap();
        let sig_bytes = fs::read(bundle.root.join(SIGNATURE_FILE)).unwrap();
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        key.verifying_key()
            .verify(&manifest_signing_preimage(&manifest), &signature)
            .unwrap();
    }
}
