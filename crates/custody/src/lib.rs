//! Offline custody verifier: replays an exported bundle and reports
//! whether it is internally consistent. Every failure mode is a report
//! field, never an error, since a failing bundle is itself evidence.
//! The verifier never repairs.
#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use guardian_protocol::{
    decision_record_hash, digest_value, file_digest, genesis_hash, guardian, hex32,
    manifest_signing_preimage,
};
use prost::Message;
use serde::Serialize;

pub const MANIFEST_FILE: &str = "manifest.txt";
pub const SIGNATURE_FILE: &str = "manifest.sig";
pub const MANIFEST_HEADER_PREFIX: &str = "guardian-bundle v1";

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// When set, a present `manifest.sig` is checked against this key.
    pub verifying_key: Option<VerifyingKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCheck {
    pub path: String,
    pub declared_hex: String,
    pub computed_hex: Option<String>,
    pub pass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCheck {
    NotPresent,
    Valid,
    Invalid,
    NoKeyProvided,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub per_file: Vec<FileCheck>,
    pub chain_valid: bool,
    /// Sequence of the first broken record; everything from here on is
    /// invalid, since a forged mid-chain edit poisons all descendants.
    pub first_break: Option<u64>,
    pub declared_records: u64,
    pub found_records: u64,
    pub count_match: bool,
    pub signature: SignatureCheck,
    pub notes: Vec<String>,
    pub final_pass: bool,
}

impl Report {
    fn failed(note: String) -> Self {
        Report {
            per_file: Vec::new(),
            chain_valid: false,
            first_break: None,
            declared_records: 0,
            found_records: 0,
            count_match: false,
            signature: SignatureCheck::NotPresent,
            notes: vec![note],
            final_pass: false,
        }
    }
}

/// Re-verify a bundle from its bytes alone. Reproducible and idempotent:
/// the same bundle always yields the same report.
pub fn verify_bundle(bundle_dir: impl AsRef<Path>, options: &VerifyOptions) -> Report {
    let bundle_dir = bundle_dir.as_ref();

    let manifest_bytes = match fs::read(bundle_dir.join(MANIFEST_FILE)) {
        Ok(bytes) => bytes,
        Err(err) => return Report::failed(format!("manifest unreadable: {err}")),
    };
    let manifest_text = match String::from_utf8(manifest_bytes.clone()) {
        Ok(text) => text,
        Err(_) => return Report::failed("manifest is not valid UTF-8".to_string()),
    };

    let mut lines = manifest_text.lines();
    let declared_records = match parse_header(lines.next()) {
        Ok(count) => count,
        Err(note) => return Report::failed(note),
    };

    let mut notes = Vec::new();
    let mut per_file = Vec::new();
    let mut records = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((declared_hex, rel_path)) = line.split_once(' ') else {
            notes.push(format!("malformed manifest line: {line}"));
            continue;
        };

        let check = match fs::read(bundle_dir.join(rel_path)) {
            Ok(bytes) => {
                let computed_hex = hex32(file_digest(&bytes));
                let pass = computed_hex == declared_hex;
                if pass {
                    match guardian::v1::DecisionRecord::decode(bytes.as_slice()) {
                        Ok(record) => records.push(record),
                        Err(err) => notes.push(format!("{rel_path}: undecodable record: {err}")),
                    }
                }
                FileCheck {
                    path: rel_path.to_string(),
                    declared_hex: declared_hex.to_string(),
                    computed_hex: Some(computed_hex),
                    pass,
                }
            }
            Err(err) => {
                notes.push(format!("{rel_path}: unreadable: {err}"));
                FileCheck {
                    path: rel_path.to_string(),
                    declared_hex: declared_hex.to_string(),
                    computed_hex: None,
                    pass: false,
                }
            }
        };
        per_file.push(check);
    }

    records.sort_by_key(|r| r.sequence);
    let (chain_valid, first_break) = replay_chain(&records, &mut notes);

    let found_records = records.len() as u64;
    let count_match = declared_records == found_records;
    if !count_match {
        notes.push(format!(
            "record count mismatch: manifest declares {declared_records}, found {found_records}"
        ));
    }

    let signature = check_signature(bundle_dir, &manifest_bytes, options, &mut notes);

    let files_pass = per_file.iter().all(|f| f.pass);
    let final_pass =
        files_pass && chain_valid && count_match && signature != SignatureCheck::Invalid;

    Report {
        per_file,
        chain_valid,
        first_break,
        declared_records,
        found_records,
        count_match,
        signature,
        notes,
        final_pass,
    }
}

fn parse_header(line: Option<&str>) -> Result<u64, String> {
    let Some(line) = line else {
        return Err("manifest is empty".to_string());
    };
    let Some(rest) = line.strip_prefix(MANIFEST_HEADER_PREFIX) else {
        return Err(format!("unrecognized manifest header: {line}"));
    };
    let mut fields = rest.split_whitespace();
    match fields.next().map(str::parse::<u64>) {
        Some(Ok(count)) => Ok(count),
        _ => Err(format!("manifest header lacks a record count: {line}")),
    }
}

/// Recompute each record hash from content plus previous hash. A break at
/// record k invalidates k..n-1; verification of the tail is pointless once
/// the chain is forged, so replay stops at the first break.
fn replay_chain(
    records: &[guardian::v1::DecisionRecord],
    notes: &mut Vec<String>,
) -> (bool, Option<u64>) {
    let mut previous: Option<&guardian::v1::DecisionRecord> = None;
    for record in records {
        let linked = match previous {
            None => {
                // Only a slice starting at the origin can be anchored.
                record.sequence != 0 || digest_value(&record.previous_hash) == genesis_hash()
            }
            Some(prev) => {
                record.sequence == prev.sequence + 1
                    && digest_value(&record.previous_hash) == digest_value(&prev.record_hash)
            }
        };

        let computed = decision_record_hash(record);
        if !linked || digest_value(&record.record_hash) != computed {
            notes.push(format!(
                "chain break at record {}: descendants are unverifiable",
                record.sequence
            ));
            return (false, Some(record.sequence));
        }
        previous = Some(record);
    }
    (true, None)
}

fn check_signature(
    bundle_dir: &Path,
    manifest_bytes: &[u8],
    options: &VerifyOptions,
    notes: &mut Vec<String>,
) -> SignatureCheck {
    let sig_bytes = match fs::read(bundle_dir.join(SIGNATURE_FILE)) {
        Ok(bytes) => bytes,
        Err(_) => return SignatureCheck::NotPresent,
    };

    let Some(key) = options.verifying_key.as_ref() else {
        notes.push("manifest signature present but no verifying key supplied".to_string());
        return SignatureCheck::NoKeyProvided;
    };

    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        notes.push("manifest signature is malformed".to_string());
        return SignatureCheck::Invalid;
    };

    match key.verify(&manifest_signing_preimage(manifest_bytes), &signature) {
        Ok(()) => SignatureCheck::Valid,
        Err(_) => {
            notes.push("manifest signature does not verify".to_string());
            SignatureCheck::Invalid
        }
    }
}
