//! Guardian protocol core types and deterministic hashing helpers.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use blake3::Hasher;
use prost::Message;

pub mod guardian {
    pub mod v1 {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Digest32 {
            #[prost(bytes = "vec", tag = "1")]
            pub value: ::prost::alloc::vec::Vec<u8>,
        }

        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Phase {
            Unspecified = 0,
            Pre = 1,
            Post = 2,
        }

        impl Phase {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    Phase::Unspecified => "PHASE_UNSPECIFIED",
                    Phase::Pre => "PHASE_PRE",
                    Phase::Post => "PHASE_POST",
                }
            }
        }

        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum VerdictStatus {
            Unspecified = 0,
            Pass = 1,
            Halt = 2,
            Defer = 3,
        }

        impl VerdictStatus {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    VerdictStatus::Unspecified => "VERDICT_STATUS_UNSPECIFIED",
                    VerdictStatus::Pass => "VERDICT_STATUS_PASS",
                    VerdictStatus::Halt => "VERDICT_STATUS_HALT",
                    VerdictStatus::Defer => "VERDICT_STATUS_DEFER",
                }
            }
        }

        /// One chained evidence record. Immutable once appended; the hash
        /// chain runs through `previous_hash`/`record_hash`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct DecisionRecord {
            #[prost(string, tag = "1")]
            pub record_id: ::prost::alloc::string::String,
            #[prost(uint64, tag = "2")]
            pub sequence: u64,
            #[prost(enumeration = "Phase", tag = "3")]
            pub phase: i32,
            #[prost(message, optional, tag = "4")]
            pub request_digest: ::core::option::Option<Digest32>,
            #[prost(enumeration = "VerdictStatus", tag = "5")]
            pub status: i32,
            #[prost(double, tag = "6")]
            pub risk: f64,
            #[prost(string, tag = "7")]
            pub rationale: ::prost::alloc::string::String,
            #[prost(string, repeated, tag = "8")]
            pub fired_rule_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
            #[prost(double, tag = "9")]
            pub protection_index: f64,
            #[prost(double, tag = "10")]
            pub mhi: f64,
            #[prost(bool, tag = "11")]
            pub reversible: bool,
            #[prost(string, tag = "12")]
            pub jurisdiction: ::prost::alloc::string::String,
            #[prost(uint64, tag = "13")]
            pub timestamp_ms: u64,
            #[prost(message, optional, tag = "14")]
            pub previous_hash: ::core::option::Option<Digest32>,
            #[prost(message, optional, tag = "15")]
            pub record_hash: ::core::option::Option<Digest32>,
        }
    }
}

pub const DECISION_RECORD_HASH_DOMAIN: &str = "GRD:HASH:DECISION_RECORD";
pub const REQUEST_HASH_DOMAIN: &str = "GRD:HASH:REQUEST";
pub const GENESIS_HASH_DOMAIN: &str = "GRD:HASH:GENESIS";
pub const BUNDLE_MANIFEST_HASH_DOMAIN: &str = "GRD:HASH:BUNDLE_MANIFEST";
pub const BUNDLE_MANIFEST_SIGN_DOMAIN: &str = "GRD:SIGN:BUNDLE_MANIFEST";

/// Canonically encode a protobuf message using deterministic field ordering.
pub fn canonical_bytes<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

/// Compute a 32-byte digest using BLAKE3 over DOMAIN || bytes.
pub fn digest32(domain: &str, bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}

/// Chain anchor for the first record of every ledger.
pub fn genesis_hash() -> [u8; 32] {
    digest32(GENESIS_HASH_DOMAIN, b"guardian-ledger-v1")
}

/// Hash preimage of a decision record: the canonical encoding with the
/// stored hash cleared, then the previous hash appended so every record
/// binds its predecessor.
pub fn decision_record_preimage(record: &guardian::v1::DecisionRecord) -> Vec<u8> {
    let mut unhashed = record.clone();
    unhashed.record_hash = None;

    let mut preimage = canonical_bytes(&unhashed);
    preimage.extend_from_slice(digest_value(&record.previous_hash));
    preimage
}

/// The chained hash of a record: BLAKE3 over DOMAIN || preimage.
pub fn decision_record_hash(record: &guardian::v1::DecisionRecord) -> [u8; 32] {
    digest32(DECISION_RECORD_HASH_DOMAIN, &decision_record_preimage(record))
}

/// Digest of a request, independent of context insertion order: prompt,
/// context entries in ascending key order, resolved jurisdiction, each
/// length-prefixed so field boundaries are unambiguous.
pub fn request_digest(
    prompt: &str,
    context: &BTreeMap<String, String>,
    jurisdiction: &str,
) -> [u8; 32] {
    let mut bytes = Vec::new();
    push_chunk(&mut bytes, prompt.as_bytes());
    for (key, value) in context {
        push_chunk(&mut bytes, key.as_bytes());
        push_chunk(&mut bytes, value.as_bytes());
    }
    push_chunk(&mut bytes, jurisdiction.as_bytes());
    digest32(REQUEST_HASH_DOMAIN, &bytes)
}

pub const EVIDENCE_FILE_HASH_DOMAIN: &str = "GRD:HASH:EVIDENCE_FILE";

/// Digest of one evidence file's bytes, as listed in bundle manifests.
pub fn file_digest(bytes: &[u8]) -> [u8; 32] {
    digest32(EVIDENCE_FILE_HASH_DOMAIN, bytes)
}

/// Lowercase hex of a 32-byte digest.
pub fn hex32(digest: [u8; 32]) -> String {
    blake3::Hash::from(digest).to_hex().to_string()
}

/// Parse the lowercase hex form of a 32-byte digest.
pub fn parse_hex32(hex: &str) -> Option<[u8; 32]> {
    blake3::Hash::from_hex(hex).ok().map(|h| *h.as_bytes())
}

/// Digest of bundle manifest bytes.
pub fn manifest_digest(manifest_bytes: &[u8]) -> [u8; 32] {
    digest32(BUNDLE_MANIFEST_HASH_DOMAIN, manifest_bytes)
}

/// Signing preimage for a bundle manifest: sign the digest, not the raw
/// bytes, under a separate domain.
pub fn manifest_signing_preimage(manifest_bytes: &[u8]) -> Vec<u8> {
    let mut preimage = Vec::new();
    preimage.extend_from_slice(BUNDLE_MANIFEST_SIGN_DOMAIN.as_bytes());
    preimage.extend_from_slice(&manifest_digest(manifest_bytes));
    preimage
}

/// Borrow the raw bytes of an optional digest, empty when absent.
pub fn digest_value(opt: &Option<guardian::v1::Digest32>) -> &[u8] {
    opt.as_ref().map(|d| d.value.as_slice()).unwrap_or(&[])
}

/// Wrap a raw 32-byte digest in its message form.
pub fn to_digest32(bytes: [u8; 32]) -> guardian::v1::Digest32 {
    guardian::v1::Digest32 {
        value: bytes.to_vec(),
    }
}

fn push_chunk(out: &mut Vec<u8>, chunk: &[u8]) {
    out.extend_from_slice(&(chunk.len() as u64).to_be_bytes());
    out.extend_from_slice(chunk);
}
