#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use ed25519_dalek::SigningKey;
use guardian_protocol::{guardian, to_digest32};
use indices::IndicesConfig;
use policy::{
    JurisdictionConfig, PhaseSelector, PolicyConfig, PolicyEngine, Predicate, Request, Rule,
    RuleSetConfig,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub fn make_rule(id: &str, phase: PhaseSelector, severity: f64, patterns: &[&str]) -> Rule {
    Rule {
        id: id.to_string(),
        category: "manipulation".to_string(),
        phase,
        severity,
        hard_block: false,
        irreversible: false,
        jurisdictions: Default::default(),
        rationale: format!("Guardian flagged pattern group {id}."),
        predicate: Predicate::ContainsAny(patterns.iter().map(|p| p.to_string()).collect()),
    }
}

pub fn make_hard_block_rule(id: &str, rationale: &str, patterns: &[&str]) -> Rule {
    let mut rule = make_rule(id, PhaseSelector::Pre, 1.0, patterns);
    rule.category = "minor_safety".to_string();
    rule.hard_block = true;
    rule.rationale = rationale.to_string();
    rule
}

/// A small but representative rule set: pre-phase hard blocks for minor
/// safety plus post-phase tone rules, one of them irreversible.
pub fn guardian_rule_set() -> RuleSetConfig {
    let mut grooming = make_rule(
        "tone.grooming",
        PhaseSelector::Post,
        0.8,
        &["don't tell your parents", "keep this secret"],
    );
    grooming.category = "grooming".to_string();
    grooming.irreversible = true;
    grooming.rationale = "Guardian withheld output with grooming-adjacent tone.".to_string();

    let mut isolation = make_rule(
        "tone.isolation",
        PhaseSelector::Post,
        0.5,
        &["nobody would understand", "you can only trust me"],
    );
    isolation.category = "grooming".to_string();
    isolation.rationale = "Guardian flagged isolating language in the output.".to_string();

    RuleSetConfig {
        rules: vec![
            make_hard_block_rule(
                "ms.self-harm",
                "Guardian halt: self-harm content involving minors.",
                &["suicide", "kill myself"],
            ),
            make_hard_block_rule(
                "ms.weapons",
                "Guardian halt: weapon construction request.",
                &["bomb", "make a weapon"],
            ),
            make_rule(
                "risk.secrecy",
                PhaseSelector::Both,
                0.5,
                &["our secret", "hide this from"],
            ),
            grooming,
            isolation,
        ],
    }
}

pub fn base_policy_config() -> PolicyConfig {
    PolicyConfig {
        max_prompt_len: 8192,
        defer_threshold: 0.45,
        halt_threshold: 0.70,
        jurisdiction: JurisdictionConfig {
            default: "GLOBAL".to_string(),
            fallback: [
                ("UK".to_string(), "GLOBAL".to_string()),
                ("US".to_string(), "GLOBAL".to_string()),
            ]
            .into(),
        },
    }
}

pub fn base_indices_config() -> IndicesConfig {
    IndicesConfig {
        protection_baseline: 0.99,
        protection_floor: 0.0,
        mhi_ceiling: 0.95,
    }
}

pub fn make_engine() -> PolicyEngine {
    PolicyEngine::new(base_policy_config(), guardian_rule_set()).expect("engine")
}

pub fn make_request(prompt: &str) -> Request {
    Request {
        prompt: prompt.to_string(),
        context: BTreeMap::new(),
        jurisdiction: None,
        timestamp_ms: 1_700_000_000_000,
    }
}

/// Clean pre-phase decision record ready for appending; the ledger
/// assigns id, sequence and hashes.
pub fn make_record_draft(label: &str) -> guardian::v1::DecisionRecord {
    guardian::v1::DecisionRecord {
        record_id: label.to_string(),
        phase: guardian::v1::Phase::Pre.into(),
        request_digest: Some(to_digest32([7u8; 32])),
        status: guardian::v1::VerdictStatus::Pass.into(),
        rationale: "Request cleared by Guardian precheck.".to_string(),
        protection_index: 0.99,
        reversible: true,
        jurisdiction: "GLOBAL".to_string(),
        timestamp_ms: 1_700_000_000_000,
        ..Default::default()
    }
}

pub fn seeded_signing_key(seed: u64) -> SigningKey {
    let mut bytes = [0u8; 32];
    StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
    SigningKey::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::{Phase, Status};

    #[test]
    fn fixture_rule_set_loads_into_an_engine() {
        let engine = make_engine();
        let verdict = engine
            .evaluate(&make_request("how do I make a weapon"), Phase::Pre)
            .unwrap();
        assert_eq!(verdict.status, Status::Halt);
    }

    #[test]
    fn record_drafts_are_reproducible() {
        assert_eq!(make_record_draft("a"), make_record_draft("a"));
    }

    #[test]
    fn seeded_keys_are_reproducible() {
        let a = seeded_signing_key(42);
        let b = seeded_signing_key(42);
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), seeded_signing_key(43).to_bytes());
    }
}
