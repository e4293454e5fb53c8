//! Deterministic policy engine: pure evaluation of a request or output
//! against a configured rule set.
#![forbid(unsafe_code)]

pub mod config;

pub use config::{
    load_yaml, JurisdictionConfig, PhaseSelector, PolicyConfig, Predicate, Rule, RuleSetConfig,
};

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

pub const PRE_PASS_RATIONALE: &str = "Request cleared by Guardian precheck.";
pub const POST_PASS_RATIONALE: &str = "Output is reversible and suitable for delivery.";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid policy configuration: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pass,
    Halt,
    Defer,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Halt => "halt",
            Status::Defer => "defer",
        }
    }
}

/// One evaluated request. Context keys are a BTreeMap so nothing downstream
/// can depend on insertion order.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub prompt: String,
    pub context: BTreeMap<String, String>,
    pub jurisdiction: Option<String>,
    pub timestamp_ms: u64,
}

/// Immutable outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub phase: Phase,
    pub status: Status,
    pub risk: f64,
    pub rationale: String,
    /// Ids of fired rules, ascending.
    pub fired_rule_ids: Vec<String>,
    /// Post phase only; pre verdicts always report true.
    pub reversible: bool,
    /// Jurisdiction after fallback resolution.
    pub jurisdiction: String,
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<Rule>,
    cfg: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(cfg: PolicyConfig, rule_set: RuleSetConfig) -> Result<Self, PolicyError> {
        cfg.validate()?;
        rule_set.validate()?;

        let mut rules = rule_set.rules;
        rules.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Self { rules, cfg })
    }

    pub fn from_paths(
        policy_path: impl AsRef<Path>,
        rules_path: impl AsRef<Path>,
    ) -> Result<Self, PolicyError> {
        let cfg: PolicyConfig = load_yaml(policy_path)?;
        let rule_set: RuleSetConfig = load_yaml(rules_path)?;
        Self::new(cfg, rule_set)
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    pub fn resolve_jurisdiction(&self, tag: Option<&str>) -> String {
        self.cfg.jurisdiction.chain(tag)[0].clone()
    }

    /// Evaluate all applicable rules in ascending id order. Pure: identical
    /// inputs and rule set always produce byte-identical verdicts.
    pub fn evaluate(&self, request: &Request, phase: Phase) -> Result<Verdict, PolicyError> {
        if request.prompt.trim().is_empty() {
            return Err(PolicyError::Validation("prompt must be non-empty".into()));
        }
        if request.prompt.len() > self.cfg.max_prompt_len {
            return Err(PolicyError::Validation(format!(
                "prompt length {} exceeds limit {}",
                request.prompt.len(),
                self.cfg.max_prompt_len
            )));
        }

        let chain = self.cfg.jurisdiction.chain(request.jurisdiction.as_deref());
        let jurisdiction = chain[0].clone();
        let text_lower = request.prompt.to_lowercase();

        let fired: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|rule| rule.phase.applies_to(phase))
            .filter(|rule| {
                rule.jurisdictions.is_empty()
                    || chain.iter().any(|tag| rule.jurisdictions.contains(tag))
            })
            .filter(|rule| rule.predicate.matches(&text_lower, &request.context))
            .collect();

        let risk = aggregate_risk(fired.iter().map(|r| r.severity));
        let reversible = match phase {
            Phase::Pre => true,
            Phase::Post => !fired.iter().any(|r| r.irreversible),
        };
        let fired_rule_ids: Vec<String> = fired.iter().map(|r| r.id.clone()).collect();

        let (status, rationale) = if let Some(blocker) = fired.iter().find(|r| r.hard_block) {
            (Status::Halt, blocker.rationale.clone())
        } else if risk >= self.cfg.halt_threshold {
            (Status::Halt, threshold_rationale("halts", &fired, risk))
        } else if risk >= self.cfg.defer_threshold {
            (Status::Defer, threshold_rationale("defers", &fired, risk))
        } else {
            let rationale = match phase {
                Phase::Pre => PRE_PASS_RATIONALE.to_string(),
                Phase::Post => POST_PASS_RATIONALE.to_string(),
            };
            (Status::Pass, rationale)
        };

        Ok(Verdict {
            phase,
            status,
            risk,
            rationale,
            fired_rule_ids,
            reversible,
            jurisdiction,
        })
    }
}

/// Saturating sum of fired severities, clamped to [0, 1]. Monotonic:
/// raising any fired severity can never lower the aggregate.
fn aggregate_risk(severities: impl Iterator<Item = f64>) -> f64 {
    severities.sum::<f64>().clamp(0.0, 1.0)
}

/// Rationale for threshold-driven halts/defers: leads with the dominant
/// fired rule so the response stays rule-specific. Dominance is highest
/// severity, ties broken by ascending id.
fn threshold_rationale(verb: &str, fired: &[&Rule], risk: f64) -> String {
    let dominant = fired
        .iter()
        .max_by(|a, b| {
            a.severity
                .partial_cmp(&b.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|r| r.rationale.as_str())
        .unwrap_or("Aggregate risk crossed a configured threshold.");
    format!("{dominant} Guardian {verb} at aggregate risk {risk:.2}.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JurisdictionConfig, Predicate};

    fn rule(id: &str, phase: PhaseSelector, severity: f64, patterns: &[&str]) -> Rule {
        Rule {
            id: id.to_string(),
            category: "manipulation".to_string(),
            phase,
            severity,
            hard_block: false,
            irreversible: false,
            jurisdictions: Default::default(),
            rationale: format!("Guardian flagged pattern group {id}."),
            predicate: Predicate::ContainsAny(
                patterns.iter().map(|p| p.to_string()).collect(),
            ),
        }
    }

    fn base_config() -> PolicyConfig {
        PolicyConfig {
            max_prompt_len: 4096,
            defer_threshold: 0.45,
            halt_threshold: 0.70,
            jurisdiction: JurisdictionConfig {
                default: "GLOBAL".to_string(),
                fallback: [("UK".to_string(), "GLOBAL".to_string())].into(),
            },
        }
    }

    fn engine(rules: Vec<Rule>) -> PolicyEngine {
        PolicyEngine::new(base_config(), RuleSetConfig { rules }).expect("engine")
    }

    fn request(prompt: &str) -> Request {
        Request {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn benign_prompt_passes_with_zero_risk() {
        let engine = engine(vec![rule(
            "ms.self-harm",
            PhaseSelector::Pre,
            1.0,
            &["suicide"],
        )]);
        let verdict = engine
            .evaluate(
                &request("Explain cyberbullying to a 10-year-old kindly, no scary detail."),
                Phase::Pre,
            )
            .unwrap();

        assert_eq!(verdict.status, Status::Pass);
        assert_eq!(verdict.risk, 0.0);
        assert_eq!(verdict.rationale, PRE_PASS_RATIONALE);
        assert!(verdict.fired_rule_ids.is_empty());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let engine = engine(vec![
            rule("a.tone", PhaseSelector::Both, 0.3, &["secret"]),
            rule("b.tone", PhaseSelector::Both, 0.3, &["secret"]),
        ]);
        let req = request("keep this secret from everyone");
        let first = engine.evaluate(&req, Phase::Pre).unwrap();
        let second = engine.evaluate(&req, Phase::Pre).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fired_rule_ids, vec!["a.tone", "b.tone"]);
    }

    #[test]
    fn hard_block_halts_with_rule_rationale() {
        let mut blocker = rule("ms.csam", PhaseSelector::Pre, 1.0, &["csam"]);
        blocker.hard_block = true;
        blocker.rationale = "Guardian halt: child exploitation material.".to_string();
        let engine = engine(vec![blocker]);

        let verdict = engine.evaluate(&request("csam request"), Phase::Pre).unwrap();
        assert_eq!(verdict.status, Status::Halt);
        assert_eq!(verdict.risk, 1.0);
        assert_eq!(verdict.rationale, "Guardian halt: child exploitation material.");
    }

    #[test]
    fn aggregate_risk_saturates_and_crosses_thresholds() {
        let engine = engine(vec![
            rule("a", PhaseSelector::Pre, 0.25, &["weapon"]),
            rule("b", PhaseSelector::Pre, 0.25, &["weapon"]),
        ]);
        let verdict = engine.evaluate(&request("make a weapon"), Phase::Pre).unwrap();
        assert_eq!(verdict.status, Status::Defer);
        assert!((verdict.risk - 0.5).abs() < 1e-12);
        assert!(verdict.rationale.contains("0.50"));
    }

    #[test]
    fn raising_a_fired_severity_never_lowers_risk() {
        let low = engine(vec![
            rule("a", PhaseSelector::Pre, 0.3, &["weapon"]),
            rule("b", PhaseSelector::Pre, 0.6, &["weapon"]),
        ]);
        let high = engine(vec![
            rule("a", PhaseSelector::Pre, 0.5, &["weapon"]),
            rule("b", PhaseSelector::Pre, 0.6, &["weapon"]),
        ]);
        let req = request("make a weapon");
        let before = low.evaluate(&req, Phase::Pre).unwrap();
        let after = high.evaluate(&req, Phase::Pre).unwrap();
        assert!(after.risk >= before.risk);
        assert_eq!(after.status, Status::Halt);
    }

    #[test]
    fn non_ascii_patterns_match_case_insensitively() {
        let engine = engine(vec![rule(
            "tone.secrecy-de",
            PhaseSelector::Pre,
            0.9,
            &["GEHEIMNIS VOR DEINEN ELTERN", "VERRÄTST"],
        )]);
        let verdict = engine
            .evaluate(&request("das verrätst du niemandem"), Phase::Pre)
            .unwrap();
        assert_eq!(verdict.status, Status::Halt);
        assert_eq!(verdict.fired_rule_ids, vec!["tone.secrecy-de"]);
    }

    #[test]
    fn post_rule_marks_verdict_irreversible() {
        let mut tone = rule("tone.grooming", PhaseSelector::Post, 0.5, &["keep this secret"]);
        tone.irreversible = true;
        let engine = engine(vec![tone]);

        let verdict = engine
            .evaluate(&request("please keep this secret from your parents"), Phase::Post)
            .unwrap();
        assert!(!verdict.reversible);
        assert_eq!(verdict.status, Status::Defer);
    }

    #[test]
    fn jurisdiction_falls_back_along_chain() {
        let mut uk_rule = rule("uk.only", PhaseSelector::Pre, 0.9, &["age check"]);
        uk_rule.jurisdictions = ["UK".to_string()].into();
        let engine = engine(vec![uk_rule]);

        let mut req = request("run an age check bypass");
        req.jurisdiction = Some("UK".to_string());
        let verdict = engine.evaluate(&req, Phase::Pre).unwrap();
        assert_eq!(verdict.status, Status::Halt);
        assert_eq!(verdict.jurisdiction, "UK");

        req.jurisdiction = Some("ZZ".to_string());
        let verdict = engine.evaluate(&req, Phase::Pre).unwrap();
        assert_eq!(verdict.jurisdiction, "GLOBAL");
        assert_eq!(verdict.status, Status::Pass);
    }

    #[test]
    fn context_predicates_match_exactly() {
        let mut flagged = rule("ctx.minor", PhaseSelector::Pre, 0.8, &["meet"]);
        flagged.predicate = Predicate::AllOf(vec![
            Predicate::ContainsAny(vec!["meet".to_string()]),
            Predicate::ContextEquals {
                key: "age_band".to_string(),
                value: "minor".to_string(),
            },
        ]);
        let engine = engine(vec![flagged]);

        let mut req = request("can we meet alone");
        assert_eq!(engine.evaluate(&req, Phase::Pre).unwrap().status, Status::Pass);

        req.context.insert("age_band".to_string(), "minor".to_string());
        assert_eq!(engine.evaluate(&req, Phase::Pre).unwrap().status, Status::Halt);
    }

    #[test]
    fn empty_prompt_is_rejected_before_evaluation() {
        let engine = engine(vec![]);
        let err = engine.evaluate(&request("   "), Phase::Pre).unwrap_err();
        assert!(matches!(err, PolicyError::Validation(_)));
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let engine = engine(vec![]);
        let err = engine
            .evaluate(&request(&"x".repeat(5000)), Phase::Pre)
            .unwrap_err();
        assert!(matches!(err, PolicyError::Validation(_)));
    }

    #[test]
    fn duplicate_rule_ids_fail_at_load() {
        let err = PolicyEngine::new(
            base_config(),
            RuleSetConfig {
                rules: vec![
                    rule("dup", PhaseSelector::Pre, 0.1, &["x"]),
                    rule("dup", PhaseSelector::Post, 0.2, &["y"]),
                ],
            },
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn cyclic_jurisdiction_fallback_fails_at_load() {
        let mut cfg = base_config();
        cfg.jurisdiction.fallback = [
            ("UK".to_string(), "EU".to_string()),
            ("EU".to_string(), "UK".to_string()),
        ]
        .into();
        let err = PolicyEngine::new(cfg, RuleSetConfig { rules: vec![] }).unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn inverted_thresholds_fail_at_load() {
        let mut cfg = base_config();
        cfg.defer_threshold = 0.9;
        cfg.halt_threshold = 0.5;
        let err = PolicyEngine::new(cfg, RuleSetConfig { rules: vec![] }).unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }
}
