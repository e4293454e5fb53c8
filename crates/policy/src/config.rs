use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    path::Path,
};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{Phase, PolicyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseSelector {
    Pre,
    Post,
    Both,
}

impl PhaseSelector {
    pub fn applies_to(&self, phase: Phase) -> bool {
        match self {
            PhaseSelector::Pre => phase == Phase::Pre,
            PhaseSelector::Post => phase == Phase::Post,
            PhaseSelector::Both => true,
        }
    }
}

/// Rule predicates are tagged data interpreted by the engine, never code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Predicate {
    /// Case-insensitive substring match over the evaluated text.
    ContainsAny(Vec<String>),
    /// Exact match against one context entry.
    ContextEquals { key: String, value: String },
    AllOf(Vec<Predicate>),
    AnyOf(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, text_lower: &str, context: &BTreeMap<String, String>) -> bool {
        match self {
            Predicate::ContainsAny(patterns) => patterns
                .iter()
                .any(|p| text_lower.contains(p.to_lowercase().as_str())),
            Predicate::ContextEquals { key, value } => {
                context.get(key).map(|v| v == value).unwrap_or(false)
            }
            Predicate::AllOf(inner) => inner.iter().all(|p| p.matches(text_lower, context)),
            Predicate::AnyOf(inner) => inner.iter().any(|p| p.matches(text_lower, context)),
        }
    }

    fn validate(&self, rule_id: &str) -> Result<(), PolicyError> {
        match self {
            Predicate::ContainsAny(patterns) => {
                if patterns.is_empty() || patterns.iter().any(|p| p.is_empty()) {
                    return Err(PolicyError::Config(format!(
                        "rule {rule_id}: contains_any requires non-empty patterns"
                    )));
                }
            }
            Predicate::ContextEquals { key, .. } => {
                if key.is_empty() {
                    return Err(PolicyError::Config(format!(
                        "rule {rule_id}: context_equals requires a key"
                    )));
                }
            }
            Predicate::AllOf(inner) | Predicate::AnyOf(inner) => {
                if inner.is_empty() {
                    return Err(PolicyError::Config(format!(
                        "rule {rule_id}: empty predicate combinator"
                    )));
                }
                for p in inner {
                    p.validate(rule_id)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub id: String,
    pub category: String,
    pub phase: PhaseSelector,
    pub severity: f64,
    #[serde(default)]
    pub hard_block: bool,
    #[serde(default)]
    pub irreversible: bool,
    #[serde(default)]
    pub jurisdictions: BTreeSet<String>,
    pub rationale: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSetConfig {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JurisdictionConfig {
    pub default: String,
    #[serde(default)]
    pub fallback: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub max_prompt_len: usize,
    pub defer_threshold: f64,
    pub halt_threshold: f64,
    pub jurisdiction: JurisdictionConfig,
}

pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, PolicyError> {
    let file = File::open(path.as_ref())?;
    Ok(serde_yaml::from_reader(file)?)
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_prompt_len == 0 {
            return Err(PolicyError::Config("max_prompt_len must be positive".into()));
        }
        if !(self.defer_threshold > 0.0
            && self.defer_threshold <= self.halt_threshold
            && self.halt_threshold <= 1.0)
        {
            return Err(PolicyError::Config(format!(
                "thresholds must satisfy 0 < defer ({}) <= halt ({}) <= 1",
                self.defer_threshold, self.halt_threshold
            )));
        }
        if self.jurisdiction.default.is_empty() {
            return Err(PolicyError::Config("jurisdiction.default is required".into()));
        }
        self.jurisdiction.detect_cycles()?;
        Ok(())
    }
}

impl JurisdictionConfig {
    /// The resolved tag followed by its fallback ancestors, most specific
    /// first. Tags absent from the configuration resolve to the default.
    pub fn chain(&self, tag: Option<&str>) -> Vec<String> {
        let start = match tag {
            Some(t) if self.is_known(t) => t.to_string(),
            _ => self.default.clone(),
        };

        let mut chain = vec![start.clone()];
        let mut current = start;
        while let Some(parent) = self.fallback.get(&current) {
            if chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent.clone();
        }
        if !chain.contains(&self.default) {
            chain.push(self.default.clone());
        }
        chain
    }

    fn is_known(&self, tag: &str) -> bool {
        tag == self.default
            || self.fallback.contains_key(tag)
            || self.fallback.values().any(|v| v == tag)
    }

    fn detect_cycles(&self) -> Result<(), PolicyError> {
        for start in self.fallback.keys() {
            let mut visited = BTreeSet::new();
            let mut current = start.clone();
            while let Some(parent) = self.fallback.get(&current) {
                if !visited.insert(current.clone()) {
                    return Err(PolicyError::Config(format!(
                        "cyclic jurisdiction fallback through {start}"
                    )));
                }
                current = parent.clone();
            }
        }
        Ok(())
    }
}

impl RuleSetConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(PolicyError::Config("rule with empty id".into()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::Config(format!("duplicate rule id: {}", rule.id)));
            }
            if !(0.0..=1.0).contains(&rule.severity) {
                return Err(PolicyError::Config(format!(
                    "rule {}: severity {} outside [0, 1]",
                    rule.id, rule.severity
                )));
            }
            if rule.rationale.trim().is_empty() {
                return Err(PolicyError::Config(format!(
                    "rule {}: rationale must be non-empty",
                    rule.id
                )));
            }
            rule.predicate.validate(&rule.id)?;
        }
        Ok(())
    }
}
