//! User-facing numeric summaries derived from verdicts. Pure functions;
//! calibration lives in configuration, not constants.
#![forbid(unsafe_code)]

use std::fs::File;
use std::path::Path;

use policy::{Phase, Verdict};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndicesError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid indices configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndicesConfig {
    /// Protection index reported when no rule fires. Deliberately below
    /// 1.0 to reserve calibration headroom.
    pub protection_baseline: f64,
    /// Lower clamp for the protection index.
    pub protection_floor: f64,
    /// Upper clamp for the Moral Health Index of reversible outputs.
    pub mhi_ceiling: f64,
}

impl IndicesConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IndicesError> {
        let file = File::open(path.as_ref())?;
        let cfg: Self = serde_yaml::from_reader(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), IndicesError> {
        for (label, value) in [
            ("protection_baseline", self.protection_baseline),
            ("protection_floor", self.protection_floor),
            ("mhi_ceiling", self.mhi_ceiling),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(IndicesError::Config(format!(
                    "{label} {value} outside [0, 1]"
                )));
            }
        }
        if self.protection_floor > self.protection_baseline {
            return Err(IndicesError::Config(
                "protection_floor must not exceed protection_baseline".into(),
            ));
        }
        Ok(())
    }
}

/// Pre-check summary: inverse of assessed risk, floored. A clean verdict
/// reports the configured baseline exactly.
pub fn protection_index(verdict: &Verdict, cfg: &IndicesConfig) -> f64 {
    if verdict.fired_rule_ids.is_empty() {
        return cfg.protection_baseline;
    }
    (1.0 - verdict.risk).clamp(cfg.protection_floor, 1.0)
}

/// Post-check summary: residual moral headroom of a delivered output.
/// Irreversible outputs score zero regardless of risk.
pub fn moral_health_index(verdict: &Verdict, cfg: &IndicesConfig) -> f64 {
    debug_assert_eq!(verdict.phase, Phase::Post);
    if !verdict.reversible {
        return 0.0;
    }
    (1.0 - verdict.risk).clamp(0.0, cfg.mhi_ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::Status;

    fn cfg() -> IndicesConfig {
        IndicesConfig {
            protection_baseline: 0.99,
            protection_floor: 0.0,
            mhi_ceiling: 0.95,
        }
    }

    fn verdict(phase: Phase, risk: f64, fired: &[&str], reversible: bool) -> Verdict {
        Verdict {
            phase,
            status: Status::Pass,
            risk,
            rationale: "test".to_string(),
            fired_rule_ids: fired.iter().map(|s| s.to_string()).collect(),
            reversible,
            jurisdiction: "GLOBAL".to_string(),
        }
    }

    #[test]
    fn clean_precheck_reports_configured_baseline() {
        let v = verdict(Phase::Pre, 0.0, &[], true);
        assert_eq!(protection_index(&v, &cfg()), 0.99);
    }

    #[test]
    fn fired_rules_invert_risk_with_floor() {
        let v = verdict(Phase::Pre, 0.3, &["a"], true);
        assert!((protection_index(&v, &cfg()) - 0.7).abs() < 1e-12);

        let mut strict = cfg();
        strict.protection_floor = 0.2;
        let hot = verdict(Phase::Pre, 0.95, &["a"], true);
        assert_eq!(protection_index(&hot, &strict), 0.2);
    }

    #[test]
    fn irreversible_output_scores_zero() {
        let v = verdict(Phase::Post, 0.1, &["tone.grooming"], false);
        assert_eq!(moral_health_index(&v, &cfg()), 0.0);
    }

    #[test]
    fn clean_postcheck_hits_calibrated_ceiling() {
        let v = verdict(Phase::Post, 0.0, &[], true);
        assert_eq!(moral_health_index(&v, &cfg()), 0.95);
    }

    #[test]
    fn indices_stay_in_unit_interval() {
        for risk in [0.0, 0.2, 0.5, 0.9, 1.0] {
            let pre = verdict(Phase::Pre, risk, &["a"], true);
            let post = verdict(Phase::Post, risk, &["a"], true);
            let pi = protection_index(&pre, &cfg());
            let mhi = moral_health_index(&post, &cfg());
            assert!((0.0..=1.0).contains(&pi));
            assert!((0.0..=1.0).contains(&mhi));
        }
    }

    #[test]
    fn out_of_range_config_is_rejected() {
        let mut bad = cfg();
        bad.mhi_ceiling = 1.2;
        assert!(matches!(bad.validate(), Err(IndicesError::Config(_))));

        let mut inverted = cfg();
        inverted.protection_floor = 1.0;
        assert!(matches!(inverted.validate(), Err(IndicesError::Config(_))));
    }
}
