//! The Guardian gateway: one pre-check, one bounded generation, one
//! post-verification, one ledger record per decision. Holds no
//! per-request state.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use guardian_protocol::{guardian, request_digest, to_digest32};
use indices::{moral_health_index, protection_index, IndicesConfig};
use ledger::{Ledger, LedgerError};
use policy::{Phase, PolicyEngine, PolicyError, Request, Status, Verdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFER_TIMEOUT_RATIONALE: &str =
    "Generation backend unresponsive; Guardian defers delivery.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("generation backend timed out")]
    Timeout,
    #[error("generation backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("generation failed after {attempts} attempts: {source}")]
    Generation {
        attempts: u32,
        source: GeneratorError,
    },
}

/// Seam to the external answer backend. Implementations run on a worker
/// thread so the gate can enforce its wall-clock bound.
pub trait Generator: Send + Sync + 'static {
    fn generate(&self, prompt: &str) -> Result<String, GeneratorError>;
}

/// Canned backend for boot smoke tests and demos.
pub struct EchoGenerator;

impl Generator for EchoGenerator {
    fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        Ok(format!("Here is a gentle, age-appropriate answer to: {prompt}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Wall-clock bound on one generation attempt. Mandatory; a hung
    /// backend must surface as a defer, never an open-ended wait.
    pub generation_timeout_ms: u64,
    /// Extra attempts after a failed (non-timeout) generation.
    pub generation_max_retries: u32,
    /// Backoff hint attached to defer responses.
    pub defer_recheck_ms: u64,
}

impl GateConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let file = File::open(path.as_ref()).map_err(PolicyError::from)?;
        let cfg: Self = serde_yaml::from_reader(file).map_err(PolicyError::from)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if self.generation_timeout_ms == 0 {
            return Err(PolicyError::Config("generation_timeout_ms must be positive".into()).into());
        }
        if self.defer_recheck_ms == 0 {
            return Err(PolicyError::Config("defer_recheck_ms must be positive".into()).into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    /// Zero means "now".
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: String,
    pub risk: f64,
    pub rationale: String,
    pub protection_index: f64,
}

pub type AnswerRequest = CheckRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub blocked: bool,
    pub safe_output: Option<String>,
    pub rationale: String,
    pub mhi: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub output: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub reversible: bool,
    pub rationale: String,
    pub mhi: f64,
}

pub struct Gate {
    engine: PolicyEngine,
    indices_cfg: IndicesConfig,
    ledger: Arc<Ledger>,
    generator: Arc<dyn Generator>,
    cfg: GateConfig,
}

impl Gate {
    pub fn new(
        engine: PolicyEngine,
        indices_cfg: IndicesConfig,
        ledger: Arc<Ledger>,
        generator: Arc<dyn Generator>,
        cfg: GateConfig,
    ) -> Result<Self, GateError> {
        cfg.validate()?;
        indices_cfg.validate().map_err(|e| {
            GateError::Policy(PolicyError::Config(e.to_string()))
        })?;
        Ok(Self {
            engine,
            indices_cfg,
            ledger,
            generator,
            cfg,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Pre-check a prompt without generating anything.
    pub fn check(&self, request: CheckRequest) -> Result<CheckResponse, GateError> {
        let correlation = Uuid::new_v4();
        let (req, verdict) = self.pre_evaluate(&request)?;
        let protection = protection_index(&verdict, &self.indices_cfg);

        self.append_record(&correlation, &req, &verdict, protection, 0.0)?;

        Ok(CheckResponse {
            status: verdict.status.as_str().to_string(),
            risk: verdict.risk,
            rationale: verdict.rationale,
            protection_index: protection,
        })
    }

    /// Pre-check, generate under the configured wall-clock bound, then
    /// post-verify. The raw output is never delivered unverified.
    pub fn answer(&self, request: AnswerRequest) -> Result<AnswerResponse, GateError> {
        let correlation = Uuid::new_v4();
        let (req, pre) = self.pre_evaluate(&request)?;
        let protection = protection_index(&pre, &self.indices_cfg);
        self.append_record(&correlation, &req, &pre, protection, 0.0)?;

        if pre.status != Status::Pass {
            return Ok(AnswerResponse {
                blocked: true,
                safe_output: None,
                rationale: pre.rationale,
                mhi: 0.0,
                retry_after_ms: (pre.status == Status::Defer).then_some(self.cfg.defer_recheck_ms),
            });
        }

        let output = match self.generate_bounded(&correlation, &req.prompt) {
            Ok(output) => output,
            Err(GeneratorError::Timeout) => {
                let deferred = Verdict {
                    phase: Phase::Post,
                    status: Status::Defer,
                    risk: pre.risk,
                    rationale: DEFER_TIMEOUT_RATIONALE.to_string(),
                    fired_rule_ids: Vec::new(),
                    reversible: true,
                    jurisdiction: pre.jurisdiction.clone(),
                };
                self.append_record(&correlation, &req, &deferred, protection, 0.0)?;
                return Ok(AnswerResponse {
                    blocked: true,
                    safe_output: None,
                    rationale: deferred.rationale,
                    mhi: 0.0,
                    retry_after_ms: Some(self.cfg.defer_recheck_ms),
                });
            }
            Err(source) => {
                return Err(GateError::Generation {
                    attempts: self.cfg.generation_max_retries + 1,
                    source,
                })
            }
        };

        let post_req = Request {
            prompt: output.clone(),
            context: req.context.clone(),
            jurisdiction: req.jurisdiction.clone(),
            timestamp_ms: req.timestamp_ms,
        };
        let post = self.engine.evaluate(&post_req, Phase::Post)?;
        let mhi = moral_health_index(&post, &self.indices_cfg);
        self.append_record(&correlation, &post_req, &post, protection, mhi)?;

        let blocked = post.status != Status::Pass;
        Ok(AnswerResponse {
            blocked,
            safe_output: (!blocked).then_some(output),
            rationale: post.rationale,
            mhi,
            retry_after_ms: (post.status == Status::Defer).then_some(self.cfg.defer_recheck_ms),
        })
    }

    /// Post-verify an already generated output.
    pub fn verify_output(&self, request: VerifyRequest) -> Result<VerifyResponse, GateError> {
        let correlation = Uuid::new_v4();
        let req = Request {
            prompt: request.output,
            context: request.context,
            jurisdiction: request.jurisdiction,
            timestamp_ms: effective_timestamp(request.timestamp_ms),
        };
        let verdict = self.engine.evaluate(&req, Phase::Post)?;
        let mhi = moral_health_index(&verdict, &self.indices_cfg);
        let protection = protection_index(&verdict, &self.indices_cfg);
        self.append_record(&correlation, &req, &verdict, protection, mhi)?;

        Ok(VerifyResponse {
            reversible: verdict.reversible,
            rationale: verdict.rationale,
            mhi,
        })
    }

    fn pre_evaluate(&self, request: &CheckRequest) -> Result<(Request, Verdict), GateError> {
        let req = Request {
            prompt: request.prompt.clone(),
            context: request.context.clone(),
            jurisdiction: request.jurisdiction.clone(),
            timestamp_ms: effective_timestamp(request.timestamp_ms),
        };
        let verdict = self.engine.evaluate(&req, Phase::Pre)?;
        Ok((req, verdict))
    }

    /// One generation attempt runs on a worker thread so a hung backend
    /// cannot stall the gate past its timeout. Timeouts are not retried;
    /// backend failures are, up to the configured budget.
    fn generate_bounded(&self, correlation: &Uuid, prompt: &str) -> Result<String, GeneratorError> {
        let timeout = Duration::from_millis(self.cfg.generation_timeout_ms);
        let mut last_error = GeneratorError::Timeout;

        for attempt in 0..=self.cfg.generation_max_retries {
            let (tx, rx) = mpsc::channel();
            let generator = Arc::clone(&self.generator);
            let prompt = prompt.to_string();
            thread::spawn(move || {
                let _ = tx.send(generator.generate(&prompt));
            });

            match rx.recv_timeout(timeout) {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(GeneratorError::Timeout)) | Err(_) => {
                    log::warn!(
                        target: "gateway",
                        "correlation={correlation} generation timed out after {}ms",
                        self.cfg.generation_timeout_ms
                    );
                    return Err(GeneratorError::Timeout);
                }
                Ok(Err(err)) => {
                    log::warn!(
                        target: "gateway",
                        "correlation={correlation} generation attempt {attempt} failed: {err}"
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn append_record(
        &self,
        correlation: &Uuid,
        req: &Request,
        verdict: &Verdict,
        protection: f64,
        mhi: f64,
    ) -> Result<(), GateError> {
        // The uuid stays in log events; the ledger assigns the record id
        // so nothing random enters the hashed record.
        let digest = request_digest(&req.prompt, &req.context, &verdict.jurisdiction);
        let record = guardian::v1::DecisionRecord {
            phase: phase_proto(verdict.phase).into(),
            request_digest: Some(to_digest32(digest)),
            status: status_proto(verdict.status).into(),
            risk: verdict.risk,
            rationale: verdict.rationale.clone(),
            fired_rule_ids: verdict.fired_rule_ids.clone(),
            protection_index: protection,
            mhi,
            reversible: verdict.reversible,
            jurisdiction: verdict.jurisdiction.clone(),
            timestamp_ms: req.timestamp_ms,
            ..Default::default()
        };

        let receipt = self.ledger.append(record)?;
        log::info!(
            target: "gateway",
            "correlation={correlation} phase={:?} status={} seq={}",
            verdict.phase,
            verdict.status.as_str(),
            receipt.sequence
        );
        Ok(())
    }
}

fn phase_proto(phase: Phase) -> guardian::v1::Phase {
    match phase {
        Phase::Pre => guardian::v1::Phase::Pre,
        Phase::Post => guardian::v1::Phase::Post,
    }
}

fn status_proto(status: Status) -> guardian::v1::VerdictStatus {
    match status {
        Status::Pass => guardian::v1::VerdictStatus::Pass,
        Status::Halt => guardian::v1::VerdictStatus::Halt,
        Status::Defer => guardian::v1::VerdictStatus::Defer,
    }
}

fn effective_timestamp(timestamp_ms: u64) -> u64 {
    if timestamp_ms != 0 {
        return timestamp_ms;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = GateConfig {
            generation_timeout_ms: 0,
            generation_max_retries: 1,
            defer_recheck_ms: 500,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_timestamps_pass_through() {
        assert_eq!(effective_timestamp(123), 123);
        assert!(effective_timestamp(0) > 0);
    }

    #[test]
    fn response_json_matches_the_published_surface() {
        let response = CheckResponse {
            status: "pass".to_string(),
            risk: 0.0,
            rationale: policy::PRE_PASS_RATIONALE.to_string(),
            protection_index: 0.99,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "pass",
                "risk": 0.0,
                "rationale": "Request cleared by Guardian precheck.",
                "protection_index": 0.99,
            })
        );

        let deferred = AnswerResponse {
            blocked: true,
            safe_output: None,
            rationale: DEFER_TIMEOUT_RATIONALE.to_string(),
            mhi: 0.0,
            retry_after_ms: Some(750),
        };
        let json = serde_json::to_value(&deferred).unwrap();
        assert_eq!(json["blocked"], serde_json::json!(true));
        assert_eq!(json["safe_output"], serde_json::Value::Null);
        assert_eq!(json["retry_after_ms"], serde_json::json!(750));
    }
}
