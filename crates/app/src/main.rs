#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway::{EchoGenerator, Gate, GateConfig, GateError};
use indices::{IndicesConfig, IndicesError};
use ledger::{Ledger, LedgerError};
use policy::{PolicyEngine, PolicyError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration path missing: {0}")]
    MissingPath(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Indices(#[from] IndicesError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Gate(#[from] GateError),
}

#[derive(Debug, Clone)]
struct ConfigPaths {
    policy: PathBuf,
    rules: PathBuf,
    indices: PathBuf,
    gateway: PathBuf,
}

impl ConfigPaths {
    fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            policy: base.join("policy.yaml"),
            rules: base.join("rules.yaml"),
            indices: base.join("indices.yaml"),
            gateway: base.join("gateway.yaml"),
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        for (label, path) in [
            ("policy", &self.policy),
            ("rules", &self.rules),
            ("indices", &self.indices),
            ("gateway", &self.gateway),
        ] {
            if !path.exists() {
                return Err(AppError::MissingPath(label.to_string()));
            }
        }

        Ok(())
    }
}

fn main() -> Result<(), AppError> {
    env_logger::init();

    let config_paths = ConfigPaths::new("config");
    config_paths.validate()?;

    let engine = PolicyEngine::from_paths(&config_paths.policy, &config_paths.rules)?;
    let indices_cfg = IndicesConfig::load(&config_paths.indices)?;
    let gate_cfg = GateConfig::load(&config_paths.gateway)?;
    let ledger = Arc::new(Ledger::open("evidence")?);

    let gate = Gate::new(
        engine,
        indices_cfg,
        ledger,
        Arc::new(EchoGenerator),
        gate_cfg,
    )?;

    log::info!(
        target: "app",
        "guardian ready, ledger at sequence {}",
        gate.ledger().len()
    );
    println!("boot ok");
    Ok(())
}
