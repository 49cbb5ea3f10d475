//! Two-stage bootstrap controller.
//!
//! Stage 1 is the engine's own setup; only after it completes does
//! stage 2 perform the controlled, explicit load of the protected
//! payload and publish the catalog. Making the second load an explicit
//! operation (instead of an implicit load-time dependency) removes the
//! ordering race between host initialization and engine readiness.
//!
//! The state machine only moves forward: `Uninitialized -> Stage1Ready
//! -> Stage2Ready`, with `Failed` absorbing any stage failure for the
//! rest of the process lifetime. Callers that arrive before the
//! controller settles serialize on an internal mutex; settled callers
//! are answered from an atomic state word without locking.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;

use crate::catalog::{Catalog, CatalogError};
use crate::dispatch::Engine;
use crate::eval::ExecLimits;
use crate::payload::{decode_bundle, PayloadError, PayloadSource};

/// Bootstrap lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootstrapState {
    Uninitialized = 0,
    Stage1Ready = 1,
    Stage2Ready = 2,
    Failed = 3,
}

impl BootstrapState {
    fn from_word(word: u8) -> Self {
        match word {
            0 => BootstrapState::Uninitialized,
            1 => BootstrapState::Stage1Ready,
            2 => BootstrapState::Stage2Ready,
            _ => BootstrapState::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("payload load failed: {0}")]
    Payload(#[from] PayloadError),
    #[error("catalog build failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("payload bundle contains no functions")]
    EmptyCatalog,
    #[error("bootstrap previously failed")]
    AlreadyFailed,
}

/// Configuration for one controller: where stage 2 reads the payload
/// and the limits applied to every dispatch.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub source: PayloadSource,
    pub limits: ExecLimits,
}

/// Process-wide bootstrap sequencer. The global instance serves the
/// boundary surface; host tooling constructs private controllers with
/// their own payload sources.
pub struct Bootstrap {
    config: EngineConfig,
    state: AtomicU8,
    drive: Mutex<()>,
    engine: OnceCell<Engine>,
}

static GLOBAL: Lazy<Bootstrap> = Lazy::new(|| Bootstrap::new(EngineConfig::default()));

impl Bootstrap {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(BootstrapState::Uninitialized as u8),
            drive: Mutex::new(()),
            engine: OnceCell::new(),
        }
    }

    /// The controller backing the process-wide boundary surface; loads
    /// the embedded payload.
    pub fn global() -> &'static Bootstrap {
        &GLOBAL
    }

    pub fn state(&self) -> BootstrapState {
        BootstrapState::from_word(self.state.load(Ordering::Acquire))
    }

    /// Drive the controller to `Stage2Ready` (or reuse the settled
    /// outcome) and hand out the engine. Safe to call from any thread,
    /// any number of times; concurrent callers block until the first
    /// one settles the state.
    pub fn ensure_ready(&self) -> Result<&Engine, BootstrapError> {
        // Lock-free paths for settled states.
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }
        if self.state() == BootstrapState::Failed {
            return Err(BootstrapError::AlreadyFailed);
        }

        let _guard = match self.drive.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Re-check: another caller may have settled while we waited.
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }
        if self.state() == BootstrapState::Failed {
            return Err(BootstrapError::AlreadyFailed);
        }

        let limits = self.run_stage1();
        match self.run_stage2(limits) {
            Ok(engine) => {
                let engine = self.engine.get_or_init(|| engine);
                self.state
                    .store(BootstrapState::Stage2Ready as u8, Ordering::Release);
                tracing::info!(functions = engine.catalog().len(), "bootstrap stage 2 ready");
                Ok(engine)
            }
            Err(error) => {
                self.state
                    .store(BootstrapState::Failed as u8, Ordering::Release);
                tracing::error!(%error, "bootstrap failed");
                Err(error)
            }
        }
    }

    /// Stage 1: the engine's own setup. Idempotent under host re-entry;
    /// normalizes configured limits so later stages never see a zero
    /// budget.
    fn run_stage1(&self) -> ExecLimits {
        let limits = ExecLimits {
            fuel: self.config.limits.fuel.max(1),
            max_call_depth: self.config.limits.max_call_depth.max(1),
        };
        self.state
            .store(BootstrapState::Stage1Ready as u8, Ordering::Release);
        tracing::debug!(
            fuel = limits.fuel,
            max_call_depth = limits.max_call_depth,
            "bootstrap stage 1 ready"
        );
        limits
    }

    /// Stage 2: the controlled payload load. Runs only after stage 1;
    /// decodes the bundle, validates every stream, and builds the
    /// engine.
    fn run_stage2(&self, limits: ExecLimits) -> Result<Engine, BootstrapError> {
        let bytes = self.config.source.load()?;
        let bundle = decode_bundle(&bytes)?;
        if bundle.functions.is_empty() {
            return Err(BootstrapError::EmptyCatalog);
        }
        let catalog = Catalog::from_entries(bundle.functions)?;
        Ok(Engine::new(catalog, bundle.cases, limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn embedded_bootstrap_reaches_stage2() {
        let controller = Bootstrap::new(EngineConfig::default());
        assert_eq!(controller.state(), BootstrapState::Uninitialized);
        let engine = controller.ensure_ready().unwrap();
        assert_eq!(controller.state(), BootstrapState::Stage2Ready);
        assert!(engine.catalog().len() > 0);
    }

    #[test]
    fn repeat_calls_reuse_the_same_engine() {
        let controller = Bootstrap::new(EngineConfig::default());
        let first = controller.ensure_ready().unwrap() as *const Engine;
        let second = controller.ensure_ready().unwrap() as *const Engine;
        assert_eq!(first, second);
        assert_eq!(controller.state(), BootstrapState::Stage2Ready);
    }

    #[test]
    fn missing_payload_fails_and_stays_failed() {
        let controller = Bootstrap::new(EngineConfig {
            source: PayloadSource::File(PathBuf::from("/nonexistent/payload.zvmb")),
            limits: ExecLimits::default(),
        });
        let first = controller.ensure_ready().unwrap_err();
        assert!(matches!(first, BootstrapError::Payload(_)));
        assert_eq!(controller.state(), BootstrapState::Failed);

        let second = controller.ensure_ready().unwrap_err();
        assert!(matches!(second, BootstrapError::AlreadyFailed));
        assert_eq!(controller.state(), BootstrapState::Failed);
    }

    #[test]
    fn zero_limits_are_normalized_in_stage1() {
        let controller = Bootstrap::new(EngineConfig {
            source: PayloadSource::Embedded,
            limits: ExecLimits {
                fuel: 0,
                max_call_depth: 0,
            },
        });
        let engine = controller.ensure_ready().unwrap();
        assert!(engine.limits().fuel >= 1);
        assert!(engine.limits().max_call_depth >= 1);
    }
}
