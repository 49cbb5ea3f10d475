//! Dispatch engine: the outcome-producing front end over the catalog.
//!
//! Every invocation gets fresh interpreter state and resolves to a
//! structured [`Outcome`]; raw interpreter failures never cross this
//! layer. The engine itself is immutable apart from relaxed statistics
//! counters, so invocations may run concurrently without coordination.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::catalog::{CaseSpec, Catalog};
use crate::eval::{execute, ExecLimits};

/// Result of one dispatched invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub name: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Success { value: u64 },
    Fault { reason: String },
    Unsupported,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self.verdict, Verdict::Success { .. })
    }

    pub fn value(&self) -> Option<u64> {
        match self.verdict {
            Verdict::Success { value } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    invocations: AtomicU64,
    faults: AtomicU64,
    instructions: AtomicU64,
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub invocations: u64,
    pub faults: u64,
    pub instructions: u64,
}

/// The dispatch engine published by a successful bootstrap.
#[derive(Debug)]
pub struct Engine {
    catalog: Catalog,
    cases: Vec<CaseSpec>,
    limits: ExecLimits,
    stats: EngineStats,
}

impl Engine {
    pub(crate) fn new(catalog: Catalog, cases: Vec<CaseSpec>, limits: ExecLimits) -> Self {
        Self {
            catalog,
            cases,
            limits,
            stats: EngineStats::default(),
        }
    }

    /// Invoke a virtualized function by identifier. An absent identifier
    /// is `Unsupported` (a caller contract error); every execution
    /// failure, including a defect-induced panic in the interpreter, is
    /// classified into `Fault`.
    pub fn invoke(&self, name: &str, args: &[u64]) -> Outcome {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);

        let Some(entry) = self.catalog.lookup(name) else {
            return Outcome {
                name: name.to_string(),
                verdict: Verdict::Unsupported,
            };
        };

        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            execute(entry, args, &self.catalog, &self.limits)
        }));

        let verdict = match run {
            Ok(Ok(exec)) => {
                self.stats
                    .instructions
                    .fetch_add(exec.steps, Ordering::Relaxed);
                Verdict::Success { value: exec.value }
            }
            Ok(Err(fault)) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(function = name, %fault, "invocation faulted");
                Verdict::Fault {
                    reason: fault.to_string(),
                }
            }
            Err(panic_payload) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(&panic_payload);
                tracing::error!(function = name, message, "interpreter defect contained");
                Verdict::Fault {
                    reason: format!("engine defect: {message}"),
                }
            }
        };

        Outcome {
            name: name.to_string(),
            verdict,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Reporting cases in declaration order.
    pub fn cases(&self) -> &[CaseSpec] {
        &self.cases
    }

    pub fn limits(&self) -> ExecLimits {
        self.limits
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            invocations: self.stats.invocations.load(Ordering::Relaxed),
            faults: self.stats.faults.load(Ordering::Relaxed),
            instructions: self.stats.instructions.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::builtin_bundle;

    fn engine() -> Engine {
        let bundle = builtin_bundle();
        let catalog = Catalog::from_entries(bundle.functions).unwrap();
        Engine::new(catalog, bundle.cases, ExecLimits::default())
    }

    #[test]
    fn invoke_success_returns_the_computed_value() {
        let engine = engine();
        let outcome = engine.invoke("fun_add", &[2, 4]);
        assert_eq!(outcome.value(), Some(6));
    }

    #[test]
    fn unknown_identifier_is_unsupported_not_fault() {
        let engine = engine();
        let outcome = engine.invoke("fun_missing", &[]);
        assert_eq!(outcome.verdict, Verdict::Unsupported);
    }

    #[test]
    fn wrong_argument_count_is_a_fault() {
        let engine = engine();
        let outcome = engine.invoke("fun_add", &[1]);
        match outcome.verdict {
            Verdict::Fault { reason } => assert!(reason.contains("arity")),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn stats_track_invocations_and_faults() {
        let engine = engine();
        engine.invoke("fun_add", &[2, 4]);
        engine.invoke("fun_add", &[1]);
        let stats = engine.stats();
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.faults, 1);
        assert!(stats.instructions >= 2);
    }

    #[test]
    fn outcome_serializes_with_a_status_tag() {
        let engine = engine();
        let outcome = engine.invoke("fun_add", &[2, 4]);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["value"], 6);
        assert_eq!(json["name"], "fun_add");
    }

    #[test]
    fn concurrent_invocations_do_not_interfere() {
        let engine = std::sync::Arc::new(engine());
        let expectations = [
            ("fun_add", 6u64),
            ("fun_for", 30),
            ("fun_call_chain", 38),
            ("fun_switch_dispatch", 10),
        ];
        let mut handles = Vec::new();
        for &(name, expected) in &expectations {
            for _ in 0..8 {
                let engine = engine.clone();
                handles.push(std::thread::spawn(move || {
                    let outcome = engine.invoke(name, &[2, 4]);
                    assert_eq!(outcome.value(), Some(expected), "{name}");
                }));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
