//! Boundary surface for the hosting shell.
//!
//! Three total entry points: the process startup hook and the two query
//! operations. Each one triggers (or reuses) the global bootstrap and
//! always returns — a bootstrap failure degrades to an explanatory
//! string, never a panic across the boundary.

use crate::bootstrap::Bootstrap;
use crate::report;

/// Process startup hook. Invoked once by the host's library-load
/// mechanism; re-entry is harmless.
pub fn startup_hook() {
    match Bootstrap::global().ensure_ready() {
        Ok(engine) => {
            tracing::info!(functions = engine.catalog().len(), "engine ready");
        }
        Err(error) => {
            tracing::error!(%error, "startup bootstrap failed");
        }
    }
}

/// Full report over the reporting cases, one line per function. On
/// bootstrap failure, a single line describing it.
pub fn get_protect_results() -> String {
    protect_results_for(Bootstrap::global())
}

/// Smoke reduction over the smoke subset: one `PASS`/`FAIL` line.
pub fn run_vmp_smoke_check() -> String {
    smoke_check_for(Bootstrap::global())
}

pub(crate) fn protect_results_for(controller: &Bootstrap) -> String {
    match controller.ensure_ready() {
        Ok(engine) => report::build_report(engine),
        Err(error) => format!("bootstrap failed: {error}"),
    }
}

pub(crate) fn smoke_check_for(controller: &Bootstrap) -> String {
    match controller.ensure_ready() {
        Ok(engine) => report::run_smoke_check(engine),
        Err(_) => "FAIL: bootstrap".to_string(),
    }
}
