//! zvm-core: virtualized function engine.
//!
//! Protected functions travel as a private bytecode inside a packed
//! payload bundle. A two-stage bootstrap first completes the engine's
//! own setup, then performs the controlled load of the payload and
//! publishes an immutable function catalog. The dispatch engine runs
//! individual functions in isolated interpreter state and the result
//! aggregator renders the consolidated report the hosting shell
//! displays.
//!
//! The hosting shell only touches [`bridge`]; everything else is the
//! engine's internal surface, exposed for host tooling and tests.

pub mod bootstrap;
pub mod bridge;
pub mod builtin;
pub mod catalog;
pub mod dispatch;
pub mod eval;
pub mod opcodes;
pub mod payload;
pub mod report;
pub mod state;

pub use bootstrap::{Bootstrap, BootstrapError, BootstrapState, EngineConfig};
pub use bridge::{get_protect_results, run_vmp_smoke_check, startup_hook};
pub use catalog::{CaseSpec, Catalog, CatalogError, FunctionEntry};
pub use dispatch::{Engine, Outcome, StatsSnapshot, Verdict};
pub use eval::{execute, CalleeResolver, ExecLimits, Fault};
pub use opcodes::{BinOp, CmpOp, Inst, UnOp, Width};
pub use payload::{decode_bundle, encode_bundle, Bundle, PayloadError, PayloadSource};
pub use report::{build_report, run_smoke_check};
