//! Result aggregation.
//!
//! Runs the engine over its reporting cases and renders the one
//! artifact the outside world sees: a multi-line report, or a single
//! `PASS`/`FAIL` reduction for the smoke subset. Cases run in
//! declaration order and no failure stops the pass, so one report shows
//! every failing entry at once.

use crate::dispatch::{Engine, Outcome, Verdict};

/// One line per reporting case, in declaration order. Deterministic for
/// a given catalog and case list.
pub fn build_report(engine: &Engine) -> String {
    let mut lines = Vec::with_capacity(engine.cases().len());
    for case in engine.cases() {
        let outcome = engine.invoke(&case.name, &case.args);
        lines.push(render_line(&outcome));
    }
    lines.join("\n")
}

/// Reduce the smoke subset to a single verdict line: `PASS` iff every
/// smoke case succeeds with its expected value, otherwise `FAIL` naming
/// the first offender.
pub fn run_smoke_check(engine: &Engine) -> String {
    let mut total = 0usize;
    for case in engine.cases().iter().filter(|case| case.smoke) {
        total += 1;
        let outcome = engine.invoke(&case.name, &case.args);
        let passed = matches!(outcome.verdict, Verdict::Success { value } if value == case.expected);
        if !passed {
            return format!("FAIL: {}", case.name);
        }
    }
    format!("PASS: vmp protected function check ok ({total} cases)")
}

fn render_line(outcome: &Outcome) -> String {
    match &outcome.verdict {
        Verdict::Success { value } => format!("{}: Success value={value}", outcome.name),
        Verdict::Fault { reason } => format!("{}: Fault reason={reason}", outcome.name),
        Verdict::Unsupported => format!("{}: Unsupported", outcome.name),
    }
}
