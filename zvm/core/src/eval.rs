//! Bytecode interpreter.
//!
//! Executes one validated instruction stream per invocation. Cross
//! function calls run on an explicit frame stack rather than host
//! recursion, so call depth is bounded by configuration, not by the
//! thread stack. Every failure mode resolves to a [`Fault`]; the
//! interpreter never panics on malformed input and never touches state
//! outside the frames it owns.

use thiserror::Error;

use crate::catalog::FunctionEntry;
use crate::opcodes::{BinOp, CmpOp, Inst, UnOp, Width};
use crate::state::{AccessError, Frame};

/// Execution limits applied to a single invocation.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    /// Total instruction budget across all frames.
    pub fuel: u64,
    /// Maximum live call frames (root frame included).
    pub max_call_depth: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            fuel: 1_000_000,
            max_call_depth: 64,
        }
    }
}

/// Resolves callee identifiers during execution. Implemented by the
/// function catalog; tests substitute table-backed resolvers.
pub trait CalleeResolver {
    fn resolve(&self, name: &str) -> Option<&FunctionEntry>;
}

/// Reasons an invocation failed. Each fault is isolated to its own
/// invocation; the dispatcher reports it and moves on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("pc {0} outside instruction stream")]
    PcOutOfRange(usize),
    #[error("branch id {0} outside branch table")]
    BranchOutOfRange(u16),
    #[error("callee id {0} outside callee table")]
    CalleeOutOfRange(u16),
    #[error("unknown callee '{0}'")]
    UnknownCallee(String),
    #[error("arity mismatch calling '{name}': expected {expected} arguments, got {got}")]
    ArityMismatch {
        name: String,
        expected: u8,
        got: usize,
    },
    #[error("call depth limit of {0} frames exceeded")]
    CallDepthExceeded(usize),
    #[error("integer division by zero")]
    DivideByZero,
    #[error("step budget of {0} instructions exhausted")]
    OutOfFuel(u64),
}

/// A completed invocation: the returned value and how many instructions
/// it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub value: u64,
    pub steps: u64,
}

/// Run `entry` with `args`, resolving cross-function calls through
/// `resolver`. `args` length must match the entry's declared arity.
pub fn execute(
    entry: &FunctionEntry,
    args: &[u64],
    resolver: &dyn CalleeResolver,
    limits: &ExecLimits,
) -> Result<Execution, Fault> {
    if args.len() != entry.arity as usize {
        return Err(Fault::ArityMismatch {
            name: entry.name.clone(),
            expected: entry.arity,
            got: args.len(),
        });
    }

    let mut frames: Vec<Frame<'_>> = Vec::with_capacity(4);
    frames.push(Frame::new(entry, args, None));

    let mut fuel = limits.fuel;
    let mut steps = 0u64;

    loop {
        let depth = frames.len();
        let Some(frame) = frames.last_mut() else {
            // Return handling always exits before the stack empties.
            return Err(Fault::PcOutOfRange(0));
        };

        if fuel == 0 {
            return Err(Fault::OutOfFuel(limits.fuel));
        }
        fuel -= 1;
        steps += 1;

        let inst = frame
            .entry
            .insts
            .get(frame.pc)
            .ok_or(Fault::PcOutOfRange(frame.pc))?;

        // Outcomes that need the frame borrow released first.
        enum Transfer<'a> {
            Push(Frame<'a>),
            Pop(u64),
        }

        let mut transfer = None;

        match inst {
            Inst::End => {
                tracing::debug!(function = %frame.entry.name, steps, "halt via End");
                return Ok(Execution { value: 0, steps });
            }
            Inst::Nop => frame.pc += 1,
            Inst::LoadImm { dst, value } => {
                frame.regs.write(*dst, *value as u64)?;
                frame.pc += 1;
            }
            Inst::LoadImm64 { dst, value } => {
                frame.regs.write(*dst, *value)?;
                frame.pc += 1;
            }
            Inst::Mov { dst, src } => {
                let value = frame.regs.read(*src)?;
                frame.regs.write(*dst, value)?;
                frame.pc += 1;
            }
            Inst::Binary {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => {
                let l = frame.regs.read(*lhs)?;
                let r = frame.regs.read(*rhs)?;
                frame.regs.write(*dst, apply_binary(*op, *width, l, r)?)?;
                frame.pc += 1;
            }
            Inst::BinaryImm {
                op,
                width,
                dst,
                lhs,
                imm,
            } => {
                let l = frame.regs.read(*lhs)?;
                frame
                    .regs
                    .write(*dst, apply_binary(*op, *width, l, *imm as u64)?)?;
                frame.pc += 1;
            }
            Inst::Unary {
                op,
                width,
                dst,
                src,
            } => {
                let value = frame.regs.read(*src)?;
                frame.regs.write(*dst, apply_unary(*op, *width, value))?;
                frame.pc += 1;
            }
            Inst::Cmp {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => {
                let l = frame.regs.read(*lhs)?;
                let r = frame.regs.read(*rhs)?;
                frame.regs.write(*dst, apply_compare(*op, *width, l, r))?;
                frame.pc += 1;
            }
            Inst::Select {
                dst,
                cond,
                on_true,
                on_false,
            } => {
                let picked = if frame.regs.read(*cond)? != 0 {
                    frame.regs.read(*on_true)?
                } else {
                    frame.regs.read(*on_false)?
                };
                frame.regs.write(*dst, picked)?;
                frame.pc += 1;
            }
            Inst::Branch { target } => {
                frame.pc = branch_target(frame.entry, *target)?;
            }
            Inst::BranchIf { cond, target } => {
                if frame.regs.read(*cond)? != 0 {
                    frame.pc = branch_target(frame.entry, *target)?;
                } else {
                    frame.pc += 1;
                }
            }
            Inst::Call { callee, dst, args } => {
                let name = frame
                    .entry
                    .callees
                    .get(*callee as usize)
                    .ok_or(Fault::CalleeOutOfRange(*callee))?;
                let target = resolver
                    .resolve(name)
                    .ok_or_else(|| Fault::UnknownCallee(name.clone()))?;
                if args.len() != target.arity as usize {
                    return Err(Fault::ArityMismatch {
                        name: target.name.clone(),
                        expected: target.arity,
                        got: args.len(),
                    });
                }
                if depth >= limits.max_call_depth {
                    return Err(Fault::CallDepthExceeded(limits.max_call_depth));
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(frame.regs.read(*arg)?);
                }
                // Resume past the call once the callee returns.
                frame.pc += 1;
                transfer = Some(Transfer::Push(Frame::new(target, &values, Some(*dst))));
            }
            Inst::Return { src } => {
                transfer = Some(Transfer::Pop(frame.regs.read(*src)?));
            }
        }

        match transfer {
            Some(Transfer::Push(callee_frame)) => frames.push(callee_frame),
            Some(Transfer::Pop(value)) => {
                let finished = frames.pop().ok_or(Fault::PcOutOfRange(0))?;
                match (frames.last_mut(), finished.ret_dst) {
                    (Some(caller), Some(dst)) => caller.regs.write(dst, value)?,
                    _ => return Ok(Execution { value, steps }),
                }
            }
            None => {}
        }
    }
}

fn branch_target(entry: &FunctionEntry, id: u16) -> Result<usize, Fault> {
    entry
        .branches
        .get(id as usize)
        .map(|&pc| pc as usize)
        .ok_or(Fault::BranchOutOfRange(id))
}

fn apply_binary(op: BinOp, width: Width, lhs: u64, rhs: u64) -> Result<u64, Fault> {
    let mask = width.mask();
    let bits = width.bits();
    let l = lhs & mask;
    let r = rhs & mask;
    let value = match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
        BinOp::Shl => l.wrapping_shl(r as u32 % bits),
        BinOp::Lsr => l.wrapping_shr(r as u32 % bits),
        BinOp::Asr => {
            let shifted = width.sign_extend(l) >> (r as u32 % bits);
            shifted as u64
        }
        BinOp::Udiv => {
            if r == 0 {
                return Err(Fault::DivideByZero);
            }
            l / r
        }
        BinOp::Urem => {
            if r == 0 {
                return Err(Fault::DivideByZero);
            }
            l % r
        }
        BinOp::Sdiv => {
            if r == 0 {
                return Err(Fault::DivideByZero);
            }
            width.sign_extend(l).wrapping_div(width.sign_extend(r)) as u64
        }
        BinOp::Srem => {
            if r == 0 {
                return Err(Fault::DivideByZero);
            }
            width.sign_extend(l).wrapping_rem(width.sign_extend(r)) as u64
        }
    };
    Ok(value & mask)
}

fn apply_unary(op: UnOp, width: Width, src: u64) -> u64 {
    let mask = width.mask();
    let value = src & mask;
    let result = match op {
        UnOp::Neg => value.wrapping_neg(),
        UnOp::Not => !value,
        UnOp::LogicalNot => (value == 0) as u64,
        UnOp::Abs => width.sign_extend(value).wrapping_abs() as u64,
        UnOp::Clz => {
            // Leading zeros within the operating width.
            u64::from(value.leading_zeros() - (64 - width.bits()))
        }
    };
    result & mask
}

fn apply_compare(op: CmpOp, width: Width, lhs: u64, rhs: u64) -> u64 {
    let lu = lhs & width.mask();
    let ru = rhs & width.mask();
    let ls = width.sign_extend(lhs);
    let rs = width.sign_extend(rhs);
    let taken = match op {
        CmpOp::Eq => lu == ru,
        CmpOp::Ne => lu != ru,
        CmpOp::Gt => ls > rs,
        CmpOp::Ge => ls >= rs,
        CmpOp::Lt => ls < rs,
        CmpOp::Le => ls <= rs,
        CmpOp::Ugt => lu > ru,
        CmpOp::Uge => lu >= ru,
        CmpOp::Ult => lu < ru,
        CmpOp::Ule => lu <= ru,
    };
    taken as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FunctionEntry;
    use std::collections::HashMap;

    struct TableResolver(HashMap<String, FunctionEntry>);

    impl CalleeResolver for TableResolver {
        fn resolve(&self, name: &str) -> Option<&FunctionEntry> {
            self.0.get(name)
        }
    }

    fn empty_resolver() -> TableResolver {
        TableResolver(HashMap::new())
    }

    fn entry(name: &str, arity: u8, reg_count: u8, insts: Vec<Inst>) -> FunctionEntry {
        FunctionEntry {
            name: name.to_string(),
            arity,
            reg_count,
            insts,
            branches: Vec::new(),
            callees: Vec::new(),
        }
    }

    fn run(entry: &FunctionEntry, args: &[u64]) -> Result<u64, Fault> {
        execute(entry, args, &empty_resolver(), &ExecLimits::default()).map(|e| e.value)
    }

    #[test]
    fn add_returns_sum() {
        let f = entry(
            "add",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&f, &[2, 3]), Ok(5));
    }

    #[test]
    fn w32_addition_wraps() {
        let f = entry(
            "wrap",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&f, &[0xFFFF_FFFF, 1]), Ok(0));
        assert_eq!(run(&f, &[0xFFFF_FFFF, 2]), Ok(1));
    }

    #[test]
    fn w8_subtraction_wraps_within_byte() {
        let f = entry(
            "sub8",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Sub,
                    width: Width::W8,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&f, &[0, 1]), Ok(0xFF));
    }

    #[test]
    fn division_by_zero_faults() {
        let f = entry(
            "div",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Udiv,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&f, &[4, 2]), Ok(2));
        assert_eq!(run(&f, &[4, 0]), Err(Fault::DivideByZero));
    }

    #[test]
    fn signed_division_wraps_on_min_over_minus_one() {
        let f = entry(
            "sdiv",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Sdiv,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(
            run(&f, &[0x8000_0000, 0xFFFF_FFFF]),
            Ok(0x8000_0000)
        );
        assert_eq!(run(&f, &[0xFFFF_FFF8, 2]), Ok(0xFFFF_FFFC)); // -8 / 2
    }

    #[test]
    fn shift_amounts_are_taken_modulo_width() {
        let f = entry(
            "shl",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Shl,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&f, &[1, 33]), Ok(2));
    }

    #[test]
    fn asr_preserves_sign_within_width() {
        let f = entry(
            "asr",
            2,
            3,
            vec![
                Inst::Binary {
                    op: BinOp::Asr,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&f, &[0x8000_0000, 4]), Ok(0xF800_0000));
    }

    #[test]
    fn clz_counts_within_width() {
        let f = entry(
            "clz",
            1,
            2,
            vec![
                Inst::Unary {
                    op: UnOp::Clz,
                    width: Width::W32,
                    dst: 1,
                    src: 0,
                },
                Inst::Return { src: 1 },
            ],
        );
        assert_eq!(run(&f, &[0]), Ok(32));
        assert_eq!(run(&f, &[6]), Ok(29));
    }

    #[test]
    fn uninitialized_register_read_faults() {
        let f = entry("uninit", 0, 2, vec![Inst::Return { src: 1 }]);
        assert_eq!(
            run(&f, &[]),
            Err(Fault::Access(AccessError::Uninitialized(1)))
        );
    }

    #[test]
    fn arity_mismatch_is_refused_before_running() {
        let f = entry("add", 2, 3, vec![Inst::Return { src: 0 }]);
        let err = run(&f, &[1]).unwrap_err();
        assert!(matches!(err, Fault::ArityMismatch { got: 1, .. }));
    }

    #[test]
    fn loop_terminates_via_branch_table() {
        // ret = 0; i = 0; while i < 5 { ret += a; i += 1 }; ret
        let f = FunctionEntry {
            name: "loop".to_string(),
            arity: 1,
            reg_count: 5,
            insts: vec![
                Inst::LoadImm { dst: 1, value: 0 },
                Inst::LoadImm { dst: 2, value: 0 },
                Inst::LoadImm { dst: 3, value: 5 },
                Inst::Cmp {
                    op: CmpOp::Ge,
                    width: Width::W32,
                    dst: 4,
                    lhs: 2,
                    rhs: 3,
                },
                Inst::BranchIf { cond: 4, target: 0 },
                Inst::Binary {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 1,
                    lhs: 1,
                    rhs: 0,
                },
                Inst::BinaryImm {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 2,
                    lhs: 2,
                    imm: 1,
                },
                Inst::Branch { target: 1 },
                Inst::Return { src: 1 },
            ],
            branches: vec![8, 3],
            callees: Vec::new(),
        };
        assert_eq!(run(&f, &[7]), Ok(35));
    }

    #[test]
    fn infinite_loop_runs_out_of_fuel() {
        let f = FunctionEntry {
            name: "spin".to_string(),
            arity: 0,
            reg_count: 1,
            insts: vec![Inst::Branch { target: 0 }],
            branches: vec![0],
            callees: Vec::new(),
        };
        let limits = ExecLimits {
            fuel: 1000,
            ..ExecLimits::default()
        };
        let err = execute(&f, &[], &empty_resolver(), &limits).unwrap_err();
        assert_eq!(err, Fault::OutOfFuel(1000));
    }

    #[test]
    fn call_runs_callee_and_stores_result() {
        let callee = entry(
            "double",
            1,
            2,
            vec![
                Inst::Binary {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 1,
                    lhs: 0,
                    rhs: 0,
                },
                Inst::Return { src: 1 },
            ],
        );
        let mut caller = entry(
            "caller",
            1,
            3,
            vec![
                Inst::Call {
                    callee: 0,
                    dst: 1,
                    args: vec![0],
                },
                Inst::BinaryImm {
                    op: BinOp::Add,
                    width: Width::W32,
                    dst: 2,
                    lhs: 1,
                    imm: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        caller.callees.push("double".to_string());

        let mut table = HashMap::new();
        table.insert("double".to_string(), callee);
        let resolver = TableResolver(table);
        let exec = execute(&caller, &[21], &resolver, &ExecLimits::default()).unwrap();
        assert_eq!(exec.value, 43);
    }

    #[test]
    fn unknown_callee_faults_instead_of_panicking() {
        let mut caller = entry(
            "caller",
            0,
            1,
            vec![
                Inst::Call {
                    callee: 0,
                    dst: 0,
                    args: vec![],
                },
                Inst::Return { src: 0 },
            ],
        );
        caller.callees.push("missing".to_string());
        let err = execute(&caller, &[], &empty_resolver(), &ExecLimits::default()).unwrap_err();
        assert_eq!(err, Fault::UnknownCallee("missing".to_string()));
    }

    #[test]
    fn self_recursion_hits_the_depth_cap() {
        let mut f = entry(
            "rec",
            0,
            1,
            vec![
                Inst::Call {
                    callee: 0,
                    dst: 0,
                    args: vec![],
                },
                Inst::Return { src: 0 },
            ],
        );
        f.callees.push("rec".to_string());
        let mut table = HashMap::new();
        table.insert("rec".to_string(), f.clone());
        let resolver = TableResolver(table);
        let limits = ExecLimits {
            max_call_depth: 8,
            ..ExecLimits::default()
        };
        let err = execute(&f, &[], &resolver, &limits).unwrap_err();
        assert_eq!(err, Fault::CallDepthExceeded(8));
    }

    #[test]
    fn end_halts_with_zero() {
        let f = entry("end", 0, 1, vec![Inst::End]);
        assert_eq!(run(&f, &[]), Ok(0));
    }

    #[test]
    fn select_picks_by_condition() {
        let f = entry(
            "sel",
            3,
            4,
            vec![
                Inst::Select {
                    dst: 3,
                    cond: 0,
                    on_true: 1,
                    on_false: 2,
                },
                Inst::Return { src: 3 },
            ],
        );
        assert_eq!(run(&f, &[1, 10, 20]), Ok(10));
        assert_eq!(run(&f, &[0, 10, 20]), Ok(20));
    }

    #[test]
    fn signed_and_unsigned_compares_disagree_on_high_bit() {
        let f = entry(
            "cmp",
            2,
            3,
            vec![
                Inst::Cmp {
                    op: CmpOp::Gt,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        // 0x8000_0000 is negative under signed W32 compare.
        assert_eq!(run(&f, &[0x8000_0000, 1]), Ok(0));

        let g = entry(
            "ucmp",
            2,
            3,
            vec![
                Inst::Cmp {
                    op: CmpOp::Ugt,
                    width: Width::W32,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Inst::Return { src: 2 },
            ],
        );
        assert_eq!(run(&g, &[0x8000_0000, 1]), Ok(1));
    }
}
