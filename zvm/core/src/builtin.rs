//! The embedded protected function set.
//!
//! These are the virtualized bodies the engine ships with: a ladder from
//! plain arithmetic up through loops, chained calls, and mixed branch
//! shapes. Each case runs with the canned arguments `(2, 4)` and carries
//! the value the original function computes for them.

use once_cell::sync::Lazy;

use crate::catalog::{CaseSpec, FunctionEntry};
use crate::opcodes::{BinOp, BranchId, CalleeId, CmpOp, Inst, RegId, Width};
use crate::payload::{encode_bundle, Bundle};

/// Canonical encoded form of the builtin bundle. Built once per process;
/// bootstrap stage 2 decodes it like any external payload.
static BUNDLE_BYTES: Lazy<Vec<u8>> = Lazy::new(|| encode_bundle(&builtin_bundle()));

pub fn bundle_bytes() -> &'static [u8] {
    &BUNDLE_BYTES
}

/// Small assembler for hand-written function bodies: allocates branch
/// slots as labels, patches them on bind, and interns callee names.
struct Asm {
    insts: Vec<Inst>,
    branches: Vec<u32>,
    callees: Vec<String>,
}

impl Asm {
    fn new() -> Self {
        Self {
            insts: Vec::new(),
            branches: Vec::new(),
            callees: Vec::new(),
        }
    }

    fn inst(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    /// Reserve a branch-table slot to be bound later.
    fn label(&mut self) -> BranchId {
        self.branches.push(u32::MAX);
        (self.branches.len() - 1) as BranchId
    }

    /// Point `label` at the next instruction to be emitted.
    fn bind(&mut self, label: BranchId) {
        self.branches[label as usize] = self.insts.len() as u32;
    }

    fn callee(&mut self, name: &str) -> CalleeId {
        if let Some(i) = self.callees.iter().position(|c| c == name) {
            return i as CalleeId;
        }
        self.callees.push(name.to_string());
        (self.callees.len() - 1) as CalleeId
    }

    fn finish(self, name: &str, arity: u8, reg_count: u8) -> FunctionEntry {
        FunctionEntry {
            name: name.to_string(),
            arity,
            reg_count,
            insts: self.insts,
            branches: self.branches,
            callees: self.callees,
        }
    }
}

// Shorthand constructors; every builtin body works at 32-bit width, like
// the `int`-valued originals.
fn add(dst: RegId, lhs: RegId, rhs: RegId) -> Inst {
    Inst::Binary {
        op: BinOp::Add,
        width: Width::W32,
        dst,
        lhs,
        rhs,
    }
}

fn sub(dst: RegId, lhs: RegId, rhs: RegId) -> Inst {
    Inst::Binary {
        op: BinOp::Sub,
        width: Width::W32,
        dst,
        lhs,
        rhs,
    }
}

fn addi(dst: RegId, lhs: RegId, imm: u32) -> Inst {
    Inst::BinaryImm {
        op: BinOp::Add,
        width: Width::W32,
        dst,
        lhs,
        imm,
    }
}

fn subi(dst: RegId, lhs: RegId, imm: u32) -> Inst {
    Inst::BinaryImm {
        op: BinOp::Sub,
        width: Width::W32,
        dst,
        lhs,
        imm,
    }
}

fn muli(dst: RegId, lhs: RegId, imm: u32) -> Inst {
    Inst::BinaryImm {
        op: BinOp::Mul,
        width: Width::W32,
        dst,
        lhs,
        imm,
    }
}

fn andi(dst: RegId, lhs: RegId, imm: u32) -> Inst {
    Inst::BinaryImm {
        op: BinOp::And,
        width: Width::W32,
        dst,
        lhs,
        imm,
    }
}

fn cmp(op: CmpOp, dst: RegId, lhs: RegId, rhs: RegId) -> Inst {
    Inst::Cmp {
        op,
        width: Width::W32,
        dst,
        lhs,
        rhs,
    }
}

fn imm(dst: RegId, value: u32) -> Inst {
    Inst::LoadImm { dst, value }
}

fn ret(src: RegId) -> Inst {
    Inst::Return { src }
}

/// `a + b`
fn fun_add() -> FunctionEntry {
    let mut a = Asm::new();
    a.inst(add(2, 0, 1));
    a.inst(ret(2));
    a.finish("fun_add", 2, 3)
}

/// `if a > b { a - b } else { b - a }`
fn fun_if_sub() -> FunctionEntry {
    let mut a = Asm::new();
    let gt = a.label();
    a.inst(cmp(CmpOp::Gt, 2, 0, 1));
    a.inst(Inst::BranchIf { cond: 2, target: gt });
    a.inst(sub(3, 1, 0));
    a.inst(ret(3));
    a.bind(gt);
    a.inst(sub(3, 0, 1));
    a.inst(ret(3));
    a.finish("fun_if_sub", 2, 4)
}

/// `for i in 0..5 { ret += a; ret += b }`
fn fun_for() -> FunctionEntry {
    let mut a = Asm::new();
    let done = a.label();
    let head = a.label();
    a.inst(imm(2, 0)); // ret
    a.inst(imm(3, 0)); // i
    a.inst(imm(5, 5)); // limit
    a.bind(head);
    a.inst(cmp(CmpOp::Ge, 4, 3, 5));
    a.inst(Inst::BranchIf {
        cond: 4,
        target: done,
    });
    a.inst(add(2, 2, 0));
    a.inst(add(2, 2, 1));
    a.inst(addi(3, 3, 1));
    a.inst(Inst::Branch { target: head });
    a.bind(done);
    a.inst(ret(2));
    a.finish("fun_for", 2, 6)
}

/// `for i in 0..5 { ret += fun_add(a, b) }`
fn fun_for_add() -> FunctionEntry {
    let mut a = Asm::new();
    let done = a.label();
    let head = a.label();
    let callee = a.callee("fun_add");
    a.inst(imm(2, 0)); // ret
    a.inst(imm(3, 0)); // i
    a.inst(imm(5, 5)); // limit
    a.bind(head);
    a.inst(cmp(CmpOp::Ge, 4, 3, 5));
    a.inst(Inst::BranchIf {
        cond: 4,
        target: done,
    });
    a.inst(Inst::Call {
        callee,
        dst: 4,
        args: vec![0, 1],
    });
    a.inst(add(2, 2, 4));
    a.inst(addi(3, 3, 1));
    a.inst(Inst::Branch { target: head });
    a.bind(done);
    a.inst(ret(2));
    a.finish("fun_for_add", 2, 6)
}

/// `while n > 0 { ret += b; n -= 1 }; ret + a`
fn fun_countdown_muladd() -> FunctionEntry {
    let mut a = Asm::new();
    let done = a.label();
    let head = a.label();
    a.inst(imm(2, 0)); // ret
    a.inst(Inst::Mov { dst: 3, src: 0 }); // n
    a.inst(imm(4, 0)); // zero
    a.bind(head);
    a.inst(cmp(CmpOp::Le, 5, 3, 4));
    a.inst(Inst::BranchIf {
        cond: 5,
        target: done,
    });
    a.inst(add(2, 2, 1));
    a.inst(subi(3, 3, 1));
    a.inst(Inst::Branch { target: head });
    a.bind(done);
    a.inst(add(2, 2, 0));
    a.inst(ret(2));
    a.finish("fun_countdown_muladd", 2, 6)
}

/// `for i in 0..4 { ret += if i < 2 { fun_add(a, b) } else { fun_add(a, 1) } }`
fn fun_loop_call_mix() -> FunctionEntry {
    let mut a = Asm::new();
    let done = a.label();
    let first = a.label();
    let join = a.label();
    let head = a.label();
    let callee = a.callee("fun_add");
    a.inst(imm(2, 0)); // ret
    a.inst(imm(3, 0)); // i
    a.inst(imm(4, 4)); // limit
    a.inst(imm(5, 2)); // pivot
    a.inst(imm(6, 1)); // one
    a.bind(head);
    a.inst(cmp(CmpOp::Ge, 7, 3, 4));
    a.inst(Inst::BranchIf {
        cond: 7,
        target: done,
    });
    a.inst(cmp(CmpOp::Lt, 7, 3, 5));
    a.inst(Inst::BranchIf {
        cond: 7,
        target: first,
    });
    a.inst(Inst::Call {
        callee,
        dst: 7,
        args: vec![0, 6],
    });
    a.inst(Inst::Branch { target: join });
    a.bind(first);
    a.inst(Inst::Call {
        callee,
        dst: 7,
        args: vec![0, 1],
    });
    a.bind(join);
    a.inst(add(2, 2, 7));
    a.inst(addi(3, 3, 1));
    a.inst(Inst::Branch { target: head });
    a.bind(done);
    a.inst(ret(2));
    a.finish("fun_loop_call_mix", 2, 8)
}

/// `fun_for(a, b) + fun_add(a, b) + fun_if_sub(a, b)`
fn fun_call_chain() -> FunctionEntry {
    let mut a = Asm::new();
    let c_for = a.callee("fun_for");
    let c_add = a.callee("fun_add");
    let c_sub = a.callee("fun_if_sub");
    a.inst(Inst::Call {
        callee: c_for,
        dst: 2,
        args: vec![0, 1],
    });
    a.inst(Inst::Call {
        callee: c_add,
        dst: 3,
        args: vec![0, 1],
    });
    a.inst(add(2, 2, 3));
    a.inst(Inst::Call {
        callee: c_sub,
        dst: 3,
        args: vec![0, 1],
    });
    a.inst(add(2, 2, 3));
    a.inst(ret(2));
    a.finish("fun_call_chain", 2, 5)
}

/// `(if a >= b { fun_countdown_muladd } else { fun_loop_call_mix })(a, b) + fun_add(a, b)`
fn fun_branch_call() -> FunctionEntry {
    let mut a = Asm::new();
    let ge = a.label();
    let join = a.label();
    let c_count = a.callee("fun_countdown_muladd");
    let c_mix = a.callee("fun_loop_call_mix");
    let c_add = a.callee("fun_add");
    a.inst(cmp(CmpOp::Ge, 2, 0, 1));
    a.inst(Inst::BranchIf { cond: 2, target: ge });
    a.inst(Inst::Call {
        callee: c_mix,
        dst: 3,
        args: vec![0, 1],
    });
    a.inst(Inst::Branch { target: join });
    a.bind(ge);
    a.inst(Inst::Call {
        callee: c_count,
        dst: 3,
        args: vec![0, 1],
    });
    a.bind(join);
    a.inst(Inst::Call {
        callee: c_add,
        dst: 4,
        args: vec![0, 1],
    });
    a.inst(add(3, 3, 4));
    a.inst(ret(3));
    a.finish("fun_branch_call", 2, 5)
}

/// Chained range dispatch on `x = a + b + a`, then an `a` vs `b`
/// adjustment.
fn fun_multi_branch_path() -> FunctionEntry {
    let mut a = Asm::new();
    let c1 = a.label();
    let c2 = a.label();
    let c3 = a.label();
    let second = a.label();
    let a_gt_b = a.label();
    let a_eq_b = a.label();
    a.inst(add(2, 0, 1));
    a.inst(add(2, 2, 0)); // x
    a.inst(imm(4, 5));
    a.inst(cmp(CmpOp::Lt, 5, 2, 4));
    a.inst(Inst::BranchIf { cond: 5, target: c1 });
    a.inst(imm(4, 9));
    a.inst(cmp(CmpOp::Lt, 5, 2, 4));
    a.inst(Inst::BranchIf { cond: 5, target: c2 });
    a.inst(imm(4, 14));
    a.inst(cmp(CmpOp::Lt, 5, 2, 4));
    a.inst(Inst::BranchIf { cond: 5, target: c3 });
    a.inst(subi(3, 2, 8));
    a.inst(Inst::Branch { target: second });
    a.bind(c1);
    a.inst(addi(3, 2, 10));
    a.inst(Inst::Branch { target: second });
    a.bind(c2);
    a.inst(addi(3, 2, 2));
    a.inst(Inst::Branch { target: second });
    a.bind(c3);
    a.inst(subi(3, 2, 3));
    a.bind(second);
    a.inst(cmp(CmpOp::Gt, 5, 0, 1));
    a.inst(Inst::BranchIf {
        cond: 5,
        target: a_gt_b,
    });
    a.inst(cmp(CmpOp::Eq, 5, 0, 1));
    a.inst(Inst::BranchIf {
        cond: 5,
        target: a_eq_b,
    });
    a.inst(subi(3, 3, 2));
    a.inst(ret(3));
    a.bind(a_gt_b);
    a.inst(addi(3, 3, 4));
    a.inst(ret(3));
    a.bind(a_eq_b);
    a.inst(addi(3, 3, 1));
    a.inst(ret(3));
    a.finish("fun_multi_branch_path", 2, 6)
}

/// `match a + b { 3 => a+b+1, 5 => a+a+b, 6 => a+b+b, k if k > 8 => k-2, k => k+2 }`
fn fun_switch_dispatch() -> FunctionEntry {
    let mut a = Asm::new();
    let k3 = a.label();
    let k5 = a.label();
    let k6 = a.label();
    let big = a.label();
    a.inst(add(2, 0, 1)); // key
    a.inst(imm(4, 3));
    a.inst(cmp(CmpOp::Eq, 5, 2, 4));
    a.inst(Inst::BranchIf { cond: 5, target: k3 });
    a.inst(imm(4, 5));
    a.inst(cmp(CmpOp::Eq, 5, 2, 4));
    a.inst(Inst::BranchIf { cond: 5, target: k5 });
    a.inst(imm(4, 6));
    a.inst(cmp(CmpOp::Eq, 5, 2, 4));
    a.inst(Inst::BranchIf { cond: 5, target: k6 });
    a.inst(imm(4, 8));
    a.inst(cmp(CmpOp::Gt, 5, 2, 4));
    a.inst(Inst::BranchIf {
        cond: 5,
        target: big,
    });
    a.inst(addi(3, 2, 2));
    a.inst(ret(3));
    a.bind(big);
    a.inst(subi(3, 2, 2));
    a.inst(ret(3));
    a.bind(k3);
    a.inst(add(3, 0, 1));
    a.inst(addi(3, 3, 1));
    a.inst(ret(3));
    a.bind(k5);
    a.inst(add(3, 0, 0));
    a.inst(add(3, 3, 1));
    a.inst(ret(3));
    a.bind(k6);
    a.inst(add(3, 0, 1));
    a.inst(add(3, 3, 1));
    a.inst(ret(3));
    a.finish("fun_switch_dispatch", 2, 6)
}

/// Conditional selects: `x = max-ish mix`, `y` by parity, tail by
/// non-zero test of both arguments.
fn fun_select_mix() -> FunctionEntry {
    let mut a = Asm::new();
    a.inst(muli(2, 0, 3)); // a*3
    a.inst(muli(3, 1, 2)); // b*2
    a.inst(cmp(CmpOp::Gt, 4, 0, 1));
    a.inst(Inst::Select {
        dst: 5,
        cond: 4,
        on_true: 2,
        on_false: 3,
    }); // x
    a.inst(add(2, 0, 1));
    a.inst(andi(2, 2, 1)); // parity of a+b
    a.inst(addi(3, 5, 5)); // x+5
    a.inst(subi(6, 5, 3)); // x-3
    a.inst(Inst::Select {
        dst: 5,
        cond: 2,
        on_true: 3,
        on_false: 6,
    }); // y
    a.inst(imm(2, 0));
    a.inst(cmp(CmpOp::Ne, 3, 0, 2));
    a.inst(cmp(CmpOp::Ne, 4, 1, 2));
    a.inst(Inst::Binary {
        op: BinOp::And,
        width: Width::W32,
        dst: 3,
        lhs: 3,
        rhs: 4,
    });
    a.inst(imm(6, 7));
    a.inst(imm(7, 7u32.wrapping_neg())); // -7 at 32 bits
    a.inst(Inst::Select {
        dst: 4,
        cond: 3,
        on_true: 6,
        on_false: 7,
    });
    a.inst(add(5, 5, 4));
    a.inst(ret(5));
    a.finish("fun_select_mix", 2, 8)
}

/// Unsigned fold: `hi - lo + (hi & 3)` over `ua = a*11+1`, `ub = b*7+2`.
fn fun_unsigned_compare_fold() -> FunctionEntry {
    let mut a = Asm::new();
    a.inst(muli(2, 0, 11));
    a.inst(addi(2, 2, 1)); // ua
    a.inst(muli(3, 1, 7));
    a.inst(addi(3, 3, 2)); // ub
    a.inst(cmp(CmpOp::Ugt, 4, 2, 3));
    a.inst(Inst::Select {
        dst: 5,
        cond: 4,
        on_true: 2,
        on_false: 3,
    }); // hi
    a.inst(Inst::Select {
        dst: 6,
        cond: 4,
        on_true: 3,
        on_false: 2,
    }); // lo
    a.inst(sub(7, 5, 6));
    a.inst(andi(5, 5, 3));
    a.inst(add(7, 7, 5));
    a.inst(ret(7));
    a.finish("fun_unsigned_compare_fold", 2, 8)
}

/// The full builtin bundle: functions in registration order plus one
/// smoke case per function with the canned `(2, 4)` arguments.
pub fn builtin_bundle() -> Bundle {
    let functions = vec![
        fun_add(),
        fun_if_sub(),
        fun_for(),
        fun_for_add(),
        fun_countdown_muladd(),
        fun_loop_call_mix(),
        fun_call_chain(),
        fun_branch_call(),
        fun_multi_branch_path(),
        fun_switch_dispatch(),
        fun_select_mix(),
        fun_unsigned_compare_fold(),
    ];

    let expected: &[(&str, u64)] = &[
        ("fun_add", 6),
        ("fun_if_sub", 2),
        ("fun_for", 30),
        ("fun_for_add", 30),
        ("fun_countdown_muladd", 10),
        ("fun_loop_call_mix", 18),
        ("fun_call_chain", 38),
        ("fun_branch_call", 24),
        ("fun_multi_branch_path", 8),
        ("fun_switch_dispatch", 10),
        ("fun_select_mix", 12),
        ("fun_unsigned_compare_fold", 9),
    ];

    let cases = expected
        .iter()
        .map(|&(name, value)| CaseSpec {
            name: name.to_string(),
            args: vec![2, 4],
            expected: value,
            smoke: true,
        })
        .collect();

    Bundle { functions, cases }
}
