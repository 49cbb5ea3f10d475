//! Packed payload container.
//!
//! The protected payload travels as a single byte bundle: a 4-byte magic
//! followed by a bitstream of 6-bit groups drained LSB-first. Integers
//! are variable-length: each group carries 5 value bits plus a
//! continuation flag. The format is private to the engine and versioned
//! behind the magic; it is not an external compatibility surface.
//!
//! Layout after the magic (all integers varint unless noted):
//!
//! ```text
//! version
//! function_count
//!   per function: name, arity, reg_count,
//!                 callee_count + callee names,
//!                 branch_count + branch offsets,
//!                 inst_count + instructions
//! case_count
//!   per case: name, arg_count + args (u64 as lo/hi), expected (lo/hi),
//!             smoke flag
//! ```
//!
//! Instructions encode as their wire opcode followed by operands in
//! field order; `Call` inserts an argument count before its registers.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::{CaseSpec, FunctionEntry};
use crate::opcodes::{
    BinOp, CmpOp, Inst, UnOp, Width, OP_BINARY, OP_BINARY_IMM, OP_BRANCH, OP_BRANCH_IF, OP_CALL,
    OP_CMP, OP_END, OP_LOAD_IMM, OP_LOAD_IMM64, OP_MOV, OP_NOP, OP_RETURN, OP_SELECT, OP_UNARY,
};

pub const BUNDLE_MAGIC: &[u8; 4] = b"ZVMB";
pub const BUNDLE_VERSION: u32 = 1;

const MAX_FUNCTIONS: u32 = 4096;
const MAX_INSTS: u32 = 65_536;
const MAX_NAME_LEN: u32 = 256;
const MAX_TABLE_LEN: u32 = 4096;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload does not start with the bundle magic")]
    BadMagic,
    #[error("unsupported bundle version {0}")]
    UnsupportedVersion(u32),
    #[error("payload truncated mid-field")]
    UnexpectedEof,
    #[error("varint does not fit in 32 bits")]
    VarintOverflow,
    #[error("unknown wire opcode {0}")]
    UnknownOpcode(u32),
    #[error("unknown binary sub-opcode {0}")]
    UnknownBinaryOp(u32),
    #[error("unknown unary sub-opcode {0}")]
    UnknownUnaryOp(u32),
    #[error("unknown compare sub-opcode {0}")]
    UnknownCompareOp(u32),
    #[error("unknown width code {0}")]
    UnknownWidth(u32),
    #[error("{what} value {value} exceeds the format limit")]
    OversizedField { what: &'static str, value: u32 },
    #[error("function name is not valid UTF-8")]
    NonUtf8Name,
    #[error("failed to read payload: {0}")]
    Io(#[from] std::io::Error),
}

/// Where bootstrap stage 2 obtains the payload bytes.
#[derive(Debug, Clone, Default)]
pub enum PayloadSource {
    /// The bundle compiled into this library.
    #[default]
    Embedded,
    /// An external bundle file (host tooling and regression runs).
    File(PathBuf),
}

impl PayloadSource {
    pub fn load(&self) -> Result<Vec<u8>, PayloadError> {
        match self {
            PayloadSource::Embedded => Ok(crate::builtin::bundle_bytes().to_vec()),
            PayloadSource::File(path) => {
                tracing::info!(path = %path.display(), "loading payload bundle from file");
                Ok(std::fs::read(path)?)
            }
        }
    }
}

/// Decoded payload: the function set plus the reporting case list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub functions: Vec<FunctionEntry>,
    pub cases: Vec<CaseSpec>,
}

// ---------------------------------------------------------------------------
// Bitstream primitives
// ---------------------------------------------------------------------------

/// LSB-first 6-bit group reader over a byte slice.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bits: u64,
    bit_count: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bits: 0,
            bit_count: 0,
        }
    }

    fn read6(&mut self) -> Result<u32, PayloadError> {
        while self.bit_count < 6 {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(PayloadError::UnexpectedEof);
            };
            self.bits |= u64::from(byte) << self.bit_count;
            self.bit_count += 8;
            self.pos += 1;
        }
        let value = (self.bits & 0x3F) as u32;
        self.bits >>= 6;
        self.bit_count -= 6;
        Ok(value)
    }

    /// Variable-length integer: 5 value bits per group, high bit of the
    /// group flags continuation.
    pub fn read_varint(&mut self) -> Result<u32, PayloadError> {
        let mut value = 0u32;
        let mut shift = 0u32;
        loop {
            let group = self.read6()?;
            if shift >= 32 || (shift > 27 && (group & 0x1F) >> (32 - shift) != 0) {
                return Err(PayloadError::VarintOverflow);
            }
            value |= (group & 0x1F) << shift;
            if group & 0x20 == 0 {
                return Ok(value);
            }
            shift += 5;
        }
    }

    pub fn read_u64(&mut self) -> Result<u64, PayloadError> {
        let lo = self.read_varint()? as u64;
        let hi = self.read_varint()? as u64;
        Ok(lo | (hi << 32))
    }
}

/// LSB-first 6-bit group writer.
pub(crate) struct BitWriter {
    out: Vec<u8>,
    bits: u64,
    bit_count: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            bits: 0,
            bit_count: 0,
        }
    }

    fn write6(&mut self, value: u32) {
        self.bits |= u64::from(value & 0x3F) << self.bit_count;
        self.bit_count += 6;
        while self.bit_count >= 8 {
            self.out.push(self.bits as u8);
            self.bits >>= 8;
            self.bit_count -= 8;
        }
    }

    pub fn write_varint(&mut self, mut value: u32) {
        loop {
            let group = value & 0x1F;
            value >>= 5;
            if value != 0 {
                self.write6(group | 0x20);
            } else {
                self.write6(group);
                return;
            }
        }
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_varint(value as u32);
        self.write_varint((value >> 32) as u32);
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            self.out.push(self.bits as u8);
        }
        self.out
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn write_name(w: &mut BitWriter, name: &str) {
    w.write_varint(name.len() as u32);
    for &byte in name.as_bytes() {
        w.write_varint(u32::from(byte));
    }
}

fn read_name(r: &mut BitReader<'_>) -> Result<String, PayloadError> {
    let len = bounded(r.read_varint()?, MAX_NAME_LEN, "name length")?;
    let mut bytes = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let byte = bounded(r.read_varint()?, u8::MAX as u32, "name byte")?;
        bytes.push(byte as u8);
    }
    String::from_utf8(bytes).map_err(|_| PayloadError::NonUtf8Name)
}

fn bounded(value: u32, limit: u32, what: &'static str) -> Result<u32, PayloadError> {
    if value > limit {
        Err(PayloadError::OversizedField { what, value })
    } else {
        Ok(value)
    }
}

fn read_reg(r: &mut BitReader<'_>) -> Result<u8, PayloadError> {
    Ok(bounded(r.read_varint()?, u8::MAX as u32, "register")? as u8)
}

fn read_id16(r: &mut BitReader<'_>, what: &'static str) -> Result<u16, PayloadError> {
    Ok(bounded(r.read_varint()?, u16::MAX as u32, what)? as u16)
}

// ---------------------------------------------------------------------------
// Instruction codec
// ---------------------------------------------------------------------------

fn encode_inst(w: &mut BitWriter, inst: &Inst) {
    w.write_varint(inst.opcode());
    match inst {
        Inst::End | Inst::Nop => {}
        Inst::LoadImm { dst, value } => {
            w.write_varint(u32::from(*dst));
            w.write_varint(*value);
        }
        Inst::LoadImm64 { dst, value } => {
            w.write_varint(u32::from(*dst));
            w.write_u64(*value);
        }
        Inst::Mov { dst, src } => {
            w.write_varint(u32::from(*dst));
            w.write_varint(u32::from(*src));
        }
        Inst::Binary {
            op,
            width,
            dst,
            lhs,
            rhs,
        } => {
            w.write_varint(op.code());
            w.write_varint(width.code());
            w.write_varint(u32::from(*dst));
            w.write_varint(u32::from(*lhs));
            w.write_varint(u32::from(*rhs));
        }
        Inst::BinaryImm {
            op,
            width,
            dst,
            lhs,
            imm,
        } => {
            w.write_varint(op.code());
            w.write_varint(width.code());
            w.write_varint(u32::from(*dst));
            w.write_varint(u32::from(*lhs));
            w.write_varint(*imm);
        }
        Inst::Unary {
            op,
            width,
            dst,
            src,
        } => {
            w.write_varint(op.code());
            w.write_varint(width.code());
            w.write_varint(u32::from(*dst));
            w.write_varint(u32::from(*src));
        }
        Inst::Cmp {
            op,
            width,
            dst,
            lhs,
            rhs,
        } => {
            w.write_varint(op.code());
            w.write_varint(width.code());
            w.write_varint(u32::from(*dst));
            w.write_varint(u32::from(*lhs));
            w.write_varint(u32::from(*rhs));
        }
        Inst::Select {
            dst,
            cond,
            on_true,
            on_false,
        } => {
            w.write_varint(u32::from(*dst));
            w.write_varint(u32::from(*cond));
            w.write_varint(u32::from(*on_true));
            w.write_varint(u32::from(*on_false));
        }
        Inst::Branch { target } => w.write_varint(u32::from(*target)),
        Inst::BranchIf { cond, target } => {
            w.write_varint(u32::from(*cond));
            w.write_varint(u32::from(*target));
        }
        Inst::Call { callee, dst, args } => {
            w.write_varint(u32::from(*callee));
            w.write_varint(u32::from(*dst));
            w.write_varint(args.len() as u32);
            for arg in args {
                w.write_varint(u32::from(*arg));
            }
        }
        Inst::Return { src } => w.write_varint(u32::from(*src)),
    }
}

fn decode_inst(r: &mut BitReader<'_>) -> Result<Inst, PayloadError> {
    let opcode = r.read_varint()?;
    let inst = match opcode {
        OP_END => Inst::End,
        OP_NOP => Inst::Nop,
        OP_LOAD_IMM => Inst::LoadImm {
            dst: read_reg(r)?,
            value: r.read_varint()?,
        },
        OP_LOAD_IMM64 => Inst::LoadImm64 {
            dst: read_reg(r)?,
            value: r.read_u64()?,
        },
        OP_MOV => Inst::Mov {
            dst: read_reg(r)?,
            src: read_reg(r)?,
        },
        OP_BINARY => {
            let code = r.read_varint()?;
            let op = BinOp::from_code(code).ok_or(PayloadError::UnknownBinaryOp(code))?;
            let width = read_width(r)?;
            Inst::Binary {
                op,
                width,
                dst: read_reg(r)?,
                lhs: read_reg(r)?,
                rhs: read_reg(r)?,
            }
        }
        OP_BINARY_IMM => {
            let code = r.read_varint()?;
            let op = BinOp::from_code(code).ok_or(PayloadError::UnknownBinaryOp(code))?;
            let width = read_width(r)?;
            Inst::BinaryImm {
                op,
                width,
                dst: read_reg(r)?,
                lhs: read_reg(r)?,
                imm: r.read_varint()?,
            }
        }
        OP_UNARY => {
            let code = r.read_varint()?;
            let op = UnOp::from_code(code).ok_or(PayloadError::UnknownUnaryOp(code))?;
            let width = read_width(r)?;
            Inst::Unary {
                op,
                width,
                dst: read_reg(r)?,
                src: read_reg(r)?,
            }
        }
        OP_CMP => {
            let code = r.read_varint()?;
            let op = CmpOp::from_code(code).ok_or(PayloadError::UnknownCompareOp(code))?;
            let width = read_width(r)?;
            Inst::Cmp {
                op,
                width,
                dst: read_reg(r)?,
                lhs: read_reg(r)?,
                rhs: read_reg(r)?,
            }
        }
        OP_SELECT => Inst::Select {
            dst: read_reg(r)?,
            cond: read_reg(r)?,
            on_true: read_reg(r)?,
            on_false: read_reg(r)?,
        },
        OP_BRANCH => Inst::Branch {
            target: read_id16(r, "branch id")?,
        },
        OP_BRANCH_IF => Inst::BranchIf {
            cond: read_reg(r)?,
            target: read_id16(r, "branch id")?,
        },
        OP_CALL => {
            let callee = read_id16(r, "callee id")?;
            let dst = read_reg(r)?;
            let argc = bounded(
                r.read_varint()?,
                crate::opcodes::MAX_CALL_ARGS as u32,
                "call argument count",
            )?;
            let mut args = Vec::with_capacity(argc as usize);
            for _ in 0..argc {
                args.push(read_reg(r)?);
            }
            Inst::Call { callee, dst, args }
        }
        OP_RETURN => Inst::Return { src: read_reg(r)? },
        other => return Err(PayloadError::UnknownOpcode(other)),
    };
    Ok(inst)
}

fn read_width(r: &mut BitReader<'_>) -> Result<Width, PayloadError> {
    let code = r.read_varint()?;
    Width::from_code(code).ok_or(PayloadError::UnknownWidth(code))
}

// ---------------------------------------------------------------------------
// Bundle codec
// ---------------------------------------------------------------------------

pub fn encode_bundle(bundle: &Bundle) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_varint(BUNDLE_VERSION);

    w.write_varint(bundle.functions.len() as u32);
    for function in &bundle.functions {
        write_name(&mut w, &function.name);
        w.write_varint(u32::from(function.arity));
        w.write_varint(u32::from(function.reg_count));
        w.write_varint(function.callees.len() as u32);
        for callee in &function.callees {
            write_name(&mut w, callee);
        }
        w.write_varint(function.branches.len() as u32);
        for &target in &function.branches {
            w.write_varint(target);
        }
        w.write_varint(function.insts.len() as u32);
        for inst in &function.insts {
            encode_inst(&mut w, inst);
        }
    }

    w.write_varint(bundle.cases.len() as u32);
    for case in &bundle.cases {
        write_name(&mut w, &case.name);
        w.write_varint(case.args.len() as u32);
        for &arg in &case.args {
            w.write_u64(arg);
        }
        w.write_u64(case.expected);
        w.write_varint(u32::from(case.smoke));
    }

    let mut out = Vec::with_capacity(4 + w.out.len() + 8);
    out.extend_from_slice(BUNDLE_MAGIC);
    out.extend_from_slice(&w.finish());
    out
}

pub fn decode_bundle(bytes: &[u8]) -> Result<Bundle, PayloadError> {
    let body = bytes
        .strip_prefix(BUNDLE_MAGIC.as_slice())
        .ok_or(PayloadError::BadMagic)?;
    let mut r = BitReader::new(body);

    let version = r.read_varint()?;
    if version != BUNDLE_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }

    let function_count = bounded(r.read_varint()?, MAX_FUNCTIONS, "function count")?;
    let mut functions = Vec::with_capacity(function_count as usize);
    for _ in 0..function_count {
        let name = read_name(&mut r)?;
        let arity = read_reg(&mut r)?;
        let reg_count = read_reg(&mut r)?;

        let callee_count = bounded(r.read_varint()?, MAX_TABLE_LEN, "callee count")?;
        let mut callees = Vec::with_capacity(callee_count as usize);
        for _ in 0..callee_count {
            callees.push(read_name(&mut r)?);
        }

        let branch_count = bounded(r.read_varint()?, MAX_TABLE_LEN, "branch count")?;
        let mut branches = Vec::with_capacity(branch_count as usize);
        for _ in 0..branch_count {
            branches.push(r.read_varint()?);
        }

        let inst_count = bounded(r.read_varint()?, MAX_INSTS, "instruction count")?;
        let mut insts = Vec::with_capacity(inst_count as usize);
        for _ in 0..inst_count {
            insts.push(decode_inst(&mut r)?);
        }

        functions.push(FunctionEntry {
            name,
            arity,
            reg_count,
            insts,
            branches,
            callees,
        });
    }

    let case_count = bounded(r.read_varint()?, MAX_FUNCTIONS, "case count")?;
    let mut cases = Vec::with_capacity(case_count as usize);
    for _ in 0..case_count {
        let name = read_name(&mut r)?;
        let arg_count = bounded(
            r.read_varint()?,
            crate::opcodes::MAX_CALL_ARGS as u32,
            "case argument count",
        )?;
        let mut args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            args.push(r.read_u64()?);
        }
        let expected = r.read_u64()?;
        let smoke = r.read_varint()? != 0;
        cases.push(CaseSpec {
            name,
            args,
            expected,
            smoke,
        });
    }

    Ok(Bundle { functions, cases })
}
