//! Compiled function definitions.
//!
//! A [`FuncDef`] is the immutable result of compiling one function: code,
//! constants, upvalue-capture descriptors and the encoded source-location
//! stream. FuncDefs live on the heap so that constants referencing other
//! heap objects (strings, inner FuncDefs, closures) stay reachable through
//! them.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::{
    bytecode::op::{Instr, Opcode, operand_const_index, operand_is_const},
    error::SrcLoc,
    heap::{Heap, HeapData, HeapId},
    srcloc::decode_loc,
    value::Value,
};

/// How a closure captures one upvalue at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpvalDef {
    /// Capture a register of the enclosing frame.
    Reg(u8),
    /// Share an upvalue cell of the enclosing closure.
    Upval(u8),
}

/// An immutable compiled function.
#[derive(Debug, Clone)]
pub(crate) struct FuncDef {
    /// Function name as a heap string; anonymous functions have none.
    pub name: Option<HeapId>,
    pub n_params: usize,
    /// Registers the VM must reserve for a frame of this function.
    pub n_regs: usize,
    pub code: Rc<[u32]>,
    pub consts: Rc<[Value]>,
    pub upvals: Rc<[UpvalDef]>,
    /// Encoded instruction-to-location stream, see the `srcloc` module.
    pub src_loc: Rc<[u8]>,
}

impl FuncDef {
    /// An empty definition carrying only the signature.
    ///
    /// Top-level functions are registered as shells first so that bodies
    /// compiled later can reference them; the shell is replaced in place
    /// when its own body is compiled.
    pub(crate) fn shell(name: Option<HeapId>, n_params: usize) -> Self {
        Self {
            name,
            n_params,
            n_regs: n_params,
            code: Rc::from([]),
            consts: Rc::from([]),
            upvals: Rc::from([]),
            src_loc: Rc::from([]),
        }
    }

    /// Source location of the instruction at `addr`.
    pub(crate) fn loc_at(&self, addr: usize) -> SrcLoc {
        decode_loc(&self.src_loc, addr)
    }
}

fn fmt_operand(out: &mut String, v: u32) {
    if operand_is_const(v) {
        let _ = write!(out, "k{}", operand_const_index(v));
    } else {
        let _ = write!(out, "r{v}");
    }
}

fn fmt_const(out: &mut String, heap: &Heap, v: Value) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => out.push_str(&crate::value::fmt_number(n)),
        Value::Native(_) => out.push_str("<native function>"),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => {
                let _ = write!(out, "{:?}", s.as_str());
            }
            HeapData::FuncDef(_) => out.push_str("<func def>"),
            HeapData::Closure(_) => out.push_str("<closure>"),
            _ => out.push_str("<object>"),
        },
    }
}

/// Writes a one-line disassembly of a single instruction.
pub(crate) fn dump_instr(out: &mut String, heap: &Heap, consts: &[Value], addr: usize, instr: Instr) {
    let Some(op) = instr.op() else {
        let _ = writeln!(out, "{addr:5}  <invalid instruction {:08x}>", instr.0);
        return;
    };
    let name: &'static str = op.into();
    let _ = write!(out, "{addr:5}  {name:<10}");
    match op {
        Opcode::Ldc => {
            let _ = write!(out, "r{}, k{}", instr.a(), instr.u());
        }
        Opcode::LdNull => {
            let _ = write!(out, "r{}", instr.a());
        }
        Opcode::Mov | Opcode::Closure | Opcode::Neg | Opcode::Not => {
            let _ = write!(out, "r{}, ", instr.a());
            fmt_operand(out, instr.b());
        }
        Opcode::Ret | Opcode::Test | Opcode::SetUpval => {
            let _ = write!(out, "{}, ", instr.a());
            fmt_operand(out, instr.b());
        }
        Opcode::Call => {
            let _ = write!(out, "r{}, {}", instr.a(), instr.b());
        }
        Opcode::GetUpval => {
            let _ = write!(out, "r{}, u{}", instr.a(), instr.b());
        }
        Opcode::NewArray | Opcode::NewMap => {
            let _ = write!(out, "r{}, {}", instr.a(), instr.u());
        }
        Opcode::Jmp => {
            let target = addr as i64 + 1 + i64::from(instr.s());
            let _ = write!(out, "{}, {:+}    ; -> {target}", instr.a(), instr.s());
        }
        Opcode::GetEl | Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            let _ = write!(out, "r{}, ", instr.a());
            fmt_operand(out, instr.b());
            out.push_str(", ");
            fmt_operand(out, instr.c());
        }
        Opcode::SetEl => {
            let _ = write!(out, "r{}, ", instr.a());
            fmt_operand(out, instr.b());
            out.push_str(", ");
            fmt_operand(out, instr.c());
        }
        Opcode::CmpEq | Opcode::CmpLt | Opcode::CmpLe => {
            let _ = write!(out, "{}, ", instr.a());
            fmt_operand(out, instr.b());
            out.push_str(", ");
            fmt_operand(out, instr.c());
        }
    }
    // show the constant value for constant operands
    let mut shown = Vec::new();
    if op == Opcode::Ldc {
        shown.push(instr.u() as usize);
    } else {
        for v in [instr.b(), instr.c()] {
            if uses_bc(op) && operand_is_const(v) {
                shown.push(operand_const_index(v));
            }
        }
    }
    let mut first = true;
    for k in shown {
        if let Some(&val) = consts.get(k) {
            out.push_str(if first { "    ; " } else { ", " });
            first = false;
            fmt_const(out, heap, val);
        }
    }
    out.push('\n');
}

fn uses_bc(op: Opcode) -> bool {
    !matches!(op, Opcode::Ldc | Opcode::LdNull | Opcode::Jmp | Opcode::NewArray | Opcode::NewMap | Opcode::Call)
}

/// Writes the full disassembly of one function.
pub(crate) fn dump_func(out: &mut String, heap: &Heap, fd: &FuncDef) {
    let name = fd
        .name
        .and_then(|id| match heap.get(id) {
            HeapData::Str(s) => Some(s.as_str().to_owned()),
            _ => None,
        })
        .unwrap_or_else(|| "<anonymous>".to_owned());
    let _ = writeln!(out, "; function {name} ({} params, {} regs, {} upvals)", fd.n_params, fd.n_regs, fd.upvals.len());
    for (addr, &word) in fd.code.iter().enumerate() {
        dump_instr(out, heap, &fd.consts, addr, Instr(word));
    }
}
