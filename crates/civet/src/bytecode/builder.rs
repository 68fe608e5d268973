//! Bytecode emission for one function.
//!
//! `CodeBuilder` accumulates instructions, the constant pool (deduplicated
//! on insert) and the encoded source-location stream, and patches forward
//! jumps once their targets are known.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    bytecode::{
        code::{FuncDef, UpvalDef},
        op::{Instr, MAX_CONSTS, Opcode},
    },
    error::SrcLoc,
    heap::HeapId,
    srcloc::SrcLocEncoder,
    value::{NativeId, Value},
};

#[derive(Debug)]
pub(crate) struct CodeBuilder {
    code: Vec<u32>,
    consts: Vec<Value>,
    num_index: AHashMap<u64, usize>,
    str_index: AHashMap<Box<str>, usize>,
    bool_index: [Option<usize>; 2],
    ref_index: AHashMap<HeapId, usize>,
    native_index: AHashMap<u32, usize>,
    loc_enc: SrcLocEncoder,
    cur_loc: SrcLoc,
}

impl CodeBuilder {
    pub(crate) fn new() -> Self {
        Self {
            code: Vec::new(),
            consts: Vec::new(),
            num_index: AHashMap::new(),
            str_index: AHashMap::new(),
            bool_index: [None; 2],
            ref_index: AHashMap::new(),
            native_index: AHashMap::new(),
            loc_enc: SrcLocEncoder::new(),
            cur_loc: SrcLoc::default(),
        }
    }

    /// Sets the source location recorded for subsequently emitted
    /// instructions.
    pub(crate) fn set_loc(&mut self, loc: SrcLoc) {
        self.cur_loc = loc;
    }

    /// Next instruction address.
    pub(crate) fn addr(&self) -> usize {
        self.code.len()
    }

    /// Appends an instruction and returns its address.
    pub(crate) fn emit(&mut self, instr: Instr) -> usize {
        let addr = self.code.len();
        self.code.push(instr.0);
        self.loc_enc.push(self.cur_loc);
        addr
    }

    /// Emits a `JMP` with a zero displacement to be patched later.
    pub(crate) fn emit_jump(&mut self, close_count: u32) -> usize {
        self.emit(Instr::op_as(Opcode::Jmp, close_count, 0))
    }

    /// Points the jump at `addr` to `target`. Fails when the displacement
    /// exceeds the 18-bit signed field.
    pub(crate) fn patch_jump(&mut self, addr: usize, target: usize) -> Result<(), String> {
        let diff = target as i64 - addr as i64 - 1;
        if !(-(1 << 17)..(1 << 17)).contains(&diff) {
            return Err(format!("too far to jump ({addr} to {target})"));
        }
        let old = Instr(self.code[addr]);
        #[expect(clippy::cast_possible_truncation, reason = "range checked above")]
        let patched = Instr::op_as(Opcode::Jmp, old.a(), diff as i32);
        self.code[addr] = patched.0;
        Ok(())
    }

    /// Signed displacement from the instruction about to be emitted to
    /// `target`, for backward jumps.
    pub(crate) fn displacement_to(&self, target: usize) -> Result<i32, String> {
        let diff = target as i64 - self.addr() as i64 - 1;
        if !(-(1 << 17)..(1 << 17)).contains(&diff) {
            return Err(format!("too far to jump ({} to {target})", self.addr()));
        }
        #[expect(clippy::cast_possible_truncation, reason = "range checked above")]
        Ok(diff as i32)
    }

    fn add_const(&mut self, v: Value) -> Result<usize, String> {
        if self.consts.len() >= MAX_CONSTS {
            return Err("too many constants in function".to_owned());
        }
        self.consts.push(v);
        Ok(self.consts.len() - 1)
    }

    pub(crate) fn const_number(&mut self, n: f64) -> Result<usize, String> {
        if let Some(&k) = self.num_index.get(&n.to_bits()) {
            return Ok(k);
        }
        let k = self.add_const(Value::Number(n))?;
        self.num_index.insert(n.to_bits(), k);
        Ok(k)
    }

    pub(crate) fn const_bool(&mut self, b: bool) -> Result<usize, String> {
        if let Some(k) = self.bool_index[usize::from(b)] {
            return Ok(k);
        }
        let k = self.add_const(Value::Bool(b))?;
        self.bool_index[usize::from(b)] = Some(k);
        Ok(k)
    }

    /// Pool index of an already-interned string constant.
    pub(crate) fn lookup_string(&self, text: &str) -> Option<usize> {
        self.str_index.get(text).copied()
    }

    /// Interns a string constant; `id` must be a heap string whose content
    /// is `text`. Dedup is by content, so equal literals share one entry.
    pub(crate) fn const_string(&mut self, text: &str, id: HeapId) -> Result<usize, String> {
        if let Some(&k) = self.str_index.get(text) {
            return Ok(k);
        }
        let k = self.add_const(Value::Ref(id))?;
        self.str_index.insert(text.into(), k);
        Ok(k)
    }

    /// A reference constant: a top-level closure or an inner FuncDef.
    pub(crate) fn const_ref(&mut self, id: HeapId) -> Result<usize, String> {
        if let Some(&k) = self.ref_index.get(&id) {
            return Ok(k);
        }
        let k = self.add_const(Value::Ref(id))?;
        self.ref_index.insert(id, k);
        Ok(k)
    }

    pub(crate) fn const_native(&mut self, id: NativeId) -> Result<usize, String> {
        if let Some(&k) = self.native_index.get(&id.0) {
            return Ok(k);
        }
        let k = self.add_const(Value::Native(id))?;
        self.native_index.insert(id.0, k);
        Ok(k)
    }

    /// Freezes everything into the final function definition.
    pub(crate) fn finish(
        self,
        name: Option<HeapId>,
        n_params: usize,
        n_regs: usize,
        upvals: Vec<UpvalDef>,
    ) -> FuncDef {
        FuncDef {
            name,
            n_params,
            n_regs,
            code: self.code.into(),
            consts: self.consts.into(),
            upvals: upvals.into(),
            src_loc: Rc::from(self.loc_enc.finish()),
        }
    }
}
