//! The virtual machine.
//!
//! One closure per frame on an elastic value stack. Call frames live apart
//! from the value stack: each records its closure, the base of its register
//! window and the caller's resume address; the function's return slot is
//! `stack[base - 1]`. A frame whose resume address is absent is a host
//! entry, and popping it halts the dispatch loop.
//!
//! Because registers are addressed as `stack[base + r]`, growing the stack
//! can never leave a handler with a stale pointer; every register access
//! reads through the current allocation.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::{
        code::dump_instr,
        op::{Instr, Opcode, operand_const_index, operand_is_const},
    },
    error::{Error, ErrorKind, RunError, RunResult},
    heap::{Closure, HeapData, HeapId, Upval, UpvalState},
    program::Program,
    srcloc::decode_loc,
    value::{Value, display_value, is_truthy, values_equal},
};

/// One active call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    /// The executing closure; native-call frames have none.
    pub closure: Option<HeapId>,
    /// First register of this frame's window; the return slot is `base - 1`.
    pub base: usize,
    /// Live registers above `base` (register count for script frames,
    /// argument count for native frames), bounding the GC root region.
    pub regs: usize,
    /// Caller instruction to resume at; `None` marks a host entry whose pop
    /// halts the loop.
    pub ret_pc: Option<usize>,
}

/// Mutable interpreter state, owned by the program.
#[derive(Debug, Default)]
pub(crate) struct Vm {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    /// Open upvalue cells sorted by descending stack slot.
    pub open_upvals: Vec<HeapId>,
}

/// Per-frame state the dispatch loop keeps out of the frame stack; rebuilt
/// after every call, return and caught fault.
struct FrameCache {
    code: Rc<[u32]>,
    consts: Rc<[Value]>,
    src_loc: Rc<[u8]>,
    base: usize,
}

/// Reg-or-const operand read.
fn rk(stack: &[Value], cache: &FrameCache, v: u32) -> RunResult<Value> {
    if operand_is_const(v) {
        cache
            .consts
            .get(operand_const_index(v))
            .copied()
            .ok_or_else(|| RunError::internal("constant operand out of range"))
    } else {
        stack
            .get(cache.base + v as usize)
            .copied()
            .ok_or_else(|| RunError::internal("register operand out of range"))
    }
}

/// Evaluates a fallible expression inside the dispatch loop, converting a
/// `RunError` into a located `Error`.
macro_rules! vm_try {
    ($self:expr, $cache:expr, $pc:expr, $expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return Err($self.vm_fault(e, &$cache, $pc)),
        }
    };
}

/// Aborts the dispatch loop with a located error.
macro_rules! vm_bail {
    ($self:expr, $cache:expr, $pc:expr, $err:expr) => {
        return Err($self.vm_fault($err, &$cache, $pc))
    };
}

impl Program {
    fn frame_cache(&self) -> RunResult<FrameCache> {
        let frame = self
            .vm
            .frames
            .last()
            .ok_or_else(|| RunError::internal("no active call frame"))?;
        let closure = frame
            .closure
            .ok_or_else(|| RunError::internal("active frame has no closure"))?;
        let fd_id = match self.heap.get(closure) {
            HeapData::Closure(c) => c.func_def,
            _ => return Err(RunError::internal("frame closure is not a closure object")),
        };
        match self.heap.get(fd_id) {
            HeapData::FuncDef(fd) => Ok(FrameCache {
                code: fd.code.clone(),
                consts: fd.consts.clone(),
                src_loc: fd.src_loc.clone(),
                base: frame.base,
            }),
            _ => Err(RunError::internal("closure does not reference a function definition")),
        }
    }

    /// Grows the value stack to at least `size` slots, in 1 KiB steps.
    pub(crate) fn ensure_stack_size(&mut self, size: usize) {
        if self.vm.stack.len() >= size {
            return;
        }
        let new_size = size.div_ceil(1024) * 1024;
        self.vm.stack.resize(new_size, Value::Null);
    }

    fn upval_slot(&self, id: HeapId) -> Option<usize> {
        match self.heap.get(id) {
            HeapData::Upval(Upval {
                state: UpvalState::Open(slot),
            }) => Some(*slot),
            _ => None,
        }
    }

    /// Closes the topmost open upvalue: snapshots the stack slot's value
    /// into the cell.
    pub(crate) fn close_upval(&mut self) {
        if self.vm.open_upvals.is_empty() {
            return;
        }
        let id = self.vm.open_upvals.remove(0);
        let Some(slot) = self.upval_slot(id) else { return };
        let v = self.vm.stack.get(slot).copied().unwrap_or(Value::Null);
        if let HeapData::Upval(u) = self.heap.get_mut(id) {
            u.state = UpvalState::Closed(v);
        }
    }

    /// Closes every open upvalue at or above `floor`.
    pub(crate) fn close_upvals_from(&mut self, floor: usize) {
        while let Some(&top) = self.vm.open_upvals.first() {
            match self.upval_slot(top) {
                Some(slot) if slot >= floor => self.close_upval(),
                _ => break,
            }
        }
    }

    /// Returns the open cell for `slot`, creating and inserting one in
    /// descending-slot order if no closure captured it yet.
    fn find_or_add_upval(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.vm.open_upvals.len();
        for (i, &id) in self.vm.open_upvals.iter().enumerate() {
            let Some(s) = self.upval_slot(id) else { continue };
            if s == slot {
                return id;
            }
            if s < slot {
                insert_at = i;
                break;
            }
        }
        let id = self.alloc_value(HeapData::Upval(Upval {
            state: UpvalState::Open(slot),
        }));
        self.vm.open_upvals.insert(insert_at, id);
        id
    }

    /// Sizes the callee's register window: missing arguments become null
    /// and every register past the declared parameters is cleared.
    fn prepare_call_window(&mut self, ret_reg: usize, n_args: usize, n_params: usize, n_regs: usize) {
        self.ensure_stack_size(ret_reg + 1 + n_regs);
        let base = ret_reg + 1;
        if n_args < n_params {
            self.vm.stack[base + n_args..base + n_params].fill(Value::Null);
        }
        self.vm.stack[base + n_params..base + n_regs].fill(Value::Null);
    }

    /// Formats a fault with the current source location; internal faults
    /// additionally dump the frame to stderr.
    fn vm_fault(&mut self, err: RunError, cache: &FrameCache, pc: usize) -> Error {
        let addr = pc.saturating_sub(1);
        let loc = decode_loc(&cache.src_loc, addr);
        if matches!(err, RunError::Internal(_)) {
            self.dump_state(cache, addr);
        }
        let file = self
            .files
            .get(loc.file as usize)
            .map_or("<unknown>", String::as_str);
        Error::at(ErrorKind::Runtime, file, loc, err.message())
    }

    /// Writes the current frame and offending instruction to stderr, for
    /// internal faults only.
    fn dump_state(&self, cache: &FrameCache, addr: usize) {
        let mut out = String::from("** halting on internal VM error\n");
        if let Some(frame) = self.vm.frames.last() {
            out.push_str(&format!("** frame base={}, regs={}\n", frame.base, frame.regs));
            for r in 0..frame.regs {
                let mut val = String::new();
                if let Some(&v) = self.vm.stack.get(frame.base + r) {
                    display_value(&self.heap, v, &mut val);
                }
                out.push_str(&format!("  r{r:<3} = {val}\n"));
            }
        }
        out.push_str("** instruction that caused the error:\n");
        if let Some(&word) = cache.code.get(addr) {
            dump_instr(&mut out, &self.heap, &cache.consts, addr, Instr(word));
        }
        eprint!("{out}");
    }

    /// The dispatch loop. Runs until the newest host-entry frame pops;
    /// faults leave the frame stack in place for the caller to unwind.
    #[expect(clippy::cast_possible_truncation, reason = "indices are truncated after range checks")]
    #[expect(clippy::cast_sign_loss, reason = "jump targets are checked non-negative")]
    pub(crate) fn run_vm(&mut self) -> Result<(), Error> {
        let mut cache = match self.frame_cache() {
            Ok(c) => c,
            Err(e) => {
                return Err(Error::new(ErrorKind::Runtime, e.message().to_owned()));
            }
        };
        let mut pc = 0usize;

        loop {
            let Some(&word) = cache.code.get(pc) else {
                vm_bail!(self, cache, pc, RunError::internal("instruction pointer past end of code"));
            };
            let instr = Instr(word);
            pc += 1;
            let Some(op) = instr.op() else {
                vm_bail!(
                    self,
                    cache,
                    pc,
                    RunError::internal(format!("unknown opcode in instruction {word:#010x}"))
                );
            };

            match op {
                Opcode::Ldc => {
                    let Some(&v) = cache.consts.get(instr.u() as usize) else {
                        vm_bail!(self, cache, pc, RunError::internal("constant index out of range"));
                    };
                    self.vm.stack[cache.base + instr.a() as usize] = v;
                }

                Opcode::LdNull => {
                    self.vm.stack[cache.base + instr.a() as usize] = Value::Null;
                }

                Opcode::Mov => {
                    let v = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    self.vm.stack[cache.base + instr.a() as usize] = v;
                }

                Opcode::Ret => {
                    let ret_val = if instr.a() != 0 {
                        vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()))
                    } else {
                        Value::Null
                    };
                    let frame = *self.vm.frames.last().expect("frame stack empty in RET");
                    self.close_upvals_from(frame.base);
                    self.vm.stack[frame.base - 1] = ret_val;
                    self.vm.frames.pop();
                    let Some(ret_pc) = frame.ret_pc else { return Ok(()) };
                    if self.vm.frames.is_empty() {
                        return Ok(());
                    }
                    pc = ret_pc;
                    cache = vm_try!(self, cache, pc, self.frame_cache());
                }

                Opcode::Call => {
                    let a = instr.a() as usize;
                    let n_args = instr.b() as usize;
                    let ret_reg = cache.base + a;
                    let func_v = self.vm.stack[ret_reg];
                    match func_v {
                        Value::Ref(id) => {
                            let fd_id = match self.heap.get(id) {
                                HeapData::Closure(c) => c.func_def,
                                _ => {
                                    vm_bail!(self, cache, pc, RunError::user("call to non-function value"))
                                }
                            };
                            let (code, consts, src_loc, n_params, n_regs) = match self.heap.get(fd_id) {
                                HeapData::FuncDef(fd) => {
                                    (fd.code.clone(), fd.consts.clone(), fd.src_loc.clone(), fd.n_params, fd.n_regs)
                                }
                                _ => vm_bail!(
                                    self,
                                    cache,
                                    pc,
                                    RunError::internal("closure does not reference a function definition")
                                ),
                            };
                            self.prepare_call_window(ret_reg, n_args, n_params, n_regs);
                            self.vm.frames.push(Frame {
                                closure: Some(id),
                                base: ret_reg + 1,
                                regs: n_regs,
                                ret_pc: Some(pc),
                            });
                            cache = FrameCache {
                                code,
                                consts,
                                src_loc,
                                base: ret_reg + 1,
                            };
                            pc = 0;
                        }
                        Value::Native(nid) => {
                            self.ensure_stack_size(ret_reg + 1 + n_args);
                            let args: SmallVec<[Value; 8]> =
                                self.vm.stack[ret_reg + 1..ret_reg + 1 + n_args].iter().copied().collect();
                            self.vm.frames.push(Frame {
                                closure: None,
                                base: ret_reg + 1,
                                regs: n_args,
                                ret_pc: Some(pc),
                            });
                            let roots_floor = self.c_roots.len();
                            let Some(func) = self.natives.get(nid.0 as usize).map(|n| n.func) else {
                                vm_bail!(self, cache, pc, RunError::internal("native function index out of range"));
                            };
                            let result = func(self, &args);
                            self.c_roots.truncate(roots_floor);
                            self.vm.frames.pop();
                            match result {
                                Ok(v) => self.vm.stack[ret_reg] = v,
                                Err(e) => vm_bail!(self, cache, pc, RunError::user(e.message)),
                            }
                        }
                        _ => vm_bail!(self, cache, pc, RunError::user("call to non-function value")),
                    }
                }

                Opcode::GetEl => {
                    let container = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    let key = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.c()));
                    let Value::Ref(id) = container else {
                        vm_bail!(self, cache, pc, RunError::user("invalid element access (non-container object)"));
                    };
                    match self.heap.get(id) {
                        HeapData::Array(arr) => {
                            let Value::Number(n) = key else {
                                vm_bail!(self, cache, pc, RunError::user("invalid array access (non-numeric index)"));
                            };
                            let Some(v) = arr.get(n as i64) else {
                                vm_bail!(self, cache, pc, RunError::user("invalid array index"));
                            };
                            self.vm.stack[cache.base + instr.a() as usize] = v;
                        }
                        HeapData::Map(_) => {
                            let Some(v) = self.heap.map_get(id, key) else {
                                vm_bail!(self, cache, pc, RunError::user("key not in map"));
                            };
                            self.vm.stack[cache.base + instr.a() as usize] = v;
                        }
                        _ => vm_bail!(self, cache, pc, RunError::user("invalid element access (non-container object)")),
                    }
                }

                Opcode::SetEl => {
                    let target = self.vm.stack[cache.base + instr.a() as usize];
                    let key = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    let val = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.c()));
                    let Value::Ref(id) = target else {
                        vm_bail!(self, cache, pc, RunError::user("invalid element access (non-container object)"));
                    };
                    let is_array = matches!(self.heap.get(id), HeapData::Array(_));
                    if is_array {
                        let Value::Number(n) = key else {
                            vm_bail!(self, cache, pc, RunError::user("invalid array access (non-numeric index)"));
                        };
                        let HeapData::Array(arr) = self.heap.get_mut(id) else {
                            unreachable!("checked above");
                        };
                        let Some(slot) = arr.get_mut(n as i64) else {
                            vm_bail!(self, cache, pc, RunError::user("invalid array index"));
                        };
                        *slot = val;
                    } else if matches!(self.heap.get(id), HeapData::Map(_)) {
                        vm_try!(self, cache, pc, self.heap.map_insert(id, key, val));
                    } else {
                        vm_bail!(self, cache, pc, RunError::user("invalid element access (non-container object)"));
                    }
                }

                Opcode::NewArray => {
                    let n = instr.u() as usize;
                    let base = cache.base + instr.a() as usize;
                    let id = self.alloc_value(HeapData::Array(crate::heap::Array::new()));
                    if n > 0 {
                        self.heap.pin(id);
                        if let HeapData::Array(arr) = self.heap.get_mut(id) {
                            let first = arr.grow(n);
                            for i in 0..n {
                                arr.items_mut()[first + i] = self.vm.stack[base + 1 + i];
                            }
                        }
                        self.heap.unpin(id);
                    }
                    self.vm.stack[base] = Value::Ref(id);
                }

                Opcode::NewMap => {
                    let n = instr.u() as usize;
                    let base = cache.base + instr.a() as usize;
                    let id = self.alloc_value(HeapData::Map(crate::heap::Map::new()));
                    self.heap.pin(id);
                    for i in 0..n / 2 {
                        let key = self.vm.stack[base + 1 + 2 * i];
                        let val = self.vm.stack[base + 2 + 2 * i];
                        if key.is_null() {
                            self.heap.unpin(id);
                            vm_bail!(self, cache, pc, RunError::user("can't create map with null key"));
                        }
                        if let Err(e) = self.heap.map_insert(id, key, val) {
                            self.heap.unpin(id);
                            vm_bail!(self, cache, pc, e);
                        }
                    }
                    self.heap.unpin(id);
                    self.vm.stack[base] = Value::Ref(id);
                }

                Opcode::Closure => {
                    let fv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    let fd_id = match fv {
                        Value::Ref(id) if matches!(self.heap.get(id), HeapData::FuncDef(_)) => id,
                        _ => vm_bail!(self, cache, pc, RunError::internal("invalid value for closure (not a func def)")),
                    };
                    let defs = match self.heap.get(fd_id) {
                        HeapData::FuncDef(fd) => fd.upvals.clone(),
                        _ => unreachable!("checked above"),
                    };
                    let clo_id = self.alloc_value(HeapData::Closure(Closure {
                        func_def: fd_id,
                        upvals: Vec::with_capacity(defs.len()),
                    }));
                    self.heap.pin(clo_id);
                    let parent = self.vm.frames.last().and_then(|f| f.closure);
                    for def in defs.iter() {
                        let cell = match *def {
                            crate::bytecode::code::UpvalDef::Reg(i) => self.find_or_add_upval(cache.base + i as usize),
                            crate::bytecode::code::UpvalDef::Upval(i) => {
                                let Some(p) = parent else {
                                    self.heap.unpin(clo_id);
                                    vm_bail!(self, cache, pc, RunError::internal("upvalue capture without parent closure"));
                                };
                                let cell = match self.heap.get(p) {
                                    HeapData::Closure(c) => c.upvals.get(i as usize).copied(),
                                    _ => None,
                                };
                                let Some(cell) = cell else {
                                    self.heap.unpin(clo_id);
                                    vm_bail!(self, cache, pc, RunError::internal("invalid parent upvalue index"));
                                };
                                cell
                            }
                        };
                        if let HeapData::Closure(c) = self.heap.get_mut(clo_id) {
                            c.upvals.push(cell);
                        }
                    }
                    self.heap.unpin(clo_id);
                    self.vm.stack[cache.base + instr.a() as usize] = Value::Ref(clo_id);
                }

                Opcode::GetUpval => {
                    let b = instr.b() as usize;
                    let v = vm_try!(self, cache, pc, self.read_upval(b));
                    self.vm.stack[cache.base + instr.a() as usize] = v;
                }

                Opcode::SetUpval => {
                    let a = instr.a() as usize;
                    let v = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    vm_try!(self, cache, pc, self.write_upval(a, v));
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let bv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    let cv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.c()));
                    let (Value::Number(x), Value::Number(y)) = (bv, cv) else {
                        vm_bail!(self, cache, pc, RunError::user("arithmetic on non-numeric values"));
                    };
                    let r = match op {
                        Opcode::Add => x + y,
                        Opcode::Sub => x - y,
                        Opcode::Mul => x * y,
                        Opcode::Div => x / y,
                        _ => x % y,
                    };
                    self.vm.stack[cache.base + instr.a() as usize] = Value::Number(r);
                }

                Opcode::Neg => {
                    let bv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    let Value::Number(x) = bv else {
                        vm_bail!(self, cache, pc, RunError::user("arithmetic on non-numeric value"));
                    };
                    self.vm.stack[cache.base + instr.a() as usize] = Value::Number(-x);
                }

                Opcode::Not => {
                    let bv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                    let truthy = is_truthy(&self.heap, bv);
                    self.vm.stack[cache.base + instr.a() as usize] = Value::Bool(!truthy);
                }

                Opcode::Jmp => {
                    for _ in 0..instr.a() {
                        self.close_upval();
                    }
                    let target = pc as i64 + i64::from(instr.s());
                    if target < 0 {
                        vm_bail!(self, cache, pc, RunError::internal("jump before start of code"));
                    }
                    pc = target as usize;
                }

                Opcode::Test | Opcode::CmpEq | Opcode::CmpLt | Opcode::CmpLe => {
                    let test = match op {
                        Opcode::Test => {
                            let v = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                            is_truthy(&self.heap, v)
                        }
                        Opcode::CmpEq => {
                            let bv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                            let cv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.c()));
                            values_equal(&self.heap, bv, cv)
                        }
                        _ => {
                            let bv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.b()));
                            let cv = vm_try!(self, cache, pc, rk(&self.vm.stack, &cache, instr.c()));
                            let (Value::Number(x), Value::Number(y)) = (bv, cv) else {
                                let msg = if op == Opcode::CmpLt {
                                    "using < with non-numeric values"
                                } else {
                                    "using <= with non-numeric values"
                                };
                                vm_bail!(self, cache, pc, RunError::user(msg));
                            };
                            if op == Opcode::CmpLt { x < y } else { x <= y }
                        }
                    };
                    // XOR with the invert bit, then skip or execute the
                    // following JMP's displacement inline
                    if test != (instr.a() != 0) {
                        pc += 1;
                    } else {
                        let Some(&next) = cache.code.get(pc) else {
                            vm_bail!(self, cache, pc, RunError::internal("conditional without following jump"));
                        };
                        let target = pc as i64 + i64::from(Instr(next).s()) + 1;
                        if target < 0 {
                            vm_bail!(self, cache, pc, RunError::internal("jump before start of code"));
                        }
                        pc = target as usize;
                    }
                }
            }
        }
    }

    fn read_upval(&self, index: usize) -> RunResult<Value> {
        let closure = self
            .vm
            .frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| RunError::internal("upvalue access outside closure frame"))?;
        let cell = match self.heap.get(closure) {
            HeapData::Closure(c) => c.upvals.get(index).copied(),
            _ => None,
        }
        .ok_or_else(|| RunError::internal("invalid upvalue index"))?;
        match self.heap.get(cell) {
            HeapData::Upval(u) => match u.state {
                UpvalState::Open(slot) => Ok(self.vm.stack.get(slot).copied().unwrap_or(Value::Null)),
                UpvalState::Closed(v) => Ok(v),
            },
            _ => Err(RunError::internal("upvalue cell is not an upvalue object")),
        }
    }

    fn write_upval(&mut self, index: usize, v: Value) -> RunResult<()> {
        let closure = self
            .vm
            .frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| RunError::internal("upvalue access outside closure frame"))?;
        let cell = match self.heap.get(closure) {
            HeapData::Closure(c) => c.upvals.get(index).copied(),
            _ => None,
        }
        .ok_or_else(|| RunError::internal("invalid upvalue index"))?;
        let slot = match self.heap.get(cell) {
            HeapData::Upval(u) => match u.state {
                UpvalState::Open(slot) => Some(slot),
                UpvalState::Closed(_) => None,
            },
            _ => return Err(RunError::internal("upvalue cell is not an upvalue object")),
        };
        match slot {
            Some(slot) => {
                if let Some(dest) = self.vm.stack.get_mut(slot) {
                    *dest = v;
                }
            }
            None => {
                if let HeapData::Upval(u) = self.heap.get_mut(cell) {
                    u.state = UpvalState::Closed(v);
                }
            }
        }
        Ok(())
    }
}
