//! The program façade.
//!
//! A [`Program`] owns everything with a lifetime: the heap of collected
//! objects, the compiled function list, the native-function registry, the
//! VM state, the source-file table and the last error message. Hosts
//! compile scripts into it, call top-level functions by name, construct
//! and inspect values, and control collection.

use std::path::Path;

use crate::{
    bytecode::{code::dump_func, compiler},
    error::{Error, RunError},
    heap::{Array, Heap, HeapData, HeapId, Map},
    io::{PrintWriter, StdPrint},
    parser::{self, Source},
    value::{Value, display_value, fmt_number},
    vm::{Frame, Vm},
};

/// An externally supplied callable.
///
/// Natives run synchronously on the VM's thread; a returned error aborts
/// the current run as a runtime error. Values a native creates through the
/// program's constructors stay rooted until the native returns.
pub type NativeFn = fn(&mut Program, &[Value]) -> Result<Value, Error>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeEntry {
    pub func: NativeFn,
}

/// A compiled top-level function.
#[derive(Debug, Clone)]
pub(crate) struct GlobalFunc {
    pub name: String,
    /// Zero-upvalue closure wrapping the function definition.
    pub closure: HeapId,
}

/// One script environment: compiler, VM, heap and host registry.
pub struct Program {
    pub(crate) heap: Heap,
    pub(crate) vm: Vm,
    pub(crate) funcs: Vec<GlobalFunc>,
    pub(crate) native_names: Vec<String>,
    pub(crate) natives: Vec<NativeEntry>,
    /// Transient roots for values the host or a native is holding.
    pub(crate) c_roots: Vec<Value>,
    pub(crate) files: Vec<String>,
    print: Box<dyn PrintWriter>,
    last_error: Option<String>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    /// A fresh program with the builtin natives (`print`, `printf`, `len`)
    /// registered and output going to stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_print(Box::new(StdPrint))
    }

    /// Like [`Program::new`] with a custom output writer for the print
    /// natives.
    #[must_use]
    pub fn with_print(print: Box<dyn PrintWriter>) -> Self {
        let mut prog = Self {
            heap: Heap::new(),
            vm: Vm::default(),
            funcs: Vec::new(),
            native_names: Vec::new(),
            natives: Vec::new(),
            c_roots: Vec::new(),
            files: Vec::new(),
            print,
            last_error: None,
        };
        prog.register_native("print", native_print);
        prog.register_native("printf", native_printf);
        prog.register_native("len", native_len);
        prog
    }

    /// Registers a native function; scripts call it by `name`.
    pub fn register_native(&mut self, name: &str, func: NativeFn) {
        self.native_names.push(name.to_owned());
        self.natives.push(NativeEntry { func });
    }

    /// Most recent error message, kept after a failed compile or call.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            self.last_error = Some(e.message.clone());
        }
        result
    }

    // ---- compilation ---------------------------------------------------

    /// Parses and compiles a script file. Nothing is attached on failure.
    pub fn compile_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let source = Source::File(path.as_ref().to_path_buf());
        let result = self.compile_source(source);
        self.record(result)
    }

    /// Parses and compiles in-memory text; `name` appears in diagnostics.
    pub fn compile_str(&mut self, name: &str, text: &str) -> Result<(), Error> {
        let source = Source::Str {
            name: name.to_owned(),
            text: text.to_owned(),
        };
        let result = self.compile_source(source);
        self.record(result)
    }

    fn compile_source(&mut self, source: Source) -> Result<(), Error> {
        let ast = parser::parse(&mut self.files, source)?;
        let new_funcs = compiler::compile(&ast, &mut self.heap, &self.funcs, &self.native_names, &self.files)?;
        self.funcs.extend(new_funcs);
        Ok(())
    }

    fn find_func(&self, name: &str) -> Option<HeapId> {
        self.funcs.iter().find(|f| f.name == name).map(|f| f.closure)
    }

    // ---- execution -----------------------------------------------------

    /// Calls a compiled top-level function by name.
    ///
    /// Surplus arguments are dropped and missing ones are null, matching
    /// in-language calls. The returned value is kept rooted until
    /// [`Program::release_host_values`]. On a runtime error the frame
    /// stack unwinds back to this entry and open upvalues above it close.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let Some(closure) = self.find_func(name) else {
            let err = Error::runtime(format!("function '{name}' not found"));
            return self.record(Err(err));
        };
        let fd_id = match self.heap.get(closure) {
            HeapData::Closure(c) => c.func_def,
            _ => {
                let err = Error::runtime("function entry is not a closure");
                return self.record(Err(err));
            }
        };
        let (n_params, n_regs) = match self.heap.get(fd_id) {
            HeapData::FuncDef(fd) => (fd.n_params, fd.n_regs),
            _ => {
                let err = Error::runtime("closure does not reference a function definition");
                return self.record(Err(err));
            }
        };

        let entry_frames = self.vm.frames.len();
        let ret_reg = self.vm.frames.last().map_or(0, |f| f.base + f.regs);
        let n_args = args.len().min(n_params);

        self.ensure_stack_size(ret_reg + 1 + n_regs);
        self.vm.stack[ret_reg] = Value::Null;
        self.vm.stack[ret_reg + 1..ret_reg + 1 + n_args].copy_from_slice(&args[..n_args]);
        self.vm.stack[ret_reg + 1 + n_args..ret_reg + 1 + n_regs].fill(Value::Null);
        self.vm.frames.push(Frame {
            closure: Some(closure),
            base: ret_reg + 1,
            regs: n_regs,
            ret_pc: None,
        });

        match self.run_vm() {
            Ok(()) => {
                let ret = self.vm.stack[ret_reg];
                if matches!(ret, Value::Ref(_)) {
                    self.c_roots.push(ret);
                }
                Ok(ret)
            }
            Err(e) => {
                self.vm.frames.truncate(entry_frames);
                self.close_upvals_from(ret_reg);
                self.record(Err(e))
            }
        }
    }

    // ---- garbage collection --------------------------------------------

    /// Allocates a heap object at a safepoint: collects first when the
    /// allocation threshold was crossed (or always, in stress mode).
    pub(crate) fn alloc_value(&mut self, data: HeapData) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(data)
    }

    /// Runs a full mark-and-sweep collection now.
    ///
    /// Roots: the compiled function list, the live region of the value
    /// stack, every frame's closure, open upvalue cells, host-held values
    /// and pinned objects.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<HeapId> = Vec::new();
        for f in &self.funcs {
            roots.push(f.closure);
        }
        if let Some(top) = self.vm.frames.last() {
            let live = (top.base + top.regs).min(self.vm.stack.len());
            for v in &self.vm.stack[..live] {
                if let Value::Ref(id) = v {
                    roots.push(*id);
                }
            }
        }
        for f in &self.vm.frames {
            if let Some(c) = f.closure {
                roots.push(c);
            }
        }
        roots.extend(self.vm.open_upvals.iter().copied());
        for v in &self.c_roots {
            if let Value::Ref(id) = v {
                roots.push(*id);
            }
        }
        self.heap.collect(roots);
    }

    /// Protects an object from collection until [`Program::unpin`].
    pub fn pin(&mut self, v: Value) {
        if let Value::Ref(id) = v {
            self.heap.pin(id);
        }
    }

    pub fn unpin(&mut self, v: Value) {
        if let Value::Ref(id) = v {
            self.heap.unpin(id);
        }
    }

    /// Collect before every allocation; for tests exercising GC safety.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_gc_stress(stress);
    }

    /// Sets the allocation-count threshold for automatic collection.
    pub fn set_gc_threshold(&mut self, threshold: usize) {
        self.heap.set_gc_threshold(threshold);
    }

    /// Live heap object count, for tests and diagnostics.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// Drops every host-held root (values returned by [`Program::call`]
    /// and constructors called outside natives).
    pub fn release_host_values(&mut self) {
        self.c_roots.clear();
    }

    // ---- host value API ------------------------------------------------

    /// Allocates a string value, rooted until the current native returns
    /// (or until [`Program::release_host_values`] when called by the host).
    pub fn new_string(&mut self, s: &str) -> Value {
        let data = HeapData::Str(crate::heap::Str::new(s));
        let v = Value::Ref(self.alloc_value(data));
        self.c_roots.push(v);
        v
    }

    /// Allocates an empty array value; rooted like [`Program::new_string`].
    pub fn new_array(&mut self) -> Value {
        let v = Value::Ref(self.alloc_value(HeapData::Array(Array::new())));
        self.c_roots.push(v);
        v
    }

    /// Allocates an empty map value; rooted like [`Program::new_string`].
    pub fn new_map(&mut self) -> Value {
        let v = Value::Ref(self.alloc_value(HeapData::Map(Map::new())));
        self.c_roots.push(v);
        v
    }

    #[must_use]
    pub fn is_string(&self, v: Value) -> bool {
        matches!(v, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Str(_)))
    }

    #[must_use]
    pub fn is_array(&self, v: Value) -> bool {
        matches!(v, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Array(_)))
    }

    #[must_use]
    pub fn is_map(&self, v: Value) -> bool {
        matches!(v, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Map(_)))
    }

    /// True for values callable by the VM: closures and natives.
    #[must_use]
    pub fn is_callable(&self, v: Value) -> bool {
        match v {
            Value::Native(_) => true,
            Value::Ref(id) => matches!(self.heap.get(id), HeapData::Closure(_)),
            _ => false,
        }
    }

    #[must_use]
    pub fn get_string(&self, v: Value) -> Option<&str> {
        match v {
            Value::Ref(id) => self.heap.as_str(id).map(crate::heap::Str::as_str),
            _ => None,
        }
    }

    #[must_use]
    pub fn array_len(&self, v: Value) -> Option<usize> {
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Array(a) => Some(a.len()),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn array_get(&self, v: Value, index: usize) -> Option<Value> {
        match v {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Array(a) => a.get(i64::try_from(index).ok()?),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn array_set(&mut self, v: Value, index: usize, item: Value) -> Result<(), Error> {
        let Value::Ref(id) = v else {
            return Err(Error::runtime("value is not an array"));
        };
        let HeapData::Array(a) = self.heap.get_mut(id) else {
            return Err(Error::runtime("value is not an array"));
        };
        let slot = i64::try_from(index)
            .ok()
            .and_then(|i| a.get_mut(i))
            .ok_or_else(|| Error::runtime("array index out of range"))?;
        *slot = item;
        Ok(())
    }

    /// Appends to an array.
    pub fn array_push(&mut self, v: Value, item: Value) -> Result<(), Error> {
        let Value::Ref(id) = v else {
            return Err(Error::runtime("value is not an array"));
        };
        let HeapData::Array(a) = self.heap.get_mut(id) else {
            return Err(Error::runtime("value is not an array"));
        };
        a.push(item);
        Ok(())
    }

    /// Appends `n` null elements and returns the index of the first.
    pub fn array_grow(&mut self, v: Value, n: usize) -> Result<usize, Error> {
        let Value::Ref(id) = v else {
            return Err(Error::runtime("value is not an array"));
        };
        let HeapData::Array(a) = self.heap.get_mut(id) else {
            return Err(Error::runtime("value is not an array"));
        };
        Ok(a.grow(n))
    }

    #[must_use]
    pub fn map_get(&self, map: Value, key: Value) -> Option<Value> {
        match map {
            Value::Ref(id) => self.heap.map_get(id, key),
            _ => None,
        }
    }

    pub fn map_insert(&mut self, map: Value, key: Value, value: Value) -> Result<(), Error> {
        let Value::Ref(id) = map else {
            return Err(Error::runtime("value is not a map"));
        };
        if !self.is_map(map) {
            return Err(Error::runtime("value is not a map"));
        }
        self.heap.map_insert(id, key, value).map_err(run_to_error)
    }

    /// Removes a key; an absent key is an error, matching in-language
    /// deletes.
    pub fn map_delete(&mut self, map: Value, key: Value) -> Result<(), Error> {
        let Value::Ref(id) = map else {
            return Err(Error::runtime("value is not a map"));
        };
        if !self.is_map(map) {
            return Err(Error::runtime("value is not a map"));
        }
        if self.heap.map_delete(id, key).map_err(run_to_error)? {
            Ok(())
        } else {
            Err(Error::runtime("key not in map"))
        }
    }

    /// Map iteration: `None` yields the first key, a key yields its
    /// successor, the last key yields `None`.
    #[must_use]
    pub fn map_next_key(&self, map: Value, prev: Option<Value>) -> Option<Value> {
        match map {
            Value::Ref(id) => self.heap.map_next_key(id, prev),
            _ => None,
        }
    }

    /// The value as the `print` native shows it.
    #[must_use]
    pub fn display(&self, v: Value) -> String {
        let mut out = String::new();
        display_value(&self.heap, v, &mut out);
        out
    }

    pub(crate) fn print_str(&mut self, s: &str) {
        self.print.write_str(s);
    }

    // ---- diagnostics ---------------------------------------------------

    /// Disassembles every compiled function, inner definitions included.
    #[must_use]
    pub fn dump_bytecode(&self) -> String {
        let mut out = String::new();
        let mut pending: Vec<HeapId> = Vec::new();
        for f in &self.funcs {
            if let HeapData::Closure(c) = self.heap.get(f.closure) {
                pending.push(c.func_def);
            }
        }
        let mut seen: Vec<HeapId> = Vec::new();
        while let Some(fd_id) = pending.pop() {
            if seen.contains(&fd_id) {
                continue;
            }
            seen.push(fd_id);
            let HeapData::FuncDef(fd) = self.heap.get(fd_id) else { continue };
            dump_func(&mut out, &self.heap, fd);
            out.push('\n');
            for &v in fd.consts.iter() {
                if let Value::Ref(id) = v {
                    match self.heap.get(id) {
                        HeapData::FuncDef(_) => pending.push(id),
                        HeapData::Closure(c) => pending.push(c.func_def),
                        _ => {}
                    }
                }
            }
        }
        out
    }
}

fn run_to_error(e: RunError) -> Error {
    Error::runtime(e.message().to_owned())
}

// ---- builtin natives ----------------------------------------------------

/// `print(...)`: prints each argument's display form, no separators.
fn native_print(prog: &mut Program, args: &[Value]) -> Result<Value, Error> {
    let mut out = String::new();
    for &a in args {
        display_value(&prog.heap, a, &mut out);
    }
    prog.print_str(&out);
    Ok(Value::Number(0.0))
}

/// `printf(fmt, ...)`: formatted output with `%d %u %x %f %g %s %%`.
#[expect(clippy::cast_possible_truncation, reason = "integer conversions mirror printf semantics")]
#[expect(clippy::cast_sign_loss, reason = "%u and %x reinterpret the integer bits")]
fn native_printf(prog: &mut Program, args: &[Value]) -> Result<Value, Error> {
    let Some(&fmt_v) = args.first() else {
        return Ok(Value::Number(0.0));
    };
    let Some(fmt) = prog.get_string(fmt_v) else {
        return Ok(Value::Number(0.0));
    };
    let fmt = fmt.to_owned();

    let mut out = String::new();
    let mut next_arg = 1;
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(spec) = chars.next() else {
            return Err(Error::runtime("printf(): invalid format specifier: '%'"));
        };
        if spec == '%' {
            out.push('%');
            continue;
        }
        if next_arg >= args.len() {
            return Err(Error::runtime(format!("printf(): no argument supplied for '%{spec}'")));
        }
        let arg = args[next_arg];
        match spec {
            'd' => {
                let Value::Number(n) = arg else {
                    return Err(Error::runtime(format!("printf(): invalid argument type for '%{spec}'")));
                };
                out.push_str(&format!("{}", n as i64));
            }
            'u' | 'x' => {
                let Value::Number(n) = arg else {
                    return Err(Error::runtime(format!("printf(): invalid argument type for '%{spec}'")));
                };
                let u = n as i64 as u64;
                if spec == 'u' {
                    out.push_str(&format!("{u}"));
                } else {
                    out.push_str(&format!("{u:x}"));
                }
            }
            'f' => {
                let Value::Number(n) = arg else {
                    return Err(Error::runtime(format!("printf(): invalid argument type for '%{spec}'")));
                };
                out.push_str(&format!("{n:.6}"));
            }
            'g' => {
                let Value::Number(n) = arg else {
                    return Err(Error::runtime(format!("printf(): invalid argument type for '%{spec}'")));
                };
                out.push_str(&fmt_number(n));
            }
            's' => {
                display_value(&prog.heap, arg, &mut out);
            }
            _ => {
                return Err(Error::runtime(format!("printf(): invalid format specifier: '%{spec}'")));
            }
        }
        next_arg += 1;
    }
    prog.print_str(&out);
    Ok(Value::Number(0.0))
}

/// `len(array)`: element count of an array.
fn native_len(prog: &mut Program, args: &[Value]) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::runtime(format!(
            "len(): invalid number of arguments: {}",
            args.len()
        )));
    }
    let Some(len) = prog.array_len(args[0]) else {
        return Err(Error::runtime("len(): argument must be an array"));
    };
    Ok(Value::Number(len as f64))
}
