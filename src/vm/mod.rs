//! The virtual machine: register stack, call protocol, dispatch loop, and
//! the host-facing API.
//!
//! Execution enters through [`Vm::call`]. A native callee runs directly
//! (behind a pseudoframe, so the backtrace can name it); a script callee
//! gets a register frame seeded with its arguments, and the dispatch loop
//! runs until the entered function returns to the host or a runtime error
//! aborts it. Script-to-script and script-to-native calls are handled
//! inside the loop; a native may re-enter the VM through [`Vm::call`], and
//! the nested activation shares the same stack.
//!
//! On error the stack is intentionally left intact so the host can read a
//! backtrace; it is unwound at the beginning of the next host-initiated
//! call.

use std::any::Any;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::array::Array;
use crate::bytecode::{
    self, opa, opb, opc, opcode_byte, opmid, oplong, ConstKind, Opcode, SymEntryKind, UpvalKind,
    Word, FUNCHDR_IDX_ARGC, FUNCHDR_IDX_BODYLEN, FUNCHDR_IDX_NREGS, FUNCHDR_IDX_SYMCNT,
    FUNCHDR_LEN,
};
use crate::error::{ErrorKind, RuntimeError};
use crate::function::{Function, NativeFn, ProgramUnit, LAMBDA_NAME};
use crate::value::{compare_values, values_comparable, values_equal, Str, Value};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Slots reserved when the register stack first grows.
const INITIAL_STACK_SLOTS: usize = 8;

/// One activation record.
///
/// Registers of the frame live in the shared register stack at
/// `base .. base + size`; the vararg area is the tail `extra_argc` slots of
/// that range. Frame positions are indices, never pointers, so stack growth
/// cannot invalidate them.
struct FrameHeader {
    /// Index of register 0 in the register stack.
    base: usize,
    /// Register plus vararg slot count.
    size: usize,
    /// Declared (formal) parameter count of the callee.
    decl_argc: usize,
    /// Call-time arguments beyond `decl_argc`.
    extra_argc: usize,
    /// Total call-time argument count.
    real_argc: usize,
    /// Where to resume in the caller; `None` returns to the host.
    return_addr: Option<usize>,
    /// Absolute stack index of the caller's destination register; `None`
    /// returns to the host.
    return_slot: Option<usize>,
    /// The function executing in this frame.
    callee: Rc<Function>,
    /// The program unit the callee executes in; `None` for native
    /// pseudoframes.
    unit: Option<Rc<ProgramUnit>>,
}

impl FrameHeader {
    /// Stack index of the `idx`-th vararg. The vararg area is the frame
    /// tail, behind the formals and the locals.
    fn vararg_slot(&self, idx: usize) -> usize {
        debug_assert!(self.decl_argc <= self.size - self.extra_argc);
        debug_assert!(idx < self.extra_argc);
        self.base + self.size - self.extra_argc + idx
    }
}

/// Where the arguments of a call come from.
enum ArgsSource<'a> {
    /// The caller is the host; arguments are an external slice.
    Host(&'a [Value]),
    /// The caller is a script frame; argument register indices are packed
    /// after the CALL instruction at `ip` in the caller's code.
    Script {
        caller_base: usize,
        caller_unit: &'a Rc<ProgramUnit>,
        ip: usize,
    },
}

/// A Sparkling virtual machine.
///
/// Single-threaded and single-entrant; one `Vm` must not be shared across
/// threads, but any number of independent machines may coexist.
pub struct Vm {
    /// Register slots of all live frames, interleaved in call order.
    stack: Vec<Value>,
    /// One header per live frame, innermost last.
    frames: Vec<FrameHeader>,
    /// The global symbol table; also handed to hosts via [`Vm::globals`].
    globals: Rc<Array>,
    /// Set while an error is pending; cleared (with a stack unwind) at the
    /// next host-initiated call.
    has_error: bool,
    /// Last recorded error; survives the unwind so the host can keep
    /// reading it.
    last_error: Option<RuntimeError>,
    /// Opaque host data, passed to every native through [`Vm::context`].
    context: Option<Box<dyn Any>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Rc::new(Array::new()),
            has_error: false,
            last_error: None,
            context: None,
        }
    }

    // -------------------------
    // Host API
    // -------------------------

    /// Call a function value with the given arguments.
    ///
    /// If the previous call ended in an error, the leftover frames are
    /// unwound first (they were kept so the host could read a backtrace).
    pub fn call(&mut self, func: &Value, args: &[Value]) -> Result<Value> {
        self.clean_if_needed();

        let Value::Function(fnobj) = func else {
            return Err(self.fail(None, ErrorKind::NotCallable));
        };

        // Native functions are easy to deal with.
        if let Some(native) = fnobj.native_fn() {
            self.push_native_pseudoframe(Rc::clone(fnobj));
            let mut ret = Value::Nil;
            let code = native(&mut ret, args, self);
            if code != 0 {
                // The pseudoframe stays so the backtrace names the callee.
                let name = fnobj.name().to_string();
                return Err(self.fail(None, ErrorKind::NativeError { name, code }));
            }
            self.pop_frame();
            return Ok(ret);
        }

        let Some(unit) = fnobj.env_unit() else {
            let name = fnobj.name().to_string();
            return Err(self.fail(None, ErrorKind::DeadProgram(name)));
        };

        // A top-level program parses its local symbol table on first entry.
        if fnobj.is_program() {
            self.read_local_symtab(&unit)?;
        }

        let entry = fnobj.entry();
        self.push_and_copy_args(fnobj, &unit, ArgsSource::Host(args), args.len(), None, None)?;
        self.dispatch(unit, entry + FUNCHDR_LEN)
    }

    /// Callee names of all live frames, innermost first.
    pub fn stack_trace(&self) -> Vec<Rc<str>> {
        self.frames
            .iter()
            .rev()
            .map(|f| Rc::clone(f.callee.name()))
            .collect()
    }

    /// The global symbol table. Named globals and library subtables live
    /// here; the handle stays valid for the lifetime of the machine.
    pub fn globals(&self) -> &Rc<Array> {
        &self.globals
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.globals.get_str(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.set_str(name, value);
    }

    /// Register named native functions. With `libname`, they are grouped in
    /// a library subtable of that name (created on demand); without, they
    /// become globals.
    pub fn add_library_functions(&mut self, libname: Option<&str>, fns: &[(&str, NativeFn)]) {
        let storage = self.library_storage(libname);
        for (name, f) in fns {
            storage.set_str(name, Value::Function(Rc::new(Function::native(name, *f))));
        }
        log::debug!(
            "registered {} native functions in {}",
            fns.len(),
            libname.unwrap_or("<globals>")
        );
    }

    /// Register named values, with the same layout as
    /// [`Vm::add_library_functions`].
    pub fn add_library_values(&mut self, libname: Option<&str>, vals: &[(&str, Value)]) {
        let storage = self.library_storage(libname);
        for (name, v) in vals {
            storage.set_str(name, v.clone());
        }
    }

    fn library_storage(&mut self, libname: Option<&str>) -> Rc<Array> {
        let Some(libname) = libname else {
            return Rc::clone(&self.globals);
        };
        match self.globals.get_str(libname) {
            Value::Array(lib) => lib,
            _ => {
                let lib = Rc::new(Array::new());
                self.globals
                    .set_str(libname, Value::Array(Rc::clone(&lib)));
                lib
            }
        }
    }

    /// The last runtime error, formatted. Stays readable after the stack
    /// has been unwound.
    pub fn last_error_message(&self) -> Option<String> {
        self.last_error.as_ref().map(|e| e.to_string())
    }

    pub fn last_error(&self) -> Option<&RuntimeError> {
        self.last_error.as_ref()
    }

    /// Report a custom error message from inside a native function, before
    /// returning a nonzero code. The first message wins: the generic
    /// "error in function" text will not overwrite it.
    pub fn set_error_message(&mut self, msg: impl Into<String>) {
        let _ = self.fail(None, ErrorKind::Host(msg.into()));
    }

    /// Opaque host data passed to every native function.
    pub fn set_context(&mut self, ctx: Option<Box<dyn Any>>) {
        self.context = ctx;
    }

    pub fn context(&self) -> Option<&dyn Any> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn Any + 'static)> {
        self.context.as_deref_mut()
    }

    // -------------------------
    // Errors
    // -------------------------

    /// Record a runtime error. `addr` is the word offset of the faulting
    /// instruction, or `None` for errors raised outside script code.
    ///
    /// Self-guarding: while an error is pending, later ones are discarded,
    /// so the first (root-cause) message survives.
    fn fail(&mut self, addr: Option<usize>, kind: ErrorKind) -> RuntimeError {
        let err = match addr {
            Some(addr) => RuntimeError::Script { addr, kind },
            None => RuntimeError::Native { kind },
        };
        if !self.has_error {
            log::error!("{err}");
            self.has_error = true;
            self.last_error = Some(err.clone());
        }
        self.last_error.clone().unwrap_or(err)
    }

    /// Unwind frames left over from an errored execution. Deferred to the
    /// next call so backtraces stay readable in between.
    fn clean_if_needed(&mut self) {
        if self.has_error {
            while !self.frames.is_empty() {
                self.pop_frame();
            }
            self.has_error = false;
        }
    }

    // -------------------------
    // Stack and frames
    // -------------------------

    fn push_frame(
        &mut self,
        nregs: usize,
        decl_argc: usize,
        extra_argc: usize,
        real_argc: usize,
        return_addr: Option<usize>,
        return_slot: Option<usize>,
        callee: Rc<Function>,
        unit: Option<Rc<ProgramUnit>>,
    ) {
        let size = nregs + extra_argc;
        let base = self.stack.len();
        if self.stack.capacity() == 0 {
            self.stack.reserve(INITIAL_STACK_SLOTS);
        }
        // Growth beyond that doubles amortized; every saved position is an
        // index, so relocation is harmless.
        self.stack.resize(base + size, Value::Nil);
        self.frames.push(FrameHeader {
            base,
            size,
            decl_argc,
            extra_argc,
            real_argc,
            return_addr,
            return_slot,
            callee,
            unit,
        });
    }

    /// Zero-register frame pushed around a native call, purely so the
    /// backtrace can name the native function.
    fn push_native_pseudoframe(&mut self, callee: Rc<Function>) {
        self.push_frame(0, 0, 0, 0, None, None, callee, None);
    }

    /// Drop the innermost frame, releasing every value it holds.
    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            self.stack.truncate(frame.base);
        }
    }

    /// Push the callee frame and route the caller's arguments into it:
    /// formals into registers `0 .. decl_argc`, the surplus into the vararg
    /// area, missing formals left nil.
    fn push_and_copy_args(
        &mut self,
        fnobj: &Rc<Function>,
        callee_unit: &Rc<ProgramUnit>,
        source: ArgsSource<'_>,
        argc: usize,
        return_addr: Option<usize>,
        return_slot: Option<usize>,
    ) -> Result<()> {
        let entry = fnobj.entry();
        let code = callee_unit.code();
        if entry + FUNCHDR_LEN > code.len() {
            return Err(self.fail(
                None,
                ErrorKind::MalformedBytecode(format!(
                    "function header at word {} overruns the image",
                    entry
                )),
            ));
        }
        let decl_argc = code[entry + FUNCHDR_IDX_ARGC] as usize;
        let nregs = code[entry + FUNCHDR_IDX_NREGS] as usize;
        if decl_argc > nregs {
            return Err(self.fail(
                None,
                ErrorKind::MalformedBytecode(format!(
                    "function `{}' declares {} parameters but only {} registers",
                    fnobj.name(),
                    decl_argc,
                    nregs
                )),
            ));
        }
        let extra_argc = argc.saturating_sub(decl_argc);

        self.push_frame(
            nregs,
            decl_argc,
            extra_argc,
            argc,
            return_addr,
            return_slot,
            Rc::clone(fnobj),
            Some(Rc::clone(callee_unit)),
        );
        let base = self.stack.len() - (nregs + extra_argc);

        // Formals first, then the surplus into the vararg tail. The caller
        // registers sit below the new frame, so they are still addressable
        // after the push.
        for i in 0..argc {
            let src = match &source {
                ArgsSource::Host(argv) => argv[i].clone(),
                ArgsSource::Script {
                    caller_base,
                    caller_unit,
                    ip,
                } => {
                    let reg = bytecode::nth_arg_idx(caller_unit.code(), *ip, i);
                    self.stack[caller_base + reg as usize].clone()
                }
            };
            let dst = if i < decl_argc {
                base + i
            } else {
                base + nregs + (i - decl_argc)
            };
            self.stack[dst] = src;
        }
        Ok(())
    }

    // -------------------------
    // Local symbol tables
    // -------------------------

    /// Parse the local symbol table stream that follows a top-level
    /// program's body. Runs once; the flag flips before parsing so
    /// re-entry is a no-op.
    fn read_local_symtab(&mut self, unit: &Rc<ProgramUnit>) -> Result<()> {
        if unit.symtab_read() {
            return Ok(());
        }
        unit.mark_symtab_read();

        let code = unit.code();
        let bodylen = code[FUNCHDR_IDX_BODYLEN] as usize;
        let symcount = code[FUNCHDR_IDX_SYMCNT] as usize;
        let mut p = FUNCHDR_LEN + bodylen;
        let mut syms = Vec::with_capacity(symcount);

        for _ in 0..symcount {
            let Some(&ins) = code.get(p) else {
                return Err(self.symtab_error("symbol table overruns the image"));
            };
            p += 1;
            match SymEntryKind::from_u8(opcode_byte(ins)) {
                Some(SymEntryKind::StrConst) => {
                    let len = oplong(ins) as usize;
                    let Some(bytes) = bytecode::read_packed_bytes(code, p, len) else {
                        return Err(self.symtab_error("string constant overruns the image"));
                    };
                    p += bytecode::packed_words(len);
                    syms.push(Value::String(Rc::new(Str::from_bytes(bytes))));
                }
                Some(SymEntryKind::SymStub) => {
                    let len = oplong(ins) as usize;
                    let Some(name) = read_packed_name(code, p, len) else {
                        return Err(self.symtab_error("unresolved symbol name is malformed"));
                    };
                    p += bytecode::packed_words(len);
                    syms.push(Value::SymStub(Rc::from(name.as_str())));
                }
                Some(SymEntryKind::FuncDef) => {
                    let (Some(&hdr_off), Some(&namelen)) = (code.get(p), code.get(p + 1)) else {
                        return Err(self.symtab_error("function entry overruns the image"));
                    };
                    p += 2;
                    let namelen = namelen as usize;
                    debug_assert_eq!(oplong(ins) as usize, namelen);
                    let Some(name) = read_packed_name(code, p, namelen) else {
                        return Err(self.symtab_error("function name is malformed"));
                    };
                    p += bytecode::packed_words(namelen);
                    let name = if name.is_empty() {
                        LAMBDA_NAME
                    } else {
                        name.as_str()
                    };
                    // Functions are implemented in the same translation unit
                    // that declares them, so the unit back-reference can be
                    // filled in right here.
                    syms.push(Value::Function(Rc::new(Function::script(
                        name,
                        hdr_off as usize,
                        unit,
                    ))));
                }
                None => {
                    return Err(self.fail(None, ErrorKind::IllegalInstruction(opcode_byte(ins))));
                }
            }
        }

        log::trace!("loaded {} local symbols", symcount);
        *unit.symtab().borrow_mut() = syms;
        Ok(())
    }

    fn symtab_error(&mut self, what: &str) -> RuntimeError {
        self.fail(None, ErrorKind::MalformedBytecode(what.to_string()))
    }

    /// Look a symbol stub up in the global table. The caller caches the
    /// result back into the local symbol table, so a given stub resolves at
    /// most once.
    fn resolve_symbol(&mut self, ip: usize, name: &str) -> Result<Value> {
        let resolved = self.globals.get_str(name);
        if resolved.is_nil() {
            return Err(self.fail(Some(ip), ErrorKind::UnresolvedSymbol(name.to_string())));
        }
        Ok(resolved)
    }

    // -------------------------
    // Dispatch loop
    // -------------------------

    /// Execute starting at word `ip` of `unit` until the function entered
    /// at the bottom of this activation returns to the host, or a runtime
    /// error aborts execution.
    fn dispatch(&mut self, mut unit: Rc<ProgramUnit>, mut ip: usize) -> Result<Value> {
        loop {
            let Some(&ins) = unit.code().get(ip) else {
                return Err(self.fail(Some(ip), ErrorKind::PcOutOfRange(ip)));
            };
            let at = ip;
            ip += 1;

            let Some(op) = Opcode::from_u8(opcode_byte(ins)) else {
                return Err(self.fail(Some(at), ErrorKind::IllegalInstruction(opcode_byte(ins))));
            };

            // Register indices are relative to the innermost frame.
            let base = match self.frames.last() {
                Some(f) => f.base,
                None => return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(at))),
            };

            match op {
                Opcode::Call => {
                    let dst = base + opa(ins) as usize;
                    let argc = opc(ins) as usize;
                    let narg_words = bytecode::arg_pack_words(argc);
                    if ip + narg_words > unit.code().len() {
                        return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                    }
                    let func = self.stack[base + opb(ins) as usize].clone();

                    let Value::Function(fnobj) = func else {
                        return Err(self.fail(Some(at), ErrorKind::NotCallable));
                    };

                    if let Some(native) = fnobj.native_fn() {
                        // Snapshot the arguments before the pseudoframe goes
                        // on: they live in the current (topmost) frame.
                        let mut args: SmallVec<[Value; 16]> = SmallVec::with_capacity(argc);
                        for i in 0..argc {
                            let reg = bytecode::nth_arg_idx(unit.code(), ip, i);
                            args.push(self.stack[base + reg as usize].clone());
                        }

                        self.push_native_pseudoframe(Rc::clone(&fnobj));
                        let mut ret = Value::Nil;
                        let code = native(&mut ret, &args, self);
                        if code != 0 {
                            let name = fnobj.name().to_string();
                            return Err(self.fail(None, ErrorKind::NativeError { name, code }));
                        }
                        debug_assert!(!self.has_error, "native returned success after an error");
                        self.pop_frame();

                        // The destination is overwritten only after the
                        // callback ran, so `x = f(x)` sees the old value.
                        self.stack[dst] = ret;
                        ip += narg_words;
                    } else {
                        let return_addr = ip + narg_words;
                        let Some(callee_unit) = fnobj.env_unit() else {
                            let name = fnobj.name().to_string();
                            return Err(self.fail(Some(at), ErrorKind::DeadProgram(name)));
                        };
                        if fnobj.is_program() {
                            self.read_local_symtab(&callee_unit)?;
                        }
                        self.push_and_copy_args(
                            &fnobj,
                            &callee_unit,
                            ArgsSource::Script {
                                caller_base: base,
                                caller_unit: &unit,
                                ip,
                            },
                            argc,
                            Some(return_addr),
                            Some(dst),
                        )?;
                        ip = fnobj.entry() + FUNCHDR_LEN;
                        unit = callee_unit;
                    }
                }

                Opcode::Ret => {
                    // Take the return value out before the frame pop
                    // releases the register that holds it.
                    let res = self.stack[base + opa(ins) as usize].clone();
                    let (return_addr, return_slot) = match self.frames.last() {
                        Some(f) => (f.return_addr, f.return_slot),
                        None => (None, None),
                    };
                    self.pop_frame();

                    match (return_addr, return_slot) {
                        (Some(addr), Some(slot)) => {
                            self.stack[slot] = res;
                            ip = addr;
                            let caller_unit =
                                self.frames.last().and_then(|f| f.unit.as_ref()).cloned();
                            match caller_unit {
                                Some(u) => unit = u,
                                // A script return address always has a
                                // script caller frame below it.
                                None => return Ok(Value::Nil),
                            }
                        }
                        _ => return Ok(res),
                    }
                }

                Opcode::Jmp => {
                    let Some(&off) = unit.code().get(ip) else {
                        return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                    };
                    ip += 1;
                    ip = branch_target(ip, off);
                }

                Opcode::Jze | Opcode::Jnz => {
                    let Some(&off) = unit.code().get(ip) else {
                        return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                    };
                    ip += 1;
                    let cond = match &self.stack[base + opa(ins) as usize] {
                        Value::Bool(b) => *b,
                        _ => return Err(self.fail(Some(at), ErrorKind::CondJumpType)),
                    };
                    if cond == (op == Opcode::Jnz) {
                        ip = branch_target(ip, off);
                    }
                }

                Opcode::Eq | Opcode::Ne => {
                    let b = &self.stack[base + opb(ins) as usize];
                    let c = &self.stack[base + opc(ins) as usize];
                    // Equality is total; compute before touching the
                    // destination, which may alias an operand.
                    let res = values_equal(b, c) == (op == Opcode::Eq);
                    self.stack[base + opa(ins) as usize] = Value::Bool(res);
                }

                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let b = &self.stack[base + opb(ins) as usize];
                    let c = &self.stack[base + opc(ins) as usize];
                    if !values_comparable(b, c) {
                        let (lhs, rhs) = (b.type_name(), c.type_name());
                        return Err(self.fail(Some(at), ErrorKind::Uncomparable { lhs, rhs }));
                    }
                    let res = cmp_to_bool(compare_values(b, c), op);
                    self.stack[base + opa(ins) as usize] = Value::Bool(res);
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    let b = &self.stack[base + opb(ins) as usize];
                    let c = &self.stack[base + opc(ins) as usize];
                    if !b.is_num() || !c.is_num() {
                        return Err(self.fail(Some(at), ErrorKind::ArithmeticType));
                    }
                    let Some(res) = arith_op(b, c, op) else {
                        return Err(self.fail(Some(at), ErrorKind::DivisionByZero));
                    };
                    self.stack[base + opa(ins) as usize] = res;
                }

                Opcode::Mod => {
                    let b = &self.stack[base + opb(ins) as usize];
                    let c = &self.stack[base + opc(ins) as usize];
                    let (x, y) = match (b, c) {
                        (Value::Int(x), Value::Int(y)) => (*x, *y),
                        _ => return Err(self.fail(Some(at), ErrorKind::ModuloType)),
                    };
                    if y == 0 {
                        return Err(self.fail(Some(at), ErrorKind::ModuloByZero));
                    }
                    self.stack[base + opa(ins) as usize] = Value::Int(x.wrapping_rem(y));
                }

                Opcode::Neg => {
                    let res = match &self.stack[base + opb(ins) as usize] {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        Value::Float(f) => Value::Float(-f),
                        _ => return Err(self.fail(Some(at), ErrorKind::NegationType)),
                    };
                    self.stack[base + opa(ins) as usize] = res;
                }

                Opcode::Inc | Opcode::Dec => {
                    let delta: i64 = if op == Opcode::Inc { 1 } else { -1 };
                    // Mutated in place: the value keeps its identity.
                    match &mut self.stack[base + opa(ins) as usize] {
                        Value::Int(i) => *i = i.wrapping_add(delta),
                        Value::Float(f) => *f += delta as f64,
                        _ => return Err(self.fail(Some(at), ErrorKind::IncDecType)),
                    }
                }

                Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr => {
                    let b = &self.stack[base + opb(ins) as usize];
                    let c = &self.stack[base + opc(ins) as usize];
                    let (x, y) = match (b, c) {
                        (Value::Int(x), Value::Int(y)) => (*x, *y),
                        _ => return Err(self.fail(Some(at), ErrorKind::BitwiseType)),
                    };
                    self.stack[base + opa(ins) as usize] = Value::Int(bitwise_op(x, y, op));
                }

                Opcode::BitNot => {
                    let x = match &self.stack[base + opb(ins) as usize] {
                        Value::Int(x) => *x,
                        _ => return Err(self.fail(Some(at), ErrorKind::BitNotType)),
                    };
                    self.stack[base + opa(ins) as usize] = Value::Int(!x);
                }

                Opcode::LogNot => {
                    let b = match &self.stack[base + opb(ins) as usize] {
                        Value::Bool(b) => *b,
                        _ => return Err(self.fail(Some(at), ErrorKind::LogNotType)),
                    };
                    self.stack[base + opa(ins) as usize] = Value::Bool(!b);
                }

                Opcode::SizeOf => {
                    let res = match &self.stack[base + opb(ins) as usize] {
                        Value::String(s) => Value::Int(s.len() as i64),
                        Value::Array(a) => Value::Int(a.len() as i64),
                        other => {
                            let ty = other.type_name();
                            return Err(self.fail(Some(at), ErrorKind::SizeofType(ty)));
                        }
                    };
                    self.stack[base + opa(ins) as usize] = res;
                }

                Opcode::TypeOf => {
                    let name = self.stack[base + opb(ins) as usize].type_name();
                    self.stack[base + opa(ins) as usize] = Value::string(name);
                }

                Opcode::Concat => {
                    let b = &self.stack[base + opb(ins) as usize];
                    let c = &self.stack[base + opc(ins) as usize];
                    let res = match (b, c) {
                        (Value::String(x), Value::String(y)) => Value::String(Rc::new(x.concat(y))),
                        _ => return Err(self.fail(Some(at), ErrorKind::ConcatType)),
                    };
                    self.stack[base + opa(ins) as usize] = res;
                }

                Opcode::LdConst => {
                    let dst = base + opa(ins) as usize;
                    let Some(kind) = ConstKind::from_u8(opb(ins)) else {
                        return Err(
                            self.fail(Some(at), ErrorKind::IllegalInstruction(opcode_byte(ins)))
                        );
                    };
                    let value = match kind {
                        ConstKind::Nil => Value::Nil,
                        ConstKind::True => Value::Bool(true),
                        ConstKind::False => Value::Bool(false),
                        ConstKind::Int => {
                            if ip + bytecode::INT_WORDS > unit.code().len() {
                                return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                            }
                            let v = bytecode::read_i64(unit.code(), ip);
                            ip += bytecode::INT_WORDS;
                            Value::Int(v)
                        }
                        ConstKind::Float => {
                            if ip + bytecode::FLOAT_WORDS > unit.code().len() {
                                return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                            }
                            let v = bytecode::read_f64(unit.code(), ip);
                            ip += bytecode::FLOAT_WORDS;
                            Value::Float(v)
                        }
                    };
                    self.stack[dst] = value;
                }

                Opcode::LdSym => {
                    let symidx = opmid(ins) as usize;
                    let sym = {
                        let symtab = unit.symtab().borrow();
                        symtab.get(symidx).cloned().unwrap_or(Value::Nil)
                    };
                    debug_assert!(!sym.is_nil(), "local symbol {} is unset", symidx);

                    let stub_name = match &sym {
                        Value::SymStub(name) => Some(Rc::clone(name)),
                        _ => None,
                    };
                    let resolved = match stub_name {
                        Some(name) => {
                            let res = self.resolve_symbol(at, &name)?;
                            // Cache the resolution; the stub is gone for
                            // good.
                            unit.symtab().borrow_mut()[symidx] = res.clone();
                            res
                        }
                        None => sym,
                    };
                    self.stack[base + opa(ins) as usize] = resolved;
                }

                Opcode::Mov => {
                    let src = self.stack[base + opb(ins) as usize].clone();
                    self.stack[base + opa(ins) as usize] = src;
                }

                Opcode::LdArgc => {
                    let argc = match self.frames.last() {
                        Some(f) => f.real_argc as i64,
                        None => 0,
                    };
                    self.stack[base + opa(ins) as usize] = Value::Int(argc);
                }

                Opcode::NewArr => {
                    self.stack[base + opa(ins) as usize] = Value::array();
                }

                Opcode::ArrGet => {
                    let container = self.stack[base + opb(ins) as usize].clone();
                    let res = match &container {
                        Value::Array(arr) => arr.get(&self.stack[base + opc(ins) as usize]),
                        Value::String(s) => {
                            let raw = match &self.stack[base + opc(ins) as usize] {
                                Value::Int(raw) => *raw,
                                _ => {
                                    return Err(self.fail(Some(at), ErrorKind::StringIndexType));
                                }
                            };
                            let len = s.len() as i64;
                            // Negative indices count from the end.
                            let idx = if raw < 0 { len + raw } else { raw };
                            if idx < 0 || idx >= len {
                                return Err(self
                                    .fail(Some(at), ErrorKind::StringIndexBounds { idx, len }));
                            }
                            Value::Int(s.as_bytes()[idx as usize] as i64)
                        }
                        _ => {
                            return Err(self.fail(Some(at), ErrorKind::IndexableType));
                        }
                    };
                    self.stack[base + opa(ins) as usize] = res;
                }

                Opcode::ArrSet => {
                    let target = self.stack[base + opa(ins) as usize].clone();
                    let Value::Array(arr) = &target else {
                        return Err(self.fail(Some(at), ErrorKind::ArraySetType));
                    };
                    let key = &self.stack[base + opb(ins) as usize];
                    if matches!(key, Value::Float(f) if f.is_nan()) {
                        return Err(self.fail(Some(at), ErrorKind::NanKey));
                    }
                    arr.set(key, self.stack[base + opc(ins) as usize].clone());
                }

                Opcode::NthArg => {
                    // `#i` reads unnamed (vararg) arguments only: index 0 is
                    // the first argument past the declared parameters.
                    let idx = match &self.stack[base + opb(ins) as usize] {
                        Value::Int(idx) => *idx,
                        _ => return Err(self.fail(Some(at), ErrorKind::VarargIndexType)),
                    };
                    if idx < 0 {
                        return Err(self.fail(Some(at), ErrorKind::VarargIndexNegative));
                    }
                    let slot = match self.frames.last() {
                        Some(f) if (idx as usize) < f.extra_argc => f.vararg_slot(idx as usize),
                        _ => return Err(self.fail(Some(at), ErrorKind::VarargBounds(idx))),
                    };
                    let vararg = self.stack[slot].clone();
                    self.stack[base + opa(ins) as usize] = vararg;
                }

                Opcode::Function => {
                    // A nested definition is dead weight at execution time;
                    // hop over its header and body.
                    let Some(&bodylen) = unit.code().get(ip + FUNCHDR_IDX_BODYLEN) else {
                        return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                    };
                    debug_assert!(
                        unit.code()
                            .get(ip + FUNCHDR_IDX_ARGC)
                            .zip(unit.code().get(ip + FUNCHDR_IDX_NREGS))
                            .is_some_and(|(a, r)| a <= r),
                        "formal parameters must fit in the register window"
                    );
                    ip += FUNCHDR_LEN + bodylen as usize;
                }

                Opcode::GlbVal => {
                    let namelen = opmid(ins) as usize;
                    let Some(name) = read_packed_name(unit.code(), ip, namelen) else {
                        return Err(self.symtab_error("global name is malformed"));
                    };
                    ip += bytecode::packed_words(namelen);

                    if !self.globals.get_str(&name).is_nil() {
                        return Err(self.fail(Some(at), ErrorKind::GlobalRedefinition(name)));
                    }
                    let value = self.stack[base + opa(ins) as usize].clone();
                    self.globals.set_str(&name, value);
                }

                Opcode::Closure => {
                    let reg = base + opa(ins) as usize;
                    let n_upvals = opb(ins) as usize;
                    let enclosing = match self.frames.last() {
                        Some(f) => Rc::clone(&f.callee),
                        None => return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(at))),
                    };

                    let mut upvalues = Vec::with_capacity(n_upvals);
                    for _ in 0..n_upvals {
                        let Some(&desc) = unit.code().get(ip) else {
                            return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(ip)));
                        };
                        ip += 1;
                        match UpvalKind::from_u8(opcode_byte(desc)) {
                            Some(UpvalKind::Local) => {
                                // Capture a register of the enclosing frame.
                                upvalues.push(self.stack[base + opa(desc) as usize].clone());
                            }
                            Some(UpvalKind::Outer) => {
                                // Copy from the closure of the currently
                                // executing function.
                                debug_assert!(enclosing.upvalues().is_some());
                                let idx = opa(desc) as usize;
                                let v = enclosing
                                    .upvalues()
                                    .and_then(|u| u.borrow().get(idx).cloned())
                                    .unwrap_or(Value::Nil);
                                upvalues.push(v);
                            }
                            None => {
                                return Err(self.fail(
                                    Some(at),
                                    ErrorKind::IllegalInstruction(opcode_byte(desc)),
                                ));
                            }
                        }
                    }

                    let prototype = self.stack[reg].clone();
                    let closure = match &prototype {
                        Value::Function(proto) => Function::closure_of(proto, upvalues),
                        _ => None,
                    };
                    let Some(closure) = closure else {
                        return Err(self.fail(Some(at), ErrorKind::NotCallable));
                    };
                    // The prototype in the register is replaced by the
                    // closure built over it.
                    self.stack[reg] = Value::Function(Rc::new(closure));
                }

                Opcode::LdUpval => {
                    let idx = opb(ins) as usize;
                    let current = match self.frames.last() {
                        Some(f) => Rc::clone(&f.callee),
                        None => return Err(self.fail(Some(at), ErrorKind::PcOutOfRange(at))),
                    };
                    let v = current
                        .upvalues()
                        .and_then(|u| u.borrow().get(idx).cloned())
                        .unwrap_or(Value::Nil);
                    self.stack[base + opa(ins) as usize] = v;
                }
            }
        }
    }
}

/// Decode a packed, NUL-terminated name as UTF-8.
fn read_packed_name(code: &[Word], at: usize, len: usize) -> Option<String> {
    let bytes = bytecode::read_packed_bytes(code, at, len)?;
    String::from_utf8(bytes).ok()
}

/// Branch targets are relative to the word after the offset word.
#[inline]
fn branch_target(ip: usize, offset: Word) -> usize {
    (ip as i64 + offset as i32 as i64) as usize
}

/// Map a three-way comparison onto the four ordered-comparison opcodes.
fn cmp_to_bool(ord: std::cmp::Ordering, op: Opcode) -> bool {
    use std::cmp::Ordering;
    match op {
        Opcode::Lt => ord == Ordering::Less,
        Opcode::Le => ord != Ordering::Greater,
        Opcode::Gt => ord == Ordering::Greater,
        Opcode::Ge => ord != Ordering::Less,
        _ => unreachable!("not an ordered comparison opcode"),
    }
}

/// Numeric arithmetic. Either operand being float makes the result float;
/// the all-integer path wraps. Returns `None` for integer division by
/// zero.
fn arith_op(lhs: &Value, rhs: &Value, op: Opcode) -> Option<Value> {
    debug_assert!(lhs.is_num() && rhs.is_num());

    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let res = match op {
            Opcode::Add => a.wrapping_add(*b),
            Opcode::Sub => a.wrapping_sub(*b),
            Opcode::Mul => a.wrapping_mul(*b),
            Opcode::Div => {
                if *b == 0 {
                    return None;
                }
                a.wrapping_div(*b)
            }
            _ => unreachable!("not an arithmetic opcode"),
        };
        return Some(Value::Int(res));
    }

    let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
    let res = match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        _ => unreachable!("not an arithmetic opcode"),
    };
    Some(Value::Float(res))
}

/// Integer bitwise operations; shift counts are masked to the word width.
fn bitwise_op(a: i64, b: i64, op: Opcode) -> i64 {
    match op {
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a.wrapping_shl(b as u32),
        Opcode::Shr => a.wrapping_shr(b as u32),
        _ => unreachable!("not a bitwise opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_kind_promotion() {
        let v = arith_op(&Value::Int(2), &Value::Int(3), Opcode::Add).expect("no zero divisor");
        assert!(matches!(v, Value::Int(5)));

        let v = arith_op(&Value::Int(2), &Value::Float(0.5), Opcode::Mul).expect("no zero divisor");
        assert!(matches!(v, Value::Float(f) if f == 1.0));
    }

    #[test]
    fn integer_division_by_zero_is_detected() {
        assert!(arith_op(&Value::Int(1), &Value::Int(0), Opcode::Div).is_none());
    }

    #[test]
    fn float_division_keeps_ieee_semantics() {
        let v = arith_op(&Value::Float(1.0), &Value::Int(0), Opcode::Div).expect("float path");
        assert!(matches!(v, Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn comparison_opcode_mapping() {
        use std::cmp::Ordering;
        assert!(cmp_to_bool(Ordering::Less, Opcode::Lt));
        assert!(cmp_to_bool(Ordering::Less, Opcode::Le));
        assert!(!cmp_to_bool(Ordering::Less, Opcode::Gt));
        assert!(cmp_to_bool(Ordering::Equal, Opcode::Ge));
        assert!(!cmp_to_bool(Ordering::Equal, Opcode::Lt));
    }

    #[test]
    fn branch_target_is_signed() {
        assert_eq!(branch_target(10, 2), 12);
        assert_eq!(branch_target(10, (-3i32) as Word), 7);
    }

    #[test]
    fn shift_counts_are_masked() {
        assert_eq!(bitwise_op(1, 1, Opcode::Shl), 2);
        assert_eq!(bitwise_op(-8, 1, Opcode::Shr), -4);
        // A pathological shift count must not abort execution.
        let _ = bitwise_op(1, 1 << 40, Opcode::Shl);
    }
}
