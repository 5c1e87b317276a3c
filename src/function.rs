use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::bytecode::Word;
use crate::value::Value;
use crate::vm::Vm;

/// A native extension function.
///
/// The callback writes its (script-visible) return value through the first
/// argument, which arrives as nil so that "return nothing" means "return
/// nil". The `i32` result is zero on success; any nonzero code aborts the
/// running program with an error naming the function. A callback may
/// re-enter the VM through [`Vm::call`], and may report a custom message
/// with [`Vm::set_error_message`] before returning its error code.
pub type NativeFn = fn(ret: &mut Value, args: &[Value], vm: &mut Vm) -> i32;

/// Placeholder name for functions without a source-level name.
pub const LAMBDA_NAME: &str = "<lambda>";

/// One compiled translation unit: the word stream of a top-level program
/// plus its lazily-populated local symbol table.
///
/// The symbol table is parsed from the trailing stream the first time the
/// program is entered; `symtab_read` flips before parsing so re-entry is a
/// no-op. Symbol-stub entries are overwritten in place once resolved.
pub struct ProgramUnit {
    code: Box<[Word]>,
    symtab: RefCell<Vec<Value>>,
    symtab_read: Cell<bool>,
}

impl ProgramUnit {
    pub(crate) fn new(code: Box<[Word]>) -> Self {
        Self {
            code,
            symtab: RefCell::new(Vec::new()),
            symtab_read: Cell::new(false),
        }
    }

    #[inline]
    pub fn code(&self) -> &[Word] {
        &self.code
    }

    #[inline]
    pub(crate) fn symtab(&self) -> &RefCell<Vec<Value>> {
        &self.symtab
    }

    #[inline]
    pub(crate) fn symtab_read(&self) -> bool {
        self.symtab_read.get()
    }

    #[inline]
    pub(crate) fn mark_symtab_read(&self) {
        self.symtab_read.set(true);
    }
}

impl fmt::Debug for ProgramUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramUnit")
            .field("words", &self.code.len())
            .field("symtab_read", &self.symtab_read.get())
            .finish()
    }
}

/// A callable.
///
/// Three shapes share this type: native host callbacks, script functions
/// (an entry offset into some program's bytecode, plus a back-reference to
/// that program for its symbol table), and top-level programs (which own
/// their [`ProgramUnit`]). A closure is a script function whose upvalue
/// table is populated.
///
/// The back-reference of a script function is weak, mirroring the
/// non-owning `env` of the original object model: a program's symbol table
/// stores its nested functions, so a strong reference here would knot the
/// unit into a cycle it could never leave.
pub struct Function {
    name: Rc<str>,
    repr: FuncRepr,
}

enum FuncRepr {
    Native(NativeFn),
    Script {
        /// Word offset of the function's header within its unit's code.
        entry: usize,
        env: Weak<ProgramUnit>,
        /// Populated for closures only.
        upvalues: Option<RefCell<Vec<Value>>>,
    },
    Program(Rc<ProgramUnit>),
}

impl Function {
    pub fn native(name: &str, f: NativeFn) -> Function {
        Function {
            name: Rc::from(name),
            repr: FuncRepr::Native(f),
        }
    }

    /// Wrap an already-decoded word stream as a top-level program function.
    /// The header lives at word 0; execution starts right behind it.
    pub fn program(name: &str, code: Vec<Word>) -> Function {
        Function {
            name: Rc::from(name),
            repr: FuncRepr::Program(Rc::new(ProgramUnit::new(code.into_boxed_slice()))),
        }
    }

    pub(crate) fn script(name: &str, entry: usize, env: &Rc<ProgramUnit>) -> Function {
        Function {
            name: Rc::from(name),
            repr: FuncRepr::Script {
                entry,
                env: Rc::downgrade(env),
                upvalues: None,
            },
        }
    }

    /// Build a closure over a script-function prototype with the given
    /// captured values. Returns `None` for native functions and programs,
    /// which cannot capture.
    pub(crate) fn closure_of(prototype: &Function, upvalues: Vec<Value>) -> Option<Function> {
        match &prototype.repr {
            FuncRepr::Script { entry, env, .. } => Some(Function {
                name: Rc::clone(&prototype.name),
                repr: FuncRepr::Script {
                    entry: *entry,
                    env: env.clone(),
                    upvalues: Some(RefCell::new(upvalues)),
                },
            }),
            _ => None,
        }
    }

    #[inline]
    pub fn name(&self) -> &Rc<str> {
        &self.name
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self.repr, FuncRepr::Native(_))
    }

    #[inline]
    pub fn is_program(&self) -> bool {
        matches!(self.repr, FuncRepr::Program(_))
    }

    #[inline]
    pub(crate) fn native_fn(&self) -> Option<NativeFn> {
        match self.repr {
            FuncRepr::Native(f) => Some(f),
            _ => None,
        }
    }

    /// Word offset of this function's header within its unit.
    #[inline]
    pub(crate) fn entry(&self) -> usize {
        match &self.repr {
            FuncRepr::Script { entry, .. } => *entry,
            _ => 0,
        }
    }

    /// The program unit this function executes in, if it is still alive.
    pub fn env_unit(&self) -> Option<Rc<ProgramUnit>> {
        match &self.repr {
            FuncRepr::Program(unit) => Some(Rc::clone(unit)),
            FuncRepr::Script { env, .. } => env.upgrade(),
            FuncRepr::Native(_) => None,
        }
    }

    #[inline]
    pub(crate) fn upvalues(&self) -> Option<&RefCell<Vec<Value>>> {
        match &self.repr {
            FuncRepr::Script { upvalues, .. } => upvalues.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.repr {
            FuncRepr::Native(_) => "native",
            FuncRepr::Script {
                upvalues: Some(_), ..
            } => "closure",
            FuncRepr::Script { .. } => "script",
            FuncRepr::Program(_) => "program",
        };
        write!(f, "Function({} {})", kind, self.name)
    }
}
