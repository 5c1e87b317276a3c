//! sparkling-vm
//!
//! The execution core of the Sparkling scripting language: a register-based
//! bytecode interpreter with a dynamically grown call stack, per-program
//! symbol tables resolved lazily against the global table, closures with
//! upvalues, and a native-function interface for host embedding.
//!
//! The compiler, parser, and standard library live elsewhere; this crate
//! consumes their stable bytecode format (see [`bytecode`]) and exposes the
//! host API on [`Vm`]. Programs can be loaded from a byte image
//! ([`bytecode::load_program_bytes`]) or built in memory with
//! [`asm::ProgramBuilder`].
//!
//! ```
//! use sparkling_vm::{asm::ProgramBuilder, Value, Vm};
//!
//! let mut b = ProgramBuilder::new(1);
//! b.ld_int(0, 21);
//! b.op_abc(sparkling_vm::bytecode::Opcode::Add, 0, 0, 0);
//! b.ret(0);
//! let program = b.finish("<top-level>");
//!
//! let mut vm = Vm::new();
//! let result = vm.call(&program, &[]).expect("program runs");
//! assert!(matches!(result, Value::Int(42)));
//! ```

pub mod array;
pub mod asm;
pub mod bytecode;
pub mod disasm;
pub mod error;
pub mod function;
pub mod value;
pub mod vm;

pub use array::Array;
pub use error::{ErrorKind, RuntimeError};
pub use function::{Function, NativeFn, ProgramUnit, LAMBDA_NAME};
pub use value::{compare_values, values_comparable, values_equal, Str, Value};
pub use vm::Vm;
