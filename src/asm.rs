//! Programmatic bytecode construction.
//!
//! [`ProgramBuilder`] assembles a top-level program in memory using the
//! same word constructors the compiler uses: instruction words, packed
//! argument octets, inline constants, nested function blocks, and the
//! trailing local-symbol-table stream. Jump targets are expressed as
//! labels bound after the fact, like any one-pass assembler.

use crate::bytecode::{
    self, mkins_a, mkins_ab, mkins_abc, mkins_long, mkins_mid, mkins_void, ConstKind, Opcode,
    SymEntryKind, UpvalKind, Word, FUNCHDR_LEN,
};
use crate::function::Function;
use crate::value::Value;

/// A forward-jump fixup: the body offset of the reserved offset word.
#[derive(Debug, Clone, Copy)]
#[must_use = "an unbound label leaves a zero jump offset behind"]
pub struct Label(usize);

enum SymEntry {
    Str(Vec<u8>),
    Stub(String),
    FuncDef { hdr_off: usize, name: String },
}

/// Builds one top-level program: body instructions first, symbol table
/// entries on the side, assembled into a single image by [`finish`].
///
/// [`finish`]: ProgramBuilder::finish
pub struct ProgramBuilder {
    body: Vec<Word>,
    nregs: u8,
    syms: Vec<SymEntry>,
}

impl ProgramBuilder {
    /// `nregs` is the register count of the top-level frame.
    pub fn new(nregs: u8) -> Self {
        Self {
            body: Vec::new(),
            nregs,
            syms: Vec::new(),
        }
    }

    // -------------------------
    // Raw emission
    // -------------------------

    fn emit(&mut self, word: Word) -> usize {
        self.body.push(word);
        self.body.len() - 1
    }

    /// Body offset the next instruction will land on.
    pub fn here(&self) -> usize {
        self.body.len()
    }

    pub fn op_void(&mut self, op: Opcode) {
        self.emit(mkins_void(op));
    }

    pub fn op_a(&mut self, op: Opcode, a: u8) {
        self.emit(mkins_a(op, a));
    }

    pub fn op_ab(&mut self, op: Opcode, a: u8, b: u8) {
        self.emit(mkins_ab(op, a, b));
    }

    pub fn op_abc(&mut self, op: Opcode, a: u8, b: u8, c: u8) {
        self.emit(mkins_abc(op, a, b, c));
    }

    // -------------------------
    // Constants and moves
    // -------------------------

    pub fn ld_nil(&mut self, dst: u8) {
        self.op_ab(Opcode::LdConst, dst, ConstKind::Nil as u8);
    }

    pub fn ld_bool(&mut self, dst: u8, value: bool) {
        let kind = if value { ConstKind::True } else { ConstKind::False };
        self.op_ab(Opcode::LdConst, dst, kind as u8);
    }

    pub fn ld_int(&mut self, dst: u8, value: i64) {
        self.op_ab(Opcode::LdConst, dst, ConstKind::Int as u8);
        for w in bytecode::int_to_words(value) {
            self.emit(w);
        }
    }

    pub fn ld_float(&mut self, dst: u8, value: f64) {
        self.op_ab(Opcode::LdConst, dst, ConstKind::Float as u8);
        for w in bytecode::float_to_words(value) {
            self.emit(w);
        }
    }

    pub fn mov(&mut self, dst: u8, src: u8) {
        self.op_ab(Opcode::Mov, dst, src);
    }

    pub fn ld_sym(&mut self, dst: u8, symidx: u16) {
        self.emit(mkins_mid(Opcode::LdSym, dst, symidx));
    }

    pub fn ld_upval(&mut self, dst: u8, upval_idx: u8) {
        self.op_ab(Opcode::LdUpval, dst, upval_idx);
    }

    // -------------------------
    // Control flow
    // -------------------------

    /// Emit an unconditional jump with an unbound target.
    pub fn jmp(&mut self) -> Label {
        self.op_void(Opcode::Jmp);
        Label(self.emit(0))
    }

    /// Emit a jump-if-false with an unbound target.
    pub fn jze(&mut self, cond: u8) -> Label {
        self.op_a(Opcode::Jze, cond);
        Label(self.emit(0))
    }

    /// Emit a jump-if-true with an unbound target.
    pub fn jnz(&mut self, cond: u8) -> Label {
        self.op_a(Opcode::Jnz, cond);
        Label(self.emit(0))
    }

    /// Point `label` at the current position.
    pub fn bind(&mut self, label: Label) {
        self.patch(label, self.here());
    }

    /// Point `label` at an arbitrary body offset (backward jumps).
    pub fn patch(&mut self, label: Label, target: usize) {
        // The offset is relative to the word after the offset word.
        let offset = target as i64 - (label.0 as i64 + 1);
        self.body[label.0] = offset as i32 as Word;
    }

    pub fn ret(&mut self, src: u8) {
        self.op_a(Opcode::Ret, src);
    }

    /// `dst = func(args...)`, argument registers packed after the word.
    pub fn call(&mut self, dst: u8, func: u8, args: &[u8]) {
        debug_assert!(args.len() <= u8::MAX as usize);
        self.op_abc(Opcode::Call, dst, func, args.len() as u8);
        let start = self.body.len();
        self.body
            .resize(start + bytecode::arg_pack_words(args.len()), 0);
        for (i, &reg) in args.iter().enumerate() {
            self.body[start + i / bytecode::WORD_OCTETS] |=
                (reg as Word) << (8 * (i % bytecode::WORD_OCTETS));
        }
    }

    // -------------------------
    // Globals, closures, functions
    // -------------------------

    /// Publish register `src` as the global `name`.
    pub fn glb_val(&mut self, src: u8, name: &str) {
        debug_assert!(name.len() <= u16::MAX as usize);
        self.emit(mkins_mid(Opcode::GlbVal, src, name.len() as u16));
        bytecode::pack_bytes(&mut self.body, name.as_bytes());
    }

    /// Turn the prototype in `reg` into a closure with the given captures.
    pub fn closure(&mut self, reg: u8, upvals: &[(UpvalKind, u8)]) {
        debug_assert!(upvals.len() <= u8::MAX as usize);
        self.op_ab(Opcode::Closure, reg, upvals.len() as u8);
        for &(kind, index) in upvals {
            // An upvalue descriptor mirrors the "A" instruction format:
            // capture kind in the opcode octet, slot index in operand A.
            self.emit(kind as Word | (index as Word) << 8);
        }
    }

    /// Emit a nested function block inline: the FUNCTION marker, a header,
    /// and the body produced by `f`. Returns the program-relative offset of
    /// the nested header, suitable for [`sym_func`].
    ///
    /// [`sym_func`]: ProgramBuilder::sym_func
    pub fn function(
        &mut self,
        decl_argc: u8,
        nregs: u8,
        f: impl FnOnce(&mut ProgramBuilder),
    ) -> usize {
        debug_assert!(decl_argc <= nregs);
        self.op_void(Opcode::Function);
        let hdr_pos = self.body.len();
        self.body.resize(hdr_pos + FUNCHDR_LEN, 0);
        let body_start = self.body.len();
        f(self);
        let body_len = self.body.len() - body_start;
        self.body[hdr_pos + bytecode::FUNCHDR_IDX_BODYLEN] = body_len as Word;
        self.body[hdr_pos + bytecode::FUNCHDR_IDX_ARGC] = decl_argc as Word;
        self.body[hdr_pos + bytecode::FUNCHDR_IDX_NREGS] = nregs as Word;
        self.body[hdr_pos + bytecode::FUNCHDR_IDX_SYMCNT] = 0;
        // Body offsets shift by the top-level header when the image is
        // assembled.
        FUNCHDR_LEN + hdr_pos
    }

    // -------------------------
    // Local symbol table
    // -------------------------

    /// Intern a string constant; returns its symbol index.
    pub fn sym_str(&mut self, s: &str) -> u16 {
        self.push_sym(SymEntry::Str(s.as_bytes().to_vec()))
    }

    /// Add an unresolved global reference; returns its symbol index.
    pub fn sym_stub(&mut self, name: &str) -> u16 {
        self.push_sym(SymEntry::Stub(name.to_string()))
    }

    /// Bind a nested function (by the header offset returned from
    /// [`function`]) to a symbol index.
    ///
    /// [`function`]: ProgramBuilder::function
    pub fn sym_func(&mut self, name: &str, hdr_off: usize) -> u16 {
        self.push_sym(SymEntry::FuncDef {
            hdr_off,
            name: name.to_string(),
        })
    }

    fn push_sym(&mut self, entry: SymEntry) -> u16 {
        self.syms.push(entry);
        debug_assert!(self.syms.len() <= u16::MAX as usize + 1);
        (self.syms.len() - 1) as u16
    }

    // -------------------------
    // Assembly
    // -------------------------

    /// Assemble the image and wrap it as a program function value.
    pub fn finish(self, name: &str) -> Value {
        let ProgramBuilder { body, nregs, syms } = self;

        let mut words = Vec::with_capacity(FUNCHDR_LEN + body.len());
        words.push(body.len() as Word);
        words.push(0); // no formal parameters for a top-level program
        words.push(nregs as Word);
        words.push(syms.len() as Word);
        words.extend_from_slice(&body);

        for sym in &syms {
            match sym {
                SymEntry::Str(bytes) => {
                    words.push(mkins_long(SymEntryKind::StrConst as u8, bytes.len() as u32));
                    bytecode::pack_bytes(&mut words, bytes);
                }
                SymEntry::Stub(name) => {
                    words.push(mkins_long(SymEntryKind::SymStub as u8, name.len() as u32));
                    bytecode::pack_bytes(&mut words, name.as_bytes());
                }
                SymEntry::FuncDef { hdr_off, name } => {
                    words.push(mkins_long(SymEntryKind::FuncDef as u8, name.len() as u32));
                    words.push(*hdr_off as Word);
                    words.push(name.len() as Word);
                    bytecode::pack_bytes(&mut words, name.as_bytes());
                }
            }
        }

        Value::Function(std::rc::Rc::new(Function::program(name, words)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{opa, opcode_byte, opmid};

    #[test]
    fn jump_offsets_are_relative_to_the_next_word() {
        let mut b = ProgramBuilder::new(2);
        let label = b.jmp(); // words 0 (ins) and 1 (offset)
        b.ld_nil(0); // word 2
        b.bind(label); // target = 3 => offset = 3 - 2 = 1
        b.ret(0);
        let Value::Function(prog) = b.finish("t") else {
            panic!("builder must produce a function");
        };
        let unit = prog.env_unit().expect("program owns its unit");
        let body = &unit.code()[FUNCHDR_LEN..];
        assert_eq!(opcode_byte(body[0]), Opcode::Jmp as u8);
        assert_eq!(body[1] as i32, 1);
    }

    #[test]
    fn nested_function_header_is_patched() {
        let mut b = ProgramBuilder::new(1);
        let hdr = b.function(2, 3, |fb| {
            fb.op_abc(Opcode::Add, 2, 0, 1);
            fb.ret(2);
        });
        b.ret(0);
        let Value::Function(prog) = b.finish("t") else {
            panic!("builder must produce a function");
        };
        let unit = prog.env_unit().expect("program owns its unit");
        let code = unit.code();
        // hdr is program-relative; the FUNCTION marker sits right before it.
        assert_eq!(opcode_byte(code[hdr - 1]), Opcode::Function as u8);
        assert_eq!(code[hdr + bytecode::FUNCHDR_IDX_BODYLEN], 2);
        assert_eq!(code[hdr + bytecode::FUNCHDR_IDX_ARGC], 2);
        assert_eq!(code[hdr + bytecode::FUNCHDR_IDX_NREGS], 3);
    }

    #[test]
    fn glbval_packs_the_name() {
        let mut b = ProgramBuilder::new(1);
        b.ld_int(0, 1);
        b.glb_val(0, "x");
        b.ret(0);
        let Value::Function(prog) = b.finish("t") else {
            panic!("builder must produce a function");
        };
        let unit = prog.env_unit().expect("program owns its unit");
        let body = &unit.code()[FUNCHDR_LEN..];
        // ldconst + 2 payload words, then glbval.
        assert_eq!(opcode_byte(body[3]), Opcode::GlbVal as u8);
        assert_eq!(opa(body[3]), 0);
        assert_eq!(opmid(body[3]), 1);
        let name = bytecode::read_packed_bytes(body, 4, 1).expect("in range");
        assert_eq!(name, b"x");
    }
}
