//! Bytecode listing for debugging.
//!
//! Renders an instruction stream word by word: mnemonics, operands, inline
//! payloads, nested function headers, and (for a top-level program) the
//! trailing local-symbol-table stream. Purely an inspection aid; execution
//! never goes through here.

use std::fmt::Write as _;

use crate::bytecode::{
    self, opa, opb, opc, opcode_byte, opmid, oplong, ConstKind, Opcode, SymEntryKind, Word,
    FUNCHDR_IDX_ARGC, FUNCHDR_IDX_BODYLEN, FUNCHDR_IDX_NREGS, FUNCHDR_IDX_SYMCNT, FUNCHDR_LEN,
};
use crate::function::Function;

/// Disassemble a whole program function.
///
/// Returns an empty listing for native functions, which have no bytecode.
pub fn disassemble(func: &Function) -> String {
    let Some(unit) = func.env_unit() else {
        return String::new();
    };
    let code = unit.code();
    let mut out = String::new();

    let bodylen = code.first().copied().unwrap_or(0) as usize;
    let _ = writeln!(out, "; program {}", func.name());
    render_header(&mut out, code, 0);

    let body_end = (FUNCHDR_LEN + bodylen).min(code.len());
    let mut ip = FUNCHDR_LEN;
    while ip < body_end {
        ip = render_instruction(&mut out, code, ip);
    }

    let symcount = code.get(FUNCHDR_IDX_SYMCNT).copied().unwrap_or(0) as usize;
    if symcount > 0 {
        let _ = writeln!(out, "; local symbols ({})", symcount);
        render_symtab(&mut out, code, body_end, symcount);
    }

    out
}

fn render_header(out: &mut String, code: &[Word], at: usize) {
    if at + FUNCHDR_LEN > code.len() {
        let _ = writeln!(out, "{:#010x}  <truncated header>", at);
        return;
    }
    let _ = writeln!(
        out,
        "{:#010x}  .func body={} argc={} nregs={} syms={}",
        at,
        code[at + FUNCHDR_IDX_BODYLEN],
        code[at + FUNCHDR_IDX_ARGC],
        code[at + FUNCHDR_IDX_NREGS],
        code[at + FUNCHDR_IDX_SYMCNT],
    );
}

/// Render one instruction (with its payload) and return the next offset.
fn render_instruction(out: &mut String, code: &[Word], at: usize) -> usize {
    let ins = code[at];
    let mut ip = at + 1;

    let Some(op) = Opcode::from_u8(opcode_byte(ins)) else {
        let _ = writeln!(out, "{:#010x}  .word {:#010x}", at, ins);
        return ip;
    };

    match op {
        Opcode::Call => {
            let argc = opc(ins) as usize;
            let mut args = Vec::with_capacity(argc);
            let pack_end = ip + bytecode::arg_pack_words(argc);
            if pack_end <= code.len() {
                for i in 0..argc {
                    args.push(format!("r{}", bytecode::nth_arg_idx(code, ip, i)));
                }
            }
            let _ = writeln!(
                out,
                "{:#010x}  call r{}, r{} ({})",
                at,
                opa(ins),
                opb(ins),
                args.join(", ")
            );
            ip = pack_end;
        }
        Opcode::Ret => {
            let _ = writeln!(out, "{:#010x}  ret r{}", at, opa(ins));
        }
        Opcode::Jmp => {
            let off = code.get(ip).copied().unwrap_or(0) as i32;
            let _ = writeln!(out, "{:#010x}  jmp {:+} ; -> {:#010x}", at, off, target(ip + 1, off));
            ip += 1;
        }
        Opcode::Jze | Opcode::Jnz => {
            let off = code.get(ip).copied().unwrap_or(0) as i32;
            let _ = writeln!(
                out,
                "{:#010x}  {} r{}, {:+} ; -> {:#010x}",
                at,
                op.mnemonic(),
                opa(ins),
                off,
                target(ip + 1, off)
            );
            ip += 1;
        }
        Opcode::LdConst => {
            match ConstKind::from_u8(opb(ins)) {
                Some(ConstKind::Nil) => {
                    let _ = writeln!(out, "{:#010x}  ldconst r{}, nil", at, opa(ins));
                }
                Some(ConstKind::True) => {
                    let _ = writeln!(out, "{:#010x}  ldconst r{}, true", at, opa(ins));
                }
                Some(ConstKind::False) => {
                    let _ = writeln!(out, "{:#010x}  ldconst r{}, false", at, opa(ins));
                }
                Some(ConstKind::Int) if ip + bytecode::INT_WORDS <= code.len() => {
                    let v = bytecode::read_i64(code, ip);
                    let _ = writeln!(out, "{:#010x}  ldconst r{}, {}", at, opa(ins), v);
                    ip += bytecode::INT_WORDS;
                }
                Some(ConstKind::Float) if ip + bytecode::FLOAT_WORDS <= code.len() => {
                    let v = bytecode::read_f64(code, ip);
                    let _ = writeln!(out, "{:#010x}  ldconst r{}, {}", at, opa(ins), v);
                    ip += bytecode::FLOAT_WORDS;
                }
                _ => {
                    let _ = writeln!(out, "{:#010x}  ldconst r{}, <bad payload>", at, opa(ins));
                }
            };
        }
        Opcode::LdSym => {
            let _ = writeln!(out, "{:#010x}  ldsym r{}, sym#{}", at, opa(ins), opmid(ins));
        }
        Opcode::Function => {
            // Nested definition: show its header and fall through into the
            // body, which ends where the outer code resumes.
            render_header(out, code, ip);
            ip += FUNCHDR_LEN;
        }
        Opcode::GlbVal => {
            let len = opmid(ins) as usize;
            let name = bytecode::read_packed_bytes(code, ip, len)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_else(|| "<bad name>".into());
            let _ = writeln!(out, "{:#010x}  glbval r{}, \"{}\"", at, opa(ins), name);
            ip += bytecode::packed_words(len);
        }
        Opcode::Closure => {
            let n = opb(ins) as usize;
            let mut descs = Vec::with_capacity(n);
            for i in 0..n {
                match code.get(ip + i) {
                    Some(&d) if opcode_byte(d) == 0 => descs.push(format!("local r{}", opa(d))),
                    Some(&d) => descs.push(format!("outer #{}", opa(d))),
                    None => descs.push("<truncated>".into()),
                }
            }
            let _ = writeln!(
                out,
                "{:#010x}  closure r{} [{}]",
                at,
                opa(ins),
                descs.join(", ")
            );
            ip += n;
        }
        Opcode::LdUpval | Opcode::Mov | Opcode::Neg | Opcode::BitNot | Opcode::LogNot
        | Opcode::SizeOf | Opcode::TypeOf | Opcode::NthArg => {
            let _ = writeln!(
                out,
                "{:#010x}  {} r{}, r{}",
                at,
                op.mnemonic(),
                opa(ins),
                opb(ins)
            );
        }
        Opcode::Inc | Opcode::Dec | Opcode::LdArgc | Opcode::NewArr => {
            let _ = writeln!(out, "{:#010x}  {} r{}", at, op.mnemonic(), opa(ins));
        }
        _ => {
            // The three-register family: arithmetic, comparison, bitwise,
            // concat, array access, vararg access.
            let _ = writeln!(
                out,
                "{:#010x}  {} r{}, r{}, r{}",
                at,
                op.mnemonic(),
                opa(ins),
                opb(ins),
                opc(ins)
            );
        }
    }

    ip
}

fn render_symtab(out: &mut String, code: &[Word], mut p: usize, symcount: usize) {
    for idx in 0..symcount {
        let Some(&ins) = code.get(p) else {
            let _ = writeln!(out, "; sym#{} <truncated>", idx);
            return;
        };
        p += 1;
        match SymEntryKind::from_u8(opcode_byte(ins)) {
            Some(SymEntryKind::StrConst) => {
                let len = oplong(ins) as usize;
                let text = bytecode::read_packed_bytes(code, p, len)
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_else(|| "<truncated>".into());
                let _ = writeln!(out, "; sym#{} strconst \"{}\"", idx, text);
                p += bytecode::packed_words(len);
            }
            Some(SymEntryKind::SymStub) => {
                let len = oplong(ins) as usize;
                let name = bytecode::read_packed_bytes(code, p, len)
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_else(|| "<truncated>".into());
                let _ = writeln!(out, "; sym#{} symstub {}", idx, name);
                p += bytecode::packed_words(len);
            }
            Some(SymEntryKind::FuncDef) => {
                let hdr_off = code.get(p).copied().unwrap_or(0);
                let namelen = code.get(p + 1).copied().unwrap_or(0) as usize;
                p += 2;
                let name = bytecode::read_packed_bytes(code, p, namelen)
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_else(|| "<truncated>".into());
                let _ = writeln!(out, "; sym#{} funcdef {} @ {:#010x}", idx, name, hdr_off);
                p += bytecode::packed_words(namelen);
            }
            None => {
                let _ = writeln!(out, "; sym#{} <unknown kind {:#04x}>", idx, opcode_byte(ins));
                return;
            }
        }
    }
}

#[inline]
fn target(next: usize, off: i32) -> usize {
    (next as i64 + off as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::ProgramBuilder;
    use crate::value::Value;

    #[test]
    fn listing_covers_instructions_and_symbols() {
        let mut b = ProgramBuilder::new(3);
        let s = b.sym_str("hello");
        let stub = b.sym_stub("print");
        b.ld_sym(0, s);
        b.ld_sym(1, stub);
        b.ld_int(2, 42);
        b.call(0, 1, &[2]);
        b.ret(0);
        let Value::Function(prog) = b.finish("demo") else {
            panic!("builder must produce a function");
        };

        let listing = disassemble(&prog);
        assert!(listing.contains("; program demo"));
        assert!(listing.contains("ldconst r2, 42"));
        assert!(listing.contains("call r0, r1 (r2)"));
        assert!(listing.contains("strconst \"hello\""));
        assert!(listing.contains("symstub print"));
    }

    #[test]
    fn jump_targets_are_annotated() {
        let mut b = ProgramBuilder::new(1);
        b.ld_bool(0, true);
        let l = b.jnz(0);
        b.ld_nil(0);
        b.bind(l);
        b.ret(0);
        let Value::Function(prog) = b.finish("jumps") else {
            panic!("builder must produce a function");
        };
        let listing = disassemble(&prog);
        assert!(listing.contains("jnz r0"));
    }
}
