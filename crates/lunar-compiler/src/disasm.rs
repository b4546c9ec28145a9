/// Bytecode disassembler (luac -l style output).
use crate::opcode::{sc2int, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use lunar_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete Proto into a human-readable string.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);

    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function <{}:{}> ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.line_defined,
        proto.last_line_defined,
        proto.num_params,
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        disasm_instruction(out, pc, inst, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}\t{}\t", i).unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }

    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalues.len()).unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            let name = up
                .name
                .map(|id| strings.display(id).into_owned())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                name,
                if up.in_stack { 1 } else { 0 },
                up.index
            )
            .unwrap();
        }
    }

    if !proto.local_vars.is_empty() {
        writeln!(out, "{indent}locals ({}):", proto.local_vars.len()).unwrap();
        for (i, var) in proto.local_vars.iter().enumerate() {
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                strings.display(var.name),
                var.start_pc + 1,
                var.end_pc + 1
            )
            .unwrap();
        }
    }

    for (i, p) in proto.protos.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Disassemble the instruction at `pc` into the output string.
pub fn disasm_instruction(
    out: &mut String,
    pc: usize,
    inst: &Instruction,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IABC => {
            write!(out, "{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            if inst.k() {
                write!(out, " k").unwrap();
            }
            match op {
                OpCode::GetField | OpCode::GetTabUp => {
                    // C names the string key's constant slot
                    if let Some(k) = proto.constants.get(inst.c() as usize) {
                        write!(out, "\t; ").unwrap();
                        format_constant(out, k, strings);
                    }
                }
                OpCode::SetField | OpCode::SetTabUp => {
                    // the key sits in B for stores
                    if let Some(k) = proto.constants.get(inst.b() as usize) {
                        write!(out, "\t; ").unwrap();
                        format_constant(out, k, strings);
                    }
                }
                OpCode::AddI | OpCode::ShrI | OpCode::ShlI | OpCode::EqI | OpCode::LtI
                | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                    write!(out, "\t; imm {}", sc2int(inst.c())).unwrap();
                }
                _ => {}
            }
        }
        InstructionFormat::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            match op {
                OpCode::LoadK => {
                    if let Some(k) = proto.constants.get(inst.bx() as usize) {
                        write!(out, "\t; ").unwrap();
                        format_constant(out, k, strings);
                    }
                }
                OpCode::Closure => {
                    write!(out, "\t; function [{}]", inst.bx()).unwrap();
                }
                OpCode::ForLoop | OpCode::TForLoop => {
                    // backward jump
                    write!(out, "\t; to {}", pc as i64 - inst.bx() as i64 + 2).unwrap();
                }
                OpCode::ForPrep | OpCode::TForPrep => {
                    write!(out, "\t; to {}", pc as i64 + inst.bx() as i64 + 2).unwrap();
                }
                _ => {}
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
        }
        InstructionFormat::IAx => {
            write!(out, "{}", inst.ax_field()).unwrap();
        }
        InstructionFormat::IsJ => {
            let sj = inst.get_sj();
            // printed targets are 1-based like the pc column
            write!(out, "{sj}\t; to {}", pc as i64 + sj as i64 + 2).unwrap();
        }
    }
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Integer(i) => write!(out, "{i}").unwrap(),
        Constant::Float(f) => write!(out, "{f}").unwrap(),
        Constant::String(id) => {
            let bytes = strings.get_bytes(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                write!(out, "\"{s}\"").unwrap();
            } else {
                write!(out, "<binary string>").unwrap();
            }
        }
    }
}
