/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use super::Rule;
use crate::ast::*;
use crate::errors::AssemblyError;
use pest::iterators::Pair;

// Mnemonic dispatch tables, scanned case-insensitively. New mnemonics are
// added here and in the grammar without touching the builders.
const ALU_REG_OPS: &[(&str, AluRegOp)] = &[
    ("add", AluRegOp::Add),
    ("sub", AluRegOp::Sub),
    ("sll", AluRegOp::Sll),
    ("slt", AluRegOp::Slt),
    ("sltu", AluRegOp::Sltu),
    ("xor", AluRegOp::Xor),
    ("srl", AluRegOp::Srl),
    ("sra", AluRegOp::Sra),
    ("or", AluRegOp::Or),
    ("and", AluRegOp::And),
    ("mul", AluRegOp::Mul),
    ("mulh", AluRegOp::Mulh),
    ("mulu", AluRegOp::Mulu),
    ("mulhu", AluRegOp::Mulhu),
    ("div", AluRegOp::Div),
    ("divu", AluRegOp::Divu),
    ("rem", AluRegOp::Rem),
    ("remu", AluRegOp::Remu),
];

const ALU_IMM_OPS: &[(&str, AluImmOp)] = &[
    ("addi", AluImmOp::Addi),
    ("slti", AluImmOp::Slti),
    ("sltiu", AluImmOp::Sltiu),
    ("xori", AluImmOp::Xori),
    ("ori", AluImmOp::Ori),
    ("andi", AluImmOp::Andi),
    ("slli", AluImmOp::Slli),
    ("srli", AluImmOp::Srli),
    ("srai", AluImmOp::Srai),
];

const LDST_OPS: &[(&str, MemOp)] = &[
    ("lb", MemOp::Lb),
    ("lh", MemOp::Lh),
    ("lw", MemOp::Lw),
    ("lbu", MemOp::Lbu),
    ("lhu", MemOp::Lhu),
    ("sb", MemOp::Sb),
    ("sh", MemOp::Sh),
    ("sw", MemOp::Sw),
];

const BRANCH_OPS: &[(&str, BranchOp)] = &[
    ("beq", BranchOp::Beq),
    ("bne", BranchOp::Bne),
    ("blt", BranchOp::Blt),
    ("bge", BranchOp::Bge),
    ("bltu", BranchOp::Bltu),
    ("bgeu", BranchOp::Bgeu),
    ("bgt", BranchOp::Bgt),
    ("ble", BranchOp::Ble),
    ("bgtu", BranchOp::Bgtu),
    ("bleu", BranchOp::Bleu),
];

const BRANCH_ZERO_OPS: &[(&str, BranchZeroOp)] = &[
    ("beqz", BranchZeroOp::Beqz),
    ("bnez", BranchZeroOp::Bnez),
    ("blez", BranchZeroOp::Blez),
    ("bgez", BranchZeroOp::Bgez),
    ("bltz", BranchZeroOp::Bltz),
    ("bgtz", BranchZeroOp::Bgtz),
];

const PSEUDO_OPS: &[(&str, PseudoOp)] = &[
    ("mv", PseudoOp::Mv),
    ("not", PseudoOp::Not),
    ("neg", PseudoOp::Neg),
    ("seqz", PseudoOp::Seqz),
    ("snez", PseudoOp::Snez),
    ("sltz", PseudoOp::Sltz),
    ("sgtz", PseudoOp::Sgtz),
];

const UPPER_OPS: &[(&str, UpperOp)] =
    &[("lui", UpperOp::Lui), ("auipc", UpperOp::Auipc)];

const CSR_OPS: &[(&str, CsrOp)] = &[
    ("csrrw", CsrOp::Csrrw),
    ("csrrs", CsrOp::Csrrs),
    ("csrrc", CsrOp::Csrrc),
];

const CSR_IMM_OPS: &[(&str, CsrOp)] = &[
    ("csrrwi", CsrOp::Csrrw),
    ("csrrsi", CsrOp::Csrrs),
    ("csrrci", CsrOp::Csrrc),
];

fn lookup<T: Copy>(table: &[(&str, T)], mnemonic: &str) -> T {
    let lower = mnemonic.to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, op)| *op)
        .unwrap() // the grammar only matches mnemonics present in the table
}

fn build_reg(
    pair: Pair<Rule>,
    line: usize,
    what: &str,
) -> Result<Reg, AssemblyError> {
    Reg::parse(pair.as_str())
        .ok_or_else(|| AssemblyError::semantic(line, format!("Invalid {}", what)))
}

fn build_csr(pair: Pair<Rule>, line: usize) -> Result<Csr, AssemblyError> {
    Csr::parse(pair.as_str())
        .ok_or_else(|| AssemblyError::semantic(line, "Invalid CSR"))
}

fn unescape_byte(b: u8) -> u8 {
    match b {
        b'n' => b'\n',
        b't' => b'\t',
        b'r' => b'\r',
        b'b' => 0x08,
        b'f' => 0x0C,
        b'a' => 0x07,
        b'0' => 0,
        other => other, // \\ \' \"
    }
}

fn digits_value(digits: &str, base: u32) -> u32 {
    digits.bytes().fold(0u32, |acc, b| {
        let d = (b as char).to_digit(base).unwrap();
        acc.wrapping_mul(base).wrapping_add(d)
    })
}

fn char_value(pair: Pair<Rule>) -> u32 {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::escape => unescape_byte(inner.as_str().as_bytes()[1]) as u32,
        _ => inner.as_str().chars().next().unwrap() as u32,
    }
}

// Signs accumulate; the magnitude wraps through u32 so full-width hex
// constants like 0xFFFFFFFF come out as their two's-complement value.
pub(super) fn build_number(pair: Pair<Rule>) -> i32 {
    let mut negative = false;
    let mut value: u32 = 0;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::sign => {
                if part.as_str() == "-" {
                    negative = !negative;
                }
            }
            Rule::dec_literal => value = digits_value(part.as_str(), 10),
            Rule::hex_literal => value = digits_value(&part.as_str()[2..], 16),
            Rule::bin_literal => value = digits_value(&part.as_str()[2..], 2),
            Rule::char_literal => value = char_value(part),
            _ => unreachable!(),
        }
    }
    if negative {
        value = value.wrapping_neg();
    }
    value as i32
}

fn build_string(pair: Pair<Rule>) -> Vec<u8> {
    let inner = pair.into_inner().next().unwrap();
    let raw = inner.as_str().as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            out.push(unescape_byte(raw[i + 1]));
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

fn check_range(
    value: i32,
    min: i64,
    max: i64,
    line: usize,
    reason: &str,
) -> Result<(), AssemblyError> {
    let v = value as i64;
    if v < min || v > max {
        return Err(AssemblyError::semantic(line, reason));
    }
    Ok(())
}

fn build_imm12(pair: Pair<Rule>, line: usize) -> Result<i32, AssemblyError> {
    let imm = build_number(pair);
    check_range(imm, -2048, 2047, line, "Out of bounds imm")?;
    Ok(imm)
}

pub(super) fn build_instruction(
    pair: Pair<Rule>,
    line: usize,
) -> Result<Instruction, AssemblyError> {
    let rule = pair.as_rule();
    match rule {
        Rule::alu_reg => {
            let mut it = pair.into_inner();
            let op = lookup(ALU_REG_OPS, it.next().unwrap().as_str());
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let rs1 = build_reg(it.next().unwrap(), line, "rs1")?;
            let rs2 = build_reg(it.next().unwrap(), line, "rs2")?;
            Ok(Instruction::AluReg(op, rd, rs1, rs2))
        }
        Rule::alu_imm => {
            let mut it = pair.into_inner();
            let op = lookup(ALU_IMM_OPS, it.next().unwrap().as_str());
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let rs1 = build_reg(it.next().unwrap(), line, "rs1")?;
            let imm = build_imm12(it.next().unwrap(), line)?;
            Ok(Instruction::AluImm(op, rd, rs1, imm))
        }
        Rule::ldst => {
            let mut it = pair.into_inner();
            let op = lookup(LDST_OPS, it.next().unwrap().as_str());
            let rreg = build_reg(it.next().unwrap(), line, "rreg")?;
            let imm = build_imm12(it.next().unwrap(), line)?;
            let rmem = build_reg(it.next().unwrap(), line, "rmem")?;
            Ok(Instruction::LoadStore(op, rreg, imm, rmem))
        }
        Rule::branch => {
            let mut it = pair.into_inner();
            let op = lookup(BRANCH_OPS, it.next().unwrap().as_str());
            let rs1 = build_reg(it.next().unwrap(), line, "rs1")?;
            let rs2 = build_reg(it.next().unwrap(), line, "rs2")?;
            let target = it.next().unwrap().as_str().to_string();
            Ok(Instruction::Branch(op, rs1, rs2, target))
        }
        Rule::branch_zero => {
            let mut it = pair.into_inner();
            let op = lookup(BRANCH_ZERO_OPS, it.next().unwrap().as_str());
            let rs = build_reg(it.next().unwrap(), line, "rs")?;
            let target = it.next().unwrap().as_str().to_string();
            Ok(Instruction::BranchZero(op, rs, target))
        }
        Rule::alu_pseudo => {
            let mut it = pair.into_inner();
            let op = lookup(PSEUDO_OPS, it.next().unwrap().as_str());
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let rs = build_reg(it.next().unwrap(), line, "rs")?;
            Ok(Instruction::AluPseudo(op, rd, rs))
        }
        Rule::jal_insn => {
            let ops: Vec<_> = pair
                .into_inner()
                .filter(|p| p.as_rule() != Rule::jal_kw)
                .collect();
            match ops.len() {
                1 => Ok(Instruction::Jal(Reg::RA, ops[0].as_str().to_string())),
                _ => {
                    let target = ops[1].as_str().to_string();
                    let rd = build_reg(ops.into_iter().next().unwrap(), line, "rd")?;
                    Ok(Instruction::Jal(rd, target))
                }
            }
        }
        Rule::j_insn => {
            let target = pair
                .into_inner()
                .find(|p| p.as_rule() == Rule::ident)
                .unwrap()
                .as_str()
                .to_string();
            Ok(Instruction::Jal(Reg::ZERO, target))
        }
        Rule::jalr_insn => {
            let mut it =
                pair.into_inner().filter(|p| p.as_rule() != Rule::jalr_kw);
            let first = build_reg(it.next().unwrap(), line, "register")?;
            match it.next() {
                // bare "jalr rs" links through ra
                None => Ok(Instruction::Jalr(Reg::RA, first, 0)),
                Some(sub) => match sub.as_rule() {
                    Rule::jalr_mem => {
                        let mut inner = sub.into_inner();
                        let imm = build_number(inner.next().unwrap());
                        let rs = build_reg(inner.next().unwrap(), line, "rs")?;
                        check_range(imm, -2048, 2047, line, "Immediate out of range")?;
                        Ok(Instruction::Jalr(first, rs, imm))
                    }
                    Rule::jalr_paren => {
                        let rs = build_reg(
                            sub.into_inner().next().unwrap(),
                            line,
                            "rs",
                        )?;
                        Ok(Instruction::Jalr(first, rs, 0))
                    }
                    _ => {
                        let mut inner = sub.into_inner();
                        let rs = build_reg(inner.next().unwrap(), line, "rs")?;
                        let imm = build_number(inner.next().unwrap());
                        check_range(imm, -2048, 2047, line, "Immediate out of range")?;
                        Ok(Instruction::Jalr(first, rs, imm))
                    }
                },
            }
        }
        Rule::jr_insn => {
            let rs = build_reg(
                pair.into_inner()
                    .find(|p| p.as_rule() == Rule::reg)
                    .unwrap(),
                line,
                "rs",
            )?;
            Ok(Instruction::Jalr(Reg::ZERO, rs, 0))
        }
        Rule::ret_insn => Ok(Instruction::Jalr(Reg::ZERO, Reg::RA, 0)),
        Rule::upper => {
            let mut it = pair.into_inner();
            let op = lookup(UPPER_OPS, it.next().unwrap().as_str());
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let imm = build_number(it.next().unwrap());
            // the immediate can either be signed or unsigned 20 bit
            check_range(imm, -524288, 1048575, line, "Out of bounds imm")?;
            Ok(Instruction::Upper(op, rd, imm))
        }
        Rule::li_insn => {
            let mut it =
                pair.into_inner().filter(|p| p.as_rule() != Rule::li_kw);
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let imm = build_number(it.next().unwrap());
            Ok(Instruction::Li(rd, imm))
        }
        Rule::la_insn => {
            let mut it =
                pair.into_inner().filter(|p| p.as_rule() != Rule::la_kw);
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let target = it.next().unwrap().as_str().to_string();
            Ok(Instruction::La(rd, target))
        }
        Rule::ecall_insn => Ok(Instruction::Ecall),
        Rule::sret_insn => Ok(Instruction::Sret),
        Rule::csr_insn => {
            let mut it = pair.into_inner();
            let op = lookup(CSR_OPS, it.next().unwrap().as_str());
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let csr = build_csr(it.next().unwrap(), line)?;
            let rs = build_reg(it.next().unwrap(), line, "rs")?;
            Ok(Instruction::Csr(op, rd, csr, rs))
        }
        Rule::csr_imm_insn => {
            let mut it = pair.into_inner();
            let op = lookup(CSR_IMM_OPS, it.next().unwrap().as_str());
            let rd = build_reg(it.next().unwrap(), line, "rd")?;
            let csr = build_csr(it.next().unwrap(), line)?;
            let zimm = build_number(it.next().unwrap());
            Ok(Instruction::CsrImm(op, rd, csr, zimm))
        }
        _ => unreachable!("unexpected instruction rule {:?}", rule),
    }
}

fn build_values(
    pair: Pair<Rule>,
    min: i64,
    max: i64,
    line: usize,
    reason: &str,
) -> Result<Vec<i32>, AssemblyError> {
    let mut values = Vec::new();
    for number in pair.into_inner() {
        let v = build_number(number);
        check_range(v, min, max, line, reason)?;
        values.push(v);
    }
    Ok(values)
}

fn build_strings(pair: Pair<Rule>) -> Vec<Vec<u8>> {
    pair.into_inner().map(build_string).collect()
}

pub(super) fn build_directive(
    pair: Pair<Rule>,
    line: usize,
) -> Result<Directive, AssemblyError> {
    match pair.as_rule() {
        Rule::section_dir => {
            let name = pair
                .into_inner()
                .find(|p| p.as_rule() == Rule::ident)
                .unwrap()
                .as_str()
                .to_string();
            Ok(Directive::Section(name))
        }
        Rule::text_dir => Ok(Directive::Text),
        Rule::data_dir => Ok(Directive::Data),
        Rule::globl_dir => {
            let name = pair
                .into_inner()
                .find(|p| p.as_rule() == Rule::ident)
                .unwrap()
                .as_str()
                .to_string();
            Ok(Directive::Globl(name))
        }
        Rule::byte_dir => {
            let list = pair.into_inner().nth(1).unwrap();
            Ok(Directive::Byte(build_values(
                list,
                -128,
                255,
                line,
                "Out of bounds byte",
            )?))
        }
        Rule::half_dir => {
            let list = pair.into_inner().nth(1).unwrap();
            Ok(Directive::Half(build_values(
                list,
                -32768,
                65535,
                line,
                "Out of bounds half",
            )?))
        }
        Rule::word_dir => {
            let list = pair.into_inner().nth(1).unwrap();
            Ok(Directive::Word(build_values(
                list,
                i32::MIN as i64,
                u32::MAX as i64,
                line,
                "Out of bounds word",
            )?))
        }
        Rule::ascii_dir => {
            let list = pair.into_inner().nth(1).unwrap();
            Ok(Directive::Ascii(build_strings(list)))
        }
        Rule::asciz_dir => {
            let list = pair.into_inner().nth(1).unwrap();
            Ok(Directive::Asciz(build_strings(list)))
        }
        other => unreachable!("unexpected directive rule {:?}", other),
    }
}
