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

pub mod encoder;
pub mod symbol_table;

use crate::ast::{Directive, Instruction, PseudoOp, Reg, SourceLine};
use crate::errors::AssemblyError;
use crate::memory::{
    AssemblySections, MemoryMap, RelocKind, Relocation, SectionId, TEXT_BASE,
};
use symbol_table::{Label, Symbol, SymbolTable};

/// A fully assembled (or loaded) image: the populated memory map plus the
/// symbol information the emitter, codec and backtrace printer consume.
#[derive(Debug, Clone)]
pub struct Program {
    pub memory: MemoryMap,
    pub labels: Vec<Label>,
    pub globals: Vec<String>,
    pub externs: Vec<String>,
    /// Source line of each 32-bit word emitted into `.text`.
    pub text_lines: Vec<u32>,
    pub entry: u32,
    pub supervisor_entry: bool,
}

#[derive(Clone, Copy)]
struct SectionIds {
    text: SectionId,
    data: SectionId,
    kernel_text: SectionId,
}

/// Pass two is a replay of the same statement list with the label table
/// frozen, so pass one only needs to predict sizes and record labels.
pub fn assemble_lines(
    lines: &[SourceLine],
    allow_externs: bool,
) -> Result<Program, AssemblyError> {
    let fixed = AssemblySections::new();
    let mut memory = fixed.map;
    let ids = SectionIds {
        text: fixed.text,
        data: fixed.data,
        kernel_text: fixed.kernel_text,
    };

    let mut labels = symbol_table::builtin_labels(fixed.mmio);
    let mut symbols = symbol_table::symbol_table_from(&labels);
    let mut globals: Vec<String> = Vec::new();

    layout_pass(lines, &memory, ids, &mut labels, &mut symbols, &mut globals)?;

    let mut emitter = Emitter {
        memory: &mut memory,
        symbols: &symbols,
        externs: Vec::new(),
        text_lines: Vec::new(),
        allow_externs,
        current: ids.text,
        text: ids.text,
    };
    emitter.run(lines, ids)?;
    let Emitter { externs, text_lines, .. } = emitter;

    let (entry, supervisor_entry) = resolve_entry(&symbols, &globals, ids)?;

    Ok(Program {
        memory,
        labels,
        globals,
        externs,
        text_lines,
        entry,
        supervisor_entry,
    })
}

/// Bytes the instruction will occupy. `li` grows to two words when its
/// immediate does not fit the addi range; `la` is always auipc+addi.
pub fn instruction_size(insn: &Instruction) -> u32 {
    match insn {
        Instruction::Li(_, imm) => {
            if (-2048..=2047).contains(imm) {
                4
            } else {
                8
            }
        }
        Instruction::La(..) => 8,
        _ => 4,
    }
}

fn layout_pass(
    lines: &[SourceLine],
    memory: &MemoryMap,
    ids: SectionIds,
    labels: &mut Vec<Label>,
    symbols: &mut SymbolTable,
    globals: &mut Vec<String>,
) -> Result<(), AssemblyError> {
    let mut cursors = vec![0u32; memory.sections.len()];
    let mut current = ids.text;

    for line in lines {
        if let Some(name) = &line.label {
            if symbols.contains_key(name) {
                return Err(AssemblyError::semantic(
                    line.line_number,
                    "Multiple definitions for the same label",
                ));
            }
            let address = memory.get(current).base + cursors[current.0];
            symbols
                .insert(name.clone(), Symbol { address, section: current });
            labels.push(Label {
                name: name.clone(),
                address,
                section: current,
            });
        }

        if let Some(directive) = &line.directive {
            match directive {
                Directive::Section(name) => {
                    current = memory.find_by_name(name).ok_or_else(|| {
                        AssemblyError::structural(
                            line.line_number,
                            "Section not found",
                        )
                    })?;
                }
                Directive::Text => current = ids.text,
                Directive::Data => current = ids.data,
                Directive::Globl(name) => globals.push(name.clone()),
                Directive::Byte(values) => {
                    cursors[current.0] += values.len() as u32
                }
                Directive::Half(values) => {
                    cursors[current.0] += 2 * values.len() as u32
                }
                Directive::Word(values) => {
                    cursors[current.0] += 4 * values.len() as u32
                }
                Directive::Ascii(strings) => {
                    cursors[current.0] +=
                        strings.iter().map(|s| s.len() as u32).sum::<u32>()
                }
                Directive::Asciz(strings) => {
                    cursors[current.0] +=
                        strings.iter().map(|s| s.len() as u32 + 1).sum::<u32>()
                }
            }
        }

        if let Some(insn) = &line.instruction {
            cursors[current.0] += instruction_size(insn);
        }
    }

    Ok(())
}

struct Emitter<'a> {
    memory: &'a mut MemoryMap,
    symbols: &'a SymbolTable,
    externs: Vec<String>,
    text_lines: Vec<u32>,
    allow_externs: bool,
    current: SectionId,
    text: SectionId,
}

impl Emitter<'_> {
    fn run(
        &mut self,
        lines: &[SourceLine],
        ids: SectionIds,
    ) -> Result<(), AssemblyError> {
        for line in lines {
            if let Some(directive) = &line.directive {
                self.directive(directive, line.line_number, ids)?;
            }
            if let Some(insn) = &line.instruction {
                self.instruction(insn, line.line_number)?;
            }
        }
        Ok(())
    }

    fn pc(&self) -> u32 {
        let section = self.memory.get(self.current);
        section.base + section.contents.len() as u32
    }

    fn emit_byte(&mut self, byte: u8) {
        self.memory.get_mut(self.current).contents.push(byte);
    }

    fn emit_word(&mut self, word: u32, line: usize) {
        if self.current == self.text {
            self.text_lines.push(line as u32);
        }
        self.memory
            .get_mut(self.current)
            .contents
            .extend_from_slice(&word.to_le_bytes());
    }

    fn intern_extern(&mut self, name: &str) -> usize {
        if let Some(idx) = self.externs.iter().position(|e| e == name) {
            return idx;
        }
        self.externs.push(name.to_string());
        self.externs.len() - 1
    }

    /// Looks up a label, or records relocations against it when externs
    /// are permitted. Multi-word expansions pass one kind per word; the
    /// returned address is then 0 and the emitted fields are placeholders
    /// the relocation overwrites downstream.
    fn resolve(
        &mut self,
        name: &str,
        line: usize,
        kinds: &[RelocKind],
    ) -> Result<u32, AssemblyError> {
        if let Some(sym) = self.symbols.get(name) {
            return Ok(sym.address);
        }
        if !self.allow_externs {
            return Err(AssemblyError::semantic(line, "Label not found"));
        }
        let symbol = self.intern_extern(name);
        let offset = self.memory.get(self.current).contents.len() as u32;
        let relocations = &mut self.memory.get_mut(self.current).relocations;
        for (i, kind) in kinds.iter().enumerate() {
            relocations.push(Relocation {
                offset: offset + 4 * i as u32,
                symbol,
                addend: 0,
                kind: *kind,
            });
        }
        Ok(0)
    }

    fn directive(
        &mut self,
        directive: &Directive,
        line: usize,
        ids: SectionIds,
    ) -> Result<(), AssemblyError> {
        match directive {
            Directive::Section(name) => {
                // already validated in pass one
                self.current = self.memory.find_by_name(name).ok_or_else(
                    || AssemblyError::structural(line, "Section not found"),
                )?;
            }
            Directive::Text => self.current = ids.text,
            Directive::Data => self.current = ids.data,
            Directive::Globl(_) => {}
            Directive::Byte(values) => {
                for v in values {
                    self.emit_byte(*v as u8);
                }
            }
            Directive::Half(values) => {
                for v in values {
                    let [lo, hi] = (*v as u16).to_le_bytes();
                    self.emit_byte(lo);
                    self.emit_byte(hi);
                }
            }
            Directive::Word(values) => {
                for v in values {
                    self.emit_word(*v as u32, line);
                }
            }
            Directive::Ascii(strings) => {
                for s in strings {
                    for b in s {
                        self.emit_byte(*b);
                    }
                }
            }
            Directive::Asciz(strings) => {
                for s in strings {
                    for b in s {
                        self.emit_byte(*b);
                    }
                    self.emit_byte(0);
                }
            }
        }
        Ok(())
    }

    fn instruction(
        &mut self,
        insn: &Instruction,
        line: usize,
    ) -> Result<(), AssemblyError> {
        match insn {
            Instruction::AluReg(op, rd, rs1, rs2) => {
                self.emit_word(encoder::alu_reg(*op, *rd, *rs1, *rs2), line)
            }
            Instruction::AluImm(op, rd, rs1, imm) => {
                self.emit_word(encoder::alu_imm(*op, *rd, *rs1, *imm), line)
            }
            Instruction::LoadStore(op, rreg, imm, rmem) => self
                .emit_word(encoder::load_store(*op, *rreg, *imm, *rmem), line),
            Instruction::Branch(op, rs1, rs2, target) => {
                let addr = self.resolve(target, line, &[RelocKind::Branch])?;
                let off = addr.wrapping_sub(self.pc()) as i32;
                let (funct3, a, b) = op.lower(*rs1, *rs2);
                self.emit_word(encoder::branch(funct3, a, b, off), line);
            }
            Instruction::BranchZero(op, rs, target) => {
                let addr = self.resolve(target, line, &[RelocKind::Branch])?;
                let off = addr.wrapping_sub(self.pc()) as i32;
                let (funct3, a, b) = op.lower(*rs);
                self.emit_word(encoder::branch(funct3, a, b, off), line);
            }
            Instruction::AluPseudo(op, rd, rs) => {
                use crate::ast::{AluImmOp, AluRegOp};
                let word = match op {
                    PseudoOp::Mv => {
                        encoder::alu_imm(AluImmOp::Addi, *rd, *rs, 0)
                    }
                    PseudoOp::Not => {
                        encoder::alu_imm(AluImmOp::Xori, *rd, *rs, -1)
                    }
                    PseudoOp::Neg => {
                        encoder::alu_reg(AluRegOp::Sub, *rd, Reg::ZERO, *rs)
                    }
                    PseudoOp::Seqz => {
                        encoder::alu_imm(AluImmOp::Sltiu, *rd, *rs, 1)
                    }
                    PseudoOp::Snez => {
                        encoder::alu_reg(AluRegOp::Sltu, *rd, Reg::ZERO, *rs)
                    }
                    PseudoOp::Sltz => {
                        encoder::alu_reg(AluRegOp::Slt, *rd, *rs, Reg::ZERO)
                    }
                    PseudoOp::Sgtz => {
                        encoder::alu_reg(AluRegOp::Slt, *rd, Reg::ZERO, *rs)
                    }
                };
                self.emit_word(word, line);
            }
            Instruction::Jal(rd, target) => {
                let addr = self.resolve(target, line, &[RelocKind::Jal])?;
                let off = addr.wrapping_sub(self.pc()) as i32;
                self.emit_word(encoder::jal(*rd, off), line);
            }
            Instruction::Jalr(rd, rs1, imm) => {
                self.emit_word(encoder::jalr(*rd, *rs1, *imm), line)
            }
            Instruction::Upper(op, rd, imm) => {
                self.emit_word(encoder::upper(*op, *rd, *imm), line)
            }
            Instruction::Li(rd, imm) => {
                use crate::ast::{AluImmOp, UpperOp};
                if (-2048..=2047).contains(imm) {
                    self.emit_word(
                        encoder::alu_imm(AluImmOp::Addi, *rd, Reg::ZERO, *imm),
                        line,
                    );
                } else {
                    let (hi, lo) = encoder::split_hi_lo(*imm);
                    self.emit_word(encoder::upper(UpperOp::Lui, *rd, hi), line);
                    self.emit_word(
                        encoder::alu_imm(AluImmOp::Addi, *rd, *rd, lo),
                        line,
                    );
                }
            }
            Instruction::La(rd, target) => {
                use crate::ast::{AluImmOp, UpperOp};
                let addr = self.resolve(
                    target,
                    line,
                    &[RelocKind::Hi20, RelocKind::Lo12I],
                )?;
                let off = addr.wrapping_sub(self.pc()) as i32;
                let (hi, lo) = encoder::split_hi_lo(off);
                self.emit_word(encoder::upper(UpperOp::Auipc, *rd, hi), line);
                self.emit_word(
                    encoder::alu_imm(AluImmOp::Addi, *rd, *rd, lo),
                    line,
                );
            }
            Instruction::Ecall => self.emit_word(encoder::ECALL, line),
            Instruction::Sret => self.emit_word(encoder::SRET, line),
            Instruction::Csr(op, rd, csr, rs) => {
                self.emit_word(encoder::csr_reg(*op, *rd, csr.0, *rs), line)
            }
            Instruction::CsrImm(op, rd, csr, zimm) => {
                self.emit_word(encoder::csr_imm(*op, *rd, csr.0, *zimm), line)
            }
        }
        Ok(())
    }
}

// Defining an entry label but not exporting it is a common mistake, as is
// placing it in the wrong section, so both are hard errors.
fn resolve_entry(
    symbols: &SymbolTable,
    globals: &[String],
    ids: SectionIds,
) -> Result<(u32, bool), AssemblyError> {
    let is_global = |name: &str| globals.iter().any(|g| g == name);

    if let Some(sym) = symbols.get("_kernel_start") {
        if !is_global("_kernel_start") {
            return Err(AssemblyError::StructuralErrorNoLine {
                reason: "_kernel_start defined, but without .globl".to_string(),
            });
        }
        if sym.section != ids.kernel_text {
            return Err(AssemblyError::StructuralErrorNoLine {
                reason: "_kernel_start not in .kernel_text section".to_string(),
            });
        }
        return Ok((sym.address, true));
    }

    if let Some(sym) = symbols.get("_start") {
        if !is_global("_start") {
            return Err(AssemblyError::StructuralErrorNoLine {
                reason: "_start defined, but without .globl".to_string(),
            });
        }
        if sym.section != ids.text {
            return Err(AssemblyError::StructuralErrorNoLine {
                reason: "_start not in .text section".to_string(),
            });
        }
        return Ok((sym.address, false));
    }

    Ok((TEXT_BASE, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DATA_BASE, KERNEL_TEXT_BASE};
    use crate::parser::parse_source;

    fn assemble(source: &str) -> Result<Program, AssemblyError> {
        assemble_lines(&parse_source(source)?, false)
    }

    fn assemble_obj(source: &str) -> Result<Program, AssemblyError> {
        assemble_lines(&parse_source(source)?, true)
    }

    fn text_bytes(program: &Program) -> &[u8] {
        let id = program.memory.find_by_name(".text").unwrap();
        &program.memory.get(id).contents
    }

    fn data_bytes(program: &Program) -> &[u8] {
        let id = program.memory.find_by_name(".data").unwrap();
        &program.memory.get(id).contents
    }

    #[test]
    fn test_forward_reference_fixup() {
        let program = assemble("j exit\nexit:").unwrap();
        assert_eq!(text_bytes(&program), 0x0040006Fu32.to_le_bytes());
    }

    #[test]
    fn test_dot_label_forward_reference() {
        let program = assemble("j .exit\n.exit:").unwrap();
        assert_eq!(text_bytes(&program), 0x0040006Fu32.to_le_bytes());
    }

    #[test]
    fn test_backward_branch_offset() {
        let program =
            assemble("loop: addi x0, x0, 0\nbeq x1, x2, loop").unwrap();
        let bytes = text_bytes(&program);
        let word = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(word, encoder::branch(0b000, Reg(1), Reg(2), -4));
    }

    #[test]
    fn test_label_not_found() {
        assert_eq!(
            assemble("j unknown_symbol\n").unwrap_err(),
            AssemblyError::semantic(1, "Label not found")
        );
    }

    #[test]
    fn test_dotted_section_name_is_not_a_label() {
        // `.data:` switches sections; it never defines a ".data" label
        assert!(assemble("j .data\n.data:").is_err());
    }

    #[test]
    fn test_duplicate_label() {
        assert_eq!(
            assemble(".data\nvar: .word 5\nvar: .word 10").unwrap_err(),
            AssemblyError::semantic(3, "Multiple definitions for the same label")
        );
    }

    #[test]
    fn test_section_not_found() {
        assert_eq!(
            assemble(".section .bss\n").unwrap_err(),
            AssemblyError::structural(1, "Section not found")
        );
    }

    #[test]
    fn test_directive_emission() {
        let program = assemble(".data\nvar: .word 5").unwrap();
        assert_eq!(data_bytes(&program), 5u32.to_le_bytes());

        let program = assemble(".data\nvar: .half 5").unwrap();
        assert_eq!(data_bytes(&program), 5u16.to_le_bytes());

        let program = assemble(".data\nvar: .byte 5, -1").unwrap();
        assert_eq!(data_bytes(&program), [5, 0xFF]);

        let program = assemble(".data\nstr: .ascii \"hi\", \"hi\"").unwrap();
        assert_eq!(data_bytes(&program), b"hihi");

        let program = assemble(".data\nstr: .string \"hi\"").unwrap();
        assert_eq!(data_bytes(&program), b"hi\0");
    }

    #[test]
    fn test_data_label_addresses() {
        let program =
            assemble(".data\na: .byte 1\nb: .half 2\nc: .word 3").unwrap();
        let find = |name: &str| {
            program
                .labels
                .iter()
                .find(|l| l.name == name)
                .map(|l| l.address)
                .unwrap()
        };
        assert_eq!(find("a"), DATA_BASE);
        assert_eq!(find("b"), DATA_BASE + 1);
        assert_eq!(find("c"), DATA_BASE + 3);
    }

    #[test]
    fn test_li_expansion() {
        // small immediates are a single addi
        let program = assemble("li a0, 42").unwrap();
        assert_eq!(text_bytes(&program).len(), 4);

        // large immediates split with a sign-bridged low half
        let program = assemble("li a0, 0x12345FFF").unwrap();
        let bytes = text_bytes(&program);
        assert_eq!(bytes.len(), 8);
        let lui = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let addi = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        use crate::ast::{AluImmOp, UpperOp};
        assert_eq!(lui, encoder::upper(UpperOp::Lui, Reg::A0, 0x12346));
        assert_eq!(addi, encoder::alu_imm(AluImmOp::Addi, Reg::A0, Reg::A0, -1));
    }

    #[test]
    fn test_la_expansion_is_pc_relative() {
        let program = assemble("la a0, target\ntarget:").unwrap();
        let bytes = text_bytes(&program);
        assert_eq!(bytes.len(), 8);
        use crate::ast::{AluImmOp, UpperOp};
        let auipc = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let addi = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(auipc, encoder::upper(UpperOp::Auipc, Reg::A0, 0));
        assert_eq!(addi, encoder::alu_imm(AluImmOp::Addi, Reg::A0, Reg::A0, 8));
    }

    #[test]
    fn test_extern_records_relocations() {
        let program = assemble_obj("beq x1, x2, far\njal other\nla a0, far\n")
            .unwrap();
        let text = program.memory.find_by_name(".text").unwrap();
        let relocs = &program.memory.get(text).relocations;
        assert_eq!(program.externs, vec!["far".to_string(), "other".to_string()]);
        assert_eq!(relocs.len(), 4);
        assert_eq!(relocs[0].kind, RelocKind::Branch);
        assert_eq!(relocs[0].offset, 0);
        assert_eq!(relocs[0].symbol, 0);
        assert_eq!(relocs[1].kind, RelocKind::Jal);
        assert_eq!(relocs[1].offset, 4);
        assert_eq!(relocs[1].symbol, 1);
        // la emits a HI20/LO12_I pair on consecutive words
        assert_eq!(relocs[2].kind, RelocKind::Hi20);
        assert_eq!(relocs[2].offset, 8);
        assert_eq!(relocs[3].kind, RelocKind::Lo12I);
        assert_eq!(relocs[3].offset, 12);
        assert_eq!(relocs[3].symbol, 0);
    }

    #[test]
    fn test_entry_defaults_to_text_base() {
        let program = assemble("addi x0, x0, 0").unwrap();
        assert_eq!(program.entry, TEXT_BASE);
        assert!(!program.supervisor_entry);
    }

    #[test]
    fn test_entry_start() {
        let program =
            assemble(".globl _start\naddi x0, x0, 0\n_start: ret").unwrap();
        assert_eq!(program.entry, TEXT_BASE + 4);
    }

    #[test]
    fn test_entry_kernel_start() {
        let program = assemble(
            ".globl _kernel_start\n.section .kernel_text\n_kernel_start: sret",
        )
        .unwrap();
        assert_eq!(program.entry, KERNEL_TEXT_BASE);
        assert!(program.supervisor_entry);
    }

    #[test]
    fn test_entry_errors() {
        assert_eq!(
            assemble("_start: ret").unwrap_err(),
            AssemblyError::StructuralErrorNoLine {
                reason: "_start defined, but without .globl".to_string()
            }
        );
        assert_eq!(
            assemble(".globl _start\n.data\n_start:").unwrap_err(),
            AssemblyError::StructuralErrorNoLine {
                reason: "_start not in .text section".to_string()
            }
        );
        assert_eq!(
            assemble(".section .kernel_text\n_kernel_start: sret").unwrap_err(),
            AssemblyError::StructuralErrorNoLine {
                reason: "_kernel_start defined, but without .globl".to_string()
            }
        );
    }

    #[test]
    fn test_builtin_device_labels_resolve() {
        let program = assemble("la a0, _CONSOLE0_OUT\n").unwrap();
        assert!(program.labels.iter().any(|l| l.name == "_CONSOLE0_OUT"));
    }

    #[test]
    fn test_text_line_table() {
        let program =
            assemble("addi x0, x0, 1\naddi x0, x0,\n    2\naddi x0, x0, 3\n")
                .unwrap();
        assert_eq!(program.text_lines, vec![1, 2, 4]);
    }

    #[test]
    fn test_text_line_table_counts_li_words() {
        let program = assemble("li a0, 0x12345678\naddi x0, x0, 0\n").unwrap();
        assert_eq!(program.text_lines, vec![1, 1, 2]);
    }
}
