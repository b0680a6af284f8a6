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

//! Links relocatable objects into an executable: inputs' `.text` and
//! `.data` are appended at the fixed bases in argument order, global
//! symbols are unified, and every relocation is patched with its kind's
//! rule. The output goes through the same emission path as `--build`.

use super::{
    ElfHeader, ET_REL, EM_RISCV, RelaEntry, SHF_ALLOC, SHN_UNDEF,
    SHT_PROGBITS, SHT_RELA, SHT_SYMTAB, SYM_SIZE, SymtabEntry, cstr_at,
    parse_section_headers, section_bytes,
};
use crate::assembler::encoder;
use crate::assembler::symbol_table::Label;
use crate::assembler::Program;
use crate::errors::ElfError;
use crate::memory::{
    DATA_BASE, DATA_END, MemoryMap, RelocKind, Section, TEXT_BASE, TEXT_END,
};
use std::collections::HashMap;

struct InputSection {
    name: String,
    shidx: usize,
    bytes: Vec<u8>,
    relas: Vec<RelaEntry>,
}

struct InputSymbol {
    name: String,
    shndx: u16,
    value: u32,
}

struct ObjectFile {
    sections: Vec<InputSection>,
    /// Indexed exactly like the input symtab (entry 0 is the null symbol).
    symbols: Vec<InputSymbol>,
}

fn parse_object(bytes: &[u8]) -> Result<ObjectFile, ElfError> {
    let header = ElfHeader::parse(bytes)?;
    if header.class != 1 {
        return Err(ElfError::Not32Bit);
    }
    if header.machine != EM_RISCV {
        return Err(ElfError::NotRiscv);
    }
    if header.etype != ET_REL {
        return Err(ElfError::NotRelocatable);
    }

    let shdrs = parse_section_headers(bytes, &header)?;
    let shstrtab = section_bytes(bytes, &shdrs, header.shstrndx as usize)?;

    let mut sections: Vec<InputSection> = Vec::new();
    for (i, shdr) in shdrs.iter().enumerate() {
        if shdr.shtype != SHT_PROGBITS || shdr.flags & SHF_ALLOC == 0 {
            continue;
        }
        sections.push(InputSection {
            name: cstr_at(shstrtab, shdr.name_off as usize)?,
            shidx: i,
            bytes: section_bytes(bytes, &shdrs, i)?.to_vec(),
            relas: Vec::new(),
        });
    }

    let mut symbols: Vec<InputSymbol> = Vec::new();
    if let Some((i, symtab_shdr)) =
        shdrs.iter().enumerate().find(|(_, s)| s.shtype == SHT_SYMTAB)
    {
        let strtab = section_bytes(bytes, &shdrs, symtab_shdr.link as usize)?;
        let raw = section_bytes(bytes, &shdrs, i)?;
        for off in (0..raw.len()).step_by(SYM_SIZE) {
            let sym = SymtabEntry::parse(raw, off)?;
            symbols.push(InputSymbol {
                name: cstr_at(strtab, sym.name_off as usize)?,
                shndx: sym.shndx,
                value: sym.value,
            });
        }
    }

    for (i, shdr) in shdrs.iter().enumerate() {
        if shdr.shtype != SHT_RELA {
            continue;
        }
        let raw = section_bytes(bytes, &shdrs, i)?;
        let target = shdr.info as usize;
        let Some(section) =
            sections.iter_mut().find(|s| s.shidx == target)
        else {
            continue;
        };
        for off in (0..raw.len()).step_by(super::RELA_SIZE) {
            section.relas.push(RelaEntry::parse(raw, off)?);
        }
    }

    Ok(ObjectFile { sections, symbols })
}

/// Applies one relocation kind's patch rule to an emitted word.
/// `value` is S+A; pc-relative kinds subtract the patch site.
fn patch_word(
    word: u32,
    kind: RelocKind,
    value: u32,
    site: u32,
) -> Result<u32, ElfError> {
    Ok(match kind {
        RelocKind::Abs32 => value,
        RelocKind::Branch => {
            let off = value.wrapping_sub(site) as i32;
            if !(-4096..=4094).contains(&off) || off % 2 != 0 {
                return Err(ElfError::RelocationRange(site));
            }
            (word & !encoder::B_IMM_MASK) | encoder::b_imm(off)
        }
        RelocKind::Jal => {
            let off = value.wrapping_sub(site) as i32;
            if !(-(1 << 20)..(1 << 20)).contains(&off) || off % 2 != 0 {
                return Err(ElfError::RelocationRange(site));
            }
            (word & !encoder::J_IMM_MASK) | encoder::j_imm(off)
        }
        RelocKind::Hi20 => {
            let (hi, _) = encoder::split_hi_lo(value as i32);
            (word & !encoder::U_IMM_MASK) | encoder::u_imm(hi)
        }
        RelocKind::Lo12I => {
            let (_, lo) = encoder::split_hi_lo(value as i32);
            (word & !encoder::I_IMM_MASK) | encoder::i_imm(lo)
        }
        RelocKind::Lo12S => {
            let (_, lo) = encoder::split_hi_lo(value as i32);
            (word & !encoder::S_IMM_MASK) | encoder::s_imm(lo)
        }
    })
}

pub fn link(objects: &[Vec<u8>]) -> Result<Vec<u8>, ElfError> {
    let parsed = objects
        .iter()
        .map(|bytes| parse_object(bytes))
        .collect::<Result<Vec<_>, _>>()?;

    // lay out every input's .text and .data at the fixed bases
    let mut text: Vec<u8> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut placement: HashMap<(usize, usize), u32> = HashMap::new();
    for (oi, object) in parsed.iter().enumerate() {
        for section in &object.sections {
            let (buf, base) = match section.name.as_str() {
                ".text" => (&mut text, TEXT_BASE),
                ".data" => (&mut data, DATA_BASE),
                _ => continue,
            };
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
            placement
                .insert((oi, section.shidx), base + buf.len() as u32);
            buf.extend_from_slice(&section.bytes);
        }
    }

    // unified global symbol table
    let mut globals: HashMap<String, u32> = HashMap::new();
    for (oi, object) in parsed.iter().enumerate() {
        for sym in &object.symbols {
            if sym.shndx == SHN_UNDEF || sym.name.is_empty() {
                continue;
            }
            let Some(base) = placement.get(&(oi, sym.shndx as usize)) else {
                continue;
            };
            if globals
                .insert(sym.name.clone(), base + sym.value)
                .is_some()
            {
                return Err(ElfError::DuplicateSymbol(sym.name.clone()));
            }
        }
    }

    // patch every relocation site in the merged images
    for (oi, object) in parsed.iter().enumerate() {
        for section in &object.sections {
            let Some(&sec_base) = placement.get(&(oi, section.shidx)) else {
                continue;
            };
            for rela in &section.relas {
                let sym = object
                    .symbols
                    .get(rela.symbol() as usize)
                    .ok_or(ElfError::OutOfBounds)?;
                let target = if sym.shndx == SHN_UNDEF {
                    *globals.get(&sym.name).ok_or_else(|| {
                        ElfError::UnresolvedSymbol(sym.name.clone())
                    })?
                } else {
                    placement
                        .get(&(oi, sym.shndx as usize))
                        .ok_or_else(|| {
                            ElfError::UnresolvedSymbol(sym.name.clone())
                        })?
                        + sym.value
                };
                let kind = RelocKind::from_elf_type(rela.reloc_type())
                    .ok_or(ElfError::UnknownRelocation(rela.reloc_type()))?;
                let site = sec_base + rela.offset;
                let value = target.wrapping_add(rela.addend);

                let buf = if site >= DATA_BASE {
                    &mut data
                } else {
                    &mut text
                };
                let buf_base = if site >= DATA_BASE { DATA_BASE } else { TEXT_BASE };
                let idx = (site - buf_base) as usize;
                let slot = buf
                    .get_mut(idx..idx + 4)
                    .ok_or(ElfError::OutOfBounds)?;
                let word = u32::from_le_bytes(slot.try_into().unwrap());
                let patched = patch_word(word, kind, value, site)?;
                slot.copy_from_slice(&patched.to_le_bytes());
            }
        }
    }

    // rebuild a program image and reuse the executable emission path
    let mut memory = MemoryMap::new();
    memory.push_runtime_sections();
    let text_id = memory.push(Section {
        name: ".text".to_string(),
        base: TEXT_BASE,
        limit: TEXT_END,
        contents: text,
        align: 4,
        read: true,
        write: false,
        execute: true,
        supervisor: false,
        physical: true,
        relocations: Vec::new(),
    });
    let data_id = memory.push(Section {
        name: ".data".to_string(),
        base: DATA_BASE,
        limit: DATA_END,
        contents: data,
        align: 1,
        read: true,
        write: true,
        execute: false,
        supervisor: false,
        physical: true,
        relocations: Vec::new(),
    });

    let mut labels = Vec::new();
    let mut global_names = Vec::new();
    for (name, addr) in &globals {
        let section = if *addr >= DATA_BASE { data_id } else { text_id };
        labels.push(Label { name: name.clone(), address: *addr, section });
        global_names.push(name.clone());
    }

    let program = Program {
        memory,
        labels,
        globals: global_names,
        externs: Vec::new(),
        text_lines: Vec::new(),
        entry: 0,
        supervisor_entry: false,
    };

    super::emit_executable(&program)
}
