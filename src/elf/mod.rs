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

//! ELF32 codec for RV32: emits executables and relocatable objects,
//! loads executables back into a memory map, and decodes headers for the
//! readelf view. Everything is serialized little-endian byte by byte;
//! host endianness never leaks into the output.

pub mod linker;

use crate::assembler::Program;
use crate::errors::ElfError;
use crate::memory::{MemoryMap, Section};
use std::collections::HashMap;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;
pub const SHDR_SIZE: usize = 40;
pub const SYM_SIZE: usize = 16;
pub const RELA_SIZE: usize = 12;

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_RISCV: u16 = 0xF3;

pub const PT_LOAD: u32 = 1;

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;

pub const SHF_WRITE: u32 = 0x1;
pub const SHF_ALLOC: u32 = 0x2;
pub const SHF_EXECINSTR: u32 = 0x4;
pub const SHF_STRINGS: u32 = 0x20;
pub const SHF_INFO_LINK: u32 = 0x40;

pub const SHN_UNDEF: u16 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STT_NOTYPE: u8 = 0;

// The string table always starts with "\0.strtab\0.symtab\0", so these
// name offsets are fixed and section names start at 17.
pub const STRTAB_ISTR: u32 = 1;
pub const STRTAB_ISYM: u32 = 9;
pub const STRTAB_ISEC: u32 = 17;

fn st_info(bind: u8, typ: u8) -> u8 {
    (bind << 4) | (typ & 0xF)
}

// --- little-endian plumbing ---

fn w16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn rd16(bytes: &[u8], off: usize) -> Result<u16, ElfError> {
    let b = bytes.get(off..off + 2).ok_or(ElfError::Truncated)?;
    Ok(u16::from_le_bytes(b.try_into().unwrap()))
}

fn rd32(bytes: &[u8], off: usize) -> Result<u32, ElfError> {
    let b = bytes.get(off..off + 4).ok_or(ElfError::Truncated)?;
    Ok(u32::from_le_bytes(b.try_into().unwrap()))
}

fn cstr_at(strtab: &[u8], off: usize) -> Result<String, ElfError> {
    let tail = strtab.get(off..).ok_or(ElfError::BadSectionName)?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::BadSectionName)?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfHeader {
    pub class: u8,
    pub endianness: u8,
    pub ident_version: u8,
    pub abi: u8,
    pub etype: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl ElfHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F']);
        out.push(self.class);
        out.push(self.endianness);
        out.push(self.ident_version);
        out.push(self.abi);
        out.extend_from_slice(&[0u8; 8]);
        w16(out, self.etype);
        w16(out, self.machine);
        w32(out, self.version);
        w32(out, self.entry);
        w32(out, self.phoff);
        w32(out, self.shoff);
        w32(out, self.flags);
        w16(out, self.ehsize);
        w16(out, self.phentsize);
        w16(out, self.phnum);
        w16(out, self.shentsize);
        w16(out, self.shnum);
        w16(out, self.shstrndx);
    }

    pub fn parse(bytes: &[u8]) -> Result<ElfHeader, ElfError> {
        if bytes.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if bytes[0] != 0x7F
            || bytes[1] != b'E'
            || bytes[2] != b'L'
            || bytes[3] != b'F'
        {
            return Err(ElfError::BadMagic);
        }
        Ok(ElfHeader {
            class: bytes[4],
            endianness: bytes[5],
            ident_version: bytes[6],
            abi: bytes[7],
            etype: rd16(bytes, 16)?,
            machine: rd16(bytes, 18)?,
            version: rd32(bytes, 20)?,
            entry: rd32(bytes, 24)?,
            phoff: rd32(bytes, 28)?,
            shoff: rd32(bytes, 32)?,
            flags: rd32(bytes, 36)?,
            ehsize: rd16(bytes, 40)?,
            phentsize: rd16(bytes, 42)?,
            phnum: rd16(bytes, 44)?,
            shentsize: rd16(bytes, 46)?,
            shnum: rd16(bytes, 48)?,
            shstrndx: rd16(bytes, 50)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramHeader {
    pub ptype: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgramHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        w32(out, self.ptype);
        w32(out, self.offset);
        w32(out, self.vaddr);
        w32(out, self.paddr);
        w32(out, self.filesz);
        w32(out, self.memsz);
        w32(out, self.flags);
        w32(out, self.align);
    }

    pub fn parse(bytes: &[u8], off: usize) -> Result<ProgramHeader, ElfError> {
        Ok(ProgramHeader {
            ptype: rd32(bytes, off)?,
            offset: rd32(bytes, off + 4)?,
            vaddr: rd32(bytes, off + 8)?,
            paddr: rd32(bytes, off + 12)?,
            filesz: rd32(bytes, off + 16)?,
            memsz: rd32(bytes, off + 20)?,
            flags: rd32(bytes, off + 24)?,
            align: rd32(bytes, off + 28)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionHeader {
    pub name_off: u32,
    pub shtype: u32,
    pub flags: u32,
    pub addr: u32,
    pub offset: u32,
    pub size: u32,
    pub link: u32,
    pub info: u32,
    pub addralign: u32,
    pub entsize: u32,
}

impl SectionHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        w32(out, self.name_off);
        w32(out, self.shtype);
        w32(out, self.flags);
        w32(out, self.addr);
        w32(out, self.offset);
        w32(out, self.size);
        w32(out, self.link);
        w32(out, self.info);
        w32(out, self.addralign);
        w32(out, self.entsize);
    }

    pub fn parse(bytes: &[u8], off: usize) -> Result<SectionHeader, ElfError> {
        Ok(SectionHeader {
            name_off: rd32(bytes, off)?,
            shtype: rd32(bytes, off + 4)?,
            flags: rd32(bytes, off + 8)?,
            addr: rd32(bytes, off + 12)?,
            offset: rd32(bytes, off + 16)?,
            size: rd32(bytes, off + 20)?,
            link: rd32(bytes, off + 24)?,
            info: rd32(bytes, off + 28)?,
            addralign: rd32(bytes, off + 32)?,
            entsize: rd32(bytes, off + 36)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymtabEntry {
    pub name_off: u32,
    pub value: u32,
    pub size: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
}

impl SymtabEntry {
    fn write_to(&self, out: &mut Vec<u8>) {
        w32(out, self.name_off);
        w32(out, self.value);
        w32(out, self.size);
        out.push(self.info);
        out.push(self.other);
        w16(out, self.shndx);
    }

    pub fn parse(bytes: &[u8], off: usize) -> Result<SymtabEntry, ElfError> {
        Ok(SymtabEntry {
            name_off: rd32(bytes, off)?,
            value: rd32(bytes, off + 4)?,
            size: rd32(bytes, off + 8)?,
            info: *bytes.get(off + 12).ok_or(ElfError::Truncated)?,
            other: *bytes.get(off + 13).ok_or(ElfError::Truncated)?,
            shndx: rd16(bytes, off + 14)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaEntry {
    pub offset: u32,
    pub info: u32,
    pub addend: u32,
}

impl RelaEntry {
    fn write_to(&self, out: &mut Vec<u8>) {
        w32(out, self.offset);
        w32(out, self.info);
        w32(out, self.addend);
    }

    pub fn parse(bytes: &[u8], off: usize) -> Result<RelaEntry, ElfError> {
        Ok(RelaEntry {
            offset: rd32(bytes, off)?,
            info: rd32(bytes, off + 4)?,
            addend: rd32(bytes, off + 8)?,
        })
    }

    pub fn symbol(&self) -> u32 {
        self.info >> 8
    }

    pub fn reloc_type(&self) -> u8 {
        self.info as u8
    }
}

// --- emission ---

struct EmitSection<'a> {
    section: &'a Section,
    shidx: u16,
    file_off: u32,
    name_off: u32,
    rela_name_off: u32,
}

/// Emits a fully linked executable. Requires a globally defined `_start`.
pub fn emit_executable(program: &Program) -> Result<Vec<u8>, ElfError> {
    let entry = program
        .labels
        .iter()
        .find(|l| {
            l.name == "_start" && program.globals.iter().any(|g| g == "_start")
        })
        .map(|l| l.address)
        .ok_or(ElfError::NoEntrySymbol)?;
    emit(program, Some(entry))
}

/// Emits a relocatable object carrying the symbol table and the pending
/// relocations of every physical section.
pub fn emit_object(program: &Program) -> Result<Vec<u8>, ElfError> {
    emit(program, None)
}

fn emit(program: &Program, entry: Option<u32>) -> Result<Vec<u8>, ElfError> {
    let exec = entry.is_some();
    let rsv: u16 = if exec { 1 } else { 2 };

    // physical, non-empty sections in memory-map order
    let phys: Vec<(usize, &Section)> = program
        .memory
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.physical && !s.contents.is_empty())
        .collect();
    let seg_count = phys.len() as u16;
    let reloc_count =
        phys.iter().filter(|(_, s)| !s.relocations.is_empty()).count() as u16;
    let shnum = 1 + rsv + seg_count + reloc_count;
    let symtab_shidx: u32 = if exec { 0 } else { 2 };

    // build the string table and record every name offset
    let mut strtab: Vec<u8> = vec![0];
    strtab.extend_from_slice(b".strtab\0.symtab\0");
    debug_assert_eq!(strtab.len() as u32, STRTAB_ISEC);

    let mut plan: Vec<EmitSection> = Vec::with_capacity(phys.len());
    let mut file_off = EHDR_SIZE as u32
        + if exec { seg_count as u32 * PHDR_SIZE as u32 } else { 0 };
    for (i, (_, section)) in phys.iter().enumerate() {
        plan.push(EmitSection {
            section,
            shidx: 1 + rsv + i as u16,
            file_off,
            name_off: 0,
            rela_name_off: 0,
        });
        file_off += section.contents.len() as u32;
    }

    // section names come first; a section with relocations gets its name
    // as the tail of its ".relaNAME" string below, so only the others
    // are written standalone here
    for entry in plan.iter_mut().filter(|p| p.section.relocations.is_empty())
    {
        entry.name_off = strtab.len() as u32;
        strtab.extend_from_slice(entry.section.name.as_bytes());
        strtab.push(0);
    }
    // the ".relaNAME" names follow, packed so the NAME part is shared:
    // the section's own name offset points past the ".rela" prefix
    for entry in plan.iter_mut().filter(|p| !p.section.relocations.is_empty())
    {
        entry.rela_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b".rela");
        entry.name_off = strtab.len() as u32;
        strtab.extend_from_slice(entry.section.name.as_bytes());
        strtab.push(0);
    }

    let mut extern_name_offs = Vec::with_capacity(program.externs.len());
    for name in &program.externs {
        extern_name_offs.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    let mut global_name_offs = Vec::with_capacity(program.globals.len());
    for name in &program.globals {
        global_name_offs.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let segments_end = file_off;
    let shoff = segments_end;
    let strtab_off = shoff + shnum as u32 * SHDR_SIZE as u32;
    let symtab_off = strtab_off + strtab.len() as u32;

    // symbol table: null entry, externs, then globals
    let mut symtab: Vec<SymtabEntry> = Vec::new();
    let mut shidx_of: HashMap<usize, u16> = HashMap::new();
    for (i, (pos, _)) in phys.iter().enumerate() {
        shidx_of.insert(*pos, 1 + rsv + i as u16);
    }
    if !exec {
        symtab.push(SymtabEntry::default());
        for (i, _) in program.externs.iter().enumerate() {
            symtab.push(SymtabEntry {
                name_off: extern_name_offs[i],
                value: 0,
                size: 0,
                info: st_info(STB_GLOBAL, STT_NOTYPE),
                other: 0,
                shndx: SHN_UNDEF,
            });
        }
        for (i, name) in program.globals.iter().enumerate() {
            let label = program
                .labels
                .iter()
                .find(|l| l.name == *name)
                .ok_or_else(|| ElfError::UndefinedGlobal(name.clone()))?;
            let section = program.memory.get(label.section);
            symtab.push(SymtabEntry {
                name_off: global_name_offs[i],
                value: label.address - section.base,
                size: 0,
                info: st_info(STB_GLOBAL, STT_NOTYPE),
                other: 0,
                shndx: shidx_of
                    .get(&label.section.0)
                    .copied()
                    .unwrap_or(SHN_UNDEF),
            });
        }
    }

    let relas_off = symtab_off + (symtab.len() * SYM_SIZE) as u32;

    // relocation entries, grouped per section in plan order
    let mut relas: Vec<RelaEntry> = Vec::new();
    let mut rela_spans: Vec<(u32, u32)> = Vec::new(); // (file off, size)
    for entry in plan.iter().filter(|p| !p.section.relocations.is_empty()) {
        let start = relas_off + (relas.len() * RELA_SIZE) as u32;
        for r in &entry.section.relocations {
            relas.push(RelaEntry {
                offset: r.offset,
                info: ((1 + r.symbol as u32) << 8) | r.kind.elf_type() as u32,
                addend: r.addend,
            });
        }
        let size = (entry.section.relocations.len() * RELA_SIZE) as u32;
        rela_spans.push((start, size));
    }

    // now serialize everything in file order
    let mut out = Vec::new();
    ElfHeader {
        class: 1,
        endianness: 1,
        ident_version: 1,
        abi: 0, // System V
        etype: if exec { ET_EXEC } else { ET_REL },
        machine: EM_RISCV,
        version: 1,
        entry: entry.unwrap_or(0),
        phoff: if exec { EHDR_SIZE as u32 } else { 0 },
        shoff,
        flags: 0,
        ehsize: EHDR_SIZE as u16,
        phentsize: if exec { PHDR_SIZE as u16 } else { 0 },
        phnum: if exec { seg_count } else { 0 },
        shentsize: SHDR_SIZE as u16,
        shnum,
        shstrndx: 1,
    }
    .write_to(&mut out);

    if exec {
        for entry in &plan {
            let s = entry.section;
            let mut flags = 0;
            if s.read {
                flags |= 0b100;
            }
            if s.write {
                flags |= 0b010;
            }
            if s.execute {
                flags |= 0b001;
            }
            ProgramHeader {
                ptype: PT_LOAD,
                offset: entry.file_off,
                vaddr: s.base,
                paddr: s.base,
                filesz: s.contents.len() as u32,
                memsz: s.contents.len() as u32,
                flags,
                align: s.align,
            }
            .write_to(&mut out);
        }
    }

    for entry in &plan {
        out.extend_from_slice(&entry.section.contents);
    }

    // section headers: null, reserved, progbits, rela
    SectionHeader { shtype: SHT_NULL, ..Default::default() }.write_to(&mut out);
    SectionHeader {
        name_off: STRTAB_ISTR,
        shtype: SHT_STRTAB,
        offset: strtab_off,
        size: strtab.len() as u32,
        addralign: 1,
        ..Default::default()
    }
    .write_to(&mut out);
    if !exec {
        SectionHeader {
            name_off: STRTAB_ISYM,
            shtype: SHT_SYMTAB,
            flags: SHF_INFO_LINK,
            offset: symtab_off,
            size: (symtab.len() * SYM_SIZE) as u32,
            link: 1,
            info: 1, // all symbols are global, so first non-local is 1
            addralign: 1,
            entsize: SYM_SIZE as u32,
            ..Default::default()
        }
        .write_to(&mut out);
    }
    for entry in &plan {
        let s = entry.section;
        let mut flags = SHF_ALLOC;
        if s.write {
            flags |= SHF_WRITE;
        }
        if s.execute {
            flags |= SHF_EXECINSTR;
        }
        SectionHeader {
            name_off: entry.name_off,
            shtype: SHT_PROGBITS,
            flags,
            addr: s.base,
            offset: entry.file_off,
            size: s.contents.len() as u32,
            addralign: s.align,
            ..Default::default()
        }
        .write_to(&mut out);
    }
    let mut span = rela_spans.iter();
    for entry in plan.iter().filter(|p| !p.section.relocations.is_empty()) {
        let (offset, size) = if exec { (0, 0) } else { *span.next().unwrap() };
        SectionHeader {
            name_off: entry.rela_name_off,
            shtype: SHT_RELA,
            flags: SHF_INFO_LINK,
            offset,
            size,
            link: symtab_shidx,
            info: entry.shidx as u32,
            addralign: 1,
            entsize: RELA_SIZE as u32,
            ..Default::default()
        }
        .write_to(&mut out);
    }

    out.extend_from_slice(&strtab);
    for sym in &symtab {
        sym.write_to(&mut out);
    }
    if !exec {
        for rela in &relas {
            rela.write_to(&mut out);
        }
    }

    Ok(out)
}

// --- loading ---

/// Validates an executable image and rebuilds one memory section per
/// allocatable section header, plus the runtime stack and MMIO regions.
pub fn load_executable(bytes: &[u8]) -> Result<Program, ElfError> {
    let header = ElfHeader::parse(bytes)?;
    if header.class != 1 {
        return Err(ElfError::Not32Bit);
    }
    if header.machine != EM_RISCV {
        return Err(ElfError::NotRiscv);
    }
    if header.etype != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }

    let shdrs = parse_section_headers(bytes, &header)?;
    let strtab = section_bytes(bytes, &shdrs, header.shstrndx as usize)?;

    let mut memory = MemoryMap::new();
    for shdr in &shdrs {
        if shdr.flags & SHF_ALLOC == 0 {
            continue;
        }
        let contents = bytes
            .get(shdr.offset as usize..(shdr.offset + shdr.size) as usize)
            .ok_or(ElfError::OutOfBounds)?
            .to_vec();
        let name = cstr_at(strtab, shdr.name_off as usize)?;
        memory.push(Section {
            name,
            base: shdr.addr,
            limit: shdr.addr + shdr.size,
            contents,
            align: shdr.addralign,
            read: true,
            write: shdr.flags & SHF_WRITE != 0,
            execute: shdr.flags & SHF_EXECINSTR != 0,
            supervisor: false,
            physical: false,
            relocations: Vec::new(),
        });
    }
    memory.push_runtime_sections();

    Ok(Program {
        memory,
        labels: Vec::new(),
        globals: Vec::new(),
        externs: Vec::new(),
        text_lines: Vec::new(),
        entry: header.entry,
        supervisor_entry: false,
    })
}

pub(crate) fn parse_section_headers(
    bytes: &[u8],
    header: &ElfHeader,
) -> Result<Vec<SectionHeader>, ElfError> {
    let mut shdrs = Vec::with_capacity(header.shnum as usize);
    for i in 0..header.shnum as usize {
        shdrs.push(SectionHeader::parse(
            bytes,
            header.shoff as usize + i * SHDR_SIZE,
        )?);
    }
    Ok(shdrs)
}

pub(crate) fn section_bytes<'a>(
    bytes: &'a [u8],
    shdrs: &[SectionHeader],
    index: usize,
) -> Result<&'a [u8], ElfError> {
    let shdr = shdrs.get(index).ok_or(ElfError::OutOfBounds)?;
    bytes
        .get(shdr.offset as usize..(shdr.offset + shdr.size) as usize)
        .ok_or(ElfError::OutOfBounds)
}

// --- readelf view ---

#[derive(Debug)]
pub struct ReadSection {
    pub name: String,
    pub type_name: &'static str,
    pub flags: String,
    pub header: SectionHeader,
}

#[derive(Debug)]
pub struct ReadSegment {
    pub type_name: &'static str,
    pub flags: String,
    pub header: ProgramHeader,
}

#[derive(Debug)]
pub struct ReadElf {
    pub header: ElfHeader,
    pub magic: [u8; 8],
    pub class: &'static str,
    pub endianness: &'static str,
    pub abi: &'static str,
    pub type_name: &'static str,
    pub machine: &'static str,
    pub sections: Vec<ReadSection>,
    pub segments: Vec<ReadSegment>,
}

/// Decodes the headers of any ELF file for display; unknown values are
/// reported, not rejected.
pub fn read(bytes: &[u8]) -> Result<ReadElf, ElfError> {
    const UNKNOWN: &str = "Unknown";
    let header = ElfHeader::parse(bytes)?;

    let class = match header.class {
        1 => "ELF32",
        2 => "ELF64 (WARNING: format not supported)",
        _ => UNKNOWN,
    };
    let endianness = match header.endianness {
        1 => "Little endian",
        2 => "Big endian",
        _ => UNKNOWN,
    };
    let abi = match header.abi {
        0 => "UNIX - System V",
        _ => UNKNOWN,
    };
    let type_name = match header.etype {
        1 => "Relocatable",
        2 => "Executable",
        3 => "Shared",
        4 => "Core",
        _ => UNKNOWN,
    };
    let machine = match header.machine {
        0xF3 => "RISC-V",
        0x3E => "x86-64 (x64, AMD/Intel 64 bit)",
        0xB7 => "AArch64 (ARM64)",
        _ => UNKNOWN,
    };

    let mut segments = Vec::new();
    for i in 0..header.phnum as usize {
        let phdr =
            ProgramHeader::parse(bytes, header.phoff as usize + i * PHDR_SIZE)?;
        let mut flags = String::new();
        if phdr.flags & 0b100 != 0 {
            flags.push('R');
        }
        if phdr.flags & 0b010 != 0 {
            flags.push('W');
        }
        if phdr.flags & 0b001 != 0 {
            flags.push('X');
        }
        let type_name = match phdr.ptype {
            0 => "NULL",
            1 => "LOAD",
            2 => "DYNAMIC",
            3 => "INTERP",
            4 => "NOTE",
            _ => UNKNOWN,
        };
        segments.push(ReadSegment { type_name, flags, header: phdr });
    }

    let shdrs = parse_section_headers(bytes, &header)?;
    let strtab = section_bytes(bytes, &shdrs, header.shstrndx as usize)?;
    let mut sections = Vec::new();
    for shdr in shdrs {
        let mut flags = String::new();
        if shdr.flags & SHF_WRITE != 0 {
            flags.push('W');
        }
        if shdr.flags & SHF_ALLOC != 0 {
            flags.push('A');
        }
        if shdr.flags & SHF_STRINGS != 0 {
            flags.push('S');
        }
        if shdr.flags & SHF_EXECINSTR != 0 {
            flags.push('X');
        }
        let type_name = match shdr.shtype {
            SHT_NULL => "NULL",
            SHT_PROGBITS => "PROGBITS",
            SHT_SYMTAB => "SYMTAB",
            SHT_STRTAB => "STRTAB",
            SHT_RELA => "RELA",
            _ => UNKNOWN,
        };
        let name = cstr_at(strtab, shdr.name_off as usize)?;
        sections.push(ReadSection { name, type_name, flags, header: shdr });
    }

    let mut magic = [0u8; 8];
    magic.copy_from_slice(&bytes[..8]);

    Ok(ReadElf {
        header,
        magic,
        class,
        endianness,
        abi,
        type_name,
        machine,
        sections,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_lines;
    use crate::parser::parse_source;

    fn assemble(source: &str, externs: bool) -> Program {
        assemble_lines(&parse_source(source).unwrap(), externs).unwrap()
    }

    #[test]
    fn test_executable_round_trip() {
        let source = ".globl _start\n_start:\n\
                      li a0, 5\nli a7, 93\necall\n\
                      .data\nvar: .word 0xCAFEBABE\n";
        let program = assemble(source, false);
        let image = emit_executable(&program).unwrap();
        let loaded = load_executable(&image).unwrap();

        assert_eq!(loaded.entry, program.entry);
        for name in [".text", ".data"] {
            let a = program.memory.find_by_name(name).unwrap();
            let b = loaded.memory.find_by_name(name).unwrap();
            let (a, b) = (program.memory.get(a), loaded.memory.get(b));
            assert_eq!(a.base, b.base);
            assert_eq!(a.contents, b.contents);
            assert_eq!(a.write, b.write);
            assert_eq!(a.execute, b.execute);
        }
        // the stack and MMIO window are rebuilt on load
        assert!(loaded.memory.find_by_name("stack").is_some());
        assert!(loaded.memory.find_by_name(".mmio").is_some());
    }

    #[test]
    fn test_executable_requires_global_start() {
        let program = assemble("addi x0, x0, 0\n", false);
        assert_eq!(
            emit_executable(&program).unwrap_err(),
            ElfError::NoEntrySymbol
        );
    }

    #[test]
    fn test_executable_header_fields() {
        let program = assemble(".globl _start\n_start: ret\n", false);
        let image = emit_executable(&program).unwrap();
        let header = ElfHeader::parse(&image).unwrap();
        assert_eq!(header.class, 1);
        assert_eq!(header.endianness, 1);
        assert_eq!(header.abi, 0);
        assert_eq!(header.etype, ET_EXEC);
        assert_eq!(header.machine, EM_RISCV);
        assert_eq!(header.version, 1);
        assert_eq!(header.entry, crate::memory::TEXT_BASE);
        assert_eq!(header.phnum, 1);
        assert_eq!(header.shstrndx, 1);
        // null + .strtab + .text
        assert_eq!(header.shnum, 3);
    }

    #[test]
    fn test_loader_rejects_foreign_files() {
        assert_eq!(load_executable(&[0; 10]).unwrap_err(), ElfError::Truncated);
        assert_eq!(
            load_executable(&[0x7Eu8; 64]).unwrap_err(),
            ElfError::BadMagic
        );

        let program = assemble(".globl _start\n_start: ret\n", false);
        let mut image = emit_executable(&program).unwrap();
        image[4] = 2; // claim ELF64
        assert_eq!(load_executable(&image).unwrap_err(), ElfError::Not32Bit);

        let mut image = emit_executable(&program).unwrap();
        image[18] = 0x3E; // claim x86-64
        assert_eq!(load_executable(&image).unwrap_err(), ElfError::NotRiscv);

        let mut image = emit_executable(&program).unwrap();
        image[16] = 1; // claim relocatable
        assert_eq!(
            load_executable(&image).unwrap_err(),
            ElfError::NotExecutable
        );
    }

    #[test]
    fn test_object_layout() {
        let source = "beq x1, x2, far\n.data\nvar: .word 1\n";
        let program = assemble(source, true);
        let image = emit_object(&program).unwrap();
        let header = ElfHeader::parse(&image).unwrap();
        assert_eq!(header.etype, ET_REL);
        assert_eq!(header.phnum, 0);
        assert_eq!(header.phoff, 0);
        // null + .strtab + .symtab + .text + .data + .rela.text
        assert_eq!(header.shnum, 6);

        let shdrs = parse_section_headers(&image, &header).unwrap();
        assert_eq!(shdrs[0].shtype, SHT_NULL);
        assert_eq!(shdrs[1].shtype, SHT_STRTAB);
        assert_eq!(shdrs[1].name_off, STRTAB_ISTR);
        assert_eq!(shdrs[2].shtype, SHT_SYMTAB);
        assert_eq!(shdrs[2].name_off, STRTAB_ISYM);
        assert_eq!(shdrs[2].link, 1);
        assert_eq!(shdrs[2].info, 1);
        assert_eq!(shdrs[3].shtype, SHT_PROGBITS);
        assert_eq!(shdrs[4].shtype, SHT_PROGBITS);
        assert_eq!(shdrs[5].shtype, SHT_RELA);
        assert_eq!(shdrs[5].info, 3); // relocates .text
        assert_eq!(shdrs[5].link, 2); // against .symtab

        // string table begins \0.strtab\0.symtab\0, then the section
        // names, then the .relaNAME names
        let strtab = section_bytes(&image, &shdrs, 1).unwrap();
        assert!(strtab.starts_with(b"\0.strtab\0.symtab\0"));
        assert_eq!(shdrs[4].name_off, STRTAB_ISEC);
        assert_eq!(cstr_at(strtab, shdrs[4].name_off as usize).unwrap(), ".data");
        assert_eq!(cstr_at(strtab, shdrs[3].name_off as usize).unwrap(), ".text");
        assert_eq!(
            cstr_at(strtab, shdrs[5].name_off as usize).unwrap(),
            ".rela.text"
        );
        // ".rela.text" shares its NAME tail with the .text section name
        assert_eq!(shdrs[3].name_off, shdrs[5].name_off + 5);
        assert!(shdrs[4].name_off < shdrs[5].name_off);
        let occurrences = strtab
            .windows(b".text\0".len())
            .filter(|w| *w == b".text\0")
            .count();
        assert_eq!(occurrences, 1);

        // symtab: null, extern `far`, no globals
        let symtab = section_bytes(&image, &shdrs, 2).unwrap();
        assert_eq!(symtab.len(), 2 * SYM_SIZE);
        let ext = SymtabEntry::parse(symtab, SYM_SIZE).unwrap();
        assert_eq!(ext.shndx, SHN_UNDEF);
        assert_eq!(ext.info, 0x10); // GLOBAL, NOTYPE
        assert_eq!(cstr_at(strtab, ext.name_off as usize).unwrap(), "far");

        // the relocation references symtab entry 1 with the branch type
        let relas = section_bytes(&image, &shdrs, 5).unwrap();
        let rela = RelaEntry::parse(relas, 0).unwrap();
        assert_eq!(rela.offset, 0);
        assert_eq!(rela.symbol(), 1);
        assert_eq!(rela.reloc_type(), 16);
    }

    #[test]
    fn test_object_global_symbol_values() {
        let source = ".globl entry\n.text\nnop_pad: addi x0, x0, 0\n\
                      entry: addi x0, x0, 0\n";
        let program = assemble(source, true);
        let image = emit_object(&program).unwrap();
        let header = ElfHeader::parse(&image).unwrap();
        let shdrs = parse_section_headers(&image, &header).unwrap();
        let strtab = section_bytes(&image, &shdrs, 1).unwrap();
        let symtab = section_bytes(&image, &shdrs, 2).unwrap();
        // null + one global
        assert_eq!(symtab.len(), 2 * SYM_SIZE);
        let sym = SymtabEntry::parse(symtab, SYM_SIZE).unwrap();
        assert_eq!(cstr_at(strtab, sym.name_off as usize).unwrap(), "entry");
        assert_eq!(sym.value, 4); // section-relative
        assert_eq!(sym.shndx, 3); // .text
    }

    #[test]
    fn test_object_undefined_global_fails() {
        let program = assemble(".globl missing\n", true);
        assert_eq!(
            emit_object(&program).unwrap_err(),
            ElfError::UndefinedGlobal("missing".to_string())
        );
    }

    #[test]
    fn test_readelf_view() {
        let program = assemble(
            ".globl _start\n_start: ret\n.data\nv: .word 1\n",
            false,
        );
        let image = emit_executable(&program).unwrap();
        let view = read(&image).unwrap();
        assert_eq!(view.class, "ELF32");
        assert_eq!(view.endianness, "Little endian");
        assert_eq!(view.abi, "UNIX - System V");
        assert_eq!(view.type_name, "Executable");
        assert_eq!(view.machine, "RISC-V");
        assert_eq!(view.segments.len(), 2);
        assert_eq!(view.segments[0].type_name, "LOAD");
        assert_eq!(view.segments[0].flags, "RX");
        assert_eq!(view.segments[1].flags, "RW");
        let names: Vec<_> =
            view.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["", ".strtab", ".text", ".data"]);
    }
}
