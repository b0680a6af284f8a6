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

//! The address-space model shared by the assembler, the object codec and
//! the emulator: an ordered set of non-overlapping sections.

pub const TEXT_BASE: u32 = 0x0040_0000;
pub const TEXT_END: u32 = 0x1000_0000;
pub const DATA_BASE: u32 = 0x1000_0000;
pub const DATA_END: u32 = 0x7000_0000;
pub const STACK_TOP: u32 = 0x7FFF_F000;
pub const STACK_LEN: u32 = 4096;
pub const STACK_BASE: u32 = STACK_TOP - STACK_LEN;
pub const MMIO_BASE: u32 = 0xFFE0_0000;
pub const MMIO_END: u32 = 0xFFE8_0000;
pub const KERNEL_DATA_BASE: u32 = 0xFFF0_0000;
pub const KERNEL_DATA_END: u32 = 0xFFF7_0000;
pub const KERNEL_TEXT_BASE: u32 = 0xFFF8_0000;
pub const KERNEL_TEXT_END: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Branch,
    Jal,
    Hi20,
    Lo12I,
    Lo12S,
    Abs32,
}

impl RelocKind {
    /// The standard RV32 relocation numbers carried in `rela.info`.
    pub fn elf_type(self) -> u8 {
        match self {
            RelocKind::Abs32 => 1,
            RelocKind::Branch => 16,
            RelocKind::Jal => 17,
            RelocKind::Hi20 => 26,
            RelocKind::Lo12I => 27,
            RelocKind::Lo12S => 28,
        }
    }

    pub fn from_elf_type(ty: u8) -> Option<RelocKind> {
        Some(match ty {
            1 => RelocKind::Abs32,
            16 => RelocKind::Branch,
            17 => RelocKind::Jal,
            26 => RelocKind::Hi20,
            27 => RelocKind::Lo12I,
            28 => RelocKind::Lo12S,
            _ => return None,
        })
    }
}

/// A pending patch against a section's emitted bytes. The symbol is an
/// index into the owning program's extern table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u32,
    pub symbol: usize,
    pub addend: u32,
    pub kind: RelocKind,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub base: u32,
    /// One past the highest address this section may ever cover.
    pub limit: u32,
    pub contents: Vec<u8>,
    pub align: u32,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Only reachable from supervisor mode.
    pub supervisor: bool,
    /// Physical sections appear in emitted object files; the stack and
    /// the MMIO window are runtime-only.
    pub physical: bool,
    pub relocations: Vec<Relocation>,
}

impl Section {
    pub fn end(&self) -> u32 {
        self.base + self.contents.len() as u32
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.limit
    }

    /// Byte view of [addr, addr+size), or None when the range is not
    /// wholly backed by emitted contents.
    pub fn bytes(&self, addr: u32, size: u32) -> Option<&[u8]> {
        let off = addr.checked_sub(self.base)? as usize;
        let end = off.checked_add(size as usize)?;
        self.contents.get(off..end)
    }

    pub fn bytes_mut(&mut self, addr: u32, size: u32) -> Option<&mut [u8]> {
        let off = addr.checked_sub(self.base)? as usize;
        let end = off.checked_add(size as usize)?;
        self.contents.get_mut(off..end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    pub sections: Vec<Section>,
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap { sections: Vec::new() }
    }

    pub fn push(&mut self, section: Section) -> SectionId {
        self.sections.push(section);
        SectionId(self.sections.len() - 1)
    }

    pub fn get(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    pub fn get_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn section_at(&self, addr: u32) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| s.contains(addr))
            .map(SectionId)
    }

    pub fn find_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections.iter().position(|s| s.name == name).map(SectionId)
    }

    /// The runtime-only regions: the guest stack (prefilled with a junk
    /// pattern so reads of uninitialized slots are recognizable) and the
    /// MMIO window, whose contents vector is never used.
    pub fn push_runtime_sections(&mut self) {
        self.push(Section {
            name: "stack".to_string(),
            base: STACK_BASE,
            limit: STACK_TOP,
            contents: vec![0xAB; STACK_LEN as usize],
            align: 1,
            read: true,
            write: true,
            execute: false,
            supervisor: false,
            physical: false,
            relocations: Vec::new(),
        });
        self.push(Section {
            name: ".mmio".to_string(),
            base: MMIO_BASE,
            limit: MMIO_END,
            contents: Vec::new(),
            align: 1,
            read: true,
            write: true,
            execute: false,
            supervisor: true,
            physical: false,
            relocations: Vec::new(),
        });
    }
}

/// The fixed section set every assembly starts from, in emission order.
pub struct AssemblySections {
    pub map: MemoryMap,
    pub text: SectionId,
    pub data: SectionId,
    pub kernel_text: SectionId,
    pub kernel_data: SectionId,
    pub mmio: SectionId,
}

impl AssemblySections {
    pub fn new() -> AssemblySections {
        let mut map = MemoryMap::new();
        map.push_runtime_sections();
        let mmio = map.find_by_name(".mmio").unwrap();
        let text = map.push(Section {
            name: ".text".to_string(),
            base: TEXT_BASE,
            limit: TEXT_END,
            contents: Vec::new(),
            align: 4,
            read: true,
            write: false,
            execute: true,
            supervisor: false,
            physical: true,
            relocations: Vec::new(),
        });
        let data = map.push(Section {
            name: ".data".to_string(),
            base: DATA_BASE,
            limit: DATA_END,
            contents: Vec::new(),
            align: 1,
            read: true,
            write: true,
            execute: false,
            supervisor: false,
            physical: true,
            relocations: Vec::new(),
        });
        let kernel_text = map.push(Section {
            name: ".kernel_text".to_string(),
            base: KERNEL_TEXT_BASE,
            limit: KERNEL_TEXT_END,
            contents: Vec::new(),
            align: 1,
            read: true,
            write: false,
            execute: true,
            supervisor: true,
            physical: false,
            relocations: Vec::new(),
        });
        let kernel_data = map.push(Section {
            name: ".kernel_data".to_string(),
            base: KERNEL_DATA_BASE,
            limit: KERNEL_DATA_END,
            contents: Vec::new(),
            align: 1,
            read: true,
            write: true,
            execute: false,
            supervisor: true,
            physical: false,
            relocations: Vec::new(),
        });
        AssemblySections { map, text, data, kernel_text, kernel_data, mmio }
    }
}

impl Default for AssemblySections {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_lookup_by_address() {
        let fixed = AssemblySections::new();
        let map = &fixed.map;
        assert_eq!(map.section_at(TEXT_BASE), Some(fixed.text));
        assert_eq!(map.section_at(TEXT_BASE + 0x1000), Some(fixed.text));
        assert_eq!(map.section_at(DATA_BASE), Some(fixed.data));
        assert_eq!(map.section_at(STACK_TOP - 4), map.find_by_name("stack"));
        assert_eq!(map.section_at(MMIO_BASE), Some(fixed.mmio));
        assert_eq!(map.section_at(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_section_byte_views_bounded_by_contents() {
        let fixed = AssemblySections::new();
        let mut map = fixed.map;
        let text = map.get_mut(fixed.text);
        text.contents.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(text.bytes(TEXT_BASE, 4), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(text.bytes(TEXT_BASE + 2, 2), Some(&[3u8, 4][..]));
        // inside the limit but past the emitted contents
        assert_eq!(text.bytes(TEXT_BASE + 2, 4), None);
        assert_eq!(text.bytes(TEXT_BASE - 4, 4), None);
    }

    #[test]
    fn test_stack_prefilled_with_junk() {
        let fixed = AssemblySections::new();
        let stack = fixed.map.find_by_name("stack").unwrap();
        let sec = fixed.map.get(stack);
        assert_eq!(sec.contents.len(), STACK_LEN as usize);
        assert!(sec.contents.iter().all(|&b| b == 0xAB));
    }
}
