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

use crate::emulator::devices;
use crate::memory::{MMIO_BASE, MMIO_END, SectionId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub address: u32,
    pub section: SectionId,
}

// The symbol table maps label names to their resolved addresses. Labels
// are case-sensitive, unlike mnemonics.
pub type SymbolTable = HashMap<String, Symbol>;

/// A defined label in definition order; kept alongside the hash table so
/// the backtrace printer can scan for the nearest preceding label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub address: u32,
    pub section: SectionId,
}

/// The device-register labels every assembly starts with.
pub fn builtin_labels(mmio: SectionId) -> Vec<Label> {
    let mut out = Vec::new();
    let mut push = |name: String, address: u32| {
        out.push(Label { name, address, section: mmio });
    };

    push("_MMIO_BASE".to_string(), MMIO_BASE);
    push("_MMIO_END".to_string(), MMIO_END);

    for i in 0..4u32 {
        let base = MMIO_BASE + i * devices::DEVICE_RSV;
        push(format!("_DMA{i}_BASE"), base);
        push(format!("_DMA{i}_DST_ADDR"), base + devices::DMA_DST_ADDR);
        push(format!("_DMA{i}_SRC_ADDR"), base + devices::DMA_SRC_ADDR);
        push(format!("_DMA{i}_DST_INC"), base + devices::DMA_DST_INC);
        push(format!("_DMA{i}_SRC_INC"), base + devices::DMA_SRC_INC);
        push(format!("_DMA{i}_LEN"), base + devices::DMA_LEN);
        push(format!("_DMA{i}_TRANS_SIZE"), base + devices::DMA_TRANS_SIZE);
        push(format!("_DMA{i}_CNTL"), base + devices::DMA_CNTL);
        push(format!("_DMA{i}_END"), base + devices::DMA_REGS_END);
    }

    let power = devices::POWER0_BASE;
    push("_POWER0_BASE".to_string(), power);
    push("_POWER0_CNTL".to_string(), power + devices::POWER_CNTL);
    push("_POWER0_END".to_string(), power + devices::POWER_REGS_END);

    let console = devices::CONSOLE0_BASE;
    push("_CONSOLE0_BASE".to_string(), console);
    push("_CONSOLE0_IN".to_string(), console + devices::CONSOLE_IN);
    push("_CONSOLE0_OUT".to_string(), console + devices::CONSOLE_OUT);
    push("_CONSOLE0_IN_SIZE".to_string(), console + devices::CONSOLE_IN_SIZE);
    push(
        "_CONSOLE0_BATCH_SIZE".to_string(),
        console + devices::CONSOLE_BATCH_SIZE,
    );
    push("_CONSOLE0_CNTL".to_string(), console + devices::CONSOLE_CNTL);
    push("_CONSOLE0_END".to_string(), console + devices::CONSOLE_REGS_END);

    let ric = devices::RIC0_BASE;
    push("_RIC0_BASE".to_string(), ric);
    push("_RIC0_DEVADDR".to_string(), ric + devices::RIC_DEVADDR);
    push("_RIC0_END".to_string(), ric + devices::RIC_REGS_END);

    out
}

/// Finds the label with the highest address not above `addr`, for
/// backtrace annotation.
pub fn nearest_label(labels: &[Label], addr: u32) -> Option<(&Label, u32)> {
    let mut closest: Option<&Label> = None;
    for label in labels {
        if label.address <= addr
            && closest.is_none_or(|c| label.address > c.address)
        {
            closest = Some(label);
        }
    }
    closest.map(|l| (l, addr - l.address))
}

pub fn symbol_table_from(labels: &[Label]) -> SymbolTable {
    labels
        .iter()
        .map(|l| {
            (l.name.clone(), Symbol { address: l.address, section: l.section })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_labels_cover_devices() {
        let labels = builtin_labels(SectionId(0));
        let find = |name: &str| {
            labels.iter().find(|l| l.name == name).map(|l| l.address)
        };
        assert_eq!(find("_MMIO_BASE"), Some(MMIO_BASE));
        assert_eq!(find("_DMA0_CNTL"), Some(MMIO_BASE + 24));
        assert_eq!(
            find("_DMA3_BASE"),
            Some(MMIO_BASE + 3 * devices::DEVICE_RSV)
        );
        assert_eq!(find("_CONSOLE0_OUT"), Some(devices::CONSOLE0_BASE + 1));
        assert_eq!(find("_RIC0_DEVADDR"), Some(devices::RIC0_BASE));
    }

    #[test]
    fn test_nearest_label_picks_closest_preceding() {
        let labels = vec![
            Label { name: "a".into(), address: 0x100, section: SectionId(0) },
            Label { name: "b".into(), address: 0x110, section: SectionId(0) },
        ];
        let (label, off) = nearest_label(&labels, 0x114).unwrap();
        assert_eq!(label.name, "b");
        assert_eq!(off, 4);
        assert!(nearest_label(&labels, 0xFF).is_none());
    }
}
