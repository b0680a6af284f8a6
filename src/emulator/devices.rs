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

//! The memory-mapped device model. The MMIO window is split into
//! equally sized slots; each device owns one slot's worth of register
//! backing store and a handler that runs after writes land in (or
//! before reads are served from) that store.
//!
//! The DMA handler reuses the emulator's LOAD/STORE paths. That cannot
//! re-enter the fetch loop, so the dispatch stays flat.

use super::{Machine, cause};
use crate::memory::MMIO_BASE;

pub const DEVICE_RSV: u32 = 0x10000;
pub const DEVICE_COUNT: usize = 7;

pub const DMA0_BASE: u32 = MMIO_BASE;
pub const POWER0_BASE: u32 = MMIO_BASE + 4 * DEVICE_RSV;
pub const CONSOLE0_BASE: u32 = MMIO_BASE + 5 * DEVICE_RSV;
pub const RIC0_BASE: u32 = MMIO_BASE + 6 * DEVICE_RSV;

// DMA channel registers, packed little-endian in declaration order.
pub const DMA_DST_ADDR: u32 = 0;
pub const DMA_SRC_ADDR: u32 = 4;
pub const DMA_DST_INC: u32 = 8;
pub const DMA_SRC_INC: u32 = 12;
pub const DMA_LEN: u32 = 16;
pub const DMA_TRANS_SIZE: u32 = 20;
pub const DMA_CNTL: u32 = 24;
pub const DMA_REGS_END: u32 = 28;
pub const DMA_CNTL_GO: u32 = 1 << 0;

pub const POWER_CNTL: u32 = 0;
pub const POWER_REGS_END: u32 = 1;
pub const POWER_CNTL_SHUTDOWN: u8 = 1 << 0;

pub const CONSOLE_IN: u32 = 0;
pub const CONSOLE_OUT: u32 = 1;
pub const CONSOLE_IN_SIZE: u32 = 2;
pub const CONSOLE_BATCH_SIZE: u32 = 6;
pub const CONSOLE_CNTL: u32 = 10;
pub const CONSOLE_REGS_END: u32 = 14;
pub const CONSOLE_CNTL_INTERRUPT: u32 = 1 << 0;

pub const RIC_DEVADDR: u32 = 0;
pub const RIC_REGS_END: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Dma,
    Power,
    Console,
    Ric,
}

const DEVICE_TABLE: [DeviceKind; DEVICE_COUNT] = [
    DeviceKind::Dma,     // DMA 0
    DeviceKind::Dma,     // DMA 1
    DeviceKind::Dma,     // DMA 2
    DeviceKind::Dma,     // DMA 3
    DeviceKind::Power,   // POWER 0
    DeviceKind::Console, // CONSOLE 0
    DeviceKind::Ric,     // RIC 0
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MmioOp {
    Read,
    Write,
}

/// Register backing store for every device slot.
#[derive(Debug, Clone)]
pub struct DeviceBank {
    regs: Vec<Vec<u8>>,
}

impl DeviceBank {
    pub fn new() -> DeviceBank {
        DeviceBank {
            regs: vec![vec![0u8; DEVICE_RSV as usize]; DEVICE_COUNT],
        }
    }
}

impl Default for DeviceBank {
    fn default() -> Self {
        Self::new()
    }
}

fn read_buf(buf: &[u8], off: usize, size: u32) -> Option<u32> {
    let bytes = buf.get(off..off.checked_add(size as usize)?)?;
    Some(match size {
        1 => bytes[0] as u32,
        2 => u16::from_le_bytes(bytes.try_into().unwrap()) as u32,
        4 => u32::from_le_bytes(bytes.try_into().unwrap()),
        _ => return None,
    })
}

fn write_buf(buf: &mut [u8], off: usize, size: u32, value: u32) -> bool {
    let Some(end) = off.checked_add(size as usize) else {
        return false;
    };
    let Some(bytes) = buf.get_mut(off..end) else {
        return false;
    };
    match size {
        1 => bytes[0] = value as u8,
        2 => bytes.copy_from_slice(&(value as u16).to_le_bytes()),
        4 => bytes.copy_from_slice(&value.to_le_bytes()),
        _ => return false,
    }
    true
}

impl Machine {
    pub(super) fn mmio_read(&mut self, off: u32, size: u32) -> Option<u32> {
        let dev = (off / DEVICE_RSV) as usize;
        if dev >= DEVICE_COUNT {
            return None;
        }
        let reg_off = (off % DEVICE_RSV) as usize;
        if !self.run_device(dev, reg_off as u32, MmioOp::Read) {
            return None;
        }
        read_buf(&self.devices.regs[dev], reg_off, size)
    }

    pub(super) fn mmio_write(&mut self, off: u32, size: u32, value: u32) -> bool {
        let dev = (off / DEVICE_RSV) as usize;
        if dev >= DEVICE_COUNT {
            return false;
        }
        let reg_off = (off % DEVICE_RSV) as usize;
        if !write_buf(&mut self.devices.regs[dev], reg_off, size, value) {
            return false;
        }
        self.run_device(dev, reg_off as u32, MmioOp::Write)
    }

    fn run_device(&mut self, dev: usize, off: u32, op: MmioOp) -> bool {
        match DEVICE_TABLE[dev] {
            DeviceKind::Dma => self.dma_handler(dev, op),
            DeviceKind::Power => self.power_handler(dev, op),
            DeviceKind::Console => self.console_handler(dev, off, op),
            DeviceKind::Ric => op == MmioOp::Read,
        }
    }

    fn dma_reg(&self, dev: usize, reg: u32) -> u32 {
        read_buf(&self.devices.regs[dev], reg as usize, 4).unwrap()
    }

    // A write with the GO bit set performs the whole transfer
    // synchronously, then clears GO. Any faulting intermediate access
    // aborts the transfer and fails the triggering store.
    fn dma_handler(&mut self, dev: usize, op: MmioOp) -> bool {
        if op == MmioOp::Read {
            return true;
        }

        let cntl = self.dma_reg(dev, DMA_CNTL);
        if cntl & DMA_CNTL_GO == 0 {
            return true;
        }
        write_buf(
            &mut self.devices.regs[dev],
            DMA_CNTL as usize,
            4,
            cntl & !DMA_CNTL_GO,
        );

        let dst_addr = self.dma_reg(dev, DMA_DST_ADDR);
        let src_addr = self.dma_reg(dev, DMA_SRC_ADDR);
        let dst_inc = self.dma_reg(dev, DMA_DST_INC);
        let src_inc = self.dma_reg(dev, DMA_SRC_INC);
        let len = self.dma_reg(dev, DMA_LEN);
        let trans_size = self.dma_reg(dev, DMA_TRANS_SIZE);

        if !matches!(trans_size, 1 | 2 | 4) {
            return false;
        }

        let mut dst_off = 0u32;
        let mut src_off = 0u32;
        let mut moved = 0u32;
        while moved < len {
            let data = match self
                .mem_load(src_addr.wrapping_add(src_off), trans_size)
            {
                Ok(data) => data,
                Err(_) => return false,
            };
            if self
                .mem_store(dst_addr.wrapping_add(dst_off), data, trans_size)
                .is_err()
            {
                return false;
            }
            dst_off = dst_off.wrapping_add(dst_inc);
            src_off = src_off.wrapping_add(src_inc);
            moved += trans_size;
        }
        true
    }

    fn power_handler(&mut self, dev: usize, op: MmioOp) -> bool {
        if op == MmioOp::Read {
            return true;
        }
        if self.devices.regs[dev][POWER_CNTL as usize] & POWER_CNTL_SHUTDOWN != 0 {
            self.exited = true;
        }
        true
    }

    fn console_handler(&mut self, dev: usize, off: u32, op: MmioOp) -> bool {
        if op == MmioOp::Write && off == CONSOLE_OUT {
            let out = self.devices.regs[dev][CONSOLE_OUT as usize];
            self.console.putchar(out);
        }

        // per-byte accumulation toward the programmed batch size; on
        // overflow the interrupt controller is notified
        let cntl = read_buf(&self.devices.regs[dev], CONSOLE_CNTL as usize, 4)
            .unwrap();
        if cntl & CONSOLE_CNTL_INTERRUPT != 0 {
            let in_size =
                read_buf(&self.devices.regs[dev], CONSOLE_IN_SIZE as usize, 4)
                    .unwrap()
                    .wrapping_add(1);
            let batch =
                read_buf(&self.devices.regs[dev], CONSOLE_BATCH_SIZE as usize, 4)
                    .unwrap();
            if in_size >= batch {
                write_buf(
                    &mut self.devices.regs[dev],
                    CONSOLE_IN_SIZE as usize,
                    4,
                    0,
                );
                self.ric_notify(CONSOLE0_BASE);
            } else {
                write_buf(
                    &mut self.devices.regs[dev],
                    CONSOLE_IN_SIZE as usize,
                    4,
                    in_size,
                );
            }
        }

        true
    }

    /// Latches the notifying device's base address and raises the
    /// supervisor-external interrupt.
    fn ric_notify(&mut self, devaddr: u32) {
        let ric = (RIC0_BASE - MMIO_BASE) as usize / DEVICE_RSV as usize;
        write_buf(&mut self.devices.regs[ric], RIC_DEVADDR as usize, 4, devaddr);
        self.set_interrupt_pending(cause::SUPERVISOR_EXTERNAL & !cause::INTERRUPT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{BufferConsole, Machine};
    use crate::parser::parse_source;

    fn machine_for(source: &str) -> Machine {
        let lines = parse_source(source).unwrap();
        let program = crate::assembler::assemble_lines(&lines, false).unwrap();
        Machine::new(program)
    }

    #[test]
    fn test_console_out_reaches_host() {
        let console = BufferConsole::default();
        let lines = parse_source(".data\n").unwrap();
        let program = crate::assembler::assemble_lines(&lines, false).unwrap();
        let mut machine =
            Machine::with_console(program, Box::new(console.clone()));
        machine.enter_kernel();
        machine.store(CONSOLE0_BASE + CONSOLE_OUT, b'!' as u32, 1).unwrap();
        assert_eq!(console.take(), b"!");
    }

    #[test]
    fn test_console_batch_raises_external_interrupt() {
        let console = BufferConsole::default();
        let lines = parse_source(".data\n").unwrap();
        let program = crate::assembler::assemble_lines(&lines, false).unwrap();
        let mut machine =
            Machine::with_console(program, Box::new(console.clone()));
        machine.enter_kernel();
        machine
            .store(CONSOLE0_BASE + CONSOLE_BATCH_SIZE, 2, 4)
            .unwrap();
        machine
            .store(CONSOLE0_BASE + CONSOLE_CNTL, CONSOLE_CNTL_INTERRUPT, 4)
            .unwrap();
        // the cntl write itself ticks the counter once
        machine.store(CONSOLE0_BASE + CONSOLE_OUT, b'a' as u32, 1).unwrap();
        let sei = cause::SUPERVISOR_EXTERNAL & !cause::INTERRUPT;
        assert!(machine.interrupt_pending(sei));
        // the notifying device address is latched in the controller
        assert_eq!(
            machine.load(RIC0_BASE + RIC_DEVADDR, 4).unwrap(),
            CONSOLE0_BASE
        );
    }

    #[test]
    fn test_power_shutdown_exits() {
        let mut machine = machine_for(".data\n");
        machine.enter_kernel();
        machine
            .store(POWER0_BASE + POWER_CNTL, POWER_CNTL_SHUTDOWN as u32, 1)
            .unwrap();
        assert!(machine.exited);
    }

    #[test]
    fn test_dma_copies_between_sections() {
        let mut machine =
            machine_for(".data\nsrc: .word 0x11223344, 0x55667788\ndst: .word 0, 0\n");
        machine.enter_kernel();
        let data = crate::memory::DATA_BASE;
        machine.store(DMA0_BASE + DMA_SRC_ADDR, data, 4).unwrap();
        machine.store(DMA0_BASE + DMA_DST_ADDR, data + 8, 4).unwrap();
        machine.store(DMA0_BASE + DMA_SRC_INC, 4, 4).unwrap();
        machine.store(DMA0_BASE + DMA_DST_INC, 4, 4).unwrap();
        machine.store(DMA0_BASE + DMA_LEN, 8, 4).unwrap();
        machine.store(DMA0_BASE + DMA_TRANS_SIZE, 4, 4).unwrap();
        machine.store(DMA0_BASE + DMA_CNTL, DMA_CNTL_GO, 4).unwrap();

        assert_eq!(machine.load(data + 8, 4).unwrap(), 0x11223344);
        assert_eq!(machine.load(data + 12, 4).unwrap(), 0x55667788);
        // GO auto-clears once the transfer completes
        assert_eq!(machine.load(DMA0_BASE + DMA_CNTL, 4).unwrap(), 0);
    }

    #[test]
    fn test_dma_faulting_transfer_fails_the_store() {
        let mut machine = machine_for(".data\ndst: .word 0\n");
        machine.enter_kernel();
        machine.store(DMA0_BASE + DMA_SRC_ADDR, 0xDEAD0000, 4).unwrap();
        machine
            .store(DMA0_BASE + DMA_DST_ADDR, crate::memory::DATA_BASE, 4)
            .unwrap();
        machine.store(DMA0_BASE + DMA_LEN, 4, 4).unwrap();
        machine.store(DMA0_BASE + DMA_TRANS_SIZE, 4, 4).unwrap();
        assert!(
            machine.store(DMA0_BASE + DMA_CNTL, DMA_CNTL_GO, 4).is_err()
        );
    }

    #[test]
    fn test_mmio_requires_supervisor() {
        let mut machine = machine_for(".data\n");
        assert!(machine.load(CONSOLE0_BASE, 1).is_err());
    }

    #[test]
    fn test_mmio_out_of_range_device() {
        let mut machine = machine_for(".data\n");
        machine.enter_kernel();
        assert!(machine.load(MMIO_BASE + 7 * DEVICE_RSV, 4).is_err());
    }
}
