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

//! The fetch/decode/execute interpreter with supervisor traps and the
//! privilege split. One `step` executes one guest instruction, except
//! that delivering a pending interrupt redirects the fetch to the trap
//! vector first, so the delivering step runs one handler instruction.

pub mod callsan;
pub mod devices;

use crate::assembler::Program;
use crate::assembler::symbol_table::Label;
use crate::errors::RuntimeError;
use crate::memory::{MMIO_BASE, MemoryMap, STACK_TOP};
use callsan::CallSanitizer;
use devices::DeviceBank;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

pub const CSR_SSTATUS: usize = 0x100;
pub const CSR_SIE: usize = 0x104;
pub const CSR_STVEC: usize = 0x105;
pub const CSR_SSCRATCH: usize = 0x140;
pub const CSR_SEPC: usize = 0x141;
pub const CSR_SCAUSE: usize = 0x142;
pub const CSR_SIP: usize = 0x144;
pub const CSR_MSTATUS: usize = 0x300;
pub const CSR_MIE: usize = 0x304;
pub const CSR_MIP: usize = 0x344;

pub const STATUS_SIE: u32 = 1 << 1;
pub const STATUS_SPIE: u32 = 1 << 5;
pub const STATUS_SPP: u32 = 1 << 8;
pub const STATUS_FS_MASK: u32 = 0b11 << 13;

const SSTATUS_MASK: u32 =
    STATUS_SIE | STATUS_SPIE | STATUS_SPP | STATUS_FS_MASK;
const SUPERVISOR_INT_MASK: u32 = (1 << 1) | (1 << 5) | (1 << 9);

pub mod cause {
    //! Trap cause codes; interrupts carry the high bit.
    pub const INTERRUPT: u32 = 1 << 31;

    pub const USER_ECALL: u32 = 0x08;
    pub const SUPERVISOR_ECALL: u32 = 0x09;

    pub const SUPERVISOR_SOFTWARE: u32 = INTERRUPT | 1;
    pub const SUPERVISOR_TIMER: u32 = INTERRUPT | 5;
    pub const SUPERVISOR_EXTERNAL: u32 = INTERRUPT | 9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessError {
    Unmapped,
    Forbidden,
    Supervisor,
}

/// Destination for guest console output and host syscall printing.
pub trait HostConsole {
    fn putchar(&mut self, byte: u8);
}

pub struct StdoutConsole;

impl HostConsole for StdoutConsole {
    fn putchar(&mut self, byte: u8) {
        let mut out = std::io::stdout();
        let _ = out.write_all(&[byte]);
        let _ = out.flush();
    }
}

/// Captures output in memory; the shared handle keeps it readable after
/// the machine takes ownership of the sink.
#[derive(Default, Clone)]
pub struct BufferConsole {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl BufferConsole {
    pub fn take(&self) -> Vec<u8> {
        self.bytes.borrow_mut().split_off(0)
    }
}

impl HostConsole for BufferConsole {
    fn putchar(&mut self, byte: u8) {
        self.bytes.borrow_mut().push(byte);
    }
}

pub struct Machine {
    pub memory: MemoryMap,
    pub labels: Vec<Label>,
    pub text_lines: Vec<u32>,
    pub regs: [u32; 32],
    pub pc: u32,
    pub csr: Box<[u32; 4096]>,
    pub privilege: Privilege,
    pub exited: bool,
    pub exit_code: i32,
    pub sanitizer: CallSanitizer,
    devices: DeviceBank,
    console: Box<dyn HostConsole>,
}

// end is inclusive, as in hardware field notation
fn extr(val: u32, end: u32, start: u32) -> u32 {
    if start == 0 && end == 31 {
        return val;
    }
    let mask = (1u32 << (end + 1 - start)) - 1;
    (val >> start) & mask
}

fn sext(x: u32, bits: u32) -> i32 {
    let m = 32 - bits;
    ((x << m) as i32) >> m
}

fn div32(a: i32, b: i32) -> i32 {
    if b == 0 {
        -1
    } else if a == i32::MIN && b == -1 {
        a
    } else {
        a / b
    }
}

fn divu32(a: u32, b: u32) -> u32 {
    if b == 0 { u32::MAX } else { a / b }
}

fn rem32(a: i32, b: i32) -> i32 {
    if b == 0 {
        a
    } else if a == i32::MIN && b == -1 {
        0
    } else {
        a % b
    }
}

fn remu32(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { a % b }
}

impl Machine {
    pub fn new(program: Program) -> Machine {
        Machine::with_console(program, Box::new(StdoutConsole))
    }

    pub fn with_console(
        program: Program,
        console: Box<dyn HostConsole>,
    ) -> Machine {
        let Program {
            memory,
            labels,
            text_lines,
            entry,
            supervisor_entry,
            ..
        } = program;

        let mut csr = Box::new([0u32; 4096]);
        csr[CSR_MSTATUS] |= STATUS_SIE;
        csr[CSR_MIE] |= 1 << (cause::SUPERVISOR_SOFTWARE & !cause::INTERRUPT);
        csr[CSR_MIE] |= 1 << (cause::SUPERVISOR_TIMER & !cause::INTERRUPT);
        csr[CSR_MIE] |= 1 << (cause::SUPERVISOR_EXTERNAL & !cause::INTERRUPT);

        let mut regs = [0u32; 32];
        regs[2] = STACK_TOP;

        Machine {
            memory,
            labels,
            text_lines,
            regs,
            pc: entry,
            csr,
            privilege: if supervisor_entry {
                Privilege::Supervisor
            } else {
                Privilege::User
            },
            exited: false,
            exit_code: 0,
            sanitizer: CallSanitizer::new(),
            devices: DeviceBank::new(),
            console,
        }
    }

    pub fn enter_kernel(&mut self) {
        self.privilege = Privilege::Supervisor;
    }

    pub fn leave_kernel(&mut self) {
        self.privilege = Privilege::User;
    }

    pub fn set_interrupt_pending(&mut self, intno: u32) {
        self.csr[CSR_MIP] |= 1 << intno;
    }

    pub fn clear_interrupt_pending(&mut self, intno: u32) {
        self.csr[CSR_MIP] &= !(1 << intno);
    }

    pub fn interrupt_pending(&self, intno: u32) -> bool {
        self.csr[CSR_MIP] & (1 << intno) != 0
    }

    /// Guest-visible load, obeying permissions at the current privilege.
    pub fn load(&mut self, addr: u32, size: u32) -> Result<u32, RuntimeError> {
        self.mem_load(addr, size).map_err(|e| match e {
            AccessError::Supervisor => RuntimeError::Protection(addr),
            _ => RuntimeError::Load(addr),
        })
    }

    /// Guest-visible store, obeying permissions at the current privilege.
    pub fn store(
        &mut self,
        addr: u32,
        value: u32,
        size: u32,
    ) -> Result<(), RuntimeError> {
        self.mem_store(addr, value, size).map_err(|e| match e {
            AccessError::Supervisor => RuntimeError::Protection(addr),
            _ => RuntimeError::Store(addr),
        })
    }

    fn mem_load(&mut self, addr: u32, size: u32) -> Result<u32, AccessError> {
        let id = self.memory.section_at(addr).ok_or(AccessError::Unmapped)?;
        let (read, supervisor, mmio) = {
            let section = self.memory.get(id);
            (section.read, section.supervisor, section.base == MMIO_BASE)
        };
        if supervisor && self.privilege == Privilege::User {
            return Err(AccessError::Supervisor);
        }
        if !read {
            return Err(AccessError::Forbidden);
        }
        if mmio {
            return self
                .mmio_read(addr - MMIO_BASE, size)
                .ok_or(AccessError::Forbidden);
        }
        let bytes = self
            .memory
            .get(id)
            .bytes(addr, size)
            .ok_or(AccessError::Unmapped)?;
        let mut value = 0u32;
        for (i, b) in bytes.iter().enumerate() {
            value |= (*b as u32) << (8 * i);
        }
        Ok(value)
    }

    fn mem_store(
        &mut self,
        addr: u32,
        value: u32,
        size: u32,
    ) -> Result<(), AccessError> {
        let id = self.memory.section_at(addr).ok_or(AccessError::Unmapped)?;
        let (write, supervisor, mmio) = {
            let section = self.memory.get(id);
            (section.write, section.supervisor, section.base == MMIO_BASE)
        };
        if supervisor && self.privilege == Privilege::User {
            return Err(AccessError::Supervisor);
        }
        if !write {
            return Err(AccessError::Forbidden);
        }
        if mmio {
            if self.mmio_write(addr - MMIO_BASE, size, value) {
                return Ok(());
            }
            return Err(AccessError::Forbidden);
        }
        let bytes = self
            .memory
            .get_mut(id)
            .bytes_mut(addr, size)
            .ok_or(AccessError::Unmapped)?;
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    fn kernel_text_present(&self) -> bool {
        self.memory
            .find_by_name(".kernel_text")
            .map(|id| !self.memory.get(id).contents.is_empty())
            .unwrap_or(false)
    }

    fn rdcsr(&self, csr: usize) -> u32 {
        let (csr, mask) = match csr {
            CSR_SSTATUS => (CSR_MSTATUS, SSTATUS_MASK),
            CSR_SIE => (CSR_MIE, SUPERVISOR_INT_MASK),
            CSR_SIP => (CSR_MIP, SUPERVISOR_INT_MASK),
            other => (other, u32::MAX),
        };
        self.csr[csr] & mask
    }

    fn wrcsr(&mut self, csr: usize, value: u32) {
        // for sip only the software-interrupt bit is writable, since a
        // write is how software interrupts are EOI'd; the other pending
        // bits are owned by their devices
        let (csr, mask) = match csr {
            CSR_SSTATUS => (CSR_MSTATUS, SSTATUS_MASK),
            CSR_SIE => (CSR_MIE, SUPERVISOR_INT_MASK),
            CSR_SIP => (
                CSR_MIP,
                1 << (cause::SUPERVISOR_SOFTWARE & !cause::INTERRUPT),
            ),
            other => (other, u32::MAX),
        };
        self.csr[csr] = (self.csr[csr] & !mask) | (value & mask);
    }

    /// Saves pc/cause, masks interrupts, switches to supervisor and
    /// redirects to stvec (vectored for interrupt causes when mode = 1).
    pub fn deliver_trap(&mut self, trap_cause: u32) {
        let is_interrupt = trap_cause & cause::INTERRUPT != 0;
        let off = trap_cause & !cause::INTERRUPT;
        debug_assert!(off < 32);

        let prev = self.privilege;
        self.csr[CSR_SEPC] = self.pc;
        self.csr[CSR_SCAUSE] = trap_cause;

        let mut status = self.csr[CSR_MSTATUS];
        let was_enabled = status & STATUS_SIE != 0;
        self.privilege = Privilege::Supervisor;

        status &= !STATUS_SIE;
        status = (status & !STATUS_SPIE)
            | if was_enabled { STATUS_SPIE } else { 0 };
        // SPP records only whether we came from user mode
        status = (status & !STATUS_SPP)
            | if prev != Privilege::User { STATUS_SPP } else { 0 };
        self.csr[CSR_MSTATUS] = status;

        let tvec_base = self.csr[CSR_STVEC] & !0x3;
        let tvec_mode = self.csr[CSR_STVEC] & 0x3;
        if tvec_mode == 1 && is_interrupt {
            self.pc = tvec_base + (off << 2);
        } else {
            self.pc = tvec_base;
        }
    }

    fn do_sret(&mut self) -> Result<(), RuntimeError> {
        if self.privilege != Privilege::Supervisor {
            return Err(RuntimeError::UnhandledInsn(self.pc));
        }
        let mut status = self.csr[CSR_MSTATUS];
        let old_spp = status & STATUS_SPP != 0;
        let old_spie = status & STATUS_SPIE != 0;
        status =
            (status & !STATUS_SIE) | if old_spie { STATUS_SIE } else { 0 };
        status |= STATUS_SPIE;
        status &= !STATUS_SPP;
        self.csr[CSR_MSTATUS] = status;
        self.privilege = if old_spp {
            Privilege::Supervisor
        } else {
            Privilege::User
        };
        self.pc = self.csr[CSR_SEPC];
        Ok(())
    }

    fn print_decimal(&mut self, value: u32) {
        let mut value = value;
        if (value as i32) < 0 {
            self.console.putchar(b'-');
            value = value.wrapping_neg();
        }
        let mut digits = [0u8; 10];
        let mut n = 0;
        loop {
            digits[n] = b'0' + (value % 10) as u8;
            value /= 10;
            n += 1;
            if value == 0 {
                break;
            }
        }
        while n > 0 {
            n -= 1;
            self.console.putchar(digits[n]);
        }
    }

    // With no kernel loaded, ECALL is serviced by the host; otherwise it
    // traps into the guest kernel with the privilege-appropriate cause.
    fn do_syscall(&mut self) -> Result<(), RuntimeError> {
        if self.kernel_text_present() {
            let trap_cause = if self.privilege == Privilege::Supervisor {
                cause::SUPERVISOR_ECALL
            } else {
                cause::USER_ECALL
            };
            self.deliver_trap(trap_cause);
            return Ok(());
        }

        let param = self.regs[10];
        match self.regs[17] {
            1 => self.print_decimal(param),
            4 => {
                // NUL-terminated string
                let mut addr = param;
                loop {
                    let ch = self.load(addr, 1)?;
                    if ch == 0 {
                        break;
                    }
                    self.console.putchar(ch as u8);
                    addr = addr.wrapping_add(1);
                }
            }
            11 => self.console.putchar(param as u8),
            34 => {
                self.console.putchar(b'0');
                self.console.putchar(b'x');
                for i in (0..8).rev() {
                    let digit = (param >> (i * 4)) & 0xF;
                    self.console.putchar(b"0123456789abcdef"[digit as usize]);
                }
            }
            35 => {
                self.console.putchar(b'0');
                self.console.putchar(b'b');
                for i in (0..32).rev() {
                    self.console
                        .putchar(if (param >> i) & 1 != 0 { b'1' } else { b'0' });
                }
            }
            93 => {
                self.exited = true;
                self.exit_code = param as i32;
            }
            7 | 10 => self.exited = true,
            _ => {}
        }

        self.pc = self.pc.wrapping_add(4);
        Ok(())
    }

    /// Advances the machine by one instruction (or one trap delivery
    /// plus the first handler instruction). The pc stays at the
    /// offending instruction whenever an error is returned, except for
    /// the CSR privilege report, which fires after the access completes.
    pub fn step(&mut self) -> Result<(), RuntimeError> {
        self.regs[0] = 0;

        if self.csr[CSR_MSTATUS] & STATUS_SIE != 0 {
            let pending = self.csr[CSR_MIP] & self.csr[CSR_MIE];
            if pending != 0 {
                let intno = pending.trailing_zeros();
                self.deliver_trap(cause::INTERRUPT | intno);
            }
        }

        let inst = self
            .load(self.pc, 4)
            .map_err(|_| RuntimeError::Fetch(self.pc))?;
        self.execute(inst)
    }

    fn execute(&mut self, inst: u32) -> Result<(), RuntimeError> {
        let rd = extr(inst, 11, 7) as usize;
        let rs1 = extr(inst, 19, 15) as usize;
        let rs2 = extr(inst, 24, 20) as usize;
        let funct3 = extr(inst, 14, 12);
        let funct7 = extr(inst, 31, 25);

        let btype = sext(
            (extr(inst, 31, 31) << 12)
                | (extr(inst, 7, 7) << 11)
                | (extr(inst, 30, 25) << 5)
                | (extr(inst, 11, 8) << 1),
            13,
        );
        let stype =
            sext((extr(inst, 31, 25) << 5) | extr(inst, 11, 7), 12);
        let jtype = sext(
            (extr(inst, 31, 31) << 20)
                | (extr(inst, 19, 12) << 12)
                | (extr(inst, 20, 20) << 11)
                | (extr(inst, 30, 21) << 1),
            21,
        );
        let itype = sext(extr(inst, 31, 20), 12);
        let utype = (extr(inst, 31, 12) << 12) as i32;

        let s1 = self.regs[rs1];
        let s2 = self.regs[rs2];
        let opcode = inst & 0x7F;

        match opcode {
            // LUI
            0b0110111 => {
                self.regs[rd] = utype as u32;
                self.pc = self.pc.wrapping_add(4);
                self.sanitizer.note_write(rd);
            }

            // AUIPC
            0b0010111 => {
                self.regs[rd] = self.pc.wrapping_add(utype as u32);
                self.pc = self.pc.wrapping_add(4);
                self.sanitizer.note_write(rd);
            }

            // JAL
            0b1101111 => {
                self.regs[rd] = self.pc.wrapping_add(4);
                self.pc = self.pc.wrapping_add(jtype as u32);
                self.sanitizer.note_write(rd);
                if rd == 1 {
                    self.sanitizer.on_call(&self.regs, self.pc);
                }
            }

            // JALR
            0b1100111 => {
                self.sanitizer.check_readable(rs1)?;
                self.sanitizer.note_write(rd);
                self.regs[rd] = self.pc.wrapping_add(4);
                // the return check runs before the pc moves so errors
                // point at the ret itself
                if rd == 0 && rs1 == 1 {
                    self.sanitizer.on_ret(&self.regs)?;
                }
                self.pc = s1.wrapping_add(itype as u32) & !1;
                if rd == 1 {
                    self.sanitizer.on_call(&self.regs, self.pc);
                }
            }

            // BEQ/BNE/BLT/BGE/BLTU/BGEU
            0b1100011 => {
                self.sanitizer.check_readable(rs1)?;
                self.sanitizer.check_readable(rs2)?;
                let mut taken = match funct3 >> 1 {
                    0 => s1 == s2,
                    2 => (s1 as i32) < (s2 as i32),
                    3 => s1 < s2,
                    _ => return Err(RuntimeError::UnhandledInsn(self.pc)),
                };
                if funct3 & 1 != 0 {
                    taken = !taken;
                }
                self.pc = self
                    .pc
                    .wrapping_add(if taken { btype as u32 } else { 4 });
            }

            // LB/LH/LW/LBU/LHU
            0b0000011 => {
                self.sanitizer.check_readable(rs1)?;
                let addr = s1.wrapping_add(itype as u32);
                let value = match funct3 {
                    0b000 => sext(self.load(addr, 1)?, 8) as u32,
                    0b001 => sext(self.load(addr, 2)?, 16) as u32,
                    0b010 => self.load(addr, 4)?,
                    0b100 => self.load(addr, 1)?,
                    0b101 => self.load(addr, 2)?,
                    _ => return Err(RuntimeError::UnhandledInsn(self.pc)),
                };
                if !self.sanitizer.check_load(addr, 1 << (funct3 & 0b11)) {
                    return Err(RuntimeError::LoadStack(addr));
                }
                self.regs[rd] = value;
                self.pc = self.pc.wrapping_add(4);
                self.sanitizer.note_write(rd);
            }

            // SB/SH/SW
            0b0100011 => {
                self.sanitizer.check_readable(rs1)?;
                self.sanitizer.check_readable(rs2)?;
                let addr = s1.wrapping_add(stype as u32);
                if funct3 > 0b010 {
                    return Err(RuntimeError::UnhandledInsn(self.pc));
                }
                self.store(addr, s2, 1 << funct3)?;
                self.sanitizer.note_store(addr, 1 << funct3, rs2);
                self.pc = self.pc.wrapping_add(4);
            }

            // ALU immediate
            0b0010011 => {
                self.sanitizer.check_readable(rs1)?;
                let shamt = (itype & 31) as u32;
                self.regs[rd] = match funct3 {
                    0b000 => s1.wrapping_add(itype as u32),
                    0b010 => ((s1 as i32) < itype) as u32,
                    0b011 => (s1 < itype as u32) as u32,
                    0b100 => s1 ^ itype as u32,
                    0b110 => s1 | itype as u32,
                    0b111 => s1 & itype as u32,
                    0b001 if funct7 == 0 => s1 << shamt,
                    0b101 if funct7 == 0 => s1 >> shamt,
                    0b101 if funct7 == 32 => ((s1 as i32) >> shamt) as u32,
                    _ => return Err(RuntimeError::UnhandledInsn(self.pc)),
                };
                self.pc = self.pc.wrapping_add(4);
                self.sanitizer.note_write(rd);
            }

            // ALU register
            0b0110011 => {
                self.sanitizer.check_readable(rs1)?;
                self.sanitizer.check_readable(rs2)?;
                let shamt = s2 & 31;
                self.regs[rd] = match (funct3, funct7) {
                    (0b000, 0) => s1.wrapping_add(s2),
                    (0b000, 32) => s1.wrapping_sub(s2),
                    (0b001, 0) => s1 << shamt,
                    (0b010, 0) => ((s1 as i32) < (s2 as i32)) as u32,
                    (0b011, 0) => (s1 < s2) as u32,
                    (0b100, 0) => s1 ^ s2,
                    (0b101, 0) => s1 >> shamt,
                    (0b101, 32) => ((s1 as i32) >> shamt) as u32,
                    (0b110, 0) => s1 | s2,
                    (0b111, 0) => s1 & s2,
                    (0b000, 1) => (s1 as i32).wrapping_mul(s2 as i32) as u32,
                    (0b001, 1) => {
                        ((s1 as i32 as i64 * s2 as i32 as i64) >> 32) as u32
                    }
                    (0b010, 1) => {
                        ((s1 as i32 as i64 * s2 as u64 as i64) >> 32) as u32
                    }
                    (0b011, 1) => ((s1 as u64 * s2 as u64) >> 32) as u32,
                    (0b100, 1) => div32(s1 as i32, s2 as i32) as u32,
                    (0b101, 1) => divu32(s1, s2),
                    (0b110, 1) => rem32(s1 as i32, s2 as i32) as u32,
                    (0b111, 1) => remu32(s1, s2),
                    _ => return Err(RuntimeError::UnhandledInsn(self.pc)),
                };
                self.pc = self.pc.wrapping_add(4);
                self.sanitizer.note_write(rd);
            }

            // SYSTEM
            0b1110011 => {
                if funct3 == 0b000 {
                    if itype == 0x102 {
                        return self.do_sret();
                    } else if itype == 0x001 {
                        // EBREAK
                        self.exited = true;
                        self.pc = self.pc.wrapping_add(4);
                        return Ok(());
                    }
                    return self.do_syscall();
                }

                let csr = itype as usize & 0xFFF;
                match funct3 {
                    0b001 => {
                        // CSRRW
                        let old = self.rdcsr(csr);
                        if rs1 != 0 {
                            self.wrcsr(csr, self.regs[rs1]);
                        }
                        self.regs[rd] = old;
                    }
                    0b010 => {
                        // CSRRS
                        let old = self.rdcsr(csr);
                        if rs1 != 0 {
                            self.wrcsr(csr, old | self.regs[rs1]);
                        }
                        self.regs[rd] = old;
                    }
                    0b011 => {
                        // CSRRC
                        let old = self.rdcsr(csr);
                        if rs1 != 0 {
                            self.wrcsr(csr, old & !self.regs[rs1]);
                        }
                        self.regs[rd] = old;
                    }
                    0b101 => {
                        // CSRRWI reads the raw file; rs1 is the immediate
                        self.regs[rd] = self.csr[csr];
                        if rs1 != 0 {
                            self.wrcsr(csr, rs1 as u32);
                        }
                    }
                    0b110 => {
                        // CSRRSI
                        let old = self.rdcsr(csr);
                        if rs1 != 0 {
                            self.wrcsr(csr, old | rs1 as u32);
                        }
                        self.regs[rd] = old;
                    }
                    0b111 => {
                        // CSRRCI
                        let old = self.rdcsr(csr);
                        if rs1 != 0 {
                            self.wrcsr(csr, old & !(rs1 as u32));
                        }
                        self.regs[rd] = old;
                    }
                    _ => return Err(RuntimeError::UnhandledInsn(self.pc)),
                }
                self.sanitizer.note_write(rd);

                // CSR instructions themselves are not privileged, only
                // the machine/supervisor CSRs are; this coarser check is
                // intentionally conservative
                let pc_at = self.pc;
                self.pc = self.pc.wrapping_add(4);
                if self.privilege == Privilege::User {
                    return Err(RuntimeError::Protection(pc_at));
                }
            }

            _ => return Err(RuntimeError::UnhandledInsn(self.pc)),
        }

        Ok(())
    }

    /// Nearest preceding label for a pc, for backtrace annotation.
    pub fn pc_to_label(&self, pc: u32) -> Option<(&Label, u32)> {
        crate::assembler::symbol_table::nearest_label(&self.labels, pc)
    }

    /// Source line of the `.text` word covering the pc, if known.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        let text = self.memory.find_by_name(".text")?;
        let base = self.memory.get(text).base;
        let idx = (pc.checked_sub(base)? / 4) as usize;
        self.text_lines.get(idx).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_lines;
    use crate::parser::parse_source;

    fn build(source: &str) -> Machine {
        let lines = parse_source(source).unwrap();
        let program = assemble_lines(&lines, false).unwrap();
        Machine::new(program)
    }

    fn run(machine: &mut Machine) -> Result<(), RuntimeError> {
        while !machine.exited {
            machine.step()?;
        }
        Ok(())
    }

    fn addr_of(machine: &Machine, label: &str) -> u32 {
        machine
            .labels
            .iter()
            .find(|l| l.name == label)
            .map(|l| l.address)
            .unwrap()
    }

    fn step_ok(machine: &mut Machine) {
        machine.step().unwrap();
    }

    #[test]
    fn test_alu_basics() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             addi a0, x0, 5\n\
             addi a1, x0, -3\n\
             add a2, a0, a1\n\
             sub a3, a0, a1\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert!(machine.exited);
        assert_eq!(machine.regs[10], 5);
        assert_eq!(machine.regs[11], 0xFFFF_FFFD);
        assert_eq!(machine.regs[12], 2);
        assert_eq!(machine.regs[13], 8);
    }

    #[test]
    fn test_division_edge_cases() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             li t0, -2147483648\n\
             li t1, -1\n\
             div a0, t0, t1\n\
             rem a1, t0, t1\n\
             li t2, 0\n\
             div a2, t0, t2\n\
             rem a3, t0, t2\n\
             divu a4, t0, t2\n\
             remu a5, t0, t2\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], 0x8000_0000); // INT_MIN / -1
        assert_eq!(machine.regs[11], 0); // INT_MIN % -1
        assert_eq!(machine.regs[12], u32::MAX); // div by zero -> -1
        assert_eq!(machine.regs[13], 0x8000_0000); // rem by zero -> dividend
        assert_eq!(machine.regs[14], u32::MAX); // divu by zero -> all ones
        assert_eq!(machine.regs[15], 0x8000_0000); // remu by zero -> dividend
    }

    #[test]
    fn test_shifts_mask_to_five_bits() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             li t0, 1\n\
             li t1, 33\n\
             sll a0, t0, t1\n\
             li t2, -8\n\
             sra a1, t2, t0\n\
             srl a2, t2, t0\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], 2); // shift amount 33 & 31 == 1
        assert_eq!(machine.regs[11], (-4i32) as u32);
        assert_eq!(machine.regs[12], 0x7FFF_FFFC);
    }

    #[test]
    fn test_mulh_variants() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             li t0, -2\n\
             li t1, 3\n\
             mulh a0, t0, t1\n\
             mulhu a1, t0, t1\n\
             mulu a2, t0, t1\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], u32::MAX); // -6 >> 32 signed
        assert_eq!(machine.regs[11], 2); // unsigned upper half
        assert_eq!(machine.regs[12], u32::MAX); // signed x unsigned
    }

    #[test]
    fn test_branches() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             li t0, 1\n\
             li t1, 2\n\
             blt t0, t1, taken\n\
             li a0, 111\n\
             li a7, 93\necall\n\
             taken:\n\
             li a0, 222\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], 222);
    }

    #[test]
    fn test_unsigned_branch_ordering() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             li t0, -1\n\
             li t1, 1\n\
             bltu t1, t0, taken\n\
             li a0, 111\nli a7, 93\necall\n\
             taken: li a0, 222\nli a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        // 0xFFFFFFFF is large unsigned
        assert_eq!(machine.regs[10], 222);
    }

    #[test]
    fn test_memory_sign_extension() {
        let mut machine = build(
            ".data\nbytes: .byte 0x80, 0xFF\n\
             .text\n.globl _start\n_start:\n\
             la t0, bytes\n\
             lb a0, 0(t0)\n\
             lbu a1, 0(t0)\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], 0xFFFF_FF80);
        assert_eq!(machine.regs[11], 0x80);
    }

    #[test]
    fn test_x0_is_wired_to_zero() {
        let mut machine = build(
            ".globl _start\n_start:\n\
             li t0, 7\n\
             add x0, t0, t0\n\
             add a0, x0, x0\n\
             li a7, 93\necall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], 0);
    }

    #[test]
    fn test_host_syscall_prints() {
        let console = BufferConsole::default();
        let lines = parse_source(
            ".data\nmsg: .string \"hi\\n\"\n\
             .text\n.globl _start\n_start:\n\
             li a0, -42\nli a7, 1\necall\n\
             la a0, msg\nli a7, 4\necall\n\
             li a0, 'x'\nli a7, 11\necall\n\
             li a0, 0xAB\nli a7, 34\necall\n\
             li a7, 93\necall\n",
        )
        .unwrap();
        let program = assemble_lines(&lines, false).unwrap();
        let mut machine =
            Machine::with_console(program, Box::new(console.clone()));
        run(&mut machine).unwrap();
        assert_eq!(
            String::from_utf8(console.take()).unwrap(),
            "-42hi\nx0x000000ab"
        );
    }

    #[test]
    fn test_unhandled_instruction_reports_pc() {
        let mut machine =
            build(".globl _start\n_start:\nE: .word 0b01\n");
        let err = machine.step().unwrap_err();
        assert_eq!(err, RuntimeError::UnhandledInsn(addr_of(&machine, "E")));
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_fetch_error() {
        let mut machine = build(".globl _start\n_start: jr zero\n");
        step_ok(&mut machine); // jump to 0
        assert_eq!(machine.step().unwrap_err(), RuntimeError::Fetch(0));
    }

    #[test]
    fn test_kernel_memory_protection() {
        let mut machine =
            build(".section .kernel_text\nvar: .word 0xCAFEBABE\n");
        let base = crate::memory::KERNEL_TEXT_BASE;
        // user mode cannot read supervisor memory
        assert_eq!(
            machine.load(base, 4).unwrap_err(),
            RuntimeError::Protection(base)
        );
        // supervisor mode can
        machine.enter_kernel();
        assert_eq!(machine.load(base, 4).unwrap(), 0xCAFEBABE);
    }

    #[test]
    fn test_load_store_api() {
        let mut machine = build(".data\nvar: .word 0\n");
        let base = crate::memory::DATA_BASE;
        machine.store(base, 0xDEADBEEF, 4).unwrap();
        assert_eq!(machine.load(base, 4).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_ecall_traps_when_kernel_present() {
        let mut machine = build(
            ".section .kernel_text\nhandler: addi x0, x0, 0\n\
             .text\n.globl _start\n_start: ecall\n",
        );
        machine.csr[CSR_STVEC] = addr_of(&machine, "handler");
        step_ok(&mut machine);
        assert_eq!(machine.pc, addr_of(&machine, "handler"));
        assert_eq!(machine.csr[CSR_SEPC], addr_of(&machine, "_start"));
        assert_eq!(machine.csr[CSR_SCAUSE], cause::USER_ECALL);
        assert_eq!(machine.privilege, Privilege::Supervisor);
        assert_eq!(machine.csr[CSR_MSTATUS] & STATUS_SIE, 0);
        assert_ne!(machine.csr[CSR_MSTATUS] & STATUS_SPIE, 0);
        assert_eq!(machine.csr[CSR_MSTATUS] & STATUS_SPP, 0);
    }

    #[test]
    fn test_supervisor_ecall_cause() {
        let mut machine = build(
            ".globl _kernel_start\n.section .kernel_text\n\
             _kernel_start: ecall\n",
        );
        machine.csr[CSR_STVEC] = machine.pc;
        step_ok(&mut machine);
        assert_eq!(machine.csr[CSR_SCAUSE], cause::SUPERVISOR_ECALL);
    }

    #[test]
    fn test_sret_restores_context() {
        let mut machine = build(
            ".section .kernel_text\nk: sret\n\
             .text\n.globl _start\n_start: addi x0, x0, 0\nret_target: \
             addi x0, x0, 0\n",
        );
        machine.enter_kernel();
        machine.pc = addr_of(&machine, "k");
        machine.csr[CSR_SEPC] = addr_of(&machine, "ret_target");
        machine.csr[CSR_MSTATUS] &= !STATUS_SPP; // came from user
        step_ok(&mut machine);
        assert_eq!(machine.pc, addr_of(&machine, "ret_target"));
        assert_eq!(machine.privilege, Privilege::User);
        assert_ne!(machine.csr[CSR_MSTATUS] & STATUS_SPIE, 0);
    }

    #[test]
    fn test_sret_in_user_mode_is_unhandled() {
        let mut machine = build(".globl _start\n_start: sret\n");
        assert_eq!(
            machine.step().unwrap_err(),
            RuntimeError::UnhandledInsn(addr_of(&machine, "_start"))
        );
    }

    #[test]
    fn test_interrupt_delivery_direct_mode() {
        let mut machine = build("addi x0, x0, 0\n");
        machine.csr[CSR_STVEC] = 0xAABB00;
        machine
            .set_interrupt_pending(cause::SUPERVISOR_TIMER & !cause::INTERRUPT);
        // delivery happens, then the fetch at the vector fails: nothing
        // is mapped there
        let err = machine.step().unwrap_err();
        assert_eq!(err, RuntimeError::Fetch(0xAABB00));
        assert_eq!(machine.csr[CSR_SEPC], crate::memory::TEXT_BASE);
        assert_eq!(machine.csr[CSR_SCAUSE], cause::SUPERVISOR_TIMER);
    }

    #[test]
    fn test_vectored_interrupt_executes_handler_instruction() {
        let mut machine = build(
            ".section .kernel_text\n\
             vector_handlers:\n\
             addi x0, x0, 0\naddi x0, x0, 0\naddi x0, x0, 0\n\
             addi x0, x0, 0\naddi x0, x0, 0\naddi x0, x0, 0\n\
             addi x0, x0, 0\n\
             .text\n.globl _start\n_start: addi x0, x0, 0\n",
        );
        let handlers = addr_of(&machine, "vector_handlers");
        machine.csr[CSR_STVEC] = handlers | 1;
        let timer = cause::SUPERVISOR_TIMER & !cause::INTERRUPT;
        machine.set_interrupt_pending(timer);
        step_ok(&mut machine);
        // vectored dispatch plus one executed handler instruction
        assert_eq!(machine.pc, handlers + 4 * timer + 4);
    }

    #[test]
    fn test_sstatus_write_mask() {
        let mut machine = build(
            ".section .kernel_text\nk:\nli t0, -1\ncsrrw zero, sstatus, t0\n",
        );
        machine.enter_kernel();
        machine.pc = addr_of(&machine, "k");
        step_ok(&mut machine);
        step_ok(&mut machine);
        // only the shadowed bits are writable through sstatus
        assert_ne!(machine.csr[CSR_MSTATUS], u32::MAX);
        assert_ne!(machine.csr[CSR_MSTATUS] & STATUS_SPP, 0);
    }

    #[test]
    fn test_csr_from_user_is_protection_error() {
        let mut machine =
            build(".globl _start\n_start: csrrw t0, sscratch, zero\n");
        let err = machine.step().unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Protection(addr_of(&machine, "_start"))
        );
    }

    #[test]
    fn test_sip_write_only_clears_software_bit() {
        let mut machine = build(
            ".section .kernel_text\nk: csrrci x0, sip, 2\n",
        );
        machine.enter_kernel();
        machine.pc = addr_of(&machine, "k");
        let sw = cause::SUPERVISOR_SOFTWARE & !cause::INTERRUPT;
        let timer = cause::SUPERVISOR_TIMER & !cause::INTERRUPT;
        machine.csr[CSR_MSTATUS] &= !STATUS_SIE; // keep delivery off
        machine.set_interrupt_pending(sw);
        machine.set_interrupt_pending(timer);
        step_ok(&mut machine);
        assert!(!machine.interrupt_pending(sw));
        assert!(machine.interrupt_pending(timer)); // not writable via sip
    }

    #[test]
    fn test_ebreak_exits() {
        let mut machine =
            build(".globl _start\n_start: .word 0x00100073\n");
        step_ok(&mut machine);
        assert!(machine.exited);
    }

    #[test]
    fn test_nested_trap_handling() {
        let mut machine = build(
            ".section .kernel_text\n\
             handler:\n\
             csrrw t0, scause, x0\n\
             addi t1, x0, 8\n\
             bne t0, t1, sw_irq_handle\n\
             csrrw t3, sepc, x0\n\
             csrrwi x0, sstatus, 2\n\
             csrrw x0, sepc, t3\n\
             sret\n\
             sw_irq_handle:\n\
             csrrci x0, sip, 2\n\
             sret\n\
             .text\n.globl _start\n_start: ecall\n",
        );
        machine.csr[CSR_STVEC] = addr_of(&machine, "handler");
        let start = addr_of(&machine, "_start");

        step_ok(&mut machine); // ecall
        assert_eq!(machine.pc, addr_of(&machine, "handler"));
        assert_eq!(machine.csr[CSR_SCAUSE], cause::USER_ECALL);
        assert_eq!(machine.csr[CSR_MSTATUS] & STATUS_SIE, 0);

        let sw = cause::SUPERVISOR_SOFTWARE & !cause::INTERRUPT;
        machine.set_interrupt_pending(sw);
        for _ in 0..5 {
            step_ok(&mut machine); // ecall handler up to re-enabling SIE
        }
        step_ok(&mut machine); // nested delivery + first handler insn
        assert_eq!(machine.csr[CSR_SCAUSE], cause::SUPERVISOR_SOFTWARE);
        for _ in 0..3 {
            step_ok(&mut machine); // addi, bne, csrrci
        }
        step_ok(&mut machine); // nested sret
        step_ok(&mut machine); // outer csrrw sepc
        step_ok(&mut machine); // outer sret
        assert_eq!(machine.pc, start);
    }

    #[test]
    fn test_callsan_cantread() {
        let mut machine = build(
            "fn:\n    ret\n\
             .globl _start\n_start:\n\
             li a3, 2\n\
             jal fn\n\
             E: addi a3, a3, 1\n",
        );
        let err = run(&mut machine).unwrap_err();
        assert_eq!(err, RuntimeError::CantRead(crate::ast::Reg::A3));
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_callsan_not_saved() {
        let mut machine = build(
            "fn:\n    li s1, 1234\nE: ret\n\
             .globl _start\n_start:\n    jal fn\n",
        );
        let err = run(&mut machine).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::NotSaved { reg: crate::ast::Reg::S1, .. }
        ));
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_callsan_ra_mismatch() {
        let mut machine = build(
            "fn2:\n    ret\n\
             fn:\n    jal fn2\nE: ret\n\
             .globl _start\n_start:\n    jal fn\n",
        );
        let err = run(&mut machine).unwrap_err();
        assert!(matches!(err, RuntimeError::RaMismatch { .. }));
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_callsan_sp_mismatch() {
        let mut machine = build(
            "fn:\n    addi sp, sp, -16\n    addi sp, sp, 24\nE: ret\n\
             .globl _start\n_start:\n    jal fn\n    li a7, 93\n    ecall\n",
        );
        let err = run(&mut machine).unwrap_err();
        assert!(matches!(err, RuntimeError::SpMismatch { .. }));
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_callsan_ret_empty() {
        let mut machine = build(
            "fn:\n    addi sp, sp, -16\n    addi sp, sp, 16\n    ret\n\
             .globl _start\n_start:\n    jal fn\nE: ret\n",
        );
        let err = run(&mut machine).unwrap_err();
        assert_eq!(err, RuntimeError::RetEmpty);
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_callsan_load_stack() {
        let mut machine = build(
            "fn:\n    addi sp, sp, -8\n    sw ra, 0(sp)\n    lw ra, 0(sp)\n\
             E: lw ra, 4(sp)\n    sw ra, 4(sp)\n    addi sp, sp, 8\n    ret\n\
             .globl _start\n_start:\n    jal fn\n",
        );
        let err = run(&mut machine).unwrap_err();
        assert!(matches!(err, RuntimeError::LoadStack(_)));
        assert_eq!(machine.pc, addr_of(&machine, "E"));
    }

    #[test]
    fn test_callsan_conforming_program_passes() {
        let mut machine = build(
            "double:\n\
             \taddi sp, sp, -8\n\
             \tsw s1, 0(sp)\n\
             \tmv s1, a0\n\
             \tadd a0, s1, s1\n\
             \tlw s1, 0(sp)\n\
             \taddi sp, sp, 8\n\
             \tret\n\
             .globl _start\n_start:\n\
             \tli a0, 21\n\
             \tjal double\n\
             \tli a7, 93\n\tecall\n",
        );
        run(&mut machine).unwrap();
        assert_eq!(machine.regs[10], 42);
    }

    #[test]
    fn test_backtrace_annotations() {
        let mut machine = build(
            "fn:\nE: ret\n.globl _start\n_start:\n    jal fn\n    li a7, 93\n    ecall\n",
        );
        // step _start's jal so a frame exists
        machine.pc = addr_of(&machine, "_start");
        step_ok(&mut machine);
        assert_eq!(machine.sanitizer.frames.len(), 1);
        let frame = machine.sanitizer.frames[0];
        let (label, off) = machine.pc_to_label(frame.pc).unwrap();
        assert_eq!(label.name, "fn");
        assert_eq!(off, 0);
        assert_eq!(machine.line_for_pc(addr_of(&machine, "_start")), Some(5));
    }
}
