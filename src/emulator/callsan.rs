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

//! The calling-convention sanitizer: a shadow stack of call frames, a
//! bitmap of registers holding well-defined values, and per-slot writer
//! tracking for the guest stack. It observes the interpreter; it never
//! changes guest-visible state.

use crate::ast::Reg;
use crate::errors::RuntimeError;
use crate::memory::{STACK_BASE, STACK_LEN, STACK_TOP};

const STACK_SLOTS: usize = (STACK_LEN / 4) as usize;
const POISON: u8 = 0xFF;

const fn bit(reg: usize) -> u32 {
    1u32 << reg
}

/// Registers with well-defined values at process start: x0 plus the
/// pointer registers and the callee-saved set.
const INITIAL_READABLE: u32 = bit(0) // zero
    | bit(1) // ra
    | bit(2) // sp
    | bit(3) // gp
    | bit(4) // tp
    | bit(8) // fp
    | bit(9) // s1
    | 0x0FFC_0000; // s2..s11 (x18..x27)

/// Registers a callee may legitimately read on entry.
const CALL_ACCESSIBLE: u32 = INITIAL_READABLE | 0x0003_FC00; // + a0..a7 (x10..x17)

/// Registers a caller must assume clobbered after a call returns:
/// t0..t6 and a2..a7.
const CALL_CLOBBERED: u32 =
    bit(5) | bit(6) | bit(7) | bit(28) | bit(29) | bit(30) | bit(31) | 0x0003_F000;

#[derive(Debug, Clone, Copy)]
pub struct ShadowFrame {
    pub pc: u32,
    pub sp: u32,
    pub ra: u32,
    pub args: [u32; 8],
    /// fp, s1, s2..s11 in that order.
    pub saved: [u32; 12],
    pub readable: u32,
}

#[derive(Debug, Clone)]
pub struct CallSanitizer {
    pub readable: u32,
    pub frames: Vec<ShadowFrame>,
    written_by: [u8; STACK_SLOTS],
}

fn saved_regs(regs: &[u32; 32]) -> [u32; 12] {
    let mut saved = [0u32; 12];
    saved[0] = regs[8]; // fp
    saved[1] = regs[9]; // s1
    saved[2..12].copy_from_slice(&regs[18..28]); // s2..s11
    saved
}

fn saved_slot_reg(slot: usize) -> Reg {
    match slot {
        0 => Reg::FP,
        1 => Reg::S1,
        n => Reg(18 + (n as u32 - 2)),
    }
}

impl CallSanitizer {
    pub fn new() -> CallSanitizer {
        CallSanitizer {
            readable: INITIAL_READABLE,
            frames: Vec::new(),
            written_by: [POISON; STACK_SLOTS],
        }
    }

    pub fn check_readable(&self, reg: usize) -> Result<(), RuntimeError> {
        if reg == 0 {
            return Ok(());
        }
        if self.readable & bit(reg) == 0 {
            return Err(RuntimeError::CantRead(Reg(reg as u32)));
        }
        Ok(())
    }

    pub fn note_write(&mut self, reg: usize) {
        self.readable |= bit(reg);
    }

    /// Observed on every JAL/JALR with rd = ra, after the register file
    /// and pc have been updated for the call.
    pub fn on_call(&mut self, regs: &[u32; 32], pc: u32) {
        let mut args = [0u32; 8];
        args.copy_from_slice(&regs[10..18]);
        self.frames.push(ShadowFrame {
            pc,
            sp: regs[2],
            ra: regs[1],
            args,
            saved: saved_regs(regs),
            readable: self.readable,
        });
        // narrowing, not assignment: registers must still have been
        // written before the call to be readable in the callee
        self.readable &= CALL_ACCESSIBLE;
    }

    /// Observed on `jalr x0, x1, 0` before the pc moves.
    pub fn on_ret(&mut self, regs: &[u32; 32]) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::RetEmpty)?;

        if regs[2] != frame.sp {
            return Err(RuntimeError::SpMismatch { expected: frame.sp });
        }
        if regs[1] != frame.ra {
            return Err(RuntimeError::RaMismatch { expected: frame.ra });
        }

        let now = saved_regs(regs);
        for (slot, (current, saved)) in
            now.iter().zip(frame.saved.iter()).enumerate()
        {
            if current != saved {
                return Err(RuntimeError::NotSaved {
                    reg: saved_slot_reg(slot),
                    expected: *saved,
                });
            }
        }

        // a2..a7 and the temporaries may have been clobbered by the callee
        self.readable = frame.readable & !CALL_CLOBBERED;

        // everything below the restored sp belongs to dead frames
        let end = ((frame.sp.saturating_sub(STACK_BASE)) / 4) as usize;
        for slot in &mut self.written_by[..end.min(STACK_SLOTS)] {
            *slot = POISON;
        }
        Ok(())
    }

    /// Records which register last stored to the touched stack slots.
    /// Sub-word stores mark the first and last covered slot.
    pub fn note_store(&mut self, addr: u32, size: u32, reg: usize) {
        if addr < STACK_BASE || addr as u64 + size as u64 > STACK_TOP as u64 {
            return;
        }
        let off = addr - STACK_BASE;
        let start = (off / 4) as usize;
        let end = ((off + size - 1) / 4) as usize;
        self.written_by[start] = reg as u8;
        if end != start {
            self.written_by[end] = reg as u8;
        }
    }

    /// A stack load is valid only if the covered slots were stored to in
    /// the current frame.
    pub fn check_load(&self, addr: u32, size: u32) -> bool {
        if addr < STACK_BASE || addr as u64 + size as u64 > STACK_TOP as u64 {
            return true;
        }
        let off = addr - STACK_BASE;
        let start = (off / 4) as usize;
        let end = ((off + size - 1) / 4) as usize;
        self.written_by[start] != POISON && self.written_by[end] != POISON
    }
}

impl Default for CallSanitizer {
    fn default() -> Self {
        Self::new()
    }
}
