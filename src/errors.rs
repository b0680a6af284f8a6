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

use crate::ast::Reg;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AssemblyError {
    #[error("Syntax Error: {0}")]
    PestError(#[from] pest::error::Error<crate::parser::Rule>),

    #[error("Structural Error on line {line}: {reason}")]
    StructuralError { line: usize, reason: String },

    #[error("Structural Error: {reason}")]
    StructuralErrorNoLine { reason: String },

    #[error("Semantic Error on line {line}: {reason}")]
    SemanticError { line: usize, reason: String },

    #[error("Semantic Error: {reason}")]
    SemanticErrorNoLine { reason: String },
}

impl AssemblyError {
    pub(crate) fn semantic(line: usize, reason: impl Into<String>) -> Self {
        AssemblyError::SemanticError { line, reason: reason.into() }
    }

    pub(crate) fn structural(line: usize, reason: impl Into<String>) -> Self {
        AssemblyError::StructuralError { line, reason: reason.into() }
    }
}

// One runtime error per machine step at most. The driver loop is the only
// place these are turned into diagnostics.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("fetch error on addr=0x{0:08x}")]
    Fetch(u32),

    #[error("load error on addr=0x{0:08x}")]
    Load(u32),

    #[error("store error on addr=0x{0:08x}")]
    Store(u32),

    #[error("unhandled instruction at pc=0x{0:08x}")]
    UnhandledInsn(u32),

    #[error("supervisor-only access from user mode at 0x{0:08x}")]
    Protection(u32),

    #[error("read from uninitialized register {0}")]
    CantRead(Reg),

    #[error("callee-saved register {reg} not restored, expected 0x{expected:08x}")]
    NotSaved { reg: Reg, expected: u32 },

    #[error("stack pointer mismatch on return, expected 0x{expected:08x}")]
    SpMismatch { expected: u32 },

    #[error("return address mismatch on return, expected 0x{expected:08x}")]
    RaMismatch { expected: u32 },

    #[error("return without a matching call")]
    RetEmpty,

    #[error("load from stack address 0x{0:08x} not written in the current frame")]
    LoadStack(u32),
}

impl RuntimeError {
    /// True for the calling-convention violations, which additionally get
    /// a shadow-stack backtrace from the driver.
    pub fn is_sanitizer(self) -> bool {
        matches!(
            self,
            RuntimeError::CantRead(_)
                | RuntimeError::NotSaved { .. }
                | RuntimeError::SpMismatch { .. }
                | RuntimeError::RaMismatch { .. }
                | RuntimeError::RetEmpty
                | RuntimeError::LoadStack(_)
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ElfError {
    #[error("corrupt or invalid elf header")]
    Truncated,

    #[error("not an elf file")]
    BadMagic,

    #[error("unsupported elf variant (only elf32 is supported)")]
    Not32Bit,

    #[error("unsupported architecture (only risc-v is supported)")]
    NotRiscv,

    #[error("not an elf executable")]
    NotExecutable,

    #[error("not an elf relocatable object")]
    NotRelocatable,

    #[error("section name out of bounds of string table section")]
    BadSectionName,

    #[error("section or symbol data exceeds buffer size")]
    OutOfBounds,

    #[error("unresolved reference to `_start`")]
    NoEntrySymbol,

    #[error("symbol `{0}` is declared global but never defined")]
    UndefinedGlobal(String),

    #[error("duplicate definition of global symbol `{0}`")]
    DuplicateSymbol(String),

    #[error("unresolved symbol `{0}`")]
    UnresolvedSymbol(String),

    #[error("unknown relocation type {0}")]
    UnknownRelocation(u8),

    #[error("relocation target out of range at 0x{0:08x}")]
    RelocationRange(u32),
}
