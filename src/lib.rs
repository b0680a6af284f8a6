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

//! An RV32 assembler, ELF32 codec and linker, and a sandboxed emulator
//! with a minimal supervisor mode, memory-mapped devices and a
//! calling-convention sanitizer.

pub mod assembler;
pub mod ast;
pub mod elf;
pub mod emulator;
pub mod errors;
pub mod file_reader;
pub mod memory;
pub mod parser;

use anyhow::{Context, Result};
use errors::AssemblyError;
use file_reader::FileReader;
use std::path::Path;

pub use assembler::Program;
pub use emulator::Machine;

/// Assembles a source string. With `allow_externs` every unresolved
/// label becomes a relocation against an undefined symbol (object
/// mode); otherwise it is an error.
pub fn assemble(
    source: &str,
    allow_externs: bool,
) -> Result<Program, AssemblyError> {
    let lines = parser::parse_source(source)?;
    assembler::assemble_lines(&lines, allow_externs)
}

pub fn assemble_file<F: FileReader>(
    source_path: &Path,
    allow_externs: bool,
    reader: &F,
) -> Result<Program> {
    let source = reader
        .read_to_string(source_path)
        .with_context(|| {
            format!("Failed to read input file: {}", source_path.display())
        })?;
    Ok(assemble(&source, allow_externs)
        .context("Failed during assembly")?)
}
