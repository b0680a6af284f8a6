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

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use rvasm::assemble_file;
use rvasm::elf;
use rvasm::emulator::Machine;
use rvasm::errors::RuntimeError;
use rvasm::file_reader::{DiskFileReader, FileReader};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    version,
    about = "RV32 assembler, ELF32 linker and sandboxed emulator",
    group(ArgGroup::new("command").required(true))
)]
struct Opts {
    /// assemble an RV32 assembly file and output an ELF32 relocatable
    /// object file
    #[arg(short = 'a', long, value_name = "FILE", group = "command")]
    assemble: Option<PathBuf>,

    /// assemble an RV32 assembly file and output an ELF32 executable
    #[arg(short = 'b', long, value_name = "FILE", group = "command")]
    build: Option<PathBuf>,

    /// run an ELF32 executable
    #[arg(short = 'r', long, value_name = "FILE", group = "command")]
    run: Option<PathBuf>,

    /// assemble and run an RV32 assembly file
    #[arg(short = 'e', long, value_name = "FILE", group = "command")]
    emulate: Option<PathBuf>,

    /// show information about an ELF file
    #[arg(short = 'i', long, value_name = "FILE", group = "command")]
    readelf: Option<PathBuf>,

    /// perform hexdump of a file
    #[arg(short = 'x', long, value_name = "FILE", group = "command")]
    hexdump: Option<PathBuf>,

    /// perform ascii dump of a file
    #[arg(short = 'c', long, value_name = "FILE", group = "command")]
    ascii: Option<PathBuf>,

    /// link object files into an ELF32 executable
    #[arg(short = 'l', long, group = "command")]
    link: bool,

    /// choose output file name
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// dump a shadow-stack backtrace on calling-convention errors
    #[arg(short = 's', long)]
    sanitize: bool,

    /// object files for --link
    #[arg(value_name = "OBJECTS")]
    objects: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let reader = DiskFileReader;

    if let Some(path) = &opts.assemble {
        let program = assemble_file(path, true, &reader)?;
        let image = elf::emit_object(&program).context("assembler")?;
        let out = opts.output.clone().unwrap_or_else(|| PathBuf::from("a.o"));
        fs::write(&out, image)
            .with_context(|| format!("could not write {}", out.display()))?;
    } else if let Some(path) = &opts.build {
        let program = assemble_file(path, false, &reader)?;
        let image = elf::emit_executable(&program).context("linker")?;
        let out =
            opts.output.clone().unwrap_or_else(|| PathBuf::from("a.out"));
        fs::write(&out, image)
            .with_context(|| format!("could not write {}", out.display()))?;
    } else if let Some(path) = &opts.run {
        let image = reader.read_binary(path).context("loader")?;
        let program = elf::load_executable(&image).context("loader")?;
        let mut machine = Machine::new(program);
        run_machine(&mut machine, opts.sanitize);
    } else if let Some(path) = &opts.emulate {
        let program = assemble_file(path, false, &reader)?;
        let mut machine = Machine::new(program);
        run_machine(&mut machine, opts.sanitize);
    } else if let Some(path) = &opts.readelf {
        let image = reader.read_binary(path).context("readelf")?;
        print_readelf(&image)?;
    } else if let Some(path) = &opts.hexdump {
        hexdump(path, &reader)?;
    } else if let Some(path) = &opts.ascii {
        ascii_dump(path, &reader)?;
    } else if opts.link {
        anyhow::ensure!(
            !opts.objects.is_empty(),
            "linker: no object files given"
        );
        let objects = opts
            .objects
            .iter()
            .map(|p| reader.read_binary(p))
            .collect::<Result<Vec<_>>>()
            .context("linker")?;
        let image = elf::linker::link(&objects).context("linker")?;
        let out =
            opts.output.clone().unwrap_or_else(|| PathBuf::from("a.out"));
        fs::write(&out, image)
            .with_context(|| format!("could not write {}", out.display()))?;
    }

    Ok(())
}

/// Drives the emulator until exit or the first runtime error. Only one
/// diagnostic line is printed per run; sanitizer violations additionally
/// get a backtrace when --sanitize is on.
fn run_machine(machine: &mut Machine, sanitize: bool) {
    while !machine.exited {
        let err = match machine.step() {
            Ok(()) => continue,
            Err(err) => err,
        };
        let pc = machine.pc;
        match err {
            RuntimeError::Fetch(addr) => eprintln!(
                "emulator: fetch error at pc=0x{pc:08x} on addr=0x{addr:08x}"
            ),
            RuntimeError::Load(addr) => eprintln!(
                "emulator: load error at pc=0x{pc:08x} on addr=0x{addr:08x}"
            ),
            RuntimeError::Store(addr) => eprintln!(
                "emulator: store error at pc=0x{pc:08x} on addr=0x{addr:08x}"
            ),
            RuntimeError::Protection(addr) => eprintln!(
                "emulator: protection error at pc=0x{pc:08x} on addr=0x{addr:08x}"
            ),
            RuntimeError::UnhandledInsn(at) => {
                eprintln!("emulator: unhandled instruction at pc=0x{at:08x}")
            }
            RuntimeError::CantRead(reg) => eprintln!(
                "callsan: attempt to read from uninitialized register {reg} \
                 at pc=0x{pc:08x}. Check the calling convention!"
            ),
            RuntimeError::NotSaved { reg, .. } => eprintln!(
                "callsan: attempt to return with clobbered callee-saved \
                 register {reg} at pc=0x{pc:08x} without saving it first. \
                 Check the calling convention!"
            ),
            RuntimeError::RaMismatch { .. } => eprintln!(
                "callsan: attempt to return from non-leaf function without \
                 restoring ra register at pc=0x{pc:08x}. Check the calling \
                 convention!"
            ),
            RuntimeError::SpMismatch { .. } => eprintln!(
                "callsan: attempt to return from function with wrong stack \
                 pointer value at pc=0x{pc:08x}"
            ),
            RuntimeError::RetEmpty => eprintln!(
                "callsan: attempt to return without a call at pc=0x{pc:08x}"
            ),
            RuntimeError::LoadStack(addr) => eprintln!(
                "callsan: attempt to read at pc=0x{pc:08x} from stack \
                 address 0x{addr:08x}, which hasn't been written to in the \
                 current function"
            ),
        }

        let wants_backtrace = err.is_sanitizer()
            || matches!(err, RuntimeError::UnhandledInsn(_));
        if sanitize && wants_backtrace {
            dump_backtrace(machine);
        }
        return;
    }
}

fn dump_backtrace(machine: &Machine) {
    eprintln!();
    eprintln!("===================== CALL SANITIZER ERROR");
    for (i, frame) in machine.sanitizer.frames.iter().enumerate() {
        eprint!("\t#{i} pc=0x{:08x} sp=0x{:08x} ", frame.pc, frame.sp);
        if let Some((label, off)) = machine.pc_to_label(frame.pc) {
            eprint!("(at {}+0x{off:x}", label.name);
            if let Some(line) = machine.line_for_pc(frame.pc) {
                eprint!(", line {line})");
            } else {
                eprint!(")");
            }
        }
        eprintln!();
    }
    eprintln!();
    for row in 0..8 {
        for col in 0..4 {
            let reg = row * 4 + col;
            eprint!("x{reg}: ");
            if reg < 10 {
                eprint!(" ");
            }
            eprint!("0x{:08x}    ", machine.regs[reg]);
        }
        eprintln!();
    }
}

fn print_readelf(image: &[u8]) -> Result<()> {
    let view = elf::read(image).context("readelf")?;

    print!(" {:<35}:", "Magic");
    for byte in view.magic {
        print!(" {byte:02x}");
    }
    println!();

    println!(" {:<35}: {}", "Class", view.class);
    println!(" {:<35}: {}", "Endianness", view.endianness);
    println!(" {:<35}: {}", "Version", view.header.ident_version);
    println!(" {:<35}: {}", "OS/ABI", view.abi);
    println!(" {:<35}: {}", "Type", view.type_name);
    println!(" {:<35}: {}", "Architecture", view.machine);
    println!(" {:<35}: 0x{:08x}", "Entry point", view.header.entry);
    println!(
        " {:<35}: {} (bytes into file)",
        "Start of program headers", view.header.phoff
    );
    println!(
        " {:<35}: {} (bytes into file)",
        "Start of section headers", view.header.shoff
    );
    println!(" {:<35}: 0x{:x}", "Flags", view.header.flags);
    println!(" {:<35}: {} (bytes)", "Size of ELF header", view.header.ehsize);
    println!(
        " {:<35}: {} (bytes)",
        "Size of each program header", view.header.phentsize
    );
    println!(" {:<35}: {}", "Number of program headers", view.header.phnum);
    println!(
        " {:<35}: {} (bytes)",
        "Size of each section header", view.header.shentsize
    );
    println!(" {:<35}: {}", "Number of section headers", view.header.shnum);
    println!(
        " {:<35}: {}",
        "Section header string table index", view.header.shstrndx
    );
    println!();

    println!("Section headers:");
    println!(
        " [Nr] {:<17} {:<15} {:<10} {:<10} {:<10} {:<5} {:<5}",
        "Name", "Type", "Address", "Offset", "Size", "Flags", "Align"
    );
    for (i, sec) in view.sections.iter().enumerate() {
        println!(
            " [{i:2}] {:<17} {:<15} 0x{:08x} 0x{:08x} 0x{:08x} {:>5} {:>5}",
            sec.name,
            sec.type_name,
            sec.header.addr,
            sec.header.offset,
            sec.header.size,
            sec.flags,
            sec.header.addralign
        );
    }
    println!();

    println!("Program headers:");
    println!(
        " {:<14} {:<10} {:<15} {:<16} {:<10} {:<5} {:<5}",
        "Type", "Offset", "Virtual Address", "Physical Address", "Size",
        "Flags", "Align"
    );
    for seg in &view.segments {
        println!(
            " {:<14} 0x{:08x} 0x{:08x}      0x{:08x}       0x{:08x} {:>5} {:>5}",
            seg.type_name,
            seg.header.offset,
            seg.header.vaddr,
            seg.header.paddr,
            seg.header.memsz,
            seg.flags,
            seg.header.align
        );
    }
    println!();

    Ok(())
}

fn hexdump<F: FileReader>(path: &Path, reader: &F) -> Result<()> {
    let bytes = reader.read_binary(path).context("hexdump")?;
    println!(
        "[ Offset ]    {:>8} {:>8} {:>8} {:>8}",
        "[0 - 3]", "[4 - 7]", "[8 - 11]", "[12 - 15]"
    );
    for (row, chunk) in bytes.chunks(16).enumerate() {
        print!("[{:08x}]    ", row * 16);
        for word in chunk.chunks(4) {
            for byte in word {
                print!("{byte:02x}");
            }
            print!(" ");
        }
        println!();
    }
    Ok(())
}

fn ascii_dump<F: FileReader>(path: &Path, reader: &F) -> Result<()> {
    let bytes = reader.read_binary(path).context("ascii")?;
    println!(
        "[ Offset ]    +00 +01 +02 +03 +04 +05 +06 +07 +08 +09 +10 +11 +12 \
         +13 +14 +15"
    );
    for (row, chunk) in bytes.chunks(16).enumerate() {
        print!("[{:08x}]    ", row * 16);
        for byte in chunk {
            print!(" ");
            match byte {
                0 => print!("\\0"),
                b'\n' => print!("\\n"),
                b'\r' => print!("\\r"),
                b'\t' => print!("\\t"),
                0x07 => print!("\\a"),
                0x08 => print!("\\b"),
                b if (32..127).contains(b) => print!(" {}", *b as char),
                b => print!("{b:02x}"),
            }
            print!(" ");
        }
        println!();
    }
    Ok(())
}
