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

mod ast_builder;

use crate::ast::SourceLine;
use crate::errors::AssemblyError;
use pest::Parser;
use pest_derive::Parser;

// Derive the parser from our grammar file.
#[derive(Parser)]
#[grammar = "./grammar.pest"]
pub struct AsmParser;

// Main parsing function that takes the entire source code string.
pub fn parse_source(source: &str) -> Result<Vec<SourceLine>, AssemblyError> {
    let mut pairs = AsmParser::parse(Rule::program, source)?;
    let program = pairs.next().unwrap();
    let mut lines = Vec::new();
    // end line of the most recent instruction; a newline is required
    // after every instruction, while labels and directives may share
    // their line with what follows
    let mut open_insn_line: Option<usize> = None;

    for stmt in program.into_inner() {
        if stmt.as_rule() != Rule::statement {
            continue; // EOI
        }
        let span = stmt.as_span();
        let line_number = span.start_pos().line_col().0;
        let end_line = span.end_pos().line_col().0;
        if open_insn_line == Some(line_number) {
            return Err(AssemblyError::semantic(line_number, "Expected newline"));
        }
        let inner = stmt.into_inner().next().unwrap();
        let mut line = SourceLine { line_number, ..Default::default() };

        match inner.as_rule() {
            Rule::label_def => {
                line.label =
                    Some(inner.into_inner().next().unwrap().as_str().to_string());
            }
            Rule::instruction => {
                line.instruction = Some(ast_builder::build_instruction(
                    inner.into_inner().next().unwrap(),
                    line_number,
                )?);
            }
            Rule::directive => {
                line.directive = Some(ast_builder::build_directive(
                    inner.into_inner().next().unwrap(),
                    line_number,
                )?);
            }
            _ => {}
        }

        open_insn_line =
            if line.instruction.is_some() { Some(end_line) } else { None };
        lines.push(line);
    }

    Ok(lines)
}

// ------------- unit tests -------------
