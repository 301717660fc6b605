//! Crate root: wires together the compilation pipeline.
//!
//! The stages run strictly in order, each once per compilation:
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and returns functions with their locals.
//! - `offsets` lays out each function's locals in its stack frame.
//! - `codegen` lowers the program into AArch64 assembly.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod codegen;
pub mod error;
pub mod offsets;
pub mod parser;
pub mod tokenizer;

use tracing::debug;

pub use error::{CompileError, CompileResult, Diagnostic};
pub use parser::Program;

/// Run the front end: tokenize, parse and assign stack offsets.
pub fn compile_program(source: &str) -> CompileResult<Program> {
  let tokens = tokenizer::tokenize(source)?;
  debug!(tokens = tokens.len(), "tokenized source");

  let mut program = parser::parse(tokens, source)?;
  debug!(functions = program.functions.len(), "parsed program");

  offsets::assign_offsets(&mut program);
  Ok(program)
}

/// Compile a source string into AArch64 assembly.
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  let program = compile_program(source)?;
  let asm = codegen::generate(&program, source)?;
  debug!(bytes = asm.len(), "generated assembly");
  Ok(asm)
}
