//! Front-end and IR generator for lil, a toy language of numbers, functions
//! and if/else expressions.
//!
//! Source text flows through [`lexer::Lexer`] into the precedence-climbing
//! [`parser::Parser`], which produces an [`ast::Node`] tree. [`codegen::Codegen`]
//! walks that tree against any [`backend::Backend`].

pub mod ast;
pub mod backend;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;

use backend::interpreter::Interpreter;
use backend::ssa::{FuncId, Module};
use codegen::{Codegen, Generated};
use lexer::Lexer;
use parser::{Parser, ParserConfig};

pub use error::CompileError;

/// Parse and generate `source` into a fresh SSA module.
pub fn compile_str(source: &str) -> Result<(Module, Generated<FuncId>), CompileError> {
    compile_with(source, ParserConfig::default())
}

pub fn compile_with(
    source: &str,
    config: ParserConfig,
) -> Result<(Module, Generated<FuncId>), CompileError> {
    let ast = Parser::with_config(Lexer::new(source), config).parse()?;
    let mut codegen = Codegen::new(Module::new("lilc"));
    let generated = codegen.codegen(&ast)?;
    Ok((codegen.into_backend(), generated))
}

/// Compile `source` and evaluate its entry function.
pub fn eval_str(source: &str) -> Result<f64, CompileError> {
    let (module, generated) = compile_str(source)?;
    let entry = generated.entry.ok_or(CompileError::NoEntry)?;
    Ok(Interpreter::new(&module).call_id(entry, &[])?)
}
