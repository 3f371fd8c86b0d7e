use std::{fs, path::PathBuf};

use anyhow::{anyhow, bail, Context as _};
use clap::{Parser as ClapParser, ValueEnum};
use tracing_subscriber::EnvFilter;

use lilc::{
    ast::Node,
    backend::{interpreter::Interpreter, ssa::Module},
    codegen::Codegen,
    lexer::{lex_str, Lexer},
    parser::{ParseError, Parser, ParserConfig, DEFAULT_MAX_DEPTH},
    CompileError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// One token per line
    Tokens,
    /// The parsed tree
    Ast,
    /// Generated IR
    Ir,
    /// Evaluate the top-level expressions
    Eval,
    /// Native object file (llvm backend only)
    Obj,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Ssa,
    Llvm,
}

#[derive(Debug, ClapParser)]
#[command(name = "lilc", version, about = "Compiler for the lil toy language")]
struct Options {
    /// Source file to compile
    file: PathBuf,

    #[arg(long, value_enum, default_value_t = Emit::Eval)]
    emit: Emit,

    /// Output path for --emit obj
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BackendKind::Ssa)]
    backend: BackendKind,

    /// Reject prototypes with more parameters than this
    #[arg(long, env = "LILC_MAX_PARAMS")]
    max_params: Option<usize>,

    /// Reject expressions nested deeper than this
    #[arg(long, env = "LILC_MAX_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    log_level: String,
}

impl Options {
    fn file_name(&self) -> String {
        self.file.display().to_string()
    }

    fn located(&self, err: impl Into<CompileError>) -> anyhow::Error {
        anyhow!(err.into().located(&self.file_name()))
    }
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&options.log_level))
        .with_writer(std::io::stderr)
        .init();

    let source = fs::read_to_string(&options.file)
        .with_context(|| format!("could not read {}", options.file_name()))?;
    tracing::info!(file = %options.file_name(), bytes = source.len(), "compiling");

    print!("{}", render(&options, &source)?);
    Ok(())
}

/// Run the pipeline as far as `--emit` asks and return what should be
/// printed. Object files are written to disk and produce no output.
fn render(options: &Options, source: &str) -> anyhow::Result<String> {
    if options.emit == Emit::Tokens {
        let tokens = lex_str(source).map_err(|err| options.located(ParseError::from(err)))?;
        return Ok(tokens.iter().map(|token| format!("{}\n", token)).collect());
    }

    let config = ParserConfig {
        max_parameters: options.max_params,
        max_depth: options.max_depth,
    };
    let ast = Parser::with_config(Lexer::new(source), config)
        .parse()
        .map_err(|err| options.located(err))?;
    if options.emit == Emit::Ast {
        return Ok(format!("{}\n", ast));
    }

    match options.backend {
        BackendKind::Ssa => render_ssa(options, &ast),
        BackendKind::Llvm => render_llvm(options, &ast),
    }
}

fn render_ssa(options: &Options, ast: &Node) -> anyhow::Result<String> {
    let mut codegen = Codegen::new(Module::new(options.file_name()));
    let generated = codegen.codegen(ast).map_err(|err| options.located(err))?;
    let module = codegen.into_backend();
    match options.emit {
        Emit::Ir => Ok(module.to_string()),
        Emit::Eval => {
            let entry = generated
                .entry
                .ok_or_else(|| options.located(CompileError::NoEntry))?;
            let value = Interpreter::new(&module)
                .call_id(entry, &[])
                .map_err(|err| options.located(err))?;
            Ok(format!("{}\n", value))
        }
        Emit::Obj => bail!("object files need --backend llvm"),
        Emit::Tokens | Emit::Ast => unreachable!(),
    }
}

#[cfg(feature = "llvm")]
fn render_llvm(options: &Options, ast: &Node) -> anyhow::Result<String> {
    use inkwell::context::Context;
    use lilc::{backend::llvm::LlvmBackend, codegen::ENTRY_NAME};

    let context = Context::create();
    let mut codegen = Codegen::new(LlvmBackend::new(&context, &options.file_name()));
    let generated = codegen.codegen(ast).map_err(|err| options.located(err))?;
    let backend = codegen.into_backend();

    match options.emit {
        Emit::Ir => Ok(backend.print_ir()),
        Emit::Eval => {
            if generated.entry.is_none() {
                return Err(options.located(CompileError::NoEntry));
            }
            let value = backend
                .jit_eval(ENTRY_NAME)
                .map_err(|err| options.located(err))?;
            Ok(format!("{}\n", value))
        }
        Emit::Obj => {
            let path = options
                .output
                .clone()
                .unwrap_or_else(|| options.file.with_extension("o"));
            backend
                .write_object(&path)
                .map_err(|err| options.located(err))?;
            tracing::info!(path = %path.display(), "wrote object file");
            Ok(String::new())
        }
        Emit::Tokens | Emit::Ast => unreachable!(),
    }
}

#[cfg(not(feature = "llvm"))]
fn render_llvm(_options: &Options, _ast: &Node) -> anyhow::Result<String> {
    bail!("lilc was built without the `llvm` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(args: &[&str]) -> Options {
        let argv = ["lilc", "unit.lil"].iter().chain(args).copied();
        Options::try_parse_from(argv).unwrap()
    }

    fn render_with(args: &[&str], source: &str) -> anyhow::Result<String> {
        render(&options(args), source)
    }

    #[test]
    fn defaults_to_evaluation() {
        let defaults = options(&[]);
        assert_eq!(defaults.emit, Emit::Eval);
        assert_eq!(defaults.backend, BackendKind::Ssa);
        assert_eq!(render(&defaults, "def add(a, b) { a + b }; add(3, 4);").unwrap(), "7\n");
        assert_eq!(render_with(&["--emit", "eval"], "1 < 2").unwrap(), "1\n");
    }

    #[test]
    fn emits_tokens() {
        assert_eq!(
            render_with(&["--emit", "tokens"], "def f(x) { x + 1.5 }").unwrap(),
            "def\nid f\n(\nid x\n)\n{\nid x\n+\ndbl 1.5\n}\n"
        );
    }

    #[test]
    fn emits_ast() {
        assert_eq!(
            render_with(&["--emit", "ast"], "1 + 2 * 3;").unwrap(),
            "(block\n  (+ (num 1.0) (* (num 2.0) (num 3.0))))\n"
        );
    }

    #[test]
    fn emits_ir() {
        let ir = render_with(&["--emit", "ir"], "def sq(x) { x * x }; sq(3);").unwrap();
        assert!(ir.starts_with("; ModuleID = 'unit.lil'"));
        assert!(ir.contains("define double @sq(double %x)"));
        assert!(ir.contains("define double @main()"));
    }

    #[test]
    fn object_files_need_llvm() {
        let err = render_with(&["--emit", "obj"], "1;").unwrap_err();
        assert_eq!(err.to_string(), "object files need --backend llvm");
    }

    #[cfg(not(feature = "llvm"))]
    #[test]
    fn llvm_backend_needs_the_feature() {
        let err = render_with(&["--backend", "llvm"], "1;").unwrap_err();
        assert_eq!(err.to_string(), "lilc was built without the `llvm` feature");
    }

    #[test]
    fn diagnostics_name_file_and_line() {
        let err = render_with(&[], "1 +\n)").unwrap_err();
        assert_eq!(err.to_string(), "unit.lil:2: token ')' cannot start an expression");

        let err = render_with(&[], "1;\nnope(2);").unwrap_err();
        assert_eq!(err.to_string(), "unit.lil:2: unknown function nope");

        let err = render_with(&["--emit", "tokens"], "1 @").unwrap_err();
        assert!(err.to_string().starts_with("unit.lil:1: "));

        let err = render_with(&[], "def f(a) { a }").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unit.lil: nothing to evaluate: no top-level expressions and no main()"
        );
    }

    #[test]
    fn limits_come_from_flags() {
        let err = render_with(&["--max-params", "1"], "def f(a, b) { a }; f(1, 2);").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unit.lil:1: too many parameters: 2 declared, at most 1 allowed"
        );

        let err = render_with(&["--max-depth", "2"], "((1));").unwrap_err();
        assert_eq!(err.to_string(), "unit.lil:1: expression nested deeper than 2 levels");
    }
}
