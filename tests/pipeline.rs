use lilc::{
    ast, backend::interpreter::EvalError, codegen::CodegenError, compile_str, compile_with,
    eval_str, parser::parse_str, parser::ParseErrorKind, parser::ParserConfig, CompileError,
};
use pretty_assertions::assert_eq;

#[test]
fn evaluates_definitions_and_calls() {
    assert_eq!(eval_str("def add(a, b) { a + b }; add(3, 4);").unwrap(), 7.0);
    assert_eq!(eval_str("1 + 2 * 3;").unwrap(), 7.0);
    assert_eq!(eval_str("{ 1; 2; 3 }").unwrap(), 3.0);
}

#[test]
fn evaluates_conditionals() {
    assert_eq!(eval_str("if (1 < 2) { 10 } else { 20 }").unwrap(), 10.0);
    assert_eq!(eval_str("if (2 < 1) { 10 } else { 20 }").unwrap(), 20.0);

    let source = "
        # naive fibonacci
        def fib(n) {
            if (n < 2) { n } else { fib(n - 1) + fib(n - 2) }
        };
        fib(15);
    ";
    assert_eq!(eval_str(source).unwrap(), 610.0);
}

#[test]
fn user_main_is_the_entry_without_top_level_expressions() {
    assert_eq!(eval_str("def main() { 40 + 2 }").unwrap(), 42.0);
    assert!(matches!(
        eval_str("def add(a, b) { a + b }"),
        Err(CompileError::NoEntry)
    ));
}

#[test]
fn reports_generation_errors() {
    assert!(matches!(
        eval_str("foo(1);"),
        Err(CompileError::Codegen(CodegenError::UndefinedFunction { name, line: 1 })) if name == "foo"
    ));
    assert!(matches!(
        eval_str("def f(a) { a }; f(1, 2);"),
        Err(CompileError::Codegen(CodegenError::ArityMismatch { expected: 1, found: 2, .. }))
    ));
    assert!(matches!(
        eval_str("def f(a) { a }; def f(a, b) { a };"),
        Err(CompileError::Codegen(CodegenError::ArityConflict { existing: 1, declared: 2, .. }))
    ));
    assert!(matches!(
        eval_str("def f(a) { a }; def f(b) { b };"),
        Err(CompileError::Codegen(CodegenError::BodyConflict(name))) if name == "f"
    ));
}

#[test]
fn reports_parse_errors_with_lines() {
    let err = eval_str("def f(a) {\n  a +\n}").unwrap_err();
    assert!(matches!(
        &err,
        CompileError::Parse(parse) if matches!(parse.kind, ParseErrorKind::NoPrefixHandler(_))
    ));
    assert_eq!(err.line(), Some(3));

    let limited = ParserConfig {
        max_parameters: Some(1),
        ..ParserConfig::default()
    };
    assert!(matches!(
        compile_with("def f(a, b) { a }", limited),
        Err(CompileError::Parse(parse))
            if parse.kind == ParseErrorKind::TooManyParameters { limit: 1, found: 2 }
    ));
}

#[test]
fn generation_errors_carry_the_line_of_the_use() {
    let err = eval_str("def f(a) { a };\n\nf(1, 2);").unwrap_err();
    assert_eq!(err.line(), Some(3));
    assert_eq!(
        err.located("unit.lil"),
        "unit.lil:3: invalid number of args in call f expected 1 found 2"
    );
}

#[test]
fn calls_only_see_earlier_definitions() {
    assert!(matches!(
        eval_str("g(1); def g(x) { x };"),
        Err(CompileError::Codegen(CodegenError::UndefinedFunction { .. }))
    ));
    assert_eq!(eval_str("def g(x) { x }; g(1);").unwrap(), 1.0);
}

#[test]
fn main_cannot_be_defined_next_to_top_level_expressions() {
    assert!(matches!(
        eval_str("def main() { 1 }; 2;"),
        Err(CompileError::Codegen(CodegenError::ReservedEntry))
    ));
}

#[test]
fn huge_inputs_fail_without_aborting() {
    let parens = format!("{}1{};", "(".repeat(20_000), ")".repeat(20_000));
    assert!(matches!(
        eval_str(&parens),
        Err(CompileError::Parse(parse)) if matches!(parse.kind, ParseErrorKind::TooDeep { .. })
    ));

    let sum = format!("{};", vec!["1"; 200_000].join(" + "));
    assert!(matches!(
        eval_str(&sum),
        Err(CompileError::Parse(parse)) if matches!(parse.kind, ParseErrorKind::TooDeep { .. })
    ));

    let sum = format!("{};", vec!["1"; 200].join(" + "));
    assert_eq!(eval_str(&sum).unwrap(), 200.0);
}

#[test]
fn runaway_recursion_is_an_evaluation_error() {
    assert!(matches!(
        eval_str("def down(n) { down(n - 1) }; down(1);"),
        Err(CompileError::Eval(EvalError::StackOverflow(_)))
    ));
}

#[test]
fn printing_is_stable() {
    let source = "def f(x, y) { if (x < y) { x * 2 } else { f(y, x) } }; f(1, 2) + 3;";
    let tree = parse_str(source).unwrap();
    let first = ast::print(&tree);
    assert_eq!(first, ast::print(&tree));
    assert_eq!(first, ast::print(&parse_str(source).unwrap()));
}

#[test]
fn compiled_module_verifies_and_prints() {
    let (module, generated) = compile_str("def sq(x) { x * x }; sq(3);").unwrap();
    module.verify().unwrap();
    assert_eq!(generated.functions.len(), 1);
    assert!(generated.entry.is_some());

    let text = module.to_string();
    assert!(text.contains("define double @sq(double %x)"));
    assert!(text.contains("define double @main()"));
}
