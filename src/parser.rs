use crate::ast::{Block, Node, Operator, Prototype};
use crate::lexer::{LexError, Lexer, Token};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ParseErrorKind {
    #[error(transparent)]
    Lex(LexError),
    #[error("token '{0}' cannot start an expression")]
    NoPrefixHandler(Token),
    #[error("token '{0}' cannot follow an expression")]
    NoInfixHandler(Token),
    #[error("expected token '{expected}', got '{found}'")]
    UnexpectedToken { expected: String, found: Token },
    #[error("malformed parameter list at '{0}'")]
    MalformedParameterList(Token),
    #[error("too many parameters: {found} declared, at most {limit} allowed")]
    TooManyParameters { limit: usize, found: usize },
    #[error("only a named function can be called")]
    InvalidCallee,
    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },
}

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError {
            line: err.line(),
            kind: ParseErrorKind::Lex(err),
        }
    }
}

pub type ParseResult = Result<Node, ParseError>;

/// Nesting allowed by [`ParserConfig::default`].
pub const DEFAULT_MAX_DEPTH: usize = 512;

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Reject prototypes declaring more parameters than this. `None` means
    /// unlimited.
    pub max_parameters: Option<usize>,
    /// Deepest tree the parser will build. Every sub-expression, every folded
    /// operator and every braced block counts one level.
    pub max_depth: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            max_parameters: None,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

// left binding powers, low to high
const BP_NONE: u8 = 0;
const BP_COMPARE: u8 = 1;
const BP_SUM: u8 = 2;
const BP_PRODUCT: u8 = 3;
const BP_CALL: u8 = 10;

type PrefixHandler<'src> = fn(&mut Parser<'src>, Token) -> ParseResult;
type InfixHandler<'src> = fn(&mut Parser<'src>, Token, Node) -> ParseResult;

/// Parsing behaviour of one token class.
struct Rule<'src> {
    lbp: u8,
    prefix: Option<PrefixHandler<'src>>,
    infix: Option<InfixHandler<'src>>,
}

#[derive(Debug, Clone)]
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    config: ParserConfig,
    depth: usize,
    // line of the token most recently taken by `advance`
    token_line: usize,
}

impl<'src> Parser<'src> {
    pub fn new(lexer: Lexer<'src>) -> Self {
        Self::with_config(lexer, ParserConfig::default())
    }

    pub fn with_config(lexer: Lexer<'src>, config: ParserConfig) -> Self {
        Self {
            lexer,
            config,
            depth: 0,
            token_line: 1,
        }
    }

    /// Parse the whole compilation unit into a single [`Node::Block`] of
    /// top-level statements.
    pub fn parse(mut self) -> ParseResult {
        self.lexer.scan()?;
        let program = self.block(&Token::Eos)?;
        self.expect(&Token::Eos)?;
        tracing::debug!(
            statements = program.statements.len(),
            "parsed compilation unit"
        );
        Ok(Node::Block(program))
    }

    fn rule(token: &Token) -> Rule<'src> {
        let none = Rule {
            lbp: BP_NONE,
            prefix: None,
            infix: None,
        };
        match token {
            Token::Number(_) => Rule {
                prefix: Some(Self::parse_number),
                ..none
            },
            Token::Ident(_) => Rule {
                prefix: Some(Self::parse_variable),
                ..none
            },
            Token::OpenParen => Rule {
                lbp: BP_CALL,
                prefix: Some(Self::parse_nested),
                infix: Some(Self::parse_call),
            },
            Token::OpenCurly => Rule {
                prefix: Some(Self::parse_block),
                ..none
            },
            Token::Add | Token::Sub => Rule {
                lbp: BP_SUM,
                infix: Some(Self::parse_binary),
                ..none
            },
            Token::Mul | Token::Div => Rule {
                lbp: BP_PRODUCT,
                infix: Some(Self::parse_binary),
                ..none
            },
            Token::Less => Rule {
                lbp: BP_COMPARE,
                infix: Some(Self::parse_binary),
                ..none
            },
            Token::Def => Rule {
                prefix: Some(Self::parse_definition),
                ..none
            },
            Token::Extern => Rule {
                prefix: Some(Self::parse_extern),
                ..none
            },
            Token::If => Rule {
                prefix: Some(Self::parse_if),
                ..none
            },
            _ => none,
        }
    }

    /// Parse one expression whose operators bind tighter than `rbp`.
    pub fn parse_expr(&mut self, rbp: u8) -> ParseResult {
        self.nested(|parser| parser.climb(rbp))
    }

    /// Precedence climbing: keep folding infix operators into `left` while the
    /// upcoming token binds tighter than `rbp`.
    fn climb(&mut self, rbp: u8) -> ParseResult {
        let line = self.lexer.line();
        let token = self.advance()?;
        let prefix = match Self::rule(&token).prefix {
            Some(prefix) => prefix,
            None => return Err(error_at(ParseErrorKind::NoPrefixHandler(token), line)),
        };
        let mut left = prefix(self, token)?;

        while Self::rule(self.lexer.current()).lbp > rbp {
            // each fold deepens the left spine by one
            self.descend()?;
            let line = self.lexer.line();
            let token = self.advance()?;
            let infix = match Self::rule(&token).infix {
                Some(infix) => infix,
                None => return Err(error_at(ParseErrorKind::NoInfixHandler(token), line)),
            };
            left = infix(self, token, left)?;
        }

        Ok(left)
    }

    fn parse_number(&mut self, token: Token) -> ParseResult {
        match token {
            Token::Number(value) => Ok(Node::Number(value)),
            other => Err(self.unexpected("number", other)),
        }
    }

    fn parse_variable(&mut self, token: Token) -> ParseResult {
        match token {
            Token::Ident(name) => Ok(Node::variable(name, self.token_line)),
            other => Err(self.unexpected("identifier", other)),
        }
    }

    fn parse_nested(&mut self, _token: Token) -> ParseResult {
        let inner = self.parse_expr(BP_NONE)?;
        self.expect(&Token::CloseParen)?;
        Ok(inner)
    }

    fn parse_block(&mut self, _token: Token) -> ParseResult {
        let block = self.block(&Token::CloseCurly)?;
        self.expect(&Token::CloseCurly)?;
        Ok(Node::Block(block))
    }

    fn parse_binary(&mut self, token: Token, left: Node) -> ParseResult {
        let op = match Operator::from_token(&token) {
            Some(op) => op,
            None => return Err(self.error(ParseErrorKind::NoInfixHandler(token))),
        };
        let right = self.parse_expr(Self::rule(&token).lbp)?;
        Ok(Node::binary(op, left, right))
    }

    fn parse_call(&mut self, _token: Token, left: Node) -> ParseResult {
        let (name, line) = match left {
            Node::Variable { name, line } => (name, line),
            _ => return Err(self.error(ParseErrorKind::InvalidCallee)),
        };

        let mut args = Vec::new();
        if !self.lexer.consume_if(&Token::CloseParen)? {
            loop {
                args.push(self.parse_expr(BP_NONE)?);
                if self.lexer.consume_if(&Token::Comma)? {
                    continue;
                }
                self.expect(&Token::CloseParen)?;
                break;
            }
        }

        Ok(Node::call(name, args, line))
    }

    fn parse_definition(&mut self, _token: Token) -> ParseResult {
        let prototype = self.parse_prototype()?;
        let body = self.braced_block()?;
        Ok(Node::function(prototype, Node::Block(body)))
    }

    fn parse_extern(&mut self, _token: Token) -> ParseResult {
        Ok(Node::Prototype(self.parse_prototype()?))
    }

    fn parse_if(&mut self, _token: Token) -> ParseResult {
        self.expect(&Token::OpenParen)?;
        let condition = self.parse_expr(BP_NONE)?;
        self.expect(&Token::CloseParen)?;
        let then_block = self.braced_block()?;

        let else_block = if self.lexer.consume_if(&Token::Else)? {
            if self.lexer.current() == &Token::If {
                let token = self.advance()?;
                let nested = self.nested(|parser| parser.parse_if(token))?;
                Some(Block {
                    statements: vec![nested],
                })
            } else {
                Some(self.braced_block()?)
            }
        } else {
            None
        };

        Ok(Node::if_else(condition, then_block, else_block))
    }

    fn parse_prototype(&mut self) -> Result<Prototype, ParseError> {
        let name = self.expect_ident()?;
        self.expect(&Token::OpenParen)?;

        let mut params = Vec::new();
        if !self.lexer.consume_if(&Token::CloseParen)? {
            loop {
                match self.lexer.current() {
                    Token::Ident(param) => {
                        params.push(param.clone());
                        self.lexer.scan()?;
                    }
                    other => {
                        let other = other.clone();
                        return Err(self.error(ParseErrorKind::MalformedParameterList(other)));
                    }
                }
                if self.lexer.consume_if(&Token::Comma)? {
                    continue;
                }
                if self.lexer.consume_if(&Token::CloseParen)? {
                    break;
                }
                let found = self.lexer.current().clone();
                return Err(self.error(ParseErrorKind::MalformedParameterList(found)));
            }
        }

        if let Some(limit) = self.config.max_parameters {
            if params.len() > limit {
                return Err(self.error(ParseErrorKind::TooManyParameters {
                    limit,
                    found: params.len(),
                }));
            }
        }

        Ok(Prototype { name, params })
    }

    fn braced_block(&mut self) -> Result<Block, ParseError> {
        self.nested(|parser| {
            parser.expect(&Token::OpenCurly)?;
            let block = parser.block(&Token::CloseCurly)?;
            parser.expect(&Token::CloseCurly)?;
            Ok(block)
        })
    }

    /// Run `parse` one level deeper, restoring the depth afterwards.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let depth = self.depth;
        let result = self.descend().and_then(|()| parse(self));
        self.depth = depth;
        result
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > self.config.max_depth {
            return Err(self.error(ParseErrorKind::TooDeep {
                limit: self.config.max_depth,
            }));
        }
        Ok(())
    }

    /// `expression (';' expression)* ';'?` up to `end` or end-of-source. An
    /// empty block is accepted here and rejected during generation.
    fn block(&mut self, end: &Token) -> Result<Block, ParseError> {
        let mut statements = Vec::new();
        loop {
            let current = self.lexer.current();
            if current == end || current == &Token::Eos {
                break;
            }
            statements.push(self.parse_expr(BP_NONE)?);
            if !self.lexer.consume_if(&Token::Semicolon)? {
                break;
            }
        }
        Ok(Block { statements })
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        let token = self.lexer.current().clone();
        self.token_line = self.lexer.line();
        self.lexer.scan()?;
        Ok(token)
    }

    fn expect(&mut self, want: &Token) -> Result<(), ParseError> {
        if self.lexer.consume_if(want)? {
            Ok(())
        } else {
            let found = self.lexer.current().clone();
            Err(self.unexpected(&want.to_string(), found))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.lexer.current() {
            Token::Ident(name) => {
                let name = name.clone();
                self.lexer.scan()?;
                Ok(name)
            }
            other => {
                let other = other.clone();
                Err(self.unexpected("identifier", other))
            }
        }
    }

    fn unexpected(&self, expected: &str, found: Token) -> ParseError {
        self.error(ParseErrorKind::UnexpectedToken {
            expected: expected.to_string(),
            found,
        })
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        error_at(kind, self.lexer.line())
    }
}

fn error_at(kind: ParseErrorKind, line: usize) -> ParseError {
    ParseError { kind, line }
}

pub fn parse_str(source: &str) -> ParseResult {
    Parser::new(Lexer::new(source)).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::print;
    use pretty_assertions::assert_eq;

    fn single(source: &str) -> Node {
        match parse_str(source).unwrap() {
            Node::Block(mut block) if block.statements.len() == 1 => block.statements.remove(0),
            other => panic!("expected one statement, got {}", other),
        }
    }

    fn num(value: f64) -> Node {
        Node::number(value)
    }

    #[test]
    fn parse_expr_works() {
        let target = Node::binary(
            Operator::Add,
            Node::variable("x", 1),
            Node::binary(
                Operator::Mul,
                num(1.0),
                Node::binary(Operator::Sub, num(2.0), num(3.0)),
            ),
        );
        assert_eq!(single("x + 1 * (2 - 3)"), target);
    }

    #[test]
    fn multiplication_binds_tighter() {
        assert_eq!(
            single("1 + 2 * 3;"),
            Node::binary(
                Operator::Add,
                num(1.0),
                Node::binary(Operator::Mul, num(2.0), num(3.0))
            )
        );
        assert_eq!(
            single("1 / 2 - 3"),
            Node::binary(
                Operator::Sub,
                Node::binary(Operator::Div, num(1.0), num(2.0)),
                num(3.0)
            )
        );
    }

    #[test]
    fn comparison_binds_loosest() {
        assert_eq!(
            single("a + 1 < b * 2"),
            Node::binary(
                Operator::Less,
                Node::binary(Operator::Add, Node::variable("a", 1), num(1.0)),
                Node::binary(Operator::Mul, Node::variable("b", 1), num(2.0)),
            )
        );
    }

    #[test]
    fn subtraction_is_left_associative() {
        assert_eq!(
            single("a - b - c"),
            Node::binary(
                Operator::Sub,
                Node::binary(Operator::Sub, Node::variable("a", 1), Node::variable("b", 1)),
                Node::variable("c", 1),
            )
        );
    }

    #[test]
    fn grouping_overrides_precedence() {
        assert_eq!(
            single("(a + b) * c"),
            Node::binary(
                Operator::Mul,
                Node::binary(Operator::Add, Node::variable("a", 1), Node::variable("b", 1)),
                Node::variable("c", 1),
            )
        );
    }

    #[test]
    fn parses_calls() {
        assert_eq!(single("f()"), Node::call("f", vec![], 1));
        assert_eq!(
            single("f(1, g(x) + 2)"),
            Node::call(
                "f",
                vec![
                    num(1.0),
                    Node::binary(
                        Operator::Add,
                        Node::call("g", vec![Node::variable("x", 1)], 1),
                        num(2.0)
                    ),
                ],
                1
            )
        );
    }

    #[test]
    fn parses_definition_and_call() {
        let ast = parse_str("def add(a,b){a+b}; add(3,4);").unwrap();
        let expected = Node::block(vec![
            Node::function(
                Prototype {
                    name: "add".to_string(),
                    params: vec!["a".to_string(), "b".to_string()],
                },
                Node::block(vec![Node::binary(
                    Operator::Add,
                    Node::variable("a", 1),
                    Node::variable("b", 1),
                )]),
            ),
            Node::call("add", vec![num(3.0), num(4.0)], 1),
        ]);
        assert_eq!(ast, expected);
    }

    #[test]
    fn braces_start_a_block_expression() {
        assert_eq!(
            single("{ 1; 2; 3 }"),
            Node::block(vec![num(1.0), num(2.0), num(3.0)])
        );
        assert_eq!(
            single("{ { x }; 2 } * 2"),
            Node::binary(
                Operator::Mul,
                Node::block(vec![Node::block(vec![Node::variable("x", 1)]), num(2.0)]),
                num(2.0)
            )
        );
        assert_eq!(
            parse_str("{ 1 ").unwrap_err().kind,
            ParseErrorKind::UnexpectedToken {
                expected: "}".to_string(),
                found: Token::Eos
            }
        );
    }

    #[test]
    fn names_remember_their_line() {
        let ast = parse_str("def f(a) {\n  a\n};\n\nf(\n  2);").unwrap();
        let expected = Node::block(vec![
            Node::function(
                Prototype {
                    name: "f".to_string(),
                    params: vec!["a".to_string()],
                },
                Node::block(vec![Node::variable("a", 2)]),
            ),
            Node::call("f", vec![num(2.0)], 5),
        ]);
        assert_eq!(ast, expected);
    }

    #[test]
    fn parses_extern() {
        assert_eq!(
            single("extern sin(x);"),
            Node::prototype("sin", vec!["x".to_string()])
        );
        assert_eq!(single("extern now()"), Node::prototype("now", vec![]));
    }

    #[test]
    fn parses_if_else() {
        assert_eq!(
            single("if (1 < 2) { 10 } else { 20 }"),
            Node::if_else(
                Node::binary(Operator::Less, num(1.0), num(2.0)),
                Block {
                    statements: vec![num(10.0)]
                },
                Some(Block {
                    statements: vec![num(20.0)]
                }),
            )
        );
    }

    #[test]
    fn else_if_nests_into_else_block() {
        let ast = single("if (a) { 1 } else if (b) { 2 } else { 3 }");
        assert_eq!(
            print(&ast),
            "\
(if (var a)
  (block
    (num 1.0))
  (block
    (if (var b)
      (block
        (num 2.0))
      (block
        (num 3.0)))))"
        );
    }

    #[test]
    fn if_without_else_parses() {
        match single("if (x) { 1 }") {
            Node::If(if_node) => assert_eq!(if_node.else_block, None),
            other => panic!("expected if, got {}", other),
        }
    }

    #[test]
    fn empty_block_is_allowed_by_the_grammar() {
        assert_eq!(
            single("def nothing() {}"),
            Node::function(
                Prototype {
                    name: "nothing".to_string(),
                    params: vec![]
                },
                Node::block(vec![])
            )
        );
        assert_eq!(parse_str("").unwrap(), Node::block(vec![]));
    }

    #[test]
    fn printing_twice_is_identical() {
        let ast = parse_str("def f(x) { if (x < 1) { 1 } else { x * f(x - 1) } }; f(5);").unwrap();
        let first = print(&ast);
        assert_eq!(first, print(&ast));
        assert_eq!(first, ast.to_string());
    }

    #[test]
    fn missing_prefix_handler() {
        let err = parse_str("1;\n* 2").unwrap_err();
        assert_eq!(
            err,
            ParseError {
                kind: ParseErrorKind::NoPrefixHandler(Token::Mul),
                line: 2
            }
        );
    }

    #[test]
    fn unexpected_token() {
        let err = parse_str("(1 + 2;").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::UnexpectedToken {
                expected: ")".to_string(),
                found: Token::Semicolon
            }
        );
        let err = parse_str("1 2").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::UnexpectedToken {
                expected: "end-of-source".to_string(),
                found: Token::Number(2.0)
            }
        );
    }

    #[test]
    fn malformed_parameter_list() {
        let err = parse_str("def f(a, 1) { a }").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::MalformedParameterList(Token::Number(1.0))
        );
        let err = parse_str("def f(a b) { a }").unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::MalformedParameterList(Token::Ident("b".to_string()))
        );
    }

    #[test]
    fn parameter_limit_is_configurable() {
        let source = "def f(a, b, c) { a }";
        assert!(parse_str(source).is_ok());

        let config = ParserConfig {
            max_parameters: Some(2),
            ..ParserConfig::default()
        };
        let err = Parser::with_config(Lexer::new(source), config)
            .parse()
            .unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::TooManyParameters { limit: 2, found: 3 }
        );
    }

    fn too_deep(source: &str) -> bool {
        matches!(
            parse_str(source),
            Err(ParseError {
                kind: ParseErrorKind::TooDeep {
                    limit: DEFAULT_MAX_DEPTH
                },
                ..
            })
        )
    }

    #[test]
    fn deep_parentheses_are_rejected() {
        let source = format!("{}1{};", "(".repeat(20_000), ")".repeat(20_000));
        assert!(too_deep(&source));
        let source = format!("{}1{};", "(".repeat(100), ")".repeat(100));
        assert!(parse_str(&source).is_ok());
    }

    #[test]
    fn long_operator_chains_are_rejected() {
        let source = format!("{};", vec!["1"; 200_000].join(" + "));
        assert!(too_deep(&source));
        let source = format!("{};", vec!["1"; 100].join(" * "));
        assert!(parse_str(&source).is_ok());
    }

    #[test]
    fn deep_ifs_and_blocks_are_rejected() {
        let n = 5_000;
        let ifs = format!(
            "{}1{}",
            "if (1) { ".repeat(n),
            " } else { 0 }".repeat(n)
        );
        assert!(too_deep(&ifs));
        let else_ifs = format!("{}{{ 1 }}", "if (0) { 0 } else ".repeat(n));
        assert!(too_deep(&else_ifs));
        let blocks = format!("{}1{}", "{ ".repeat(n), " }".repeat(n));
        assert!(too_deep(&blocks));
        let calls = format!("{}1{}", "f(".repeat(n), ")".repeat(n));
        assert!(too_deep(&calls));
    }

    #[test]
    fn depth_limit_is_configurable() {
        let config = |max_depth| ParserConfig {
            max_depth,
            ..ParserConfig::default()
        };
        let parse = |source: &str, max_depth| {
            Parser::with_config(Lexer::new(source), config(max_depth)).parse()
        };
        assert!(parse("((1))", 3).is_ok());
        let err = parse("(((1)))", 3).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeep { limit: 3 });
        // the right operand of the last fold sits one level below the fold
        assert!(parse("1 + 2 + 3", 4).is_ok());
        let err = parse("1 + 2 + 3 + 4", 4).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeep { limit: 4 });
    }

    #[test]
    fn only_names_can_be_called() {
        let err = parse_str("(1)(2)").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidCallee);
    }

    #[test]
    fn lex_errors_surface_with_line() {
        let err = parse_str("1 +\n\n@").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(matches!(err.kind, ParseErrorKind::Lex(_)));
    }
}
