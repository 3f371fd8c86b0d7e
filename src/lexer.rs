use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, PartialEq, Clone)]
pub enum Token {
    Eos,
    Semicolon,
    Comma,
    OpenParen,
    CloseParen,
    OpenCurly,
    CloseCurly,
    Add,
    Sub,
    Mul,
    Div,
    Less,
    Def,
    Extern,
    If,
    Else,
    Ident(String),
    Number(f64),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Eos => write!(f, "end-of-source"),
            Token::Semicolon => write!(f, ";"),
            Token::Comma => write!(f, ","),
            Token::OpenParen => write!(f, "("),
            Token::CloseParen => write!(f, ")"),
            Token::OpenCurly => write!(f, "{{"),
            Token::CloseCurly => write!(f, "}}"),
            Token::Add => write!(f, "+"),
            Token::Sub => write!(f, "-"),
            Token::Mul => write!(f, "*"),
            Token::Div => write!(f, "/"),
            Token::Less => write!(f, "<"),
            Token::Def => write!(f, "def"),
            Token::Extern => write!(f, "extern"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::Ident(name) => write!(f, "id {}", name),
            Token::Number(value) => write!(f, "dbl {:?}", value),
        }
    }
}

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum LexError {
    #[error("unrecognized input character '{character}' on line {line}")]
    UnrecognizedCharacter { character: char, line: usize },
    #[error("invalid number literal {text} on line {line}")]
    InvalidNumber { text: String, line: usize },
}

impl LexError {
    pub fn line(&self) -> usize {
        match self {
            LexError::UnrecognizedCharacter { line, .. } | LexError::InvalidNumber { line, .. } => {
                *line
            }
        }
    }
}

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(
        &[
            r"(?P<ident>[A-Za-z]\w*)",
            r"(?P<number>\d+\.?\d*)",
            r"(?P<punct>[;,(){}+\-*/<])",
            r"(?P<unknown>\S)",
        ]
        .join("|")
    )
    .unwrap();
}

/// Pull-based scanner over a source string.
///
/// The lexer always holds a *current* token; [`Lexer::scan`] replaces it with
/// the next one. A fresh lexer starts on [`Token::Eos`] until the first scan.
#[derive(Debug, Clone)]
pub struct Lexer<'src> {
    source: &'src str,
    offset: usize,
    line: usize,
    current: Token,
    current_line: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            offset: 0,
            line: 1,
            current: Token::Eos,
            current_line: 1,
        }
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    /// Line of the current token, starting at 1.
    pub fn line(&self) -> usize {
        self.current_line
    }

    /// Advance to the next token and return it. Returns [`Token::Eos`] forever
    /// once the input is exhausted.
    pub fn scan(&mut self) -> Result<&Token, LexError> {
        self.skip_trivia();
        self.current_line = self.line;

        let token = match TOKEN_RE.captures_at(self.source, self.offset) {
            None => Token::Eos,
            Some(cap) => {
                let whole = cap.get(0).map_or("", |m| m.as_str());
                self.offset += whole.len();

                if let Some(ident) = cap.name("ident") {
                    keyword_or_ident(ident.as_str())
                } else if let Some(number) = cap.name("number") {
                    let text = number.as_str();
                    let value = text.parse().map_err(|_| LexError::InvalidNumber {
                        text: text.to_string(),
                        line: self.line,
                    })?;
                    Token::Number(value)
                } else if let Some(punct) = cap.name("punct") {
                    punctuation(punct.as_str())
                } else {
                    return Err(LexError::UnrecognizedCharacter {
                        character: whole.chars().next().unwrap_or_default(),
                        line: self.line,
                    });
                }
            }
        };

        tracing::trace!(line = self.current_line, token = %token, "scanned");
        self.current = token;
        Ok(&self.current)
    }

    /// Advance only if the current token equals `want`.
    pub fn consume_if(&mut self, want: &Token) -> Result<bool, LexError> {
        if &self.current == want {
            self.scan()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn skip_trivia(&mut self) {
        let mut in_comment = false;
        for c in self.source[self.offset..].chars() {
            match c {
                '\n' => {
                    self.line += 1;
                    in_comment = false;
                }
                _ if in_comment => {}
                '#' => in_comment = true,
                c if c.is_whitespace() => {}
                _ => break,
            }
            self.offset += c.len_utf8();
        }
    }
}

fn keyword_or_ident(word: &str) -> Token {
    match word {
        "def" => Token::Def,
        "extern" => Token::Extern,
        "if" => Token::If,
        "else" => Token::Else,
        _ => Token::Ident(word.to_string()),
    }
}

fn punctuation(symbol: &str) -> Token {
    match symbol {
        ";" => Token::Semicolon,
        "," => Token::Comma,
        "(" => Token::OpenParen,
        ")" => Token::CloseParen,
        "{" => Token::OpenCurly,
        "}" => Token::CloseCurly,
        "+" => Token::Add,
        "-" => Token::Sub,
        "*" => Token::Mul,
        "/" => Token::Div,
        _ => Token::Less,
    }
}

/// lex the whole input up front - only used for diagnostics, the parser pulls
/// tokens on demand
pub fn lex_str(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.scan()?.clone();
        if token == Token::Eos {
            break;
        }
        tokens.push(token);
    }
    Ok(tokens)
}
