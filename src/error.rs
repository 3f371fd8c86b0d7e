use crate::backend::interpreter::EvalError;
use crate::backend::BackendError;
use crate::codegen::CodegenError;
use crate::parser::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("nothing to evaluate: no top-level expressions and no main()")]
    NoEntry,
}

impl CompileError {
    /// Source line the error points at, when it is known.
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::Parse(err) => Some(err.line),
            CompileError::Codegen(err) => err.line(),
            _ => None,
        }
    }

    /// `file:line: message`, or `file: message` without a line.
    pub fn located(&self, file: &str) -> String {
        match (self, self.line()) {
            (CompileError::Parse(err), _) => format!("{}:{}: {}", file, err.line, err.kind),
            (other, Some(line)) => format!("{}:{}: {}", file, line, other),
            (other, None) => format!("{}: {}", file, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_errors_carry_their_line() {
        let err = CompileError::from(parse_str("1 +\n)").unwrap_err());
        assert_eq!(err.line(), Some(2));
        assert_eq!(
            err.located("unit.lilc"),
            "unit.lilc:2: token ')' cannot start an expression"
        );
    }

    #[test]
    fn generation_errors_point_at_the_use() {
        let err = CompileError::from(CodegenError::UndefinedFunction {
            name: "f".to_string(),
            line: 4,
        });
        assert_eq!(err.line(), Some(4));
        assert_eq!(err.located("unit.lilc"), "unit.lilc:4: unknown function f");
    }

    #[test]
    fn errors_without_a_line() {
        let err = CompileError::from(CodegenError::BodyConflict("f".to_string()));
        assert_eq!(err.line(), None);
        assert_eq!(
            err.located("unit.lilc"),
            "unit.lilc: function f already has a body"
        );
        assert_eq!(CompileError::NoEntry.line(), None);
    }
}
