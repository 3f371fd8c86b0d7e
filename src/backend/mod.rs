//! The boundary between the code generator and whatever turns IR into
//! something runnable.
//!
//! [`ssa::Module`] is the in-crate implementation, evaluated by
//! [`interpreter::Interpreter`]. With the `llvm` feature, [`llvm::LlvmBackend`]
//! lowers the same calls through inkwell for JIT evaluation or object files.

pub mod interpreter;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod ssa;

use std::fmt;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithmeticOp::Add => lhs + rhs,
            ArithmeticOp::Sub => lhs - rhs,
            ArithmeticOp::Mul => lhs * rhs,
            ArithmeticOp::Div => lhs / rhs,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ArithmeticOp::Add => "fadd",
            ArithmeticOp::Sub => "fsub",
            ArithmeticOp::Mul => "fmul",
            ArithmeticOp::Div => "fdiv",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
#[error("backend error: {0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError(message.into())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// IR construction primitives needed by [`crate::codegen::Codegen`].
///
/// Every handle is a cheap copyable reference into backend-owned storage.
/// Instructions are emitted at the builder cursor, which is moved with
/// [`Backend::position_at_end`].
pub trait Backend {
    /// A double-precision value.
    type Value: Copy + fmt::Debug;
    /// A one-bit truth value, only consumed by branches and coercions.
    type Condition: Copy + fmt::Debug;
    type Function: Copy + fmt::Debug;
    type Block: Copy + fmt::Debug;

    fn const_float(&mut self, value: f64) -> Self::Value;
    fn build_arithmetic(
        &mut self,
        op: ArithmeticOp,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> BackendResult<Self::Value>;
    fn build_less_than(&mut self, lhs: Self::Value, rhs: Self::Value)
        -> BackendResult<Self::Condition>;
    /// `value != 0.0`
    fn build_nonzero(&mut self, value: Self::Value) -> BackendResult<Self::Condition>;
    /// Widen a truth value to `0.0` or `1.0`.
    fn build_condition_to_float(&mut self, cond: Self::Condition) -> BackendResult<Self::Value>;

    fn get_function(&self, name: &str) -> Option<Self::Function>;
    /// Declare an externally visible `double name(double, ...)`.
    fn add_function(&mut self, name: &str, params: &[String]) -> Self::Function;
    fn count_params(&self, function: Self::Function) -> usize;
    fn has_body(&self, function: Self::Function) -> bool;
    fn get_param(&self, function: Self::Function, index: usize) -> Option<Self::Value>;

    fn append_block(&mut self, function: Self::Function, label: &str) -> Self::Block;
    fn position_at_end(&mut self, block: Self::Block);
    fn insert_block(&self) -> Option<Self::Block>;
    fn block_parent(&self, block: Self::Block) -> Option<Self::Function>;

    fn build_conditional_branch(
        &mut self,
        cond: Self::Condition,
        then_block: Self::Block,
        else_block: Self::Block,
    ) -> BackendResult<()>;
    fn build_branch(&mut self, block: Self::Block) -> BackendResult<()>;
    fn build_phi(&mut self, incoming: &[(Self::Value, Self::Block)]) -> BackendResult<Self::Value>;
    fn build_return(&mut self, value: Self::Value) -> BackendResult<()>;
    fn build_call(
        &mut self,
        function: Self::Function,
        args: &[Self::Value],
    ) -> BackendResult<Self::Value>;

    fn verify_function(&self, function: Self::Function) -> BackendResult<()>;
    fn delete_function(&mut self, function: Self::Function);
    /// Drop every block of `function`, leaving a bare declaration.
    fn delete_function_body(&mut self, function: Self::Function);
}
