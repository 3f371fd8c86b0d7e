use std::collections::{HashMap, HashSet};

use crate::ast::{Block, Function, If, Node, Operator, Prototype};
use crate::backend::{ArithmeticOp, Backend, BackendError};

/// Name of the function wrapping the top-level expressions of a unit.
pub const ENTRY_NAME: &str = "main";

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum CodegenError {
    #[error("unknown variable referenced {name}")]
    UnboundName { name: String, line: usize },
    #[error("unknown function {name}")]
    UndefinedFunction { name: String, line: usize },
    #[error("invalid number of args in call {name} expected {expected} found {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        line: usize,
    },
    #[error("function {name} already exists with {existing} parameters, redeclared with {declared}")]
    ArityConflict {
        name: String,
        existing: usize,
        declared: usize,
    },
    #[error("function {0} already has a body")]
    BodyConflict(String),
    #[error("failed to verify function {name}: {reason}")]
    VerificationFailed { name: String, reason: String },
    #[error("a block must contain at least one statement")]
    EmptyBlock,
    #[error("if used as a value needs an else branch")]
    MissingElse,
    #[error("parameter {parameter} declared twice in {function}")]
    DuplicateParameter { function: String, parameter: String },
    #[error("function {0} must be defined at the top level")]
    NestedDefinition(String),
    #[error("main is reserved for the top-level expressions of this unit")]
    ReservedEntry,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CodegenError {
    /// Source line of the offending name, for errors raised at a use site.
    pub fn line(&self) -> Option<usize> {
        match self {
            CodegenError::UnboundName { line, .. }
            | CodegenError::UndefinedFunction { line, .. }
            | CodegenError::ArityMismatch { line, .. } => Some(*line),
            _ => None,
        }
    }
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// Parameter bindings of the function currently being generated. A new scope
/// replaces the previous one on every function entry; nothing is inherited.
#[derive(Debug)]
pub struct Scope<V> {
    values: HashMap<String, V>,
}

impl<V: Copy> Scope<V> {
    pub fn new() -> Self {
        Scope {
            values: HashMap::new(),
        }
    }

    pub fn bind(&mut self, name: &str, value: V) {
        self.values.insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<V> {
        self.values.get(name).copied()
    }
}

impl<V: Copy> Default for Scope<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Functions produced for one compilation unit.
#[derive(Debug, PartialEq, Clone)]
pub struct Generated<F> {
    /// The function to run for the unit's value, if it has one.
    pub entry: Option<F>,
    /// Top-level definitions and declarations in source order.
    pub functions: Vec<F>,
}

pub struct Codegen<B: Backend> {
    pub backend: B,
}

/// The entry function while top-level expressions are still being added.
struct OpenEntry<B: Backend> {
    function: B::Function,
    block: B::Block,
    value: B::Value,
}

impl<B: Backend> Codegen<B> {
    pub fn new(backend: B) -> Self {
        Codegen { backend }
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Generate a whole unit in source order. Definitions and declarations
    /// become module functions; every other top-level statement is appended to
    /// the body of [`ENTRY_NAME`], so a call only sees functions defined above
    /// it. If the unit fails, the entry function is removed again.
    pub fn codegen(&mut self, root: &Node) -> CodegenResult<Generated<B::Function>> {
        let statements = match root {
            Node::Block(block) => block.statements.as_slice(),
            other => std::slice::from_ref(other),
        };

        let wraps_entry = statements.iter().any(|statement| !is_definition(statement));
        if wraps_entry {
            let user_entry = statements.iter().any(|statement| match statement {
                Node::Function(function) => function.prototype.name == ENTRY_NAME,
                Node::Prototype(proto) => proto.name == ENTRY_NAME,
                _ => false,
            });
            if user_entry || self.backend.get_function(ENTRY_NAME).is_some() {
                return Err(CodegenError::ReservedEntry);
            }
        }

        let mut functions = Vec::new();
        let mut entry: Option<OpenEntry<B>> = None;
        for statement in statements {
            let step = match statement {
                Node::Function(function) => self.compile_fn(function).map(|f| functions.push(f)),
                Node::Prototype(proto) => self
                    .compile_proto(proto)
                    .map(|(f, _, _)| functions.push(f)),
                expr => self.append_to_entry(expr, &mut entry),
            };
            if let Err(err) = step {
                if let Some(open) = entry {
                    self.backend.delete_function(open.function);
                }
                return Err(err);
            }
        }

        let entry = match entry {
            Some(open) => {
                let result = self.finish(open.function, ENTRY_NAME, open.value);
                if let Err(err) = result {
                    self.backend.delete_function(open.function);
                    return Err(err);
                }
                Some(open.function)
            }
            None => self
                .backend
                .get_function(ENTRY_NAME)
                .filter(|&f| self.backend.count_params(f) == 0 && self.backend.has_body(f)),
        };

        Ok(Generated { entry, functions })
    }

    /// Generate one top-level expression at the end of the entry function,
    /// opening it first if needed.
    fn append_to_entry(
        &mut self,
        expr: &Node,
        entry: &mut Option<OpenEntry<B>>,
    ) -> CodegenResult<()> {
        let function = match entry.as_mut() {
            Some(open) => {
                // a definition since the last expression moved the builder
                self.backend.position_at_end(open.block);
                open.function
            }
            None => {
                tracing::debug!(function = ENTRY_NAME, "generating entry function");
                let function = self.backend.add_function(ENTRY_NAME, &[]);
                let block = self.backend.append_block(function, "entry");
                self.backend.position_at_end(block);
                function
            }
        };

        let generated = self
            .codegen_expr(expr, &Scope::new())
            .and_then(|value| Ok((value, self.current_block()?)));
        match generated {
            Ok((value, block)) => {
                *entry = Some(OpenEntry {
                    function,
                    block,
                    value,
                });
                Ok(())
            }
            Err(err) => {
                if entry.is_none() {
                    self.backend.delete_function(function);
                }
                Err(err)
            }
        }
    }

    fn codegen_expr(&mut self, expr: &Node, scope: &Scope<B::Value>) -> CodegenResult<B::Value> {
        match expr {
            Node::Number(value) => Ok(self.backend.const_float(*value)),
            Node::Variable { name, line } => {
                scope
                    .lookup(name)
                    .ok_or_else(|| CodegenError::UnboundName {
                        name: name.clone(),
                        line: *line,
                    })
            }
            Node::Binary(op, left, right) => {
                let lhs = self.codegen_expr(left, scope)?;
                let rhs = self.codegen_expr(right, scope)?;

                let arithmetic = match op {
                    Operator::Add => ArithmeticOp::Add,
                    Operator::Sub => ArithmeticOp::Sub,
                    Operator::Mul => ArithmeticOp::Mul,
                    Operator::Div => ArithmeticOp::Div,
                    Operator::Less => {
                        let cond = self.backend.build_less_than(lhs, rhs)?;
                        return Ok(self.backend.build_condition_to_float(cond)?);
                    }
                };
                Ok(self.backend.build_arithmetic(arithmetic, lhs, rhs)?)
            }
            Node::Block(block) => self.codegen_block(block, scope),
            Node::Call { callee, args, line } => {
                let function = self.backend.get_function(callee).ok_or_else(|| {
                    CodegenError::UndefinedFunction {
                        name: callee.clone(),
                        line: *line,
                    }
                })?;

                let expected = self.backend.count_params(function);
                if expected != args.len() {
                    return Err(CodegenError::ArityMismatch {
                        name: callee.clone(),
                        expected,
                        found: args.len(),
                        line: *line,
                    });
                }

                let mut gened_args = Vec::with_capacity(args.len());
                for arg in args {
                    gened_args.push(self.codegen_expr(arg, scope)?);
                }

                Ok(self.backend.build_call(function, &gened_args)?)
            }
            Node::If(if_node) => self.codegen_if(if_node, scope),
            Node::Function(function) => Err(CodegenError::NestedDefinition(
                function.prototype.name.clone(),
            )),
            Node::Prototype(proto) => Err(CodegenError::NestedDefinition(proto.name.clone())),
        }
    }

    fn codegen_block(&mut self, block: &Block, scope: &Scope<B::Value>) -> CodegenResult<B::Value> {
        self.codegen_statements(block.statements.iter(), scope)
    }

    /// Generate statements in order; the last one's value is the result.
    fn codegen_statements<'n>(
        &mut self,
        statements: impl IntoIterator<Item = &'n Node>,
        scope: &Scope<B::Value>,
    ) -> CodegenResult<B::Value> {
        let mut last = None;
        for statement in statements {
            last = Some(self.codegen_expr(statement, scope)?);
        }
        last.ok_or(CodegenError::EmptyBlock)
    }

    fn codegen_if(&mut self, if_node: &If, scope: &Scope<B::Value>) -> CodegenResult<B::Value> {
        let else_ast = if_node.else_block.as_ref().ok_or(CodegenError::MissingElse)?;

        let cond = self.codegen_expr(&if_node.condition, scope)?;
        let cond = self.backend.build_nonzero(cond)?;

        let function = self
            .backend
            .insert_block()
            .and_then(|block| self.backend.block_parent(block))
            .ok_or_else(|| BackendError::new("builder is not positioned inside a function"))?;

        let then_block = self.backend.append_block(function, "then");
        let else_block = self.backend.append_block(function, "else");
        let merge_block = self.backend.append_block(function, "merge");

        self.backend
            .build_conditional_branch(cond, then_block, else_block)?;

        // nested ifs move the builder, so each arm's final block is read back
        self.backend.position_at_end(then_block);
        let then_value = self.codegen_block(&if_node.then_block, scope)?;
        self.backend.build_branch(merge_block)?;
        let then_end = self.current_block()?;

        self.backend.position_at_end(else_block);
        let else_value = self.codegen_block(else_ast, scope)?;
        self.backend.build_branch(merge_block)?;
        let else_end = self.current_block()?;

        self.backend.position_at_end(merge_block);
        Ok(self
            .backend
            .build_phi(&[(then_value, then_end), (else_value, else_end)])?)
    }

    fn current_block(&self) -> CodegenResult<B::Block> {
        self.backend
            .insert_block()
            .ok_or_else(|| BackendError::new("builder lost its insertion block").into())
    }

    /// Declare `proto`, or reuse a matching body-less declaration of the same
    /// name. Returns the function, its parameter scope and whether it already
    /// existed.
    fn compile_proto(
        &mut self,
        proto: &Prototype,
    ) -> CodegenResult<(B::Function, Scope<B::Value>, bool)> {
        let mut seen = HashSet::new();
        for param in &proto.params {
            if !seen.insert(param.as_str()) {
                return Err(CodegenError::DuplicateParameter {
                    function: proto.name.clone(),
                    parameter: param.clone(),
                });
            }
        }

        let (function, existed) = match self.backend.get_function(&proto.name) {
            Some(function) => {
                let existing = self.backend.count_params(function);
                if existing != proto.params.len() {
                    return Err(CodegenError::ArityConflict {
                        name: proto.name.clone(),
                        existing,
                        declared: proto.params.len(),
                    });
                }
                if self.backend.has_body(function) {
                    return Err(CodegenError::BodyConflict(proto.name.clone()));
                }
                (function, true)
            }
            None => (self.backend.add_function(&proto.name, &proto.params), false),
        };

        let mut scope = Scope::new();
        for (index, name) in proto.params.iter().enumerate() {
            let value = self.backend.get_param(function, index).ok_or_else(|| {
                BackendError::new(format!("{} has no parameter {}", proto.name, index))
            })?;
            scope.bind(name, value);
        }

        Ok((function, scope, existed))
    }

    fn compile_fn(&mut self, function: &Function) -> CodegenResult<B::Function> {
        let Function { prototype, body } = function;
        self.define(prototype, |codegen, scope| codegen.codegen_expr(body, scope))
    }

    /// Give `proto` a body produced by `body`, returning its value. A failed
    /// definition leaves the module as it was before: new functions are
    /// deleted, completed declarations lose their body again.
    fn define<F>(&mut self, proto: &Prototype, body: F) -> CodegenResult<B::Function>
    where
        F: FnOnce(&mut Self, &Scope<B::Value>) -> CodegenResult<B::Value>,
    {
        let (function, scope, existed) = self.compile_proto(proto)?;
        tracing::debug!(
            function = %proto.name,
            params = proto.params.len(),
            forward_declared = existed,
            "generating function"
        );

        let entry = self.backend.append_block(function, "entry");
        self.backend.position_at_end(entry);

        let result =
            body(self, &scope).and_then(|value| self.finish(function, &proto.name, value));

        match result {
            Ok(()) => Ok(function),
            Err(err) => {
                if existed {
                    self.backend.delete_function_body(function);
                } else {
                    self.backend.delete_function(function);
                }
                Err(err)
            }
        }
    }

    /// Return `value` from the current block and verify `function`.
    fn finish(&mut self, function: B::Function, name: &str, value: B::Value) -> CodegenResult<()> {
        self.backend.build_return(value)?;
        self.backend.verify_function(function).map_err(|err| {
            tracing::warn!(function = %name, error = %err, "function failed verification");
            CodegenError::VerificationFailed {
                name: name.to_string(),
                reason: err.0,
            }
        })
    }
}

fn is_definition(node: &Node) -> bool {
    matches!(node, Node::Function(_) | Node::Prototype(_))
}
