//! Direct evaluation of [`ssa::Module`](super::ssa::Module) functions.

use super::ssa::{BlockId, FuncId, Function, InstKind, Module, Predicate, Value};

pub const DEFAULT_MAX_DEPTH: usize = 256;

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("function {0} is declared but never defined")]
    MissingBody(String),
    #[error("function {name} takes {expected} arguments, got {found}")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("malformed function {function}: {reason}")]
    Malformed { function: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Double(f64),
    Bool(bool),
}

pub struct Interpreter<'m> {
    module: &'m Module,
    max_depth: usize,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn call(&self, name: &str, args: &[f64]) -> Result<f64, EvalError> {
        let id = self
            .module
            .function_id(name)
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
        self.call_id(id, args)
    }

    pub fn call_id(&self, id: FuncId, args: &[f64]) -> Result<f64, EvalError> {
        self.run(id, args, 0)
    }

    fn run(&self, id: FuncId, args: &[f64], depth: usize) -> Result<f64, EvalError> {
        if depth >= self.max_depth {
            return Err(EvalError::StackOverflow(self.max_depth));
        }
        let function = self
            .module
            .function(id)
            .ok_or_else(|| EvalError::UnknownFunction(id.to_string()))?;
        if function.is_declaration() {
            return Err(EvalError::MissingBody(function.name.clone()));
        }
        if function.params.len() != args.len() {
            return Err(EvalError::ArgumentCount {
                name: function.name.clone(),
                expected: function.params.len(),
                found: args.len(),
            });
        }

        let mut frame = Frame {
            function,
            args,
            values: vec![None; function.insts.len()],
        };
        let mut block = BlockId(0);
        let mut previous: Option<BlockId> = None;

        'blocks: loop {
            let body = &function
                .blocks
                .get(block.0)
                .ok_or_else(|| frame.malformed("branch to a missing block"))?
                .insts;

            // phis read their inputs before any of them is written
            let mut start = 0;
            let mut merged = Vec::new();
            while let Some(&id) = body.get(start) {
                let incoming = match &function.insts[id.0].kind {
                    InstKind::Phi(incoming) => incoming,
                    _ => break,
                };
                let from = previous.ok_or_else(|| frame.malformed("phi in the entry block"))?;
                let (value, _) = incoming
                    .iter()
                    .find(|(_, pred)| *pred == from)
                    .ok_or_else(|| frame.malformed("phi has no value for its predecessor"))?;
                merged.push((id, frame.read(*value)?));
                start += 1;
            }
            for (id, scalar) in merged {
                frame.values[id.0] = Some(scalar);
            }

            for &id in &body[start..] {
                let result = match &function.insts[id.0].kind {
                    InstKind::Arithmetic { op, lhs, rhs } => {
                        Scalar::Double(op.apply(frame.double(*lhs)?, frame.double(*rhs)?))
                    }
                    InstKind::Compare { pred, lhs, rhs } => {
                        let (lhs, rhs) = (frame.double(*lhs)?, frame.double(*rhs)?);
                        let ordered = !lhs.is_nan() && !rhs.is_nan();
                        Scalar::Bool(match pred {
                            Predicate::Olt => ordered && lhs < rhs,
                            Predicate::One => ordered && lhs != rhs,
                        })
                    }
                    InstKind::ToFloat(value) => {
                        Scalar::Double(if frame.boolean(*value)? { 1.0 } else { 0.0 })
                    }
                    InstKind::Call { callee, args } => {
                        let args = args
                            .iter()
                            .map(|arg| frame.double(*arg))
                            .collect::<Result<Vec<f64>, EvalError>>()?;
                        Scalar::Double(self.run(*callee, &args, depth + 1)?)
                    }
                    InstKind::Phi(_) => return Err(frame.malformed("phi after other instructions")),
                    InstKind::Br(target) => {
                        previous = Some(block);
                        block = *target;
                        continue 'blocks;
                    }
                    InstKind::CondBr {
                        cond,
                        then_block,
                        else_block,
                    } => {
                        previous = Some(block);
                        block = if frame.boolean(*cond)? {
                            *then_block
                        } else {
                            *else_block
                        };
                        continue 'blocks;
                    }
                    InstKind::Ret(value) => return frame.double(*value),
                };
                frame.values[id.0] = Some(result);
            }

            return Err(frame.malformed("block falls through without a terminator"));
        }
    }
}

/// Values computed so far by one activation.
struct Frame<'a> {
    function: &'a Function,
    args: &'a [f64],
    values: Vec<Option<Scalar>>,
}

impl Frame<'_> {
    fn read(&self, value: Value) -> Result<Scalar, EvalError> {
        match value {
            Value::Const(v) => Ok(Scalar::Double(v)),
            Value::Param(index) => self
                .args
                .get(index)
                .map(|v| Scalar::Double(*v))
                .ok_or_else(|| self.malformed("parameter out of range")),
            Value::Inst(id) => self
                .values
                .get(id.0)
                .copied()
                .flatten()
                .ok_or_else(|| self.malformed("use of a value before its definition")),
        }
    }

    fn double(&self, value: Value) -> Result<f64, EvalError> {
        match self.read(value)? {
            Scalar::Double(v) => Ok(v),
            Scalar::Bool(_) => Err(self.malformed("expected a double, found a condition")),
        }
    }

    fn boolean(&self, value: Value) -> Result<bool, EvalError> {
        match self.read(value)? {
            Scalar::Bool(b) => Ok(b),
            Scalar::Double(_) => Err(self.malformed("expected a condition, found a double")),
        }
    }

    fn malformed(&self, reason: &str) -> EvalError {
        EvalError::Malformed {
            function: self.function.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Module {
    /// Evaluate `name` with the default call-depth limit.
    pub fn run(&self, name: &str, args: &[f64]) -> Result<f64, EvalError> {
        Interpreter::new(self).call(name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArithmeticOp, Backend};
    use pretty_assertions::assert_eq;

    /// `def max(a, b) { if (a < b) { b } else { a } }` built by hand.
    fn max_module() -> Module {
        let mut module = Module::new("test");
        let params = vec!["a".to_string(), "b".to_string()];
        let max = module.add_function("max", &params);
        let entry = module.append_block(max, "entry");
        let then_bb = module.append_block(max, "then");
        let else_bb = module.append_block(max, "else");
        let merge = module.append_block(max, "merge");

        module.position_at_end(entry);
        let a = module.get_param(max, 0).unwrap();
        let b = module.get_param(max, 1).unwrap();
        let cond = module.build_less_than(a, b).unwrap();
        module.build_conditional_branch(cond, then_bb, else_bb).unwrap();
        module.position_at_end(then_bb);
        module.build_branch(merge).unwrap();
        module.position_at_end(else_bb);
        module.build_branch(merge).unwrap();
        module.position_at_end(merge);
        let value = module.build_phi(&[(b, then_bb), (a, else_bb)]).unwrap();
        module.build_return(value).unwrap();
        module
    }

    #[test]
    fn evaluates_branches_and_phis() {
        let module = max_module();
        module.verify().unwrap();
        assert_eq!(module.run("max", &[1.0, 2.0]), Ok(2.0));
        assert_eq!(module.run("max", &[5.0, -2.0]), Ok(5.0));
    }

    #[test]
    fn checks_arguments() {
        let module = max_module();
        assert_eq!(
            module.run("max", &[1.0]),
            Err(EvalError::ArgumentCount {
                name: "max".to_string(),
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            module.run("min", &[]),
            Err(EvalError::UnknownFunction("min".to_string()))
        );
    }

    #[test]
    fn declarations_cannot_run() {
        let mut module = Module::new("test");
        module.add_function("sin", &["x".to_string()]);
        assert_eq!(
            module.run("sin", &[0.0]),
            Err(EvalError::MissingBody("sin".to_string()))
        );
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let mut module = Module::new("test");
        let forever = module.add_function("forever", &[]);
        let entry = module.append_block(forever, "entry");
        module.position_at_end(entry);
        let value = module.build_call(forever, &[]).unwrap();
        let one = module.const_float(1.0);
        let sum = module.build_arithmetic(ArithmeticOp::Add, value, one).unwrap();
        module.build_return(sum).unwrap();

        let interpreter = Interpreter::new(&module).with_max_depth(16);
        assert_eq!(interpreter.call("forever", &[]), Err(EvalError::StackOverflow(16)));
    }
}
