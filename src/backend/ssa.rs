//! A small SSA intermediate representation: functions made of basic blocks,
//! every instruction defining at most one value, control-flow joins through
//! phi nodes.

use std::collections::HashMap;
use std::fmt;

use super::{ArithmeticOp, Backend, BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(usize);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub usize);

/// A block together with the function it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub function: FuncId,
    pub block: BlockId,
}

/// Operands are scoped to the function they are used in: `Param` and `Inst`
/// index into that function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Const(f64),
    Param(usize),
    Inst(InstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Double,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// ordered less-than
    Olt,
    /// ordered not-equal
    One,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Arithmetic {
        op: ArithmeticOp,
        lhs: Value,
        rhs: Value,
    },
    Compare {
        pred: Predicate,
        lhs: Value,
        rhs: Value,
    },
    ToFloat(Value),
    Call {
        callee: FuncId,
        args: Vec<Value>,
    },
    Phi(Vec<(Value, BlockId)>),
    Br(BlockId),
    CondBr {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Value),
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret(_)
        )
    }

    /// Type of the defined value, `None` for terminators.
    pub fn result_type(&self) -> Option<Type> {
        match self {
            InstKind::Compare { .. } => Some(Type::Bool),
            InstKind::Arithmetic { .. }
            | InstKind::ToFloat(_)
            | InstKind::Call { .. }
            | InstKind::Phi(_) => Some(Type::Double),
            InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret(_) => None,
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br(target) => vec![*target],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub name: String,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub label: String,
    pub insts: Vec<InstId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub insts: Vec<Instruction>,
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn inst(&self, id: InstId) -> Option<&Instruction> {
        self.insts.get(id.0)
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.blocks
            .get(block.0)
            .and_then(|b| b.insts.last())
            .and_then(|&last| self.inst(last))
            .map(|inst| inst.kind.successors())
            .unwrap_or_default()
    }

    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        (0..self.blocks.len())
            .map(BlockId)
            .flat_map(|from| {
                self.successors(from)
                    .into_iter()
                    .filter(move |&to| to == block)
                    .map(move |_| from)
            })
            .collect()
    }

    fn value_type(&self, value: Value) -> Option<Type> {
        match value {
            Value::Const(_) => Some(Type::Double),
            Value::Param(index) if index < self.params.len() => Some(Type::Double),
            Value::Param(_) => None,
            Value::Inst(id) => self.inst(id).and_then(|inst| inst.kind.result_type()),
        }
    }

    fn block_label(&self, block: BlockId) -> String {
        match self.blocks.get(block.0) {
            Some(b) if block.0 == 0 => b.label.clone(),
            Some(b) => format!("{}{}", b.label, block.0),
            None => format!("<bad block {}>", block.0),
        }
    }

    fn value_name(&self, value: Value) -> String {
        match value {
            Value::Const(v) => format!("{:?}", v),
            Value::Param(index) => match self.params.get(index) {
                Some(name) => format!("%{}", name),
                None => format!("%arg{}", index),
            },
            Value::Inst(id) => match self.inst(id) {
                Some(inst) => format!("%{}{}", inst.name, id.0),
                None => format!("%<bad {}>", id.0),
            },
        }
    }

    fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("double %{}", p))
            .collect();
        format!("double @{}({})", self.name, params.join(", "))
    }
}

/// Checks run over one function body. Errors are human readable reasons.
struct Verifier<'a> {
    module: &'a Module,
    function: &'a Function,
    location: HashMap<InstId, (BlockId, usize)>,
    reachable: Vec<bool>,
    dominators: Vec<Vec<bool>>,
}

impl<'a> Verifier<'a> {
    fn run(module: &'a Module, function: &'a Function) -> Result<(), String> {
        if function.is_declaration() {
            return Ok(());
        }
        let location = Self::check_layout(function)?;
        let (reachable, dominators) = Self::dominators(function);
        let verifier = Verifier {
            module,
            function,
            location,
            reachable,
            dominators,
        };
        verifier.check_operands()
    }

    fn check_layout(function: &Function) -> Result<HashMap<InstId, (BlockId, usize)>, String> {
        let mut location = HashMap::new();
        for (b, block) in function.blocks.iter().enumerate() {
            let label = function.block_label(BlockId(b));
            if block.insts.is_empty() {
                return Err(format!("block '{}' has no terminator", label));
            }
            let mut seen_non_phi = false;
            for (pos, &id) in block.insts.iter().enumerate() {
                let inst = function
                    .inst(id)
                    .ok_or_else(|| format!("block '{}' lists unknown instruction {}", label, id.0))?;
                if location.insert(id, (BlockId(b), pos)).is_some() {
                    return Err(format!("instruction {} is placed twice", id.0));
                }
                let last = pos + 1 == block.insts.len();
                if inst.kind.is_terminator() && !last {
                    return Err(format!("terminator in the middle of block '{}'", label));
                }
                if !inst.kind.is_terminator() && last {
                    return Err(format!("block '{}' does not end in a terminator", label));
                }
                match inst.kind {
                    InstKind::Phi(_) if seen_non_phi => {
                        return Err(format!("phi after other instructions in '{}'", label))
                    }
                    InstKind::Phi(_) => {}
                    _ => seen_non_phi = true,
                }
                for target in inst.kind.successors() {
                    if target.0 >= function.blocks.len() {
                        return Err(format!("branch from '{}' to a missing block", label));
                    }
                }
            }
        }
        Ok(location)
    }

    fn dominators(function: &Function) -> (Vec<bool>, Vec<Vec<bool>>) {
        let n = function.blocks.len();
        let mut reachable = vec![false; n];
        let mut stack = vec![BlockId(0)];
        while let Some(block) = stack.pop() {
            if reachable[block.0] {
                continue;
            }
            reachable[block.0] = true;
            stack.extend(function.successors(block));
        }

        let predecessors: Vec<Vec<BlockId>> = (0..n)
            .map(|b| function.predecessors(BlockId(b)))
            .collect();
        let mut dominators: Vec<Vec<bool>> = (0..n)
            .map(|b| (0..n).map(|d| b != 0 || d == 0).collect())
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for b in 1..n {
                if !reachable[b] {
                    continue;
                }
                let mut next = vec![true; n];
                for pred in predecessors[b].iter().filter(|p| reachable[p.0]) {
                    for (d, slot) in next.iter_mut().enumerate() {
                        *slot = *slot && dominators[pred.0][d];
                    }
                }
                next[b] = true;
                if next != dominators[b] {
                    dominators[b] = next;
                    changed = true;
                }
            }
        }
        (reachable, dominators)
    }

    fn check_operands(&self) -> Result<(), String> {
        for (b, block) in self.function.blocks.iter().enumerate() {
            let block_id = BlockId(b);
            if !self.reachable[b] {
                continue;
            }
            for (pos, &id) in block.insts.iter().enumerate() {
                let inst = &self.function.insts[id.0];
                match &inst.kind {
                    InstKind::Arithmetic { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                        self.use_value(*lhs, Type::Double, block_id, pos)?;
                        self.use_value(*rhs, Type::Double, block_id, pos)?;
                    }
                    InstKind::ToFloat(value) => self.use_value(*value, Type::Bool, block_id, pos)?,
                    InstKind::Call { callee, args } => {
                        let target = self
                            .module
                            .function(*callee)
                            .ok_or_else(|| format!("call to deleted function {}", callee))?;
                        if target.params.len() != args.len() {
                            return Err(format!(
                                "call to @{} passes {} arguments, expected {}",
                                target.name,
                                args.len(),
                                target.params.len()
                            ));
                        }
                        for arg in args {
                            self.use_value(*arg, Type::Double, block_id, pos)?;
                        }
                    }
                    InstKind::Phi(incoming) => {
                        let mut expected = self.function.predecessors(block_id);
                        let mut found: Vec<BlockId> = incoming.iter().map(|(_, from)| *from).collect();
                        expected.sort();
                        found.sort();
                        if expected != found {
                            return Err(format!(
                                "phi in '{}' does not match its predecessors",
                                self.function.block_label(block_id)
                            ));
                        }
                        for (value, from) in incoming {
                            self.use_value(*value, Type::Double, *from, usize::MAX)?;
                        }
                    }
                    InstKind::Br(_) => {}
                    InstKind::CondBr { cond, .. } => {
                        self.use_value(*cond, Type::Bool, block_id, pos)?
                    }
                    InstKind::Ret(value) => self.use_value(*value, Type::Double, block_id, pos)?,
                }
            }
        }
        Ok(())
    }

    /// `value` must have type `want` and be defined before position `pos` of
    /// `block` (`usize::MAX` meaning the end of the block).
    fn use_value(&self, value: Value, want: Type, block: BlockId, pos: usize) -> Result<(), String> {
        let name = self.function.value_name(value);
        match self.function.value_type(value) {
            Some(ty) if ty == want => {}
            Some(ty) => return Err(format!("{} has type {:?}, expected {:?}", name, ty, want)),
            None => return Err(format!("{} is not a value", name)),
        }
        if let Value::Inst(id) = value {
            let (def_block, def_pos) = self
                .location
                .get(&id)
                .copied()
                .ok_or_else(|| format!("{} is not placed in any block", name))?;
            let dominates = if def_block == block {
                def_pos < pos
            } else {
                self.reachable[def_block.0] && self.dominators[block.0][def_block.0]
            };
            if !dominates {
                return Err(format!("{} does not dominate all its uses", name));
            }
        }
        Ok(())
    }
}

/// A module plus its instruction builder.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    functions: Vec<Option<Function>>,
    by_name: HashMap<String, FuncId>,
    cursor: Option<BlockRef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            by_name: HashMap::new(),
            cursor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0).and_then(Option::as_ref)
    }

    pub fn function_id(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (FuncId(i), f)))
    }

    pub fn verify(&self) -> BackendResult<()> {
        for (id, _) in self.functions() {
            self.verify_function(id)?;
        }
        Ok(())
    }

    fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.0).and_then(Option::as_mut)
    }

    fn push(&mut self, name: &str, kind: InstKind) -> BackendResult<InstId> {
        let cursor = self
            .cursor
            .ok_or_else(|| BackendError::new("builder is not positioned at a block"))?;
        let function = self
            .function_mut(cursor.function)
            .ok_or_else(|| BackendError::new("builder is positioned in a deleted function"))?;
        if cursor.block.0 >= function.blocks.len() {
            return Err(BackendError::new("builder is positioned at a deleted block"));
        }
        let id = InstId(function.insts.len());
        function.insts.push(Instruction {
            name: name.to_string(),
            kind,
        });
        function.blocks[cursor.block.0].insts.push(id);
        Ok(id)
    }

    fn push_value(&mut self, name: &str, kind: InstKind) -> BackendResult<Value> {
        self.push(name, kind).map(Value::Inst)
    }

    fn release_cursor(&mut self, function: FuncId) {
        if self.cursor.map(|c| c.function) == Some(function) {
            self.cursor = None;
        }
    }
}

impl Backend for Module {
    type Value = Value;
    type Condition = Value;
    type Function = FuncId;
    type Block = BlockRef;

    fn const_float(&mut self, value: f64) -> Value {
        Value::Const(value)
    }

    fn build_arithmetic(&mut self, op: ArithmeticOp, lhs: Value, rhs: Value) -> BackendResult<Value> {
        let name = match op {
            ArithmeticOp::Add => "addtmp",
            ArithmeticOp::Sub => "subtmp",
            ArithmeticOp::Mul => "multmp",
            ArithmeticOp::Div => "divtmp",
        };
        self.push_value(name, InstKind::Arithmetic { op, lhs, rhs })
    }

    fn build_less_than(&mut self, lhs: Value, rhs: Value) -> BackendResult<Value> {
        self.push_value(
            "cmptmp",
            InstKind::Compare {
                pred: Predicate::Olt,
                lhs,
                rhs,
            },
        )
    }

    fn build_nonzero(&mut self, value: Value) -> BackendResult<Value> {
        self.push_value(
            "ifcond",
            InstKind::Compare {
                pred: Predicate::One,
                lhs: value,
                rhs: Value::Const(0.0),
            },
        )
    }

    fn build_condition_to_float(&mut self, cond: Value) -> BackendResult<Value> {
        self.push_value("booltmp", InstKind::ToFloat(cond))
    }

    fn get_function(&self, name: &str) -> Option<FuncId> {
        self.function_id(name)
    }

    fn add_function(&mut self, name: &str, params: &[String]) -> FuncId {
        let id = FuncId(self.functions.len());
        self.functions.push(Some(Function {
            name: name.to_string(),
            params: params.to_vec(),
            insts: Vec::new(),
            blocks: Vec::new(),
        }));
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn count_params(&self, function: FuncId) -> usize {
        self.function(function).map_or(0, |f| f.params.len())
    }

    fn has_body(&self, function: FuncId) -> bool {
        self.function(function).map_or(false, |f| !f.is_declaration())
    }

    fn get_param(&self, function: FuncId, index: usize) -> Option<Value> {
        self.function(function)
            .filter(|f| index < f.params.len())
            .map(|_| Value::Param(index))
    }

    fn append_block(&mut self, function: FuncId, label: &str) -> BlockRef {
        let block = match self.function_mut(function) {
            Some(f) => {
                f.blocks.push(BasicBlock {
                    label: label.to_string(),
                    insts: Vec::new(),
                });
                BlockId(f.blocks.len() - 1)
            }
            None => BlockId(usize::MAX),
        };
        BlockRef { function, block }
    }

    fn position_at_end(&mut self, block: BlockRef) {
        self.cursor = Some(block);
    }

    fn insert_block(&self) -> Option<BlockRef> {
        self.cursor
    }

    fn block_parent(&self, block: BlockRef) -> Option<FuncId> {
        self.function(block.function).map(|_| block.function)
    }

    fn build_conditional_branch(
        &mut self,
        cond: Value,
        then_block: BlockRef,
        else_block: BlockRef,
    ) -> BackendResult<()> {
        self.push(
            "",
            InstKind::CondBr {
                cond,
                then_block: then_block.block,
                else_block: else_block.block,
            },
        )
        .map(|_| ())
    }

    fn build_branch(&mut self, block: BlockRef) -> BackendResult<()> {
        self.push("", InstKind::Br(block.block)).map(|_| ())
    }

    fn build_phi(&mut self, incoming: &[(Value, BlockRef)]) -> BackendResult<Value> {
        let incoming = incoming.iter().map(|(v, b)| (*v, b.block)).collect();
        self.push_value("iftmp", InstKind::Phi(incoming))
    }

    fn build_return(&mut self, value: Value) -> BackendResult<()> {
        self.push("", InstKind::Ret(value)).map(|_| ())
    }

    fn build_call(&mut self, function: FuncId, args: &[Value]) -> BackendResult<Value> {
        if self.function(function).is_none() {
            return Err(BackendError::new(format!("call to deleted function {}", function)));
        }
        self.push_value(
            "calltmp",
            InstKind::Call {
                callee: function,
                args: args.to_vec(),
            },
        )
    }

    fn verify_function(&self, function: FuncId) -> BackendResult<()> {
        let f = self
            .function(function)
            .ok_or_else(|| BackendError::new(format!("unknown function {}", function)))?;
        Verifier::run(self, f).map_err(|reason| BackendError::new(format!("@{}: {}", f.name, reason)))
    }

    fn delete_function(&mut self, function: FuncId) {
        if let Some(slot) = self.functions.get_mut(function.0) {
            if let Some(removed) = slot.take() {
                if self.by_name.get(&removed.name) == Some(&function) {
                    self.by_name.remove(&removed.name);
                }
            }
        }
        self.release_cursor(function);
    }

    fn delete_function_body(&mut self, function: FuncId) {
        if let Some(f) = self.function_mut(function) {
            f.blocks.clear();
            f.insts.clear();
        }
        self.release_cursor(function);
    }
}

/// Prints one function; needs the module to name call targets.
struct FunctionPrinter<'a> {
    module: &'a Module,
    function: &'a Function,
}

impl FunctionPrinter<'_> {
    fn callee_name(&self, callee: FuncId) -> String {
        self.module
            .function(callee)
            .map_or_else(|| callee.to_string(), |f| f.name.clone())
    }

    fn instruction(&self, kind: &InstKind) -> String {
        let function = self.function;
        let v = |value: &Value| function.value_name(*value);
        let l = |block: &BlockId| function.block_label(*block);
        match kind {
            InstKind::Arithmetic { op, lhs, rhs } => {
                format!("{} double {}, {}", op.mnemonic(), v(lhs), v(rhs))
            }
            InstKind::Compare { pred, lhs, rhs } => {
                let pred = match pred {
                    Predicate::Olt => "olt",
                    Predicate::One => "one",
                };
                format!("fcmp {} double {}, {}", pred, v(lhs), v(rhs))
            }
            InstKind::ToFloat(value) => format!("uitofp i1 {} to double", v(value)),
            InstKind::Call { callee, args } => {
                let args: Vec<String> = args.iter().map(|a| format!("double {}", v(a))).collect();
                format!("call double @{}({})", self.callee_name(*callee), args.join(", "))
            }
            InstKind::Phi(incoming) => {
                let incoming: Vec<String> = incoming
                    .iter()
                    .map(|(value, from)| format!("[ {}, %{} ]", v(value), l(from)))
                    .collect();
                format!("phi double {}", incoming.join(", "))
            }
            InstKind::Br(target) => format!("br label %{}", l(target)),
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => format!(
                "br i1 {}, label %{}, label %{}",
                v(cond),
                l(then_block),
                l(else_block)
            ),
            InstKind::Ret(value) => format!("ret double {}", v(value)),
        }
    }
}

impl fmt::Display for FunctionPrinter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function = self.function;
        if function.is_declaration() {
            return writeln!(f, "declare {}", function.signature());
        }
        writeln!(f, "define {} {{", function.signature())?;
        for (b, block) in function.blocks.iter().enumerate() {
            if b > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", function.block_label(BlockId(b)))?;
            for &id in &block.insts {
                let inst = &function.insts[id.0];
                let text = self.instruction(&inst.kind);
                if inst.kind.is_terminator() {
                    writeln!(f, "  {}", text)?;
                } else {
                    writeln!(f, "  {} = {}", function.value_name(Value::Inst(id)), text)?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        for (_, function) in self.functions() {
            writeln!(f)?;
            write!(
                f,
                "{}",
                FunctionPrinter {
                    module: self,
                    function
                }
            )?;
        }
        Ok(())
    }
}
