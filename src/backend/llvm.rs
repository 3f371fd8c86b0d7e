//! inkwell implementation of [`Backend`], used for JIT evaluation and object
//! file emission.

use std::path::Path;

use inkwell::{
    basic_block::BasicBlock,
    builder::{Builder, BuilderError},
    context::Context,
    execution_engine::JitFunction,
    module::{Linkage, Module},
    targets::{
        CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine,
    },
    types::BasicMetadataTypeEnum,
    values::{BasicMetadataValueEnum, BasicValue, FloatValue, FunctionValue, IntValue},
    FloatPredicate, OptimizationLevel,
};

use super::{ArithmeticOp, Backend, BackendError, BackendResult};

type EntryFunc = unsafe extern "C" fn() -> f64;

impl From<BuilderError> for BackendError {
    fn from(err: BuilderError) -> Self {
        BackendError::new(err.to_string())
    }
}

pub struct LlvmBackend<'ctx> {
    pub context: &'ctx Context,
    pub module: Module<'ctx>,
    pub builder: Builder<'ctx>,
}

impl<'ctx> LlvmBackend<'ctx> {
    pub fn new(context: &'ctx Context, name: &str) -> Self {
        LlvmBackend {
            context,
            module: context.create_module(name),
            builder: context.create_builder(),
        }
    }

    pub fn print_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// JIT the module and call the zero-argument function `name`.
    pub fn jit_eval(&self, name: &str) -> BackendResult<f64> {
        Target::initialize_native(&InitializationConfig::default())
            .map_err(BackendError::new)?;
        let ee = self
            .module
            .create_jit_execution_engine(OptimizationLevel::None)
            .map_err(|e| BackendError::new(e.to_string()))?;
        let entry: JitFunction<EntryFunc> = unsafe { ee.get_function(name) }
            .map_err(|e| BackendError::new(format!("{:?}", e)))?;
        Ok(unsafe { entry.call() })
    }

    /// Verify the module and write a native object file for the host.
    pub fn write_object(&self, path: &Path) -> BackendResult<()> {
        self.module
            .verify()
            .map_err(|e| BackendError::new(e.to_string()))?;
        Target::initialize_native(&InitializationConfig::default())
            .map_err(BackendError::new)?;
        let triple = TargetMachine::get_default_triple();
        let target =
            Target::from_triple(&triple).map_err(|e| BackendError::new(e.to_string()))?;
        let machine = target
            .create_target_machine(
                &triple,
                "generic",
                "",
                OptimizationLevel::None,
                RelocMode::Default,
                CodeModel::Default,
            )
            .ok_or_else(|| BackendError::new("could not create target machine"))?;
        self.module.set_triple(&triple);
        machine
            .write_to_file(&self.module, FileType::Object, path)
            .map_err(|e| BackendError::new(e.to_string()))
    }
}

impl<'ctx> LlvmBackend<'ctx> {
    /// Unposition the builder if it points into `function`.
    fn release_builder(&self, function: FunctionValue<'ctx>) {
        let inside = self
            .builder
            .get_insert_block()
            .and_then(|block| block.get_parent())
            == Some(function);
        if inside {
            self.builder.clear_insertion_position();
        }
    }
}

impl<'ctx> Backend for LlvmBackend<'ctx> {
    type Value = FloatValue<'ctx>;
    type Condition = IntValue<'ctx>;
    type Function = FunctionValue<'ctx>;
    type Block = BasicBlock<'ctx>;

    fn const_float(&mut self, value: f64) -> Self::Value {
        self.context.f64_type().const_float(value)
    }

    fn build_arithmetic(
        &mut self,
        op: ArithmeticOp,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> BackendResult<Self::Value> {
        let value = match op {
            ArithmeticOp::Add => self.builder.build_float_add(lhs, rhs, "addtmp"),
            ArithmeticOp::Sub => self.builder.build_float_sub(lhs, rhs, "subtmp"),
            ArithmeticOp::Mul => self.builder.build_float_mul(lhs, rhs, "multmp"),
            ArithmeticOp::Div => self.builder.build_float_div(lhs, rhs, "divtmp"),
        }?;
        Ok(value)
    }

    fn build_less_than(
        &mut self,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> BackendResult<Self::Condition> {
        Ok(self
            .builder
            .build_float_compare(FloatPredicate::OLT, lhs, rhs, "cmptmp")?)
    }

    fn build_nonzero(&mut self, value: Self::Value) -> BackendResult<Self::Condition> {
        let zero = self.context.f64_type().const_float(0.0);
        Ok(self
            .builder
            .build_float_compare(FloatPredicate::ONE, value, zero, "ifcond")?)
    }

    fn build_condition_to_float(&mut self, cond: Self::Condition) -> BackendResult<Self::Value> {
        Ok(self
            .builder
            .build_unsigned_int_to_float(cond, self.context.f64_type(), "booltmp")?)
    }

    fn get_function(&self, name: &str) -> Option<Self::Function> {
        self.module.get_function(name)
    }

    fn add_function(&mut self, name: &str, params: &[String]) -> Self::Function {
        let f64_type = self.context.f64_type();
        let param_types: Vec<BasicMetadataTypeEnum> =
            params.iter().map(|_| f64_type.into()).collect();
        let fn_type = f64_type.fn_type(&param_types, false);
        let function = self
            .module
            .add_function(name, fn_type, Some(Linkage::External));

        for (param, param_name) in function.get_param_iter().zip(params) {
            param.into_float_value().set_name(param_name);
        }

        function
    }

    fn count_params(&self, function: Self::Function) -> usize {
        function.count_params() as usize
    }

    fn has_body(&self, function: Self::Function) -> bool {
        function.count_basic_blocks() > 0
    }

    fn get_param(&self, function: Self::Function, index: usize) -> Option<Self::Value> {
        function
            .get_nth_param(index as u32)
            .map(|param| param.into_float_value())
    }

    fn append_block(&mut self, function: Self::Function, label: &str) -> Self::Block {
        self.context.append_basic_block(function, label)
    }

    fn position_at_end(&mut self, block: Self::Block) {
        self.builder.position_at_end(block);
    }

    fn insert_block(&self) -> Option<Self::Block> {
        self.builder.get_insert_block()
    }

    fn block_parent(&self, block: Self::Block) -> Option<Self::Function> {
        block.get_parent()
    }

    fn build_conditional_branch(
        &mut self,
        cond: Self::Condition,
        then_block: Self::Block,
        else_block: Self::Block,
    ) -> BackendResult<()> {
        self.builder
            .build_conditional_branch(cond, then_block, else_block)?;
        Ok(())
    }

    fn build_branch(&mut self, block: Self::Block) -> BackendResult<()> {
        self.builder.build_unconditional_branch(block)?;
        Ok(())
    }

    fn build_phi(
        &mut self,
        incoming: &[(Self::Value, Self::Block)],
    ) -> BackendResult<Self::Value> {
        let phi = self.builder.build_phi(self.context.f64_type(), "iftmp")?;
        for (value, block) in incoming {
            phi.add_incoming(&[(value as &dyn BasicValue<'ctx>, *block)]);
        }
        Ok(phi.as_basic_value().into_float_value())
    }

    fn build_return(&mut self, value: Self::Value) -> BackendResult<()> {
        self.builder.build_return(Some(&value))?;
        Ok(())
    }

    fn build_call(
        &mut self,
        function: Self::Function,
        args: &[Self::Value],
    ) -> BackendResult<Self::Value> {
        let args: Vec<BasicMetadataValueEnum> = args.iter().map(|&arg| arg.into()).collect();
        self.builder
            .build_call(function, &args, "calltmp")?
            .try_as_basic_value()
            .left()
            .map(|value| value.into_float_value())
            .ok_or_else(|| BackendError::new("call produced no value"))
    }

    fn verify_function(&self, function: Self::Function) -> BackendResult<()> {
        if function.verify(true) {
            Ok(())
        } else {
            Err(BackendError::new("llvm rejected the function"))
        }
    }

    fn delete_function(&mut self, function: Self::Function) {
        self.release_builder(function);
        unsafe {
            function.delete();
        }
    }

    fn delete_function_body(&mut self, function: Self::Function) {
        self.release_builder(function);
        for block in function.get_basic_blocks() {
            if unsafe { block.delete() }.is_err() {
                tracing::warn!(
                    function = %function.get_name().to_string_lossy(),
                    block = %block.get_name().to_string_lossy(),
                    "could not delete basic block"
                );
            }
        }
    }
}
