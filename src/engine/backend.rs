//! JIT Backend Adapter
//!
//! Wraps Cranelift behind the two operations the engine needs: turn unit
//! functions into callable machine code on demand, and resolve the external
//! symbols that code references while it is being linked.
//!
//! # Architecture
//!
//! [`JitBackend`] is created once, on first use, and reused for every unit
//! the engine ever sees. It owns the target ISA and a handle to the shared
//! [`RuntimeContext`]; symbol lookup during finalization is routed through
//! the context's resolver protocol, which is what makes resolution lazy.
//!
//! Each execution attempt gets a fresh [`EmissionUnit`]: a private Cranelift
//! `JITModule` plus the bookkeeping for the functions emitted into it. The
//! arena frees all of its machine code when dropped, on every exit path, so
//! no code survives from one attempt to the next. The price is recompiling
//! an entry point on each call; the benefit is memory that stays bounded
//! over an arbitrarily long interactive session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cranelift::codegen::ir::Signature;
use cranelift::codegen::isa::TargetIsa;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use super::context::{RuntimeContext, SymbolAddr};
use super::emission::EmissionLog;
use super::error::{EngineError, EngineResult};
use crate::unit::{CodeUnit, Expr, FunctionDef, RetKind};

// =============================================================================
// Configuration
// =============================================================================

/// Cranelift optimization level for emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// Fastest compilation, minimal optimization. The default: interactive
    /// submissions are usually run once, so compile latency dominates.
    #[default]
    None,
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    fn as_flag(&self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub opt_level: OptLevel,
}

// =============================================================================
// Backend
// =============================================================================

/// The process's single code-generation backend. Created once, reused for
/// all subsequent units.
pub(crate) struct JitBackend {
    isa: Arc<dyn TargetIsa>,
    context: RuntimeContext,
}

impl JitBackend {
    /// Build the backend for the host architecture. Errors here mean the
    /// host is unsupported or the flags are invalid; callers treat that as
    /// fatal.
    pub fn new(config: &EngineConfig, context: RuntimeContext) -> Result<Self, String> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", config.opt_level.as_flag())
            .map_err(|e| format!("failed to set opt_level: {}", e))?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| format!("failed to set flag: {}", e))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| format!("failed to set flag: {}", e))?;

        let isa_builder =
            cranelift_native::builder().map_err(|msg| format!("host not supported: {}", msg))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| format!("failed to build ISA: {}", e))?;

        Ok(JitBackend { isa, context })
    }

    /// Open a fresh emission arena for one execution attempt. Unresolved
    /// references inside it are routed through the runtime context, with the
    /// arena's per-call overrides consulted first.
    pub fn begin_emission(&self) -> EmissionUnit {
        let mut builder = JITBuilder::with_isa(self.isa.clone(), default_libcall_names());

        let overrides: Arc<Mutex<HashMap<String, SymbolAddr>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let lookup_overrides = overrides.clone();
        let lookup_context = self.context.clone();
        builder.symbol_lookup_fn(Box::new(move |name| {
            if let Some(addr) = lookup_overrides.lock().get(name) {
                return Some(addr.as_ptr());
            }
            Some(lookup_context.resolve_recording(name).as_ptr())
        }));

        let module = JITModule::new(builder);
        let ctx = module.make_context();
        let pointer_type = module.target_config().pointer_type();

        EmissionUnit {
            module: Some(module),
            ctx,
            func_ctx: FunctionBuilderContext::new(),
            pointer_type,
            declared: HashMap::new(),
            defined: HashSet::new(),
            imports: HashMap::new(),
            finalized: HashMap::new(),
            overrides,
        }
    }
}

// =============================================================================
// Emission arena
// =============================================================================

/// One execution attempt's worth of emitted machine code.
///
/// Dropping the arena frees every byte of code it emitted; callers must not
/// hold function pointers obtained from [`EmissionUnit::address_of`] past
/// that point.
pub(crate) struct EmissionUnit {
    /// `None` only transiently during teardown.
    module: Option<JITModule>,
    ctx: cranelift::codegen::Context,
    func_ctx: FunctionBuilderContext,
    pointer_type: Type,

    /// Local functions declared so far (forward declarations included).
    declared: HashMap<String, FuncId>,
    /// Local functions whose bodies have been emitted.
    defined: HashSet<String>,
    /// Imported symbols (external calls and redirected locals).
    imports: HashMap<String, FuncId>,
    /// Machine-code mapping: name to finalized address.
    finalized: HashMap<String, SymbolAddr>,

    /// Per-call resolution overrides, consulted before the runtime context.
    overrides: Arc<Mutex<HashMap<String, SymbolAddr>>>,
}

impl EmissionUnit {
    /// Compile `roots` and everything they transitively call, recording each
    /// emitted function in `log`. Names in `redirects` are not given bodies;
    /// references to them are linked through the symbol-resolution path
    /// instead, so their resolved address can be rewired.
    pub fn compile_reachable(
        &mut self,
        unit: &CodeUnit,
        roots: &[&str],
        log: &mut EmissionLog,
        redirects: &HashSet<String>,
    ) -> EngineResult<()> {
        let mut stack: Vec<String> = roots.iter().map(|s| s.to_string()).collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(name) = stack.pop() {
            if redirects.contains(&name)
                || !visited.insert(name.clone())
                || self.defined.contains(&name)
            {
                continue;
            }
            let def = unit
                .function(&name)
                .ok_or_else(|| EngineError::MissingFunction(name.clone()))?;
            for (callee, _) in def.local_callees() {
                stack.push(callee.to_owned());
            }

            self.define_function(unit, &name, redirects)?;
            self.defined.insert(name.clone());
            log.record(&name);
            trace!(function = name.as_str(), "emitted machine code");
        }

        self.finalize_round()
    }

    /// Finalized address of an emitted function, if still registered. A
    /// rewired name resolves to its override target instead of a body of
    /// its own.
    pub fn address_of(&self, name: &str) -> Option<SymbolAddr> {
        self.finalized
            .get(name)
            .copied()
            .or_else(|| self.overrides.lock().get(name).copied())
    }

    /// Remove the machine-code mapping for `name`. Used during rollback,
    /// in reverse emission order.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.finalized.remove(name).is_some()
    }

    /// Install a per-call resolution override: subsequent lookups of `name`
    /// in this arena yield `addr`.
    pub fn set_override(&mut self, name: &str, addr: SymbolAddr) {
        self.overrides.lock().insert(name.to_owned(), addr);
    }

    fn jit(&mut self) -> &mut JITModule {
        self.module.as_mut().expect("emission arena already freed")
    }

    /// Declare a unit-local function, reusing the id on repeat declarations.
    fn declare_local(&mut self, unit: &CodeUnit, name: &str) -> EngineResult<FuncId> {
        if let Some(id) = self.declared.get(name) {
            return Ok(*id);
        }
        let def = unit
            .function(name)
            .ok_or_else(|| EngineError::MissingFunction(name.to_owned()))?;
        let sig = self.signature_for(def);
        let id = self
            .jit()
            .declare_function(name, Linkage::Export, &sig)
            .map_err(|e| {
                EngineError::Codegen(format!("failed to declare function '{}': {}", name, e))
            })?;
        self.declared.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Declare an imported symbol, reusing the id on repeat declarations.
    fn declare_import(&mut self, name: &str, sig: Signature) -> EngineResult<FuncId> {
        if let Some(id) = self.imports.get(name) {
            return Ok(*id);
        }
        let id = self
            .jit()
            .declare_function(name, Linkage::Import, &sig)
            .map_err(|e| {
                EngineError::Codegen(format!("failed to declare symbol '{}': {}", name, e))
            })?;
        self.imports.insert(name.to_owned(), id);
        Ok(id)
    }

    fn signature_for(&self, def: &FunctionDef) -> Signature {
        let module = self.module.as_ref().expect("emission arena already freed");
        let mut sig = module.make_signature();
        if matches!(def.ret, RetKind::Aggregate { .. }) {
            // Caller-supplied result storage, passed as the leading argument.
            sig.params.push(AbiParam::new(self.pointer_type));
        }
        for _ in 0..def.params {
            sig.params.push(AbiParam::new(types::I64));
        }
        if matches!(def.ret, RetKind::Scalar) {
            sig.returns.push(AbiParam::new(types::I64));
        }
        sig
    }

    /// Signature for an external symbol: `arity` i64 parameters, i64 return.
    fn extern_signature(&self, arity: usize) -> Signature {
        let module = self.module.as_ref().expect("emission arena already freed");
        let mut sig = module.make_signature();
        for _ in 0..arity {
            sig.params.push(AbiParam::new(types::I64));
        }
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }

    fn define_function(
        &mut self,
        unit: &CodeUnit,
        name: &str,
        redirects: &HashSet<String>,
    ) -> EngineResult<()> {
        let def = unit
            .function(name)
            .ok_or_else(|| EngineError::MissingFunction(name.to_owned()))?;
        let func_id = self.declare_local(unit, name)?;

        // Declare everything the body references before borrowing the
        // function builder.
        let mut locals: HashMap<String, FuncId> = HashMap::new();
        let mut imports: HashMap<String, FuncId> = HashMap::new();
        for (callee, _) in def.local_callees() {
            if redirects.contains(callee) {
                let target = unit
                    .function(callee)
                    .ok_or_else(|| EngineError::MissingFunction(callee.to_owned()))?;
                let sig = self.signature_for(target);
                let id = self.declare_import(callee, sig)?;
                imports.insert(callee.to_owned(), id);
            } else {
                let id = self.declare_local(unit, callee)?;
                locals.insert(callee.to_owned(), id);
            }
        }
        for (symbol, arity) in def.extern_refs() {
            let sig = self.extern_signature(arity);
            let id = self.declare_import(symbol, sig)?;
            imports.insert(symbol.to_owned(), id);
        }

        self.ctx.func.signature = self.signature_for(def);

        let module = self.module.as_mut().expect("emission arena already freed");
        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.func_ctx);

        let block = builder.create_block();
        builder.append_block_params_for_function_params(block);
        builder.switch_to_block(block);
        builder.seal_block(block);

        let params: Vec<Value> = builder.block_params(block).to_vec();
        let (sret, args): (Option<Value>, &[Value]) = match def.ret {
            RetKind::Aggregate { .. } => (params.first().copied(), &params[1..]),
            _ => (None, &params[..]),
        };

        let mut values = Vec::with_capacity(def.body.len());
        for expr in &def.body {
            values.push(lower_expr(
                &mut builder,
                module,
                expr,
                args,
                &locals,
                &imports,
            )?);
        }

        match def.ret {
            RetKind::Unit => {
                builder.ins().return_(&[]);
            }
            RetKind::Scalar => {
                let result = *values.last().ok_or_else(|| {
                    EngineError::Codegen(format!("scalar function '{}' has an empty body", name))
                })?;
                builder.ins().return_(&[result]);
            }
            RetKind::Aggregate { fields } => {
                if values.len() != fields {
                    return Err(EngineError::Codegen(format!(
                        "aggregate function '{}' produces {} value(s) for {} field(s)",
                        name,
                        values.len(),
                        fields
                    )));
                }
                let sret = sret.ok_or_else(|| {
                    EngineError::Codegen(format!("aggregate function '{}' lacks result storage", name))
                })?;
                for (i, value) in values.iter().enumerate() {
                    builder
                        .ins()
                        .store(MemFlags::trusted(), *value, sret, (i * 8) as i32);
                }
                builder.ins().return_(&[]);
            }
        }

        builder.finalize();

        module.define_function(func_id, &mut self.ctx).map_err(|e| {
            EngineError::Codegen(format!("failed to define function '{}': {}", name, e))
        })?;
        module.clear_context(&mut self.ctx);
        Ok(())
    }

    /// Finalize all pending definitions and record their addresses in the
    /// machine-code map. Lazy symbol resolution runs here: Cranelift calls
    /// back into the runtime context for every import it must bind.
    fn finalize_round(&mut self) -> EngineResult<()> {
        let module = self.module.as_mut().expect("emission arena already freed");
        module
            .finalize_definitions()
            .map_err(|e| EngineError::Codegen(format!("failed to finalize emitted code: {}", e)))?;

        for (name, id) in &self.declared {
            if self.defined.contains(name) && !self.finalized.contains_key(name) {
                let ptr = module.get_finalized_function(*id);
                self.finalized.insert(name.clone(), SymbolAddr::new(ptr));
            }
        }
        Ok(())
    }
}

impl Drop for EmissionUnit {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // Safety: the engine never lets pointers into this arena outlive
            // the attempt that produced them; by the time the arena drops,
            // no emitted code is executing or reachable.
            unsafe { module.free_memory() };
        }
    }
}

// =============================================================================
// IR lowering
// =============================================================================

fn lower_expr(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    expr: &Expr,
    args: &[Value],
    locals: &HashMap<String, FuncId>,
    imports: &HashMap<String, FuncId>,
) -> EngineResult<Value> {
    match expr {
        Expr::Const(v) => Ok(builder.ins().iconst(types::I64, *v)),
        Expr::Arg(i) => args.get(*i).copied().ok_or_else(|| {
            EngineError::Codegen(format!("argument index {} out of range", i))
        }),
        Expr::Add(lhs, rhs) => {
            let lhs = lower_expr(builder, module, lhs, args, locals, imports)?;
            let rhs = lower_expr(builder, module, rhs, args, locals, imports)?;
            Ok(builder.ins().iadd(lhs, rhs))
        }
        Expr::Sub(lhs, rhs) => {
            let lhs = lower_expr(builder, module, lhs, args, locals, imports)?;
            let rhs = lower_expr(builder, module, rhs, args, locals, imports)?;
            Ok(builder.ins().isub(lhs, rhs))
        }
        Expr::Mul(lhs, rhs) => {
            let lhs = lower_expr(builder, module, lhs, args, locals, imports)?;
            let rhs = lower_expr(builder, module, rhs, args, locals, imports)?;
            Ok(builder.ins().imul(lhs, rhs))
        }
        Expr::CallLocal { callee, args: call_args } => {
            let func_id = locals
                .get(callee)
                .or_else(|| imports.get(callee))
                .copied()
                .ok_or_else(|| {
                    EngineError::Codegen(format!("call target '{}' was not declared", callee))
                })?;
            emit_call(builder, module, func_id, call_args, args, locals, imports)
        }
        Expr::CallExtern { symbol, args: call_args } => {
            let func_id = imports.get(symbol).copied().ok_or_else(|| {
                EngineError::Codegen(format!("external symbol '{}' was not declared", symbol))
            })?;
            emit_call(builder, module, func_id, call_args, args, locals, imports)
        }
    }
}

fn emit_call(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    func_id: FuncId,
    call_args: &[Expr],
    args: &[Value],
    locals: &HashMap<String, FuncId>,
    imports: &HashMap<String, FuncId>,
) -> EngineResult<Value> {
    let mut lowered: SmallVec<[Value; 4]> = SmallVec::new();
    for arg in call_args {
        lowered.push(lower_expr(builder, module, arg, args, locals, imports)?);
    }
    let callee_ref = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(callee_ref, &lowered);
    let result = builder.inst_results(call).first().copied();
    // A callee without a return value still has to produce something in
    // expression position; zero is the discard value.
    Ok(match result {
        Some(value) => value,
        None => builder.ins().iconst(types::I64, 0),
    })
}

// =============================================================================
// Tests
// =============================================================================
