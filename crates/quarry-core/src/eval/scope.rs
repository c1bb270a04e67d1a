//! Evaluation scopes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{parse_expression, Expr, FloatSpecial, Kind, LoadConfig, Value, Variable, VariableFlags};
use crate::binary::{BinaryInfo, TypeKind, VariableEntry, VariableRole};
use crate::error::{QuarryError, QuarryResult};
use crate::frame::execute_stack_program;
use crate::memory::{CompositeMemory, Memory};
use crate::stack::{thread_stacktrace, Stackframe, TaskContext};
use crate::types::{Address, DwarfRegisters, Location};

#[derive(Debug, Clone, Copy)]
enum UnaryOp
{
    Neg,
    Not,
}

impl fmt::Display for UnaryOp
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        })
    }
}

/// Where expressions are evaluated: a program counter inside a function,
/// the registers of its frame and the memory to read from
///
/// A scope is built for one request and not changed afterwards. A scope
/// without a function can still reach package variables and constants.
#[derive(Clone)]
pub struct EvalScope
{
    /// Program counter used for lexical scopes and location lists, with
    /// its line and function
    pub location: Location,
    pub regs: DwarfRegisters,
    mem: Memory,
    bi: Arc<BinaryInfo>,
    task: Option<TaskContext>,
    frame_offset: i64,
}

impl fmt::Debug for EvalScope
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("EvalScope")
            .field("location", &self.location)
            .field("regs", &self.regs)
            .field("task", &self.task)
            .field("frame_offset", &self.frame_offset)
            .finish_non_exhaustive()
    }
}

impl EvalScope
{
    pub fn new(location: Location, regs: DwarfRegisters, mem: Memory, bi: Arc<BinaryInfo>) -> Self
    {
        Self {
            location,
            regs,
            mem,
            bi,
            task: None,
            frame_offset: 0,
        }
    }

    /// A scope outside every function.
    pub fn global(bi: Arc<BinaryInfo>, mem: Memory) -> Self
    {
        let regs = DwarfRegisters::new(bi.architecture());
        Self::new(Location::default(), regs, mem, bi)
    }

    /// The scope of a stack frame.
    ///
    /// Lexical blocks are resolved at the frame's last executed
    /// instruction, not at its return address.
    pub fn from_frame(frame: &Stackframe, mem: Memory, bi: Arc<BinaryInfo>) -> Self
    {
        let location = Location {
            pc: Address::new(frame.last_pc()),
            ..frame.call.clone()
        };
        Self {
            frame_offset: frame.frame_offset(),
            ..Self::new(location, frame.regs.clone(), mem, bi)
        }
    }

    /// The scope of the innermost frame of a thread.
    pub fn thread(bi: Arc<BinaryInfo>, mem: Memory, regs: DwarfRegisters, task: Option<&TaskContext>) -> QuarryResult<Self>
    {
        let frames = thread_stacktrace(Arc::clone(&bi), Arc::clone(&mem), regs, task, 0)?;
        let frame = frames
            .first()
            .ok_or_else(|| QuarryError::InvalidArgument("could not decode first frame".into()))?;
        let mut scope = Self::from_frame(frame, mem, bi);
        scope.task = task.cloned();
        Ok(scope)
    }

    /// The scope of the innermost frame of a goroutine.
    pub fn from_task(task: &TaskContext) -> QuarryResult<Self>
    {
        let frames = task.stacktrace(0)?;
        let frame = frames
            .first()
            .ok_or_else(|| QuarryError::InvalidArgument("could not decode first frame".into()))?;
        let mut scope = Self::from_frame(frame, Arc::clone(task.memory()), Arc::clone(task.binary_info()));
        scope.task = Some(task.clone());
        Ok(scope)
    }

    pub fn task(&self) -> Option<&TaskContext>
    {
        self.task.as_ref()
    }

    /// Offset of the frame, see [`Stackframe::frame_offset`].
    pub fn frame_offset(&self) -> i64
    {
        self.frame_offset
    }

    pub fn binary_info(&self) -> &Arc<BinaryInfo>
    {
        &self.bi
    }

    /// Every variable visible at the scope's program counter, unloaded.
    ///
    /// Arguments come first, then locals from the outermost block inward.
    /// A variable hidden by a same-named one in an inner block is kept and
    /// flagged as shadowed. Heap-escaped locals are returned as the value
    /// they point to, flagged as escaped.
    pub fn locals(&self) -> QuarryResult<Vec<Variable>>
    {
        let function = self.location.function.as_ref().ok_or(QuarryError::NoFunctionContext)?;
        let pc = self.location.pc.value();

        let mut entries: Vec<(Variable, usize, u32)> = Vec::new();
        for (entry, depth) in function.variables_at(pc, self.location.line) {
            let mut v = self.extract_var(entry, &entry.name);
            let mut depth = depth;
            match entry.role {
                VariableRole::Argument => v.flags |= VariableFlags::ARGUMENT,
                VariableRole::ReturnArgument => v.flags |= VariableFlags::RETURN_ARGUMENT,
                VariableRole::Local => {}
            }
            if entry.role != VariableRole::Local && depth <= 1 {
                depth = 0;
            }
            entries.push((v, depth, entry.decl_line.unwrap_or(0)));
        }
        entries.sort_by_key(|(_, depth, decl_line)| (*depth, *decl_line));

        let mut vars: Vec<Variable> = Vec::with_capacity(entries.len());
        let mut last_seen: HashMap<String, usize> = HashMap::new();
        for (mut v, _, _) in entries {
            if let Some(name) = v.name.strip_prefix('&').filter(|name| !name.is_empty()).map(str::to_string) {
                let flags = v.flags;
                let mut target = v.maybe_dereference();
                if target.addr.is_null() && target.unreadable.is_none() {
                    target.poison(QuarryError::InvalidAccess("no address for escaped variable".into()));
                }
                target.name = name;
                target.flags = flags | VariableFlags::ESCAPED;
                v = target;
            }
            if let Some(&previous) = last_seen.get(&v.name) {
                vars[previous].flags |= VariableFlags::SHADOWED;
            }
            last_seen.insert(v.name.clone(), vars.len());
            vars.push(v);
        }
        Ok(vars)
    }

    /// Loaded locals that are not arguments.
    pub fn local_variables(&self, cfg: &LoadConfig) -> QuarryResult<Vec<Variable>>
    {
        self.filtered_locals(cfg, false)
    }

    /// Loaded arguments and return values.
    pub fn function_arguments(&self, cfg: &LoadConfig) -> QuarryResult<Vec<Variable>>
    {
        self.filtered_locals(cfg, true)
    }

    fn filtered_locals(&self, cfg: &LoadConfig, arguments: bool) -> QuarryResult<Vec<Variable>>
    {
        let roles = VariableFlags::ARGUMENT | VariableFlags::RETURN_ARGUMENT;
        Ok(self
            .locals()?
            .into_iter()
            .filter(|v| v.flags.intersects(roles) == arguments)
            .map(|mut v| {
                v.load_value(cfg);
                v
            })
            .collect())
    }

    /// Loaded package-level variables. Variables of unspecified type are
    /// left out.
    pub fn package_variables(&self, cfg: &LoadConfig) -> Vec<Variable>
    {
        let types = self.bi.types();
        self.bi
            .package_vars()
            .iter()
            .filter(|entry| !matches!(types.get(types.resolve_typedef(entry.ty)).kind, TypeKind::Unspecified))
            .map(|entry| {
                let mut v = self.extract_var(entry, &entry.name);
                v.load_value(cfg);
                v
            })
            .collect()
    }

    /// Package variable or constant `pkg.Name`. Packages may be named by
    /// the last element of their import path.
    pub fn find_global(&self, name: &str) -> QuarryResult<Variable>
    {
        let suffix = format!("/{name}");
        let matches = |full: &str| full == name || full.ends_with(&suffix);

        if let Some(entry) = self.bi.package_vars().iter().find(|entry| matches(&entry.name)) {
            return Ok(self.extract_var(entry, &entry.name));
        }
        if let Some((ty, constant)) = self.bi.constants().find(|(_, constant)| matches(&constant.full_name)) {
            let mut v = Variable::new(
                constant.full_name.clone(),
                Address::ZERO,
                ty,
                Arc::clone(&self.mem),
                Arc::clone(&self.bi),
            );
            v.value = Some(if v.kind == Kind::Uint {
                Value::Uint(constant.value as u64)
            } else {
                Value::Int(constant.value)
            });
            v.flags |= VariableFlags::CONSTANT;
            v.loaded = true;
            return Ok(v);
        }
        Err(QuarryError::SymbolNotFound(name.to_string()))
    }

    /// A variable by name, with optional field selectors (`v.a.b`), loaded
    /// with `cfg`.
    ///
    /// Names that are not local are looked up as package variables.
    pub fn eval_variable(&self, name: &str, cfg: &LoadConfig) -> QuarryResult<Variable>
    {
        let mut v = match name.split_once('.') {
            None => self.find_identifier(name)?,
            Some((head, members)) => match self.find_local(head) {
                Ok(mut v) => {
                    for member in members.split('.') {
                        v = v.struct_member(member)?;
                    }
                    v
                }
                Err(err) => self.find_global(name).map_err(|_| err)?,
            },
        };
        v.load_value(cfg);
        Ok(v)
    }

    /// Parse and evaluate `expr`, loading the result with `cfg`.
    pub fn eval_expression(&self, expr: &str, cfg: &LoadConfig) -> QuarryResult<Variable>
    {
        let ast = parse_expression(expr)?;
        let mut v = self.eval_ast(&ast)?;
        if v.name.is_empty() {
            v.name = expr.to_string();
        }
        v.load_value(cfg);
        Ok(v)
    }

    /// Assign the value of the expression `value` to the location the
    /// expression `name` denotes.
    pub fn set_variable(&self, name: &str, value: &str) -> QuarryResult<()>
    {
        let target = self.eval_ast(&parse_expression(name)?)?;
        if target.addr.is_null() {
            return Err(QuarryError::NotAddressable(name.to_string()));
        }
        if let Some(err) = &target.unreadable {
            return Err(QuarryError::unreadable(name, err));
        }

        let mut src = self.eval_ast(&parse_expression(value)?)?;
        src.load_value(&LoadConfig::single_value());
        src.is_type(target.dwarf_type, target.kind)?;
        if let Some(err) = &src.unreadable {
            return Err(QuarryError::unreadable(value, err));
        }
        debug!(target = name, value, addr = %target.addr, "assigning");
        target.set_value(&src, value)
    }

    /// Build the variable `entry` describes at the scope's program counter.
    ///
    /// Failures do not abort: the variable comes back poisoned.
    fn extract_var(&self, entry: &VariableEntry, name: &str) -> Variable
    {
        let poisoned = |err: QuarryError| {
            let mut v = Variable::new(name, Address::ZERO, entry.ty, Arc::clone(&self.mem), Arc::clone(&self.bi));
            v.poison(err);
            v
        };

        let Some(expression) = entry.location.expression_at(self.location.pc.value()) else {
            trace!(name, pc = %self.location.pc, "no location at pc");
            return poisoned(QuarryError::OptimizedOut(name.to_string()));
        };
        match execute_stack_program(&self.regs, expression, Some(self.mem.as_ref())) {
            Ok((address, pieces)) if pieces.is_empty() => Variable::new(
                name,
                Address::new(address as u64),
                entry.ty,
                Arc::clone(&self.mem),
                Arc::clone(&self.bi),
            ),
            Ok((_, pieces)) => match CompositeMemory::new(Arc::clone(&self.mem), &self.regs, &pieces) {
                Ok(composite) => {
                    let base = composite.base();
                    let mem: Memory = Arc::new(composite);
                    Variable::new(name, base, entry.ty, mem, Arc::clone(&self.bi))
                }
                Err(err) => poisoned(err),
            },
            Err(err) => poisoned(err),
        }
    }

    fn find_local(&self, name: &str) -> QuarryResult<Variable>
    {
        self.locals()?
            .into_iter()
            .find(|v| v.name == name && !v.flags.contains(VariableFlags::SHADOWED))
            .ok_or_else(|| QuarryError::SymbolNotFound(name.to_string()))
    }

    /// A local, or else a variable of the current function's package.
    fn find_identifier(&self, name: &str) -> QuarryResult<Variable>
    {
        match self.find_local(name) {
            Ok(v) => Ok(v),
            Err(QuarryError::SymbolNotFound(_)) => {
                let package = self.location.function.as_ref().map_or("", |function| function.package_name());
                if !package.is_empty() {
                    if let Ok(global) = self.find_global(&format!("{package}.{name}")) {
                        return Ok(global);
                    }
                }
                Err(QuarryError::SymbolNotFound(name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    fn eval_ast(&self, expr: &Expr) -> QuarryResult<Variable>
    {
        match expr {
            Expr::Ident(name) => match name.as_str() {
                "nil" => Ok(Variable::nil(Arc::clone(&self.mem), Arc::clone(&self.bi))),
                "true" | "false" => Ok(self.constant(Value::Bool(name == "true"))),
                _ => self.find_identifier(name),
            },
            Expr::Literal(value) => Ok(self.constant(value.clone())),
            Expr::Selector { base, field } => {
                if let Expr::Ident(package) = base.as_ref() {
                    if let Ok(global) = self.find_global(&format!("{package}.{field}")) {
                        return Ok(global);
                    }
                }
                self.eval_ast(base)?.struct_member(field)
            }
            Expr::Index { base, index } => self.eval_index(base, index),
            Expr::Deref(inner) => self.eval_deref(inner),
            Expr::AddrOf(inner) => self.eval_addr_of(inner),
            Expr::Neg(inner) => self.eval_unary(UnaryOp::Neg, inner),
            Expr::Not(inner) => self.eval_unary(UnaryOp::Not, inner),
        }
    }

    fn constant(&self, value: Value) -> Variable
    {
        Variable::constant(value, Arc::clone(&self.mem), Arc::clone(&self.bi))
    }

    fn eval_index(&self, base: &Expr, index: &Expr) -> QuarryResult<Variable>
    {
        let mut container = self.eval_ast(base)?;
        if let Some(err) = &container.unreadable {
            return Err(err.clone());
        }
        if container.kind == Kind::Ptr {
            let target = container.maybe_dereference();
            if target.kind == Kind::Array {
                container = target;
            }
        }

        let mut key = self.eval_ast(index)?;
        match container.kind {
            Kind::Slice | Kind::Array | Kind::String => {
                if container.base.is_null() {
                    return Err(QuarryError::InvalidAccess(format!("can not index \"{base}\"")));
                }
                container.slice_access(key.as_int()?)
            }
            Kind::Map => {
                key.load_value(&LoadConfig::full_value());
                if let Some(err) = &key.unreadable {
                    return Err(err.clone());
                }
                container.map_access(&key)
            }
            _ => Err(QuarryError::InvalidAccess(format!(
                "expression \"{base}\" ({}) does not support indexing",
                container.type_string()
            ))),
        }
    }

    fn eval_deref(&self, inner: &Expr) -> QuarryResult<Variable>
    {
        let pointer = self.eval_ast(inner)?;
        if pointer.kind != Kind::Ptr {
            return Err(QuarryError::InvalidAccess(format!(
                "expression \"{inner}\" ({}) can not be dereferenced",
                pointer.type_string()
            )));
        }
        if pointer.is_nil_literal() {
            return Err(QuarryError::InvalidAccess("nil can not be dereferenced".into()));
        }
        if let [target] = pointer.children.as_slice() {
            let mut target = target.clone();
            target.only_addr = false;
            return Ok(target);
        }

        let target = pointer.maybe_dereference();
        if let Some(err) = &target.unreadable {
            return Err(err.clone());
        }
        if target.addr.is_null() {
            return Err(QuarryError::Nil(inner.to_string()));
        }
        Ok(target)
    }

    fn eval_addr_of(&self, inner: &Expr) -> QuarryResult<Variable>
    {
        let mut target = self.eval_ast(inner)?;
        let Some(ty) = target.dwarf_type.filter(|_| !target.addr.is_null()) else {
            return Err(QuarryError::InvalidAccess(format!("can not take address of \"{inner}\"")));
        };
        target.only_addr = true;

        let pointer_type = self.bi.types().pointer_to(ty);
        let mut pointer = Variable::new("", Address::ZERO, pointer_type, Arc::clone(&self.mem), Arc::clone(&self.bi));
        pointer.children = vec![target];
        pointer.loaded = true;
        Ok(pointer)
    }

    fn eval_unary(&self, op: UnaryOp, inner: &Expr) -> QuarryResult<Variable>
    {
        let mut operand = self.eval_ast(inner)?;
        operand.load_value(&LoadConfig::single_value());
        if let Some(err) = &operand.unreadable {
            return Err(err.clone());
        }
        if operand.float_special != FloatSpecial::Normal {
            return Err(QuarryError::Unsupported("operations on non-finite floats".into()));
        }
        let Some(value) = &operand.value else {
            return Err(QuarryError::TypeMismatch(format!("operator {op} can not be applied to \"{inner}\"")));
        };

        let typed = operand.dwarf_type.is_some();
        let overflow = || QuarryError::TypeMismatch(format!("constant -{inner} overflows"));
        let result = match (op, value) {
            (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
            (UnaryOp::Neg, Value::Int(n)) if typed => Value::Int(n.wrapping_neg()),
            (UnaryOp::Neg, Value::Int(n)) => Value::Int(n.checked_neg().ok_or_else(overflow)?),
            (UnaryOp::Neg, Value::Uint(n)) if typed => Value::Uint(n.wrapping_neg()),
            (UnaryOp::Neg, Value::Uint(n)) => Value::Int(0i64.checked_sub_unsigned(*n).ok_or_else(overflow)?),
            (UnaryOp::Neg, Value::Float(x)) => Value::Float(-x),
            (UnaryOp::Neg, Value::Complex(real, imag)) => Value::Complex(-real, -imag),
            _ => {
                return Err(QuarryError::TypeMismatch(format!(
                    "operator {op} not supported on {}",
                    operand.type_string()
                )))
            }
        };

        match operand.dwarf_type {
            Some(ty) => {
                let mut v = Variable::new("", Address::ZERO, ty, Arc::clone(&self.mem), Arc::clone(&self.bi));
                v.value = Some(result);
                v.loaded = true;
                Ok(v)
            }
            None => Ok(self.constant(result)),
        }
    }
}
