//! The stack-based interpreter.
//!
//! One driver function moves a bounds-checked instruction pointer over the
//! program. The same machine serves two masters: `run` executes a whole
//! program against a data tree and a writer, and `eval` lets the optimizer
//! evaluate instruction subranges at compile time — there the fragment
//! frames and the output are absent and any instruction that would need
//! them raises the runtime-context-needed sentinel.

mod frames;
mod ops;

pub(crate) use frames::Frames;

use crate::{
    configuration::Configuration,
    contenttype::{self, Descriptor, EscapeStack},
    dictionary::Dictionary,
    error::ErrorLog,
    formatter::{Formatter, Mode},
    fragment::{Fragment, FragmentList},
    functions::{self, FunctionCtx},
    instruction::{FragBuiltin, InstrKind},
    position::Pos,
    program::Program,
    udf::UdfRegistry,
    value::{ListRef, Value},
    vm::frames::frag_value_to_value,
    writer::Writer,
};

/// How an execution ended prematurely.
#[derive(Debug)]
pub(crate) enum RunError {
    /// Compile-time evaluation touched state that only exists at runtime;
    /// the optimizer catches this and keeps the original code.
    RuntimeCtxNeeded,
    /// Unrecoverable runtime failure; `generate_page` terminates, output
    /// written so far is kept.
    Fatal(String),
}

/// Everything a program execution borrows.
pub(crate) struct RunEnv<'p> {
    pub program: &'p Program,
    pub dict: &'p Dictionary,
    pub params: &'p Configuration,
    pub encoding: &'p str,
    pub udf: Option<&'p UdfRegistry>,
    /// Snapshot of the error log rendered as fragments, for the `_error`
    /// fragment feature.
    pub error_frags: Option<&'p FragmentList>,
}

/// Executes the whole program against `root`, writing through `writer`.
/// Returns the fatal error when execution had to be terminated; the error
/// is logged either way.
pub(crate) fn run<'p>(
    env: &RunEnv<'p>,
    root: &'p Fragment,
    writer: &mut dyn Writer,
    err: &mut ErrorLog,
    content_type: Option<&'static Descriptor>,
) -> Result<(), ()> {
    let mut formatter = Formatter::new(writer, Mode::PassWhite);
    let result = {
        let mut vm = Vm {
            env,
            err,
            value_stack: Vec::new(),
            prg_stack: Vec::new(),
            frames: Some(Frames::new(root)),
            output: Some(&mut formatter),
            escaper: EscapeStack::new(content_type.unwrap_or_else(contenttype::default_descriptor)),
            log_suppressed: 0,
            instr_pos: Pos::default(),
        };
        vm.execute(0, env.program.len())
    };
    let flushed = formatter.flush();
    match result {
        Ok(()) => {
            if flushed.is_err() {
                err.fatal(Pos::default(), "Runtime: error writing output");
                return Err(());
            }
            Ok(())
        }
        Err(RunError::Fatal(msg)) => {
            err.fatal(Pos::default(), format!("Runtime: {msg}"));
            Err(())
        }
        Err(RunError::RuntimeCtxNeeded) => {
            err.fatal(Pos::default(), "Runtime: runtime context slipped out of the optimizer");
            Err(())
        }
    }
}

/// Evaluates the instruction subrange `[start, end)` without runtime
/// state. Returns the resulting value, or `None` when the code needs the
/// runtime context (or failed in any other way). Diagnostics produced by
/// the attempt are discarded with the scratch log.
pub(crate) fn eval(env: &RunEnv<'_>, start: usize, end: usize) -> Option<Value<'static>> {
    let mut scratch = ErrorLog::new();
    let mut vm = Vm {
        env,
        err: &mut scratch,
        value_stack: Vec::new(),
        prg_stack: Vec::new(),
        frames: None,
        output: None,
        escaper: EscapeStack::new(contenttype::default_descriptor()),
        log_suppressed: 0,
        instr_pos: Pos::default(),
    };
    vm.execute(start, end).ok()?;
    if vm.value_stack.len() != 1 {
        return None;
    }
    let result = vm.value_stack.pop()?.into_owned();
    (!result.is_undefined()).then_some(result)
}

struct Vm<'v, 'p, 'w> {
    env: &'v RunEnv<'p>,
    err: &'v mut ErrorLog,
    value_stack: Vec<Value<'p>>,
    prg_stack: Vec<Value<'p>>,
    /// Absent in eval mode.
    frames: Option<Frames<'p>>,
    /// Absent in eval mode.
    output: Option<&'v mut Formatter<'w>>,
    escaper: EscapeStack,
    /// While positive, recoverable warnings stay unlogged (`LOG_SUPPRESS`).
    log_suppressed: u32,
    instr_pos: Pos,
}

impl<'v, 'p, 'w> Vm<'v, 'p, 'w> {
    fn execute(&mut self, start: usize, end: usize) -> Result<(), RunError> {
        let program = self.env.program;
        let mut ip = start as i64;
        while ip < end as i64 {
            let instr = &program[ip as usize];
            self.instr_pos = instr.pos.clone();
            let next = match self.step(&instr.kind, ip)? {
                Some(next) => next,
                None => break, // HALT
            };
            if next == ip {
                return Err(RunError::Fatal("never ending loop detected".to_owned()));
            }
            if next < start as i64 {
                return Err(RunError::Fatal("instruction pointer underflow".to_owned()));
            }
            if next > end as i64 {
                return Err(RunError::Fatal("instruction pointer overflow".to_owned()));
            }
            ip = next;
        }
        Ok(())
    }

    /// Executes one instruction; returns the next instruction pointer or
    /// `None` for `HALT`.
    fn step(&mut self, kind: &'p InstrKind, ip: i64) -> Result<Option<i64>, RunError> {
        let mut next = ip + 1;
        match kind {
            InstrKind::Noop => {}
            InstrKind::Halt => return Ok(None),

            InstrKind::Val { value } => self.value_stack.push(value.borrowed()),

            InstrKind::Var { name, addr, escape } => {
                let frames = self.frames()?;
                let value = frames.get_var(*addr, name);
                let value = if value.is_undefined() {
                    self.warn(format!("Variable '{name}' is undefined"));
                    value
                } else if self.env.params.is_print_escape_enabled() {
                    // escaping happens at PRINT
                    value
                } else if self.env.params.is_always_escape_enabled() || *escape {
                    if *escape && value.is_string_like() {
                        Value::Str(self.escaper.escape(value.string()))
                    } else {
                        value
                    }
                } else {
                    value
                };
                self.value_stack.push(value);
            }

            InstrKind::Set { name, addr } => {
                let value = self.pop()?.into_owned();
                let stored = self.frames_mut()?.set_var(*addr, name, value);
                if !stored {
                    self.warn(format!(
                        "Cannot rewrite variable '{name}' which is already set by the application; nothing set"
                    ));
                }
            }

            InstrKind::Dict => {
                let arg = self.pop()?;
                let key = arg.string();
                if let Some(item) = self.env.dict.lookup(key) {
                    self.value_stack.push(Value::StrRef(item));
                } else if let Some(item) = self.env.params.dict().lookup(key) {
                    self.value_stack.push(Value::StrRef(item));
                } else {
                    self.warn(format!("Dictionary item '{key}' was not found"));
                    self.value_stack.push(arg);
                }
            }

            InstrKind::PrgStackPush => {
                let value = self.pop()?;
                self.prg_stack.push(value);
            }
            InstrKind::PrgStackPop => {
                if self.prg_stack.pop().is_none() {
                    return Err(RunError::Fatal("program stack underflow".to_owned()));
                }
            }
            InstrKind::PrgStackAt { index } => {
                let Some(slot) = self.prg_stack.len().checked_sub(1 + index) else {
                    return Err(RunError::Fatal("program stack underflow".to_owned()));
                };
                let value = self.prg_stack[slot].clone();
                self.value_stack.push(value);
            }

            InstrKind::UnaryPlus => self.unary(ops::unary_plus)?,
            InstrKind::UnaryMinus => self.unary(ops::unary_minus)?,
            InstrKind::BitNot => self.unary(ops::bit_not)?,
            InstrKind::Not => {
                let arg = self.pop()?;
                self.value_stack.push(ops::logic_not(&arg));
            }

            InstrKind::Plus => self.binary(ops::plus)?,
            InstrKind::Minus => self.binary_num(ops::NumOp::Minus)?,
            InstrKind::Mul => self.binary_num(ops::NumOp::Mul)?,
            InstrKind::Div => self.binary_num(ops::NumOp::Div)?,
            InstrKind::Mod => self.binary_num(ops::NumOp::Mod)?,
            InstrKind::BitAnd => self.binary_num(ops::NumOp::BitAnd)?,
            InstrKind::BitOr => self.binary_num(ops::NumOp::BitOr)?,
            InstrKind::BitXor => self.binary_num(ops::NumOp::BitXor)?,
            InstrKind::Repeat => self.binary(ops::repeat)?,

            InstrKind::Eq => self.binary_cmp(ops::CmpOp::Eq)?,
            InstrKind::Ne => self.binary_cmp(ops::CmpOp::Ne)?,
            InstrKind::Ge => self.binary_cmp(ops::CmpOp::Ge)?,
            InstrKind::Gt => self.binary_cmp(ops::CmpOp::Gt)?,
            InstrKind::Le => self.binary_cmp(ops::CmpOp::Le)?,
            InstrKind::Lt => self.binary_cmp(ops::CmpOp::Lt)?,

            InstrKind::And { offset } => {
                let top = self.top()?;
                if top.truthy() {
                    self.value_stack.pop();
                } else {
                    next = ip + offset + 1;
                }
            }
            InstrKind::Or { offset } => {
                let top = self.top()?;
                if top.truthy() {
                    next = ip + offset + 1;
                } else {
                    self.value_stack.pop();
                }
            }

            InstrKind::Jmp { offset } => next = ip + offset + 1,
            InstrKind::JmpIfNot { offset } => {
                let arg = self.pop()?;
                if !arg.truthy() {
                    next = ip + offset + 1;
                }
            }

            InstrKind::MatchRegex { regex, negate } => {
                let arg = self.pop()?;
                let matched = regex.matches(&arg.printable());
                self.value_stack.push(Value::Int(i64::from(matched != *negate)));
            }

            InstrKind::Func { name, nargs, is_udf } => self.call_function(name, *nargs, *is_udf)?,

            InstrKind::Print { escape } => {
                let arg = self.pop()?;
                match &arg {
                    Value::Frag(_) | Value::FragNull => {
                        self.warn("Variable is a fragment, not a scalar value");
                    }
                    Value::List(_) => self.warn("Variable is a fragment list, not a scalar value"),
                    Value::Regex(_) => self.warn("Variable is a regex, not a scalar value"),
                    _ => {}
                }
                let text = if self.env.params.is_print_escape_enabled() && *escape && arg.is_string_like() {
                    self.escaper.escape(arg.string())
                } else {
                    arg.printable().into_owned()
                };
                self.write(&text)?;
            }

            InstrKind::Repr { escape: _ } => {
                let arg = self.pop()?;
                let value = if arg.is_string_like() && !self.env.params.is_print_escape_enabled() {
                    Value::Str(self.escaper.escape(arg.string()))
                } else {
                    arg
                };
                self.value_stack.push(value);
            }

            InstrKind::OpenFormat { mode } => {
                if self.env.params.is_format_enabled() {
                    let output = self.output()?;
                    output.push(*mode).map_err(|_| RunError::Fatal("error writing output".to_owned()))?;
                }
            }
            InstrKind::CloseFormat => {
                if self.env.params.is_format_enabled() {
                    let output = self.output()?;
                    let popped =
                        output.pop().map_err(|_| RunError::Fatal("error writing output".to_owned()))?;
                    if !popped {
                        return Err(RunError::Fatal("stack of formatters is corrupted".to_owned()));
                    }
                }
            }

            InstrKind::OpenCtype { descriptor } => {
                let descriptor = descriptor.unwrap_or_else(|| self.escaper.top());
                self.escaper.push(descriptor);
            }
            InstrKind::CloseCtype => {
                if !self.escaper.pop() {
                    self.error("Can't pop content type: only one remains.");
                }
            }

            InstrKind::OpenFrame => self.frames_mut()?.open_frame(),
            InstrKind::CloseFrame => self.frames_mut()?.close_frame(),

            InstrKind::OpenFrag { name, close_frag_offset } => {
                let opened = !name.is_empty() && self.frames_mut()?.open_frag(name);
                if !opened {
                    next = ip + close_frag_offset + 1;
                }
            }
            InstrKind::OpenErrorFrag { close_frag_offset } => {
                let enabled = self.env.params.is_error_fragment_enabled();
                let opened = enabled
                    && match self.env.error_frags {
                        Some(list) => self.frames_mut()?.open_list_frag("_error", list),
                        None => false,
                    };
                if !opened {
                    next = ip + close_frag_offset + 1;
                }
            }
            InstrKind::CloseFrag { open_frag_offset } => {
                if self.frames_mut()?.next_frag() {
                    next = ip + open_frag_offset + 1;
                }
            }

            InstrKind::PushRootFrag => {
                let root = self.frames()?.root();
                self.value_stack.push(Value::Frag(root));
            }
            InstrKind::PushThisFrag => {
                let frag = self.frames()?.current_frag();
                self.value_stack.push(Value::Frag(frag));
            }
            InstrKind::PushErrorFrag { discard } => {
                if *discard {
                    self.pop()?;
                }
                let value = if self.env.params.is_error_fragment_enabled() {
                    match self.env.error_frags {
                        Some(list) => Value::List(ListRef::new(list, 0)),
                        None => Value::Undefined,
                    }
                } else {
                    Value::Undefined
                };
                self.value_stack.push(value);
            }
            InstrKind::PushFrag { name: _, addr } => {
                let value = match self.frames()?.frag_at(*addr) {
                    Some(frag) => Value::Frag(frag),
                    None => Value::FragNull,
                };
                self.value_stack.push(value);
            }

            InstrKind::PushFragBuiltin { which, name, addr } => {
                let value = match self.frames()?.list_pos(*addr) {
                    Some(pos) => builtin_of_pos(*which, pos.i, pos.size),
                    None => {
                        let what = builtin_name(*which);
                        self.warn(format!("Can't determine '{name}' frag {what}"));
                        Value::Undefined
                    }
                };
                self.value_stack.push(value);
            }

            InstrKind::PushValBuiltin { which, path } => {
                let arg = self.pop()?;
                let value = self.val_builtin(*which, path, &arg)?;
                self.value_stack.push(value);
            }

            InstrKind::PushAttr { name, path } => {
                let arg = self.pop()?;
                let value = self.push_attr(&arg, name, path)?;
                self.value_stack.push(value);
            }
            InstrKind::PushAttrAt { path } => {
                let index = self.pop()?;
                let arg = self.pop()?;
                let value = self.push_attr_at(&arg, &index, path)?;
                self.value_stack.push(value);
            }
            InstrKind::PopAttr { path: _ } => {
                let arg = self.pop()?;
                self.warn("Not implemented yet - _parent segment ignored");
                self.value_stack.push(arg);
            }

            InstrKind::LogSuppress => self.log_suppressed += 1,

            InstrKind::QueryRepr => {
                self.log_suppressed = self.log_suppressed.saturating_sub(1);
                let arg = self.pop()?;
                let value = if arg.is_string_like() && !self.env.params.is_print_escape_enabled() {
                    Value::Str(self.escaper.escape(arg.string()))
                } else {
                    arg
                };
                self.value_stack.push(value);
            }
            InstrKind::QueryCount => {
                self.log_suppressed = self.log_suppressed.saturating_sub(1);
                let arg = self.pop()?;
                let value = match &arg {
                    Value::List(lr) => Value::Int(lr.list.len() as i64),
                    Value::Frag(f) if self.is_root(f) => Value::Int(1),
                    other => {
                        self.warn(format!(
                            "The path expression references object of '{}' type with value '{}' for which \
                             count() query is undefined",
                            other.tag_str(),
                            other.printable()
                        ));
                        Value::Undefined
                    }
                };
                self.value_stack.push(value);
            }
            InstrKind::QueryType => {
                self.log_suppressed = self.log_suppressed.saturating_sub(1);
                let arg = self.pop()?;
                self.value_stack.push(Value::Str(arg.tag_str().to_owned()));
            }
            InstrKind::QueryDefined => {
                self.log_suppressed = self.log_suppressed.saturating_sub(1);
                let arg = self.pop()?;
                let value = match &arg {
                    Value::Undefined => Value::Int(0),
                    Value::Frag(_) | Value::FragNull => Value::Int(1),
                    Value::List(lr) => Value::Int(i64::from(!lr.list.is_empty())),
                    _ => arg,
                };
                self.value_stack.push(value);
            }
            InstrKind::QueryExists => {
                self.log_suppressed = self.log_suppressed.saturating_sub(1);
                let arg = self.pop()?;
                self.value_stack.push(Value::Int(i64::from(!arg.is_undefined())));
            }
            InstrKind::QueryIsempty => {
                self.log_suppressed = self.log_suppressed.saturating_sub(1);
                let arg = self.pop()?;
                let value = match &arg {
                    Value::Frag(f) => Value::Int(i64::from(f.is_empty())),
                    Value::List(lr) => Value::Int(i64::from(lr.list.is_empty())),
                    other => {
                        self.warn(format!(
                            "The path expression references object of '{}' type with value '{}' for which \
                             isempty() query is undefined",
                            other.tag_str(),
                            other.printable()
                        ));
                        Value::Undefined
                    }
                };
                self.value_stack.push(value);
            }

            InstrKind::DebugFrag => {
                if self.env.params.is_debug_enabled() {
                    let dump = self.debug_dump();
                    self.write(&dump)?;
                }
            }
            InstrKind::BytecodeFrag => {
                if self.env.params.is_bytecode_enabled() {
                    let dump = self.env.program.disassemble();
                    self.write(&dump)?;
                }
            }

            InstrKind::Call { addr } => {
                self.prg_stack.push(Value::Int(ip + 1));
                next = *addr as i64 + 1;
            }
            InstrKind::Return => {
                let Some(Value::Int(addr)) = self.prg_stack.pop() else {
                    return Err(RunError::Fatal("program stack underflow".to_owned()));
                };
                next = addr;
            }
        }
        Ok(Some(next))
    }

    // ------------------------------------------------------------------ //

    fn frames(&self) -> Result<&Frames<'p>, RunError> {
        self.frames.as_ref().ok_or(RunError::RuntimeCtxNeeded)
    }

    fn frames_mut(&mut self) -> Result<&mut Frames<'p>, RunError> {
        self.frames.as_mut().ok_or(RunError::RuntimeCtxNeeded)
    }

    fn output(&mut self) -> Result<&mut Formatter<'w>, RunError> {
        match self.output.as_deref_mut() {
            Some(output) => Ok(output),
            None => Err(RunError::RuntimeCtxNeeded),
        }
    }

    fn write(&mut self, text: &str) -> Result<(), RunError> {
        let output = self.output()?;
        output.write(text).map_err(|e| RunError::Fatal(format!("error writing output ({e})")))
    }

    fn pop(&mut self) -> Result<Value<'p>, RunError> {
        self.value_stack.pop().ok_or_else(|| RunError::Fatal("program stack underflow".to_owned()))
    }

    fn top(&self) -> Result<&Value<'p>, RunError> {
        self.value_stack.last().ok_or_else(|| RunError::Fatal("program stack underflow".to_owned()))
    }

    fn unary(&mut self, op: for<'x> fn(&Value<'x>) -> ops::OpResult<'x>) -> Result<(), RunError> {
        let arg = self.pop()?;
        match op(&arg) {
            Ok(value) => self.value_stack.push(value),
            Err(msg) => {
                self.warn(msg);
                self.value_stack.push(Value::Undefined);
            }
        }
        Ok(())
    }

    fn binary(
        &mut self,
        op: for<'x> fn(&Value<'x>, &Value<'x>) -> ops::OpResult<'x>,
    ) -> Result<(), RunError> {
        // operands pop in reverse order
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        self.push_op_result(op(&lhs, &rhs));
        Ok(())
    }

    fn binary_num(&mut self, op: ops::NumOp) -> Result<(), RunError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        self.push_op_result(ops::numop(op, &lhs, &rhs));
        Ok(())
    }

    fn binary_cmp(&mut self, op: ops::CmpOp) -> Result<(), RunError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        self.push_op_result(ops::compare(op, &lhs, &rhs));
        Ok(())
    }

    fn push_op_result(&mut self, result: ops::OpResult<'p>) {
        match result {
            Ok(value) => self.value_stack.push(value),
            Err(msg) => {
                self.warn(msg);
                self.value_stack.push(Value::Undefined);
            }
        }
    }

    fn call_function(&mut self, name: &str, nargs: usize, is_udf: bool) -> Result<(), RunError> {
        if self.value_stack.len() < nargs {
            return Err(RunError::Fatal("program stack underflow".to_owned()));
        }
        let args: Vec<Value<'p>> = self.value_stack.split_off(self.value_stack.len() - nargs);

        if is_udf {
            // what a udf does is unknown, so it is never folded
            if self.frames.is_none() {
                return Err(RunError::RuntimeCtxNeeded);
            }
            match self.env.udf.and_then(|registry| registry.find(name)) {
                Some(callable) => match callable(&args) {
                    Ok(value) => self.value_stack.push(value),
                    Err(msg) => {
                        self.error(format!("udf.{name}(): {msg}"));
                        self.value_stack.push(Value::Undefined);
                    }
                },
                None => {
                    self.error(format!("Call of unknown function udf.{name}()"));
                    self.value_stack.push(Value::Undefined);
                }
            }
            return Ok(());
        }

        let Some(function) = functions::find_function(name) else {
            // unknown functions skip optimization and fail at runtime
            if self.frames.is_none() {
                return Err(RunError::RuntimeCtxNeeded);
            }
            self.error(format!("Call of unknown function {name}()"));
            self.value_stack.push(Value::Undefined);
            return Ok(());
        };
        if self.frames.is_none() && !functions::is_evaluable(name) {
            return Err(RunError::RuntimeCtxNeeded);
        }
        let ctx = FunctionCtx {
            escaper_top: self.escaper.top(),
            params: self.env.params,
            dict: self.env.dict,
            encoding: self.env.encoding,
        };
        match function(&ctx, &args) {
            Ok(value) => self.value_stack.push(value),
            Err(msg) => {
                self.warn(msg);
                self.value_stack.push(Value::Undefined);
            }
        }
        Ok(())
    }

    fn is_root(&self, frag: &Fragment) -> bool {
        self.frames.as_ref().is_some_and(|frames| std::ptr::eq(frames.root(), frag))
    }

    fn val_builtin(
        &mut self,
        which: FragBuiltin,
        path: &str,
        arg: &Value<'p>,
    ) -> Result<Value<'p>, RunError> {
        let what = builtin_name(which);
        Ok(match arg {
            Value::Undefined => Value::Undefined,
            Value::List(lr) => match which {
                FragBuiltin::Count => Value::Int(lr.list.len() as i64),
                _ => match lr.list.len() {
                    1 => builtin_of_pos(which, lr.idx, 1),
                    0 => {
                        self.warn(format!(
                            "The path '{path}' references fragment list that does not contain any fragment; \
                             _{what} variable is undefined"
                        ));
                        Value::Undefined
                    }
                    n => {
                        self.warn(format!(
                            "The path '{path}' references fragment list of {n} fragments; _{what} variable \
                             is undefined"
                        ));
                        Value::Undefined
                    }
                },
            },
            Value::Frag(frag) if self.is_root(frag) => match which {
                // backward compatibility: the root behaves as a list of one
                FragBuiltin::Count => Value::Int(1),
                FragBuiltin::Index | FragBuiltin::Inner => Value::Int(0),
                FragBuiltin::First | FragBuiltin::Last => Value::Int(1),
            },
            other => {
                self.warn(format!(
                    "The path expression '{path}' references object of '{}' type with value '{}' for which \
                     _{what} builtin variable is undefined",
                    other.tag_str(),
                    other.printable()
                ));
                Value::Undefined
            }
        })
    }

    /// Replaces a fragment value by its named attribute.
    fn push_attr(&mut self, arg: &Value<'p>, name: &str, path: &str) -> Result<Value<'p>, RunError> {
        if arg.is_undefined() {
            return Ok(Value::Undefined);
        }
        match arg {
            Value::Frag(frag) => match frag.get(name) {
                Some(value) => Ok(frag_value_to_value(value)),
                None => {
                    if path.is_empty() {
                        self.warn(format!("This fragment doesn't contain any value for key '{name}'"));
                    } else {
                        self.warn(format!(
                            "The path expression '{path}' references fragment that doesn't contain any \
                             value for key '{name}'"
                        ));
                    }
                    Ok(Value::Undefined)
                }
            },
            Value::List(lr) if lr.list.len() == 1 => {
                let frag = lr.list.get(0).expect("list of length one");
                self.push_attr(&Value::Frag(frag), name, path)
            }
            Value::List(lr) => {
                self.warn(format!(
                    "The path expression '{path}' references fragment list of '{}' fragments; the \
                     expression is ambiguous",
                    lr.list.len()
                ));
                Ok(Value::Undefined)
            }
            _ => {
                self.warn(format!(
                    "The path expression '{path}' references fragment that doesn't contain any value for \
                     key '{name}'"
                ));
                Ok(Value::Undefined)
            }
        }
    }

    /// Replaces a `(subject, index)` pair by the indexed element. Numeric
    /// zero on a single fragment is the identity (list→frag coercion);
    /// string indices behave as attribute lookup.
    fn push_attr_at(
        &mut self,
        arg: &Value<'p>,
        index: &Value<'p>,
        path: &str,
    ) -> Result<Value<'p>, RunError> {
        if arg.is_undefined() {
            return Ok(Value::Undefined);
        }
        if index.is_string_like() {
            return self.push_attr(arg, index.string(), path);
        }
        if !index.is_number() {
            self.warn(format!(
                "The path expression '{path}' references fragment which can't be subscripted by values of \
                 '{}' type with value '{}'",
                index.tag_str(),
                index.printable()
            ));
            return Ok(Value::Undefined);
        }
        let i = index.integral();
        match arg {
            Value::Frag(_) if i == 0 => Ok(arg.clone()),
            Value::List(lr) => match usize::try_from(i).ok().and_then(|i| lr.list.get(i)) {
                Some(frag) => Ok(Value::Frag(frag)),
                None => {
                    self.warn(format!(
                        "The index '{i}' is out of valid range <0, {}) of the fragments list referenced by \
                         this path expression '{path}'",
                        lr.list.len()
                    ));
                    Ok(Value::Undefined)
                }
            },
            other => {
                self.warn(format!(
                    "The path expression '{path}' references object of '{}' type with value '{}' that is \
                     not subscriptable",
                    other.tag_str(),
                    other.printable()
                ));
                Ok(Value::Undefined)
            }
        }
    }

    /// `<?teng debug?>` dump: configuration, dictionary and the data tree.
    fn debug_dump(&self) -> String {
        let max_len = usize::from(self.env.params.max_debug_val_length());
        let clip = move |s: &str| -> String {
            if s.len() <= max_len {
                return s.to_owned();
            }
            let mut end = max_len;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        };

        let mut out = String::from("Template sources:\n");
        for source in self.env.program.sources().iter() {
            out.push_str(&format!("    {source}\n"));
        }
        out.push_str("\nLanguage dictionary sources:\n");
        for source in self.env.dict.sources().iter() {
            out.push_str(&format!("    {source}\n"));
        }
        if !self.env.dict.is_empty() {
            out.push_str("\nLanguage dictionary:\n");
            out.push_str(&self.env.dict.dump());
        }
        out.push_str(&format!("\n{}", self.env.params));
        out.push_str("\nApplication data:\n");
        if let Some(frames) = &self.frames {
            dump_fragment(&mut out, frames.root(), 1, &clip);
        }
        out
    }

    fn warn(&mut self, msg: impl Into<String>) {
        if self.log_suppressed == 0 {
            let suffix = self.log_suffix();
            self.err.warning(self.instr_pos.clone(), format!("Runtime: {}{suffix}", msg.into()));
        }
    }

    fn error(&mut self, msg: impl Into<String>) {
        if self.log_suppressed == 0 {
            self.err.error(self.instr_pos.clone(), format!("Runtime: {}", msg.into()));
        }
    }

    fn log_suffix(&self) -> String {
        match &self.frames {
            Some(frames) => format!(
                " [open_frags={}, iteration={}/{}]",
                frames.current_path(),
                frames.current_list_i(),
                frames.current_list_size()
            ),
            None => String::new(),
        }
    }
}

fn builtin_name(which: FragBuiltin) -> &'static str {
    match which {
        FragBuiltin::Count => "count",
        FragBuiltin::Index => "index",
        FragBuiltin::First => "first",
        FragBuiltin::Last => "last",
        FragBuiltin::Inner => "inner",
    }
}

/// Value of an iteration builtin at position `i` of `size`.
fn builtin_of_pos(which: FragBuiltin, i: usize, size: usize) -> Value<'static> {
    match which {
        FragBuiltin::Count => Value::Int(size as i64),
        FragBuiltin::Index => Value::Int(i as i64),
        FragBuiltin::First => Value::Int(i64::from(i == 0)),
        FragBuiltin::Last => Value::Int(i64::from(i + 1 == size)),
        FragBuiltin::Inner => Value::Int(i64::from(i > 0 && i + 1 < size)),
    }
}

/// Indented dump of a fragment tree for `<?teng debug?>`.
fn dump_fragment(out: &mut String, frag: &Fragment, indent: usize, clip: &dyn Fn(&str) -> String) {
    use crate::fragment::FragmentValue;
    let pad = "    ".repeat(indent);
    for (name, value) in frag.iter() {
        match value {
            FragmentValue::Int(v) => out.push_str(&format!("{pad}{name}: {v}\n")),
            FragmentValue::Real(v) => out.push_str(&format!("{pad}{name}: {}\n", crate::value::format_real(*v))),
            FragmentValue::String(s) => out.push_str(&format!("{pad}{name}: '{}'\n", clip(s))),
            FragmentValue::Fragment(nested) => {
                out.push_str(&format!("{pad}{name}:\n"));
                dump_fragment(out, nested, indent + 1, clip);
            }
            FragmentValue::List(list) => {
                for (i, item) in list.iter().enumerate() {
                    out.push_str(&format!("{pad}{name}[{i}]:\n"));
                    dump_fragment(out, item, indent + 1, clip);
                }
            }
        }
    }
}
