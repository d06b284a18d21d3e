//! Compile-time optimization: constant folding of expression subranges
//! and the print-merge peephole.
//!
//! Every value-producing reduction leaves an optimization point behind.
//! An n-ary reduction folds its points into one; when all inputs are
//! optimizable the subrange is handed to the interpreter in eval mode and,
//! on success, replaced by a single `VAL`. The print-merge peephole fuses
//! `VAL PRINT VAL PRINT` into one pair when no recorded address still
//! points into the vanishing range.

use crate::{
    compiler::{BlockKind, Compiler},
    instruction::{Instr, InstrKind},
    position::Pos,
    value::Value,
    vm,
};

/// Marker left behind by each expression reduction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OptPoint {
    /// Address of the subexpression's last instruction.
    pub addr: usize,
    pub optimizable: bool,
}

impl Compiler<'_> {
    /// Notes an optimization point for the just-emitted subexpression.
    pub(crate) fn note_optimization_point(&mut self, optimizable: bool) {
        let addr = self.program.len().saturating_sub(1);
        self.optimization_points.push(OptPoint { addr, optimizable });
    }

    /// Folds the points of an n-ary reduction and tries to evaluate the
    /// covered subrange at compile time. `lazy_evaluated` marks operators
    /// with short-circuit jumps whose arguments need not all be constant.
    pub(crate) fn optimize_expr(&mut self, arity: usize, lazy_evaluated: bool) {
        let mut optimizable = true;
        let mut args_point = self.program.len().saturating_sub(1);
        if arity > 0 {
            for _ in 1..arity {
                optimizable &= self.optimization_points.pop().is_some_and(|p| p.optimizable);
            }
            match self.optimization_points.pop() {
                Some(first) => {
                    args_point = first.addr;
                    optimizable = (optimizable || lazy_evaluated) && first.optimizable;
                }
                None => optimizable = false,
            }
        }

        if optimizable {
            let env = vm::RunEnv {
                program: &self.program,
                dict: self.dict,
                params: self.params,
                encoding: if self.utf8 { "utf-8" } else { "" },
                udf: None,
                error_frags: None,
            };
            match vm::eval(&env, args_point, self.program.len()) {
                Some(result) => {
                    let pos = self.program[args_point].pos.clone();
                    self.program.erase_from(args_point);
                    self.emit(InstrKind::Val { value: result }, pos);
                }
                None => optimizable = false,
            }
        }

        self.note_optimization_point(optimizable);
    }

    /// True when some recorded address points at or after `from`; the
    /// instructions from there on must not be merged away.
    fn are_instrs_protected(&self, from: usize) -> bool {
        if self.branch_addrs.iter().any(|frame| frame.iter().any(|addr| *addr >= from)) {
            return true;
        }
        if self
            .blocks
            .iter()
            .any(|block| matches!(block.kind, BlockKind::If { .. }) && block.start_addr >= from)
        {
            return true;
        }
        self.expr_start_point.addr >= from
    }

    /// Emits `PRINT`, first trying to merge a trailing `VAL PRINT VAL`
    /// triple into a single pair. Escaping is settled eagerly when the two
    /// prints disagree on their escape flag.
    pub(crate) fn generate_print(&mut self, print_escape: bool, pos: Pos) {
        let prgsize = self.program.len();
        if prgsize < 3
            || self.are_instrs_protected(prgsize - 3)
            || !matches!(self.program[prgsize - 1].kind, InstrKind::Val { .. })
            || !matches!(self.program[prgsize - 2].kind, InstrKind::Print { .. })
            || !matches!(self.program[prgsize - 3].kind, InstrKind::Val { .. })
        {
            self.emit(InstrKind::Print { escape: print_escape }, pos);
            return;
        }

        let InstrKind::Print { escape: prev_escape } = self.program[prgsize - 2].kind else {
            unreachable!("matched above");
        };

        // when escaping is deferred to the print, disagreement between the
        // two flags is settled now and the merged print emits raw
        let deferred = self.params.is_print_escape_enabled();
        let second = match &mut self.program[prgsize - 1].kind {
            InstrKind::Val { value } => std::mem::take(value),
            _ => unreachable!("matched above"),
        };
        let (merged_escape, second_text) = if deferred && prev_escape != print_escape {
            let apply = |escape: bool, value: &Value<'_>| {
                if escape && value.is_string_like() {
                    self.escaper.escape(value.string())
                } else {
                    value.printable().into_owned()
                }
            };
            let first = match &self.program[prgsize - 3].kind {
                InstrKind::Val { value } => apply(prev_escape, value),
                _ => unreachable!("matched above"),
            };
            let second = apply(print_escape, &second);
            match &mut self.program[prgsize - 3].kind {
                InstrKind::Val { value } => *value = Value::Str(first),
                _ => unreachable!("matched above"),
            }
            (false, second)
        } else {
            (prev_escape, second.into_printable())
        };

        match &mut self.program[prgsize - 3].kind {
            InstrKind::Val { value } => {
                let mut text = std::mem::take(value).into_printable();
                text.push_str(&second_text);
                *value = Value::Str(text);
            }
            _ => unreachable!("matched above"),
        }
        match &mut self.program[prgsize - 2].kind {
            InstrKind::Print { escape } => *escape = merged_escape,
            _ => unreachable!("matched above"),
        }
        self.program.erase_from(prgsize - 1);
    }

    /// Emits one instruction at the program's end.
    pub(crate) fn emit(&mut self, kind: InstrKind, pos: Pos) -> usize {
        self.program.emit(Instr::new(kind, pos))
    }
}
