//! Template inheritance: `extends`, `define block`, `override block` and
//! `super`.
//!
//! A child template's override bodies are captured verbatim between the
//! opening directive and its `endblock`. After `endextends` the base
//! template is compiled in place; every `define block` there emits a jump
//! over its body, compiles the body as a subroutine ending in `RETURN`,
//! and then generates the chain of captured overrides as further
//! subroutines. The final link is a `CALL` of the most derived override;
//! `super` inside an override calls one link toward the base.

use indexmap::IndexMap;

use crate::{
    compiler::{Compiler, PopAction},
    instruction::InstrKind,
    position::Pos,
};

/// One implementation of a named block: either a `define` compiled in
/// place (with its jump address) or a captured `override` body.
#[derive(Debug)]
pub(crate) struct OverrideBlock {
    pub pos: Pos,
    /// Address of the subroutine's leading `JMP`; set once known.
    pub addr: Option<usize>,
    /// Captured source for overrides; `define` blocks compile in place.
    pub raw: Option<String>,
}

/// Registry of block implementations, in registration order: the most
/// derived overrides first (children parse before their base), the base
/// `define` last.
pub(crate) type OverriddenBlocks = IndexMap<String, Vec<OverrideBlock>>;

/// State of the innermost `<?teng extends?>` block.
#[derive(Debug, Default)]
pub(crate) struct ExtendsState {
    pub nesting: i64,
    pub pos: Pos,
    pub base_file: String,
    /// Address of the next-less-specific implementation while compiling an
    /// override body; `super` calls it.
    pub super_addr: Option<usize>,
    /// Open `define block` records of the base template.
    pub define_stack: Vec<DefineBlock>,
}

/// An open `define block` awaiting its `endblock`.
#[derive(Debug)]
pub(crate) struct DefineBlock {
    pub name: String,
    /// Address of the leading `JMP`.
    pub addr: usize,
    pub pos: Pos,
}

/// Verbatim capture of an override body in progress.
#[derive(Debug)]
pub(crate) struct CaptureState {
    pub name: String,
    pub pos: Pos,
    /// Byte offset of the body start in the capturing lexer's source.
    pub start_offset: usize,
    /// Nesting of further define/override blocks inside the body.
    pub depth: u32,
}

/// Handles `<?teng extends file='…'?>`.
pub(crate) fn extends_file(ctx: &mut Compiler<'_>, pos: Pos, file: Option<String>) {
    ctx.extends.nesting += 1;
    if ctx.extends.nesting > 1 {
        ctx.err.error(
            pos,
            format!(
                "There is already open extends block at {}; ignoring the extends directive",
                ctx.extends.pos
            ),
        );
        return;
    }
    let Some(file) = file else {
        ctx.err.error(pos, "Can't extends template; the 'file' option is missing");
        return;
    };
    if ctx.lex1_stack.len() >= ctx.params.max_include_depth() as usize {
        ctx.err.error(pos, "Can't extends template; include level is too deep");
        return;
    }
    if file.is_empty() {
        ctx.err.warning(pos.clone(), "Can't extends template; the 'file' value empty string");
    }
    ctx.extends.pos = pos;
    ctx.extends.base_file = file;
}

/// Handles `<?teng endextends?>`: leaves the extends block and compiles
/// the base template in place.
pub(crate) fn close_extends(ctx: &mut Compiler<'_>, pos: Pos) {
    if ctx.extends.nesting <= 0 {
        ctx.err.error(pos, "The <?teng endextends?> directive closes nothing");
        return;
    }
    ctx.extends.nesting -= 1;
    if ctx.extends.nesting > 0 {
        return;
    }
    let base_file = std::mem::take(&mut ctx.extends.base_file);
    if base_file.is_empty() {
        return;
    }
    let incl_pos = ctx.extends.pos.clone();
    ctx.load_file(&base_file, incl_pos);
}

/// Handles `<?teng define block NAME?>` in a base template: emits the
/// jump over the body and opens the define record.
pub(crate) fn note_define_block(ctx: &mut Compiler<'_>, name: String, pos: Pos) {
    let addr = ctx.program.len();
    ctx.extends.define_stack.push(DefineBlock { name, addr, pos: pos.clone() });
    ctx.emit(InstrKind::Jmp { offset: 0 }, pos);
}

/// Handles `<?teng endblock?>` closing a `define block`: terminates the
/// base subroutine and generates the whole override chain.
pub(crate) fn reg_define_block(ctx: &mut Compiler<'_>, pos: Pos) {
    let Some(define) = ctx.extends.define_stack.pop() else {
        ctx.err.error(pos, "The misplaced endblock token, it has to be placed in <?teng extends?> block");
        return;
    };
    ctx.emit(InstrKind::Return, pos.clone());
    ctx.overridden
        .entry(define.name.clone())
        .or_default()
        .push(OverrideBlock { pos: define.pos, addr: Some(define.addr), raw: None });
    generate_overrides(ctx, &define.name, 0);
}

/// Generates the `index`-th link of the override chain for `name`.
/// Index 0 is the base implementation; higher indices walk toward the
/// most derived override.
pub(crate) fn generate_overrides(ctx: &mut Compiler<'_>, name: &str, index: usize) {
    let total = match ctx.overridden.get(name) {
        Some(blocks) => blocks.len(),
        None => return,
    };
    let rev = |i: usize| total - 1 - i;

    // the just-finished subroutine's leading jump skips to here
    let cur = rev(index);
    let Some(cur_addr) = ctx.overridden[name][cur].addr else { return };
    let target = ctx.program.len();
    if let InstrKind::Jmp { offset } = &mut ctx.program[cur_addr].kind {
        *offset = target as i64 - cur_addr as i64 - 1;
    }

    if index + 1 == total {
        // the chain is complete; inline execution calls the most derived
        // implementation, and super() makes no sense past this point
        ctx.extends.super_addr = None;
        let pos = ctx.overridden[name][cur].pos.clone();
        ctx.emit(InstrKind::Call { addr: cur_addr }, pos);
        return;
    }

    // super() in the upcoming override body calls the implementation we
    // just finished
    ctx.extends.super_addr = Some(cur_addr);

    let next = rev(index + 1);
    let next_pos = ctx.overridden[name][next].pos.clone();
    let raw = ctx.overridden[name][next].raw.clone().unwrap_or_default();
    ctx.overridden[name][next].addr = Some(ctx.program.len());
    ctx.emit(InstrKind::Jmp { offset: 0 }, next_pos.clone());
    ctx.load_source(
        raw,
        next_pos,
        PopAction::ContinueOverrides { name: name.to_owned(), index: index + 1 },
    );
}

/// Invoked when the lexer compiling an override body is exhausted:
/// terminates the subroutine and continues with the next chain link.
pub(crate) fn continue_overrides(ctx: &mut Compiler<'_>, name: &str, index: usize, pos: Pos) {
    ctx.emit(InstrKind::Return, pos);
    generate_overrides(ctx, name, index);
}

/// Handles `<?teng super?>`.
pub(crate) fn call_super(ctx: &mut Compiler<'_>, pos: Pos) {
    match ctx.extends.super_addr {
        Some(addr) => {
            ctx.emit(InstrKind::Call { addr }, pos);
        }
        None => ctx.err.warning(pos, "There is no open overriding blocks"),
    }
}
