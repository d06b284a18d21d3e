//! The template compiler: drives both lexers, parses directives, runs the
//! semantic actions that emit instructions, and invokes the optimizer.
//!
//! Templates compile in a single pass. Level-1 tokens either append text
//! prints or hand a directive body to the level-2 tokenizer; the directive
//! handlers manage the open-frame mirror, the auxiliary address stacks and
//! error recovery. `include` and `extends` push further level-1 lexers.

mod expr;
mod frames;
mod ident;
mod inheritance;
mod optimizer;

use std::sync::Arc;

use frames::OpenFrames;
pub(crate) use optimizer::OptPoint;

use crate::{
    compiler::{
        expr::{Options, Toks},
        ident::{Identifier, SegKind},
        inheritance::{CaptureState, ExtendsState, OverriddenBlocks},
    },
    configuration::Configuration,
    contenttype::{self, EscapeStack},
    dictionary::Dictionary,
    error::ErrorLog,
    formatter::resolve_format,
    fs::Filesystem,
    instruction::{InstrKind, Opcode},
    lex1::{Lex1, Lex1Kind, Lex1Options, Lex1Token},
    lex2::{Lex2, Tok},
    position::Pos,
    program::Program,
    value::Value,
};

/// Start address and position of the expression currently being compiled;
/// error recovery erases back to it.
#[derive(Debug, Clone)]
pub(crate) struct ExprStart {
    pub pos: Pos,
    pub addr: usize,
}

/// Kind of an open non-fragment block directive.
#[derive(Debug)]
pub(crate) enum BlockKind {
    If { seen_else: bool },
    Format,
    Ctype,
}

/// An open `if`/`format`/`ctype` block awaiting its closing directive.
#[derive(Debug)]
pub(crate) struct OpenBlock {
    pub kind: BlockKind,
    pub pos: Pos,
    pub start_addr: usize,
}

/// Work to do when a level-1 lexer is exhausted and popped.
#[derive(Debug)]
pub(crate) enum PopAction {
    None,
    /// Terminate the override subroutine and generate the next chain link.
    ContinueOverrides { name: String, index: usize },
}

#[derive(Debug)]
pub(crate) struct Lex1Entry {
    lexer: Lex1,
    action: PopAction,
}

/// The compilation context; one per compiled template.
pub(crate) struct Compiler<'c> {
    pub program: Program,
    pub err: &'c mut ErrorLog,
    pub dict: &'c Dictionary,
    pub params: &'c Configuration,
    pub fs: &'c dyn Filesystem,
    pub fs_root: String,
    pub utf8: bool,
    lex1_opts: Lex1Options,
    pub lex1_stack: Vec<Lex1Entry>,
    pub open_frames: OpenFrames,
    /// Stack of address stacks: one frame per open expression or `if`
    /// statement, holding unpatched jump addresses.
    pub branch_addrs: Vec<Vec<usize>>,
    /// Per open `case`: the literal labels seen so far, for the duplicate
    /// warning.
    pub case_options: Vec<Vec<(Value<'static>, Pos)>>,
    pub expr_start_point: ExprStart,
    pub optimization_points: Vec<OptPoint>,
    /// Guards one report per grammar error; reset explicitly.
    pub error_occurred: bool,
    pub blocks: Vec<OpenBlock>,
    pub extends: ExtendsState,
    pub overridden: OverriddenBlocks,
    capture: Option<CaptureState>,
    /// Compile-time content-type stack mirroring `ctype` blocks; the print
    /// merge and dictionary folding escape through its top.
    pub escaper: EscapeStack,
}

/// Compiles a template file into a program.
pub(crate) fn compile_file(
    err: &mut ErrorLog,
    dict: &Dictionary,
    params: &Configuration,
    fs: &dyn Filesystem,
    fs_root: &str,
    filename: &str,
    encoding: &str,
    content_type: &str,
) -> Program {
    let mut ctx = Compiler::new(err, dict, params, fs, fs_root, encoding, content_type);
    ctx.load_file(filename, Pos::default());
    ctx.run()
}

/// Compiles an inline template string into a program.
pub(crate) fn compile_string(
    err: &mut ErrorLog,
    dict: &Dictionary,
    params: &Configuration,
    fs: &dyn Filesystem,
    fs_root: &str,
    source: &str,
    encoding: &str,
    content_type: &str,
) -> Program {
    let mut ctx = Compiler::new(err, dict, params, fs, fs_root, encoding, content_type);
    ctx.load_source(source.to_owned(), Pos::default(), PopAction::None);
    ctx.run()
}

impl<'c> Compiler<'c> {
    fn new(
        err: &'c mut ErrorLog,
        dict: &'c Dictionary,
        params: &'c Configuration,
        fs: &'c dyn Filesystem,
        fs_root: &str,
        encoding: &str,
        content_type: &str,
    ) -> Self {
        let utf8 = encoding.eq_ignore_ascii_case("utf-8");
        let initial_ct = contenttype::find(content_type).unwrap_or_else(contenttype::default_descriptor);
        Self {
            program: Program::new(),
            err,
            dict,
            params,
            fs,
            fs_root: fs_root.to_owned(),
            utf8,
            lex1_opts: Lex1Options {
                short_tag: params.is_short_tag_enabled(),
                print_escape: params.is_print_escape_enabled(),
                utf8,
            },
            lex1_stack: Vec::new(),
            open_frames: OpenFrames::new(),
            branch_addrs: Vec::new(),
            case_options: Vec::new(),
            expr_start_point: ExprStart { pos: Pos::default(), addr: 0 },
            optimization_points: Vec::new(),
            error_occurred: false,
            blocks: Vec::new(),
            extends: ExtendsState::default(),
            overridden: OverriddenBlocks::default(),
            capture: None,
            escaper: EscapeStack::new(initial_ct),
        }
    }

    /// Resolves a template path against the filesystem root.
    fn full_path(&self, filename: &str) -> String {
        if filename.starts_with('/') || self.fs_root.is_empty() {
            filename.to_owned()
        } else {
            format!("{}/{filename}", self.fs_root)
        }
    }

    /// Loads a template file and pushes a lexer over it.
    pub(crate) fn load_file(&mut self, filename: &str, incl_pos: Pos) {
        let path = self.full_path(filename);
        match self.fs.read(&path) {
            Ok(source) => {
                let (name, _) = self.program.sources_mut().push(self.fs, &path);
                self.lex1_stack.push(Lex1Entry {
                    lexer: Lex1::new(Arc::from(source.as_str()), Some(name), self.lex1_opts),
                    action: PopAction::None,
                });
            }
            Err(e) => {
                self.err.error(incl_pos, format!("Error reading file '{path}' ({e})"));
            }
        }
    }

    /// Pushes a lexer over an in-memory source (inline templates and
    /// captured override bodies).
    pub(crate) fn load_source(&mut self, source: String, pos: Pos, action: PopAction) {
        let mut lexer = Lex1::new(Arc::from(source.as_str()), pos.filename.clone(), self.lex1_opts);
        // positions of override bodies continue where the capture began
        if pos.lineno > 0 {
            *lexer.position_mut() = pos;
        }
        self.lex1_stack.push(Lex1Entry { lexer, action });
    }

    /// The main compile loop: consumes level-1 tokens until every lexer is
    /// exhausted, then settles unclosed blocks and emits `HALT`.
    fn run(mut self) -> Program {
        self.emit(InstrKind::Noop, Pos::default());

        loop {
            let Some(entry) = self.lex1_stack.last_mut() else { break };
            let token = entry.lexer.next();
            match token.kind {
                Lex1Kind::EndOfInput => self.pop_lexer(),
                Lex1Kind::Error => {
                    let pos = token.pos.clone();
                    self.err.error(pos, token.text);
                }
                _ if self.capture.is_some() => self.capture_token(&token),
                Lex1Kind::Text => self.text_token(token),
                Lex1Kind::Teng => self.directive_token(&token, "<?teng"),
                Lex1Kind::TengShort => self.directive_token(&token, "<?"),
                Lex1Kind::EscExpr => self.expr_token(&token, true),
                Lex1Kind::RawExpr => self.expr_token(&token, false),
                Lex1Kind::Dict => self.dict_token(&token),
            }
        }

        self.finalize();
        self.program
    }

    /// Pops the exhausted lexer, runs its pop action and keeps the print
    /// merge from reaching across source boundaries.
    fn pop_lexer(&mut self) {
        let entry = self.lex1_stack.pop().expect("pop_lexer runs with a lexer on the stack");
        if let Some(capture) = self.capture.take() {
            self.err.error(capture.pos, "The override block crosses the template boundary; discarding it");
        }
        if self.program.back().is_some_and(|instr| instr.opcode() == Opcode::Print) {
            let pos = entry.lexer.position().clone();
            self.emit(InstrKind::Noop, pos);
        }
        match entry.action {
            PopAction::None => {}
            PopAction::ContinueOverrides { name, index } => {
                let pos = entry.lexer.position().clone();
                inheritance::continue_overrides(self, &name, index, pos);
            }
        }
    }

    /// Text chunks print verbatim; inside an extends block they are
    /// ignored.
    fn text_token(&mut self, token: Lex1Token) {
        if self.extends.nesting > 0 {
            if !token.text.trim().is_empty() {
                self.err
                    .warning(token.pos, "Ignoring text placed outside of any block in the extends block");
            }
            return;
        }
        let pos = token.pos;
        self.emit(InstrKind::Val { value: Value::Str(token.text) }, pos.clone());
        self.generate_print(false, pos);
    }

    /// While capturing an override body only block nesting is tracked;
    /// nothing compiles.
    fn capture_token(&mut self, token: &Lex1Token) {
        if !matches!(token.kind, Lex1Kind::Teng | Lex1Kind::TengShort) {
            return;
        }
        let prefix = if token.kind == Lex1Kind::Teng { "<?teng" } else { "<?" };
        let (body, body_pos) = strip_envelope(token, prefix, "?>");
        let mut toks = Toks::new(Lex2::new(body, body_pos));
        match toks.next().tok {
            Tok::Override | Tok::Define if toks.peek().tok == Tok::Block => {
                let capture = self.capture.as_mut().expect("capture_token runs while capturing");
                capture.depth += 1;
            }
            Tok::EndBlock => {
                let capture = self.capture.as_mut().expect("capture_token runs while capturing");
                if capture.depth > 0 {
                    capture.depth -= 1;
                    return;
                }
                let capture = self.capture.take().expect("capture is open");
                let lexer = &self.lex1_stack.last().expect("capturing lexer is on the stack").lexer;
                let raw = lexer.source()[capture.start_offset..token.span.start].to_owned();
                self.overridden.entry(capture.name).or_default().push(inheritance::OverrideBlock {
                    pos: capture.pos,
                    addr: None,
                    raw: Some(raw),
                });
            }
            _ => {}
        }
    }

    /// `${…}` and `%{…}`: compile the expression and print it.
    fn expr_token(&mut self, token: &Lex1Token, escape: bool) {
        if self.extends.nesting > 0 {
            self.err.warning(token.pos.clone(), "Ignoring expression inside the extends block");
            return;
        }
        let opener = if token.kind == Lex1Kind::EscExpr { "${" } else { "%{" };
        let (body, body_pos) = strip_envelope(token, opener, "}");
        let mut toks = Toks::new(Lex2::new(body, body_pos.clone()));
        self.compile_print_expr(&mut toks, body_pos, escape);
    }

    /// Compiles one full expression from `toks` and prints its value,
    /// falling back to `undefined` on grammar errors.
    fn compile_print_expr(&mut self, toks: &mut Toks<'_>, pos: Pos, escape: bool) {
        let valid = self.compile_full_expr(toks, pos.clone());
        if !valid {
            self.err.error(
                pos.clone(),
                "Invalid expression, fix it please; replacing whole expression with undefined value",
            );
        }
        self.generate_print(escape, pos);
    }

    /// Compiles an expression with the whole recovery dance: notes the
    /// start point, pushes a branch frame, and erases the emitted range on
    /// failure (leaving a single `VAL undefined`).
    pub(crate) fn compile_full_expr(&mut self, toks: &mut Toks<'_>, pos: Pos) -> bool {
        let depth = self.optimization_points.len();
        let start_addr = self.program.len();
        self.expr_start_point = ExprStart { pos: pos.clone(), addr: start_addr };
        self.branch_addrs.push(Vec::new());
        self.error_occurred = false;

        let mut valid = expr::compile_expression(self, toks);
        if valid && toks.peek().tok != Tok::End {
            valid = false;
        }
        if !valid {
            self.program.erase_from(start_addr);
            self.emit(InstrKind::Val { value: Value::Undefined }, pos);
            self.error_occurred = false;
        }

        self.branch_addrs.pop();
        self.optimization_points.truncate(depth);
        valid
    }

    /// `#{…}`: dictionary lookup resolved at compile time.
    fn dict_token(&mut self, token: &Lex1Token) {
        if self.extends.nesting > 0 {
            self.err.warning(token.pos.clone(), "Ignoring dictionary lookup inside the extends block");
            return;
        }
        let (body, body_pos) = strip_envelope(token, "#{", "}");
        let key = body.trim();
        let valid_key = !key.is_empty()
            && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
        if !valid_key {
            self.err.warning(body_pos.clone(), "Invalid dictionary key in #{...} statement");
            self.emit(InstrKind::Val { value: Value::Undefined }, body_pos.clone());
            self.generate_print(false, body_pos);
            return;
        }
        self.generate_dict_lookup(key, body_pos.clone());
        self.generate_print(true, body_pos);
    }

    /// Emits the value of a dictionary key: language dictionary first,
    /// configuration second; a missing key warns and becomes its own text.
    pub(crate) fn generate_dict_lookup(&mut self, key: &str, pos: Pos) {
        if let Some(item) = self.dict.lookup(key) {
            let value = Value::Str(item.to_owned());
            self.emit(InstrKind::Val { value }, pos);
        } else if let Some(item) = self.params.dict().lookup(key) {
            let value = Value::Str(item.to_owned());
            self.emit(InstrKind::Val { value }, pos);
        } else {
            self.err.warning(pos.clone(), format!("Dictionary item '{key}' was not found"));
            self.emit(InstrKind::Val { value: Value::Str(key.to_owned()) }, pos);
        }
    }

    /// Dispatches a `<?teng …?>` directive.
    fn directive_token(&mut self, token: &Lex1Token, prefix: &str) {
        let (body, body_pos) = strip_envelope(token, prefix, "?>");
        let mut toks = Toks::new(Lex2::new(body, body_pos.clone()));
        let head = toks.next();
        let pos = head.pos.clone();

        // inside an extends block only the inheritance directives count
        if self.extends.nesting > 0 {
            match head.tok {
                Tok::Override if toks.peek().tok == Tok::Block => {
                    toks.next();
                    self.override_block(&mut toks, token, pos);
                }
                Tok::Extends => {
                    let opts = expr::parse_options(self, &mut toks);
                    inheritance::extends_file(self, pos, option_string(&opts, "file"));
                }
                Tok::EndExtends => {
                    self.expect_end(&mut toks, "endextends");
                    inheritance::close_extends(self, pos);
                }
                Tok::EndBlock => {
                    self.err.warning(pos, "The endblock closes no override block; ignoring it");
                }
                _ => {
                    self.err.warning(pos, "Ignoring directive inside the extends block");
                }
            }
            return;
        }

        match head.tok {
            Tok::Debug => {
                self.expect_end(&mut toks, "debug");
                self.emit(InstrKind::DebugFrag, pos);
            }
            Tok::Bytecode => {
                self.expect_end(&mut toks, "bytecode");
                self.emit(InstrKind::BytecodeFrag, pos);
            }
            Tok::Include => {
                let opts = expr::parse_options(self, &mut toks);
                self.include_file(pos, &opts);
            }
            Tok::Format => {
                let opts = expr::parse_options(self, &mut toks);
                self.open_format(pos, &opts);
            }
            Tok::EndFormat => {
                self.expect_end(&mut toks, "endformat");
                self.close_block(BlockKind::Format, pos);
            }
            Tok::Ctype => self.open_ctype(&mut toks, pos),
            Tok::EndCtype => {
                self.expect_end(&mut toks, "endctype");
                self.close_block(BlockKind::Ctype, pos);
            }
            Tok::Frag => self.open_frag_directive(&mut toks, pos),
            Tok::EndFrag => {
                self.expect_end(&mut toks, "endfrag");
                self.close_frag(pos);
            }
            Tok::If => self.if_directive(&mut toks, pos),
            Tok::Elif => self.elif_directive(&mut toks, pos),
            Tok::Else => {
                self.expect_end(&mut toks, "else");
                self.else_directive(pos);
            }
            Tok::EndIf => {
                self.expect_end(&mut toks, "endif");
                self.endif_directive(pos);
            }
            Tok::Set => self.set_directive(&mut toks, pos),
            Tok::Extends => {
                let opts = expr::parse_options(self, &mut toks);
                inheritance::extends_file(self, pos, option_string(&opts, "file"));
            }
            Tok::EndExtends => {
                self.expect_end(&mut toks, "endextends");
                inheritance::close_extends(self, pos);
            }
            Tok::Define if toks.peek().tok == Tok::Block => {
                toks.next();
                match toks.next().tok {
                    Tok::Ident(name) => {
                        let name = name.to_owned();
                        self.expect_end(&mut toks, "define block");
                        inheritance::note_define_block(self, name, pos);
                    }
                    _ => self.err.warning(pos, "Ignoring define block with invalid block id"),
                }
            }
            Tok::Override if toks.peek().tok == Tok::Block => {
                toks.next();
                self.err.error(
                    pos,
                    "The misplaced override block token, it has to be placed in <?teng extends?> block",
                );
            }
            Tok::EndBlock => {
                self.expect_end(&mut toks, "endblock");
                inheritance::reg_define_block(self, pos);
            }
            Tok::Super => {
                self.expect_end(&mut toks, "super");
                inheritance::call_super(self, pos);
            }
            Tok::End => self.err.error(pos, "Empty teng directive"),
            _ => self.err.error(pos, "Unknown teng directive"),
        }
    }

    /// Starts capturing an override body after `<?teng override block X?>`.
    fn override_block(&mut self, toks: &mut Toks<'_>, token: &Lex1Token, pos: Pos) {
        match toks.next().tok {
            Tok::Ident(name) => {
                let name = name.to_owned();
                self.expect_end(toks, "override block");
                let start_offset = token.span.end;
                self.capture = Some(CaptureState { name, pos, start_offset, depth: 0 });
            }
            _ => self.err.warning(pos, "Ignoring override block with invalid block id"),
        }
    }

    fn expect_end(&mut self, toks: &mut Toks<'_>, what: &str) {
        if toks.peek().tok != Tok::End {
            let pos = toks.peek().pos.clone();
            self.err
                .warning(pos, format!("Ignoring invalid excessive tokens in <?teng {what}?> directive"));
        }
    }

    fn include_file(&mut self, pos: Pos, opts: &Options) {
        let Some(file) = option_string(opts, "file") else {
            self.err.error(pos, "Can't include file; the 'file' option is missing");
            return;
        };
        if self.lex1_stack.len() >= self.params.max_include_depth() as usize {
            self.err.error(pos, "Can't include file; include level is too deep");
            return;
        }
        self.load_file(&file, pos);
    }

    fn open_format(&mut self, pos: Pos, opts: &Options) {
        let mode = match opts.get("space") {
            None => {
                self.err.error(pos.clone(), "Formatting block has no effect; option 'space' is missing");
                None
            }
            Some(value) if !value.is_string_like() => {
                self.err.error(pos.clone(), "Formatting block has no effect; option 'space' is not string");
                None
            }
            Some(value) if value.string().is_empty() => {
                self.err.error(pos.clone(), "Formatting block has no effect; option 'space' is empty");
                None
            }
            Some(value) => match resolve_format(value.string()) {
                Some(mode) => Some(mode),
                None => {
                    self.err.error(
                        pos.clone(),
                        format!("Unsupported value '{}' of 'space' formatting option", value.string()),
                    );
                    None
                }
            },
        };
        let start_addr = self.emit(InstrKind::OpenFormat { mode }, pos.clone());
        self.blocks.push(OpenBlock { kind: BlockKind::Format, pos, start_addr });
    }

    fn open_ctype(&mut self, toks: &mut Toks<'_>, pos: Pos) {
        let descriptor = match toks.next().tok {
            Tok::Str(name) => match contenttype::find(&name) {
                Some(desc) => Some(desc),
                None => {
                    self.err
                        .error(pos.clone(), format!("Invalid content type '{name}'; using top instead"));
                    None
                }
            },
            _ => {
                self.err.error(
                    pos.clone(),
                    "The <?teng ctype?> directive must contain content type name \
                     (e.g. <?teng ctype 'text/html'?>; using top content type instead",
                );
                None
            }
        };
        self.expect_end(toks, "ctype");
        let start_addr = self.emit(InstrKind::OpenCtype { descriptor }, pos.clone());
        self.escaper.push(descriptor.unwrap_or_else(|| self.escaper.top()));
        self.blocks.push(OpenBlock { kind: BlockKind::Ctype, pos, start_addr });
    }

    /// Closes the innermost block of the given kind; a mismatching
    /// innermost block reports the crossing and the directive is ignored.
    fn close_block(&mut self, kind: BlockKind, pos: Pos) {
        let matches_kind = |block: &OpenBlock| {
            matches!(
                (&block.kind, &kind),
                (BlockKind::If { .. }, BlockKind::If { .. })
                    | (BlockKind::Format, BlockKind::Format)
                    | (BlockKind::Ctype, BlockKind::Ctype)
            )
        };
        match self.blocks.last() {
            Some(block) if matches_kind(block) => {
                self.blocks.pop();
                match kind {
                    BlockKind::Format => {
                        self.emit(InstrKind::CloseFormat, pos);
                    }
                    BlockKind::Ctype => {
                        self.escaper.pop();
                        self.emit(InstrKind::CloseCtype, pos);
                    }
                    BlockKind::If { .. } => unreachable!("endif has its own handler"),
                }
            }
            Some(block) => {
                let what = match kind {
                    BlockKind::Format => "endformat",
                    BlockKind::Ctype => "endctype",
                    BlockKind::If { .. } => "endif",
                };
                self.err.error(
                    pos,
                    format!("The {what} crosses the block opened at {}; ignoring it", block.pos),
                );
            }
            None => {
                let what = match kind {
                    BlockKind::Format => "format",
                    BlockKind::Ctype => "ctype",
                    BlockKind::If { .. } => "if",
                };
                self.err.error(pos, format!("The closing directive closes no open {what} block"));
            }
        }
    }

    // ------------------------------------------------------------ if --- //

    fn if_directive(&mut self, toks: &mut Toks<'_>, pos: Pos) {
        self.branch_addrs.push(Vec::new());
        self.blocks.push(OpenBlock {
            kind: BlockKind::If { seen_else: false },
            pos: pos.clone(),
            start_addr: self.program.len(),
        });
        let valid = self.compile_full_expr(toks, pos.clone());
        if !valid {
            self.err.debug(pos.clone(), "Invalid expression in the if statement condition");
        }
        let addr = self.program.len();
        self.curr_branch_addrs().push(addr);
        self.emit(InstrKind::JmpIfNot { offset: 0 }, pos);
    }

    fn elif_directive(&mut self, toks: &mut Toks<'_>, pos: Pos) {
        if !matches!(self.blocks.last(), Some(OpenBlock { kind: BlockKind::If { seen_else: false }, .. })) {
            self.discard_if("Disordered elif/else branches in <?teng if?> statement", pos);
            // consume the condition tokens silently
            while toks.peek().tok != Tok::End {
                toks.next();
            }
            return;
        }
        self.finalize_if_branch(0);
        let addr = self.program.len();
        self.curr_branch_addrs().push(addr);
        self.emit(InstrKind::Jmp { offset: 0 }, pos.clone());

        let valid = self.compile_full_expr(toks, pos.clone());
        if !valid {
            self.err.debug(pos.clone(), "Invalid expression in the elif statement condition");
        }
        let addr = self.program.len();
        self.curr_branch_addrs().push(addr);
        self.emit(InstrKind::JmpIfNot { offset: 0 }, pos);
    }

    fn else_directive(&mut self, pos: Pos) {
        match self.blocks.last_mut() {
            Some(OpenBlock { kind: BlockKind::If { seen_else }, .. }) if !*seen_else => {
                *seen_else = true;
            }
            _ => {
                self.discard_if("Disordered elif/else branches in <?teng if?> statement", pos);
                return;
            }
        }
        self.finalize_if_branch(0);
        let addr = self.program.len();
        self.curr_branch_addrs().push(addr);
        self.emit(InstrKind::Jmp { offset: 0 }, pos);
    }

    fn endif_directive(&mut self, pos: Pos) {
        if !matches!(self.blocks.last(), Some(OpenBlock { kind: BlockKind::If { .. }, .. })) {
            self.close_block(BlockKind::If { seen_else: false }, pos);
            return;
        }
        self.finalize_if_branch(1);
        while let Some(addr) = self.curr_branch_addrs().pop() {
            let target = self.program.len();
            if let InstrKind::Jmp { offset } = &mut self.program[addr].kind {
                *offset = target as i64 - addr as i64 - 1;
            }
        }
        self.emit(InstrKind::Noop, pos);
        self.branch_addrs.pop();
        self.blocks.pop();
    }

    /// Patches the most recent branch jump of the open `if`. `shift` is 1
    /// when the target is the current end, 0 when one more jump is about
    /// to be emitted right here.
    fn finalize_if_branch(&mut self, shift: i64) {
        let Some(addr) = self.curr_branch_addrs().pop() else { return };
        let target = self.program.len() as i64;
        match &mut self.program[addr].kind {
            InstrKind::Jmp { offset } | InstrKind::JmpIfNot { offset } => {
                *offset = target - addr as i64 - shift;
            }
            _ => {}
        }
    }

    /// Abandons the whole open `if` statement after a structural error.
    fn discard_if(&mut self, msg: &str, pos: Pos) {
        self.err.error(pos, format!("{msg}; discarding whole if statement"));
        if let Some(idx) = self
            .blocks
            .iter()
            .rposition(|block| matches!(block.kind, BlockKind::If { .. }))
        {
            let start = self.blocks[idx].start_addr;
            self.program.erase_from(start);
            self.blocks.truncate(idx);
            self.branch_addrs.pop();
        }
    }

    pub(crate) fn curr_branch_addrs(&mut self) -> &mut Vec<usize> {
        if self.branch_addrs.is_empty() {
            self.branch_addrs.push(Vec::new());
        }
        self.branch_addrs.last_mut().expect("branch address stack is not empty")
    }

    // ---------------------------------------------------------- frag --- //

    /// `<?teng frag IDENT?>`: opens every fragment of the path, starting a
    /// new frame when an absolute identifier cannot be made relative.
    fn open_frag_directive(&mut self, toks: &mut Toks<'_>, pos: Pos) {
        let Some(ident) = expr::parse_ident(toks) else {
            self.err.error(
                pos.clone(),
                "The <?teng frag?> directive must contain the frag name (e.g. <?teng frag example?>; \
                 discarding fragment block content",
            );
            let addr = self.program.len();
            let _ = self.open_frames.top_mut().open_frag(String::new(), addr, pos.clone(), false);
            self.emit(InstrKind::OpenFrag { name: String::new(), close_frag_offset: 0 }, pos);
            return;
        };
        self.expect_end(toks, "frag");

        // the error fragment opens through its own instruction
        if ident.segments.len() == 1 && ident.name().kind == SegKind::Error {
            let addr = self.program.len();
            let _ = self.open_frames.top_mut().open_frag("_error".to_owned(), addr, pos.clone(), false);
            if self.params.is_error_fragment_enabled() {
                self.emit(InstrKind::OpenErrorFrag { close_frag_offset: 0 }, pos);
            } else {
                self.emit(InstrKind::OpenFrag { name: "_error".to_owned(), close_frag_offset: 0 }, pos);
            }
            return;
        }

        let mut ident = ident::normalize_prefixed(self, ident);
        if ident.segments.iter().any(|seg| !matches!(seg.kind, SegKind::Name)) {
            self.err.error(pos.clone(), "Invalid fragment identifier; discarding fragment block content");
            let addr = self.program.len();
            let _ = self.open_frames.top_mut().open_frag(String::new(), addr, pos.clone(), false);
            self.emit(InstrKind::OpenFrag { name: String::new(), close_frag_offset: 0 }, pos);
            return;
        }

        // anchor relative identifiers that match some open path
        if ident.relative
            && let Some(addr) = self.open_frames.resolve_relative(&ident)
        {
            ident = self.make_absolute(ident, addr);
        }

        let mut start = 0usize;
        if !ident.relative {
            if self.open_frames.top().is_prefix_of(&ident) {
                start = self.open_frames.top().size();
            } else {
                if self.open_frames.open_frame().is_err() {
                    self.err.fatal(pos.clone(), "The number of open frames exceeded 65535");
                    return;
                }
                self.emit(InstrKind::OpenFrame, pos.clone());
            }
        }

        for i in start..ident.segments.len() {
            let auto_close = i != start;
            let name = ident.segments[i].name.clone();
            let addr = self.program.len();
            if self.open_frames.top_mut().open_frag(name.clone(), addr, pos.clone(), auto_close).is_err() {
                self.err.fatal(pos.clone(), "The number of open frags exceeded 65535");
                return;
            }
            self.emit(InstrKind::OpenFrag { name, close_frag_offset: 0 }, pos.clone());
        }
    }

    /// Rewrites a resolved relative identifier into its absolute form by
    /// prepending the open-fragment prefix of the resolution point.
    fn make_absolute(&self, ident: Identifier, addr: crate::instruction::FragAddress) -> Identifier {
        let frame = self.open_frames.frame_at(addr.frame_offset);
        let path_size = frame.size() - usize::from(addr.frag_offset);
        let ident_prefix = ident.segments.len().saturating_sub(1);
        let root_prefix = path_size.saturating_sub(ident_prefix);
        let mut segments: Vec<ident::Segment> = frame.frags()[..root_prefix]
            .iter()
            .map(|frag| ident::Segment {
                name: frag.name.clone(),
                kind: SegKind::Name,
                pos: ident.pos(),
            })
            .collect();
        segments.extend(ident.segments);
        Identifier { relative: false, segments }
    }

    /// `<?teng endfrag?>`: closes the innermost explicitly opened fragment
    /// together with any auto-opened parents, back-patching the offsets.
    fn close_frag(&mut self, pos: Pos) {
        loop {
            if self.open_frames.top().is_empty() {
                self.err.warning(pos, "Closing frag requested but no one opened!");
                return;
            }
            let frag = self.open_frames.top_mut().close_frag().expect("frame is not empty");
            self.emit(InstrKind::CloseFrag { open_frag_offset: 0 }, pos.clone());
            let close_addr = self.program.len() - 1;
            let routine_len = close_addr as i64 - frag.addr as i64;
            match &mut self.program[frag.addr].kind {
                InstrKind::OpenFrag { close_frag_offset, .. }
                | InstrKind::OpenErrorFrag { close_frag_offset } => *close_frag_offset = routine_len,
                _ => {}
            }
            if let InstrKind::CloseFrag { open_frag_offset } = &mut self.program[close_addr].kind {
                *open_frag_offset = -routine_len;
            }

            // discard blocks opened under an invalid name
            if frag.name.is_empty() {
                self.program.erase_from(frag.addr);
            }

            if self.open_frames.top().is_empty() && self.open_frames.frame_count() > 1 {
                self.open_frames.close_frame();
                self.emit(InstrKind::CloseFrame, pos.clone());
            }

            if !frag.auto_close {
                return;
            }
        }
    }

    // ----------------------------------------------------------- set --- //

    fn set_directive(&mut self, toks: &mut Toks<'_>, pos: Pos) {
        // optional legacy dollar: <?teng set $a = 1?>
        if let Tok::Var(_) = toks.peek().tok {
            self.err.warning(toks.peek().pos.clone(), "Don't use dollar sign here please");
        }
        let Some(ident) = expr::parse_ident(toks) else {
            self.err.error(pos, "Invalid variable identifier; it won't be set");
            return;
        };
        if toks.next().tok != Tok::Assign {
            self.err.error(pos, "Invalid <?teng set?> directive; the '=' is missing");
            return;
        }
        let valid = self.compile_full_expr(toks, pos.clone());
        if !valid {
            self.err.error(pos, "Invalid expression in <?teng set?> directive; nothing set");
            // the recovery value is on the stack; the set consumes it
        }
        ident::generate_set(self, ident);
    }

    // ------------------------------------------------------ finalize --- //

    /// Reports unclosed blocks, closes them with balanced instructions,
    /// and terminates the program.
    fn finalize(&mut self) {
        while let Some(block) = self.blocks.pop() {
            match block.kind {
                BlockKind::If { .. } => {
                    self.err.error(
                        block.pos,
                        "Missing <?teng endif?> closing directive of <?teng if?> statement; \
                         discarding whole if statement",
                    );
                    self.program.erase_from(block.start_addr);
                    self.branch_addrs.pop();
                }
                BlockKind::Format => {
                    self.err.error(
                        block.pos.clone(),
                        "The closing directive of this <?teng format?> directive is missing",
                    );
                    self.emit(InstrKind::CloseFormat, block.pos);
                }
                BlockKind::Ctype => {
                    self.err.error(
                        block.pos.clone(),
                        "The closing directive of this <?teng ctype?> directive is missing",
                    );
                    self.escaper.pop();
                    self.emit(InstrKind::CloseCtype, block.pos);
                }
            }
        }

        while !self.open_frames.top().is_empty() {
            let pos = self
                .open_frames
                .top()
                .frags()
                .last()
                .map(|frag| frag.pos.clone())
                .unwrap_or_default();
            self.err.error(
                pos.clone(),
                "Missing <?teng endfrag?> closing directive of <?teng frag?> statement",
            );
            self.close_frag(pos);
        }

        if self.extends.nesting > 0 {
            self.err.error(self.extends.pos.clone(), "The unclosed <?teng extends?>; ignoring it");
            self.extends.nesting = 0;
        }
        if let Some(define) = self.extends.define_stack.last() {
            let pos = define.pos.clone();
            self.err.error(pos.clone(), "The <?teng define block?> is not closed");
            inheritance::reg_define_block(self, pos);
            self.extends.define_stack.clear();
        }

        self.emit(InstrKind::Halt, Pos::default());

        // an unusable program is cleared entirely
        if self.err.max_level() == crate::error::Level::Fatal {
            self.program.erase_from(0);
        }
    }
}

/// Strips the envelope delimiters off a directive token, returning the
/// body and the position of its first character.
fn strip_envelope<'t>(token: &'t Lex1Token, prefix: &str, suffix: &str) -> (&'t str, Pos) {
    let text = &token.text;
    let start = prefix.len().min(text.len());
    let end = text.len().saturating_sub(suffix.len()).max(start);
    let mut pos = token.pos.clone();
    pos.advance_column(prefix.len() as u32);
    (&text[start..end], pos)
}

/// Reads a string-valued option.
fn option_string(opts: &Options, name: &str) -> Option<String> {
    opts.get(name).map(|value| value.string().to_owned())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fs::InMemoryFilesystem;

    fn compile(source: &str) -> (Program, ErrorLog) {
        let fs = InMemoryFilesystem::new();
        let dict = Dictionary::new();
        let params = Configuration::default();
        let mut err = ErrorLog::new();
        let program = compile_string(&mut err, &dict, &params, &fs, "", source, "utf-8", "");
        (program, err)
    }

    fn opcodes(program: &Program) -> Vec<Opcode> {
        program.iter().map(Instr::opcode).collect()
    }

    use crate::instruction::Instr;

    #[test]
    fn text_compiles_to_val_print_halt() {
        // the trailing no-op stops the print merge at the source boundary
        let (program, err) = compile("hello");
        assert!(err.is_empty(), "{}", err.dump());
        assert_eq!(
            opcodes(&program),
            vec![Opcode::Noop, Opcode::Val, Opcode::Print, Opcode::Noop, Opcode::Halt]
        );
    }

    #[test]
    fn halt_terminates_every_program_exactly_once() {
        for source in ["", "a${x}b", "<?teng frag f?>${y}<?teng endfrag?>"] {
            let (program, _) = compile(source);
            let halts = program.iter().filter(|i| i.opcode() == Opcode::Halt).count();
            assert_eq!(halts, 1, "for {source:?}");
            assert_eq!(program.back().unwrap().opcode(), Opcode::Halt);
        }
    }

    #[test]
    fn constant_expressions_fold_to_single_values() {
        let (program, err) = compile("${1 + 2 * 3}");
        assert!(err.is_empty(), "{}", err.dump());
        assert_eq!(
            opcodes(&program),
            vec![Opcode::Noop, Opcode::Val, Opcode::Print, Opcode::Noop, Opcode::Halt]
        );
        match &program[1].kind {
            InstrKind::Val { value } => assert_eq!(value.integral(), 7),
            other => panic!("expected VAL, got {other:?}"),
        }
    }

    #[test]
    fn adjacent_text_and_dict_prints_merge() {
        // text and compile-time dictionary lookups collapse through the
        // peephole; expression prints stay protected by their start point
        let fs = InMemoryFilesystem::new();
        fs.insert("l.dict", "b bee\n");
        let mut err = ErrorLog::new();
        let dict = Dictionary::load(&fs, &mut err, "l.dict");
        let params = Configuration::default();
        let program = compile_string(&mut err, &dict, &params, &fs, "", "a#{b}", "utf-8", "");
        assert_eq!(
            opcodes(&program),
            vec![Opcode::Noop, Opcode::Val, Opcode::Print, Opcode::Noop, Opcode::Halt]
        );
        match &program[1].kind {
            InstrKind::Val { value } => assert_eq!(value.string(), "abee"),
            other => panic!("expected VAL, got {other:?}"),
        }
    }

    #[test]
    fn expression_prints_do_not_merge_into_earlier_text() {
        let (program, _) = compile("a${'b'}");
        let vals = opcodes(&program).iter().filter(|op| **op == Opcode::Val).count();
        assert_eq!(vals, 2, "the expression value stays behind its own print");
    }

    #[test]
    fn open_close_frag_offsets_are_balanced() {
        let (program, err) = compile("<?teng frag a?>x<?teng frag b?>y<?teng endfrag?><?teng endfrag?>");
        assert!(err.is_empty(), "{}", err.dump());
        let mut stack = Vec::new();
        for (addr, instr) in program.iter().enumerate() {
            match &instr.kind {
                InstrKind::OpenFrag { close_frag_offset, .. } => stack.push((addr, *close_frag_offset)),
                InstrKind::CloseFrag { open_frag_offset } => {
                    let (open_addr, close_offset) = stack.pop().expect("matching open");
                    assert_eq!(close_offset, addr as i64 - open_addr as i64);
                    assert_eq!(*open_frag_offset, -(addr as i64 - open_addr as i64));
                }
                _ => {}
            }
        }
        assert!(stack.is_empty(), "every open fragment is closed");
    }

    #[test]
    fn unresolved_variables_lower_to_runtime_walk() {
        let (program, _) = compile("${a.b.c}");
        let ops = opcodes(&program);
        assert!(ops.contains(&Opcode::PushThisFrag));
        assert!(ops.contains(&Opcode::PushAttr));
        assert!(ops.contains(&Opcode::Repr));
    }

    #[test]
    fn statically_resolved_variables_use_var() {
        let (program, _) = compile("<?teng frag a?>${x}<?teng endfrag?>");
        let ops = opcodes(&program);
        assert!(ops.contains(&Opcode::Var));
        assert!(!ops.contains(&Opcode::PushAttr));
    }

    #[test]
    fn if_jumps_are_patched_within_bounds() {
        let (program, err) =
            compile("<?teng if a?>1<?teng elif b?>2<?teng else?>3<?teng endif?>");
        assert!(err.is_empty(), "{}", err.dump());
        let end = program.len() as i64;
        for (addr, instr) in program.iter().enumerate() {
            let offset = match &instr.kind {
                InstrKind::Jmp { offset } | InstrKind::JmpIfNot { offset } => *offset,
                InstrKind::And { offset } | InstrKind::Or { offset } => *offset,
                _ => continue,
            };
            let target = addr as i64 + offset + 1;
            assert!(target >= 0 && target <= end, "jump at {addr} escapes the program");
        }
    }

    #[test]
    fn invalid_expression_is_replaced_by_undefined() {
        let (program, err) = compile("${1 +}");
        assert_eq!(err.max_level(), crate::error::Level::Error);
        let vals: Vec<_> = program
            .iter()
            .filter_map(|i| match &i.kind {
                InstrKind::Val { value } => Some(value.is_undefined()),
                _ => None,
            })
            .collect();
        assert_eq!(vals, vec![true]);
    }

    #[test]
    fn fatal_compilation_clears_the_program() {
        // a template with no content compiles to the leading noop + halt
        let (program, _) = compile("");
        assert!(program.is_empty() || program.len() == 2);
    }

    #[test]
    fn dict_tokens_resolve_at_compile_time() {
        let fs = InMemoryFilesystem::new();
        fs.insert("l.dict", "greeting hello\n");
        let mut err = ErrorLog::new();
        let dict = Dictionary::load(&fs, &mut err, "l.dict");
        let params = Configuration::default();
        let program = compile_string(&mut err, &dict, &params, &fs, "", "#{greeting}", "utf-8", "");
        assert!(err.is_empty(), "{}", err.dump());
        assert_eq!(
            opcodes(&program),
            vec![Opcode::Noop, Opcode::Val, Opcode::Print, Opcode::Noop, Opcode::Halt]
        );
        match &program[1].kind {
            InstrKind::Val { value } => assert_eq!(value.string(), "hello"),
            other => panic!("expected VAL, got {other:?}"),
        }
    }
}
