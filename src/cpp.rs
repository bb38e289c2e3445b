use std::cell::RefCell;
use std::collections::BTreeSet;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast;
use crate::builtins::{Builtins, Lookup, Scope, Usage};
use crate::errors::ErrorHandler;
use crate::lex::{self, is_letter, is_letterd, is_useless, Kind, Token};
use crate::macros::{Macro, MacroMap};
use crate::reader::Reader;

const MAX_INCLUDE_DEPTH: usize = 9_000;

/// Translation phase 4 and the public token surface.
///
/// Four layers of token source data, populated in order 1-4 and drained in
/// order 4-1:
/// 1. The open file stack. Files or memory buffers are lexed for raw tokens.
/// 2. Macros expand into token buffers, which are stacked. Per ISO, a macro
///    may not appear twice in this stack.
/// 3. Rewind operations produce replay buffers, stacked the same way.
/// 4. An active lookahead guard records every returned token for rewind.
pub struct Lexer<'s> {
    cfile: Reader<'s>,
    cfile_searchdir: Option<usize>,
    files: Vec<OpenFile<'s>>,

    open_buffers: Vec<OpenBuffer>,
    /// Cursor into the topmost open buffer.
    buffer_pos: usize,
    /// Frames at or below this index belong to an enclosing argument
    /// pre-expansion and must not be drained by nested reads.
    buffer_floor: usize,

    lookaheads: Vec<Vec<Token>>,
    conditionals: Vec<Condition>,
    at_line_start: bool,
    /// Expression-only mode for `#if`: resolve `defined` and nothing else
    /// special; the AST builder maps leftover identifiers to zero.
    conditional_mode: bool,

    macros: Rc<RefCell<MacroMap>>,
    builtins: Rc<Builtins>,
    herr: Rc<dyn ErrorHandler>,

    visited_files: BTreeSet<PathBuf>,
}

struct OpenFile<'s> {
    reader: Reader<'s>,
    searchdir: Option<usize>,
}

struct OpenBuffer {
    tokens: BufferTokens,
    /// Names the macro this buffer unrolls, for the entered-macro check.
    origin: Option<String>,
    /// Replay verbatim: no re-expansion, no keyword translation.
    is_rewind: bool,
    /// Where the cursor was when a higher frame took over.
    buf_pos: usize,
}

enum BufferTokens {
    /// Borrowed from a macro definition; the handle keeps it alive even if
    /// the table entry is replaced mid-expansion.
    Shared(Rc<Macro>),
    Owned(Vec<Token>),
}

impl OpenBuffer {
    fn tokens(&self) -> &[Token] {
        match &self.tokens {
            BufferTokens::Shared(mac) => &mac.value,
            BufferTokens::Owned(toks) => toks,
        }
    }
}

/// One `#if..#endif` region. `parents_true` records whether a later branch of
/// this chain may still become active: it is cleared the moment one branch is
/// taken, and never set when the enclosing region is itself dead.
struct Condition {
    is_true: bool,
    seen_else: bool,
    parents_true: bool,
}

impl<'s> Lexer<'s> {
    pub fn new(
        input: Reader<'s>,
        macros: Rc<RefCell<MacroMap>>,
        builtins: Rc<Builtins>,
        herr: Rc<dyn ErrorHandler>,
    ) -> Lexer<'s> {
        let mut visited_files = BTreeSet::new();
        visited_files.insert(PathBuf::from(&*input.name));
        Lexer {
            cfile: input,
            cfile_searchdir: None,
            files: Vec::new(),
            open_buffers: Vec::new(),
            buffer_pos: 0,
            buffer_floor: 0,
            lookaheads: Vec::new(),
            conditionals: Vec::new(),
            at_line_start: true,
            conditional_mode: false,
            macros,
            builtins,
            herr,
            visited_files,
        }
    }

    /// A lexer over a pre-made token sequence, sharing the basis lexer's
    /// macro table, builtins, and diagnostic sink. Emits exactly the given
    /// tokens (macro-expanded) and then end-of-code.
    pub fn from_tokens(tokens: Vec<Token>, basis: &Lexer) -> Lexer<'static> {
        let mut lex = Lexer::new(
            Reader::from_string("<expression>", "", false),
            basis.macros.clone(),
            basis.builtins.clone(),
            basis.herr.clone(),
        );
        lex.push_buffer(tokens);
        lex
    }

    fn expression_lexer(&self, tokens: Vec<Token>) -> Lexer<'static> {
        let mut lex = Lexer::from_tokens(tokens, self);
        lex.conditional_mode = true;
        lex
    }

    pub fn error_handler(&self) -> &Rc<dyn ErrorHandler> {
        &self.herr
    }

    /// Every path this lexer has opened, for diagnostics.
    pub fn visited_files(&self) -> &BTreeSet<PathBuf> {
        &self.visited_files
    }

    /// Read one C++ token, with no scope information.
    pub fn get_token(&mut self) -> Token {
        let token = self.preprocess_and_read_token();
        if let Some(buffer) = self.lookaheads.last_mut() {
            buffer.push(token.clone());
        }
        token
    }

    /// Read one C++ token, resolving remaining plain identifiers against the
    /// given scope.
    pub fn get_token_in_scope(&mut self, scope: &dyn Scope) -> Token {
        let mut token = self.get_token();
        if token.kind == Kind::Identifier {
            match scope.look_up(&token.content) {
                Some(Lookup::Type(def)) => token.kind = Kind::Declarator(def),
                Some(Lookup::Other) => token.kind = Kind::Definition,
                None => {}
            }
        }
        token
    }

    /// Begin unbounded lookahead. Tokens read while the guard lives are
    /// recorded; `rewind` replays them, and dropping the guard without
    /// rewinding hands them to any enclosing guard.
    pub fn look_ahead(&mut self) -> LookAhead<'_, 's> {
        self.lookaheads.push(Vec::new());
        let depth = self.lookaheads.len();
        LookAhead { lex: self, depth }
    }

    /// Inject a pre-made token sequence to be emitted next.
    pub fn push_buffer(&mut self, tokens: Vec<Token>) {
        self.push_frame(OpenBuffer {
            tokens: BufferTokens::Owned(tokens),
            origin: None,
            is_rewind: false,
            buf_pos: 0,
        });
    }

    /// Inject an already-preprocessed token sequence, replayed verbatim.
    pub fn push_rewind_buffer(&mut self, tokens: Vec<Token>) {
        self.push_frame(OpenBuffer {
            tokens: BufferTokens::Owned(tokens),
            origin: None,
            is_rewind: true,
            buf_pos: 0,
        });
    }

    fn push_frame(&mut self, frame: OpenBuffer) {
        if let Some(top) = self.open_buffers.last_mut() {
            top.buf_pos = self.buffer_pos;
        }
        self.open_buffers.push(frame);
        self.buffer_pos = 0;
    }

    fn pop_buffer(&mut self) {
        self.open_buffers.pop();
        self.buffer_pos = self.open_buffers.last().map_or(0, |b| b.buf_pos);
    }

    /// Return to the file that included the current one. True means nothing
    /// is left to pop and lexing is over.
    fn pop_file(&mut self) -> bool {
        if !self.open_buffers.is_empty() {
            self.herr.error_at(
                &self.cfile.position(),
                "internal error: popping a file while token buffers remain open",
            );
        }
        match self.files.pop() {
            Some(of) => {
                self.cfile = of.reader;
                self.cfile_searchdir = of.searchdir;
                false
            }
            None => true,
        }
    }

    fn preprocess_and_read_token(&mut self) -> Token {
        loop {
            if self.herr.fatal() {
                return Token::end_of_code(self.cfile.position());
            }

            if !self.open_buffers.is_empty() {
                let top = self.open_buffers.last().unwrap();
                let tokens = top.tokens();
                if self.buffer_pos >= tokens.len() {
                    self.pop_buffer();
                    continue;
                }
                let is_rewind = top.is_rewind;
                let mut token = tokens[self.buffer_pos].clone();
                self.buffer_pos += 1;

                if is_rewind {
                    return token;
                }
                if self.conditional_mode && token.is_identifier("defined") {
                    return self.resolve_defined(token);
                }
                if token.kind == Kind::Identifier && self.handle_macro(&mut token) {
                    continue;
                }
                return token;
            }

            let mut token = lex::read_token(&mut self.cfile, &*self.herr);
            while token.kind == Kind::Newline {
                self.at_line_start = true;
                token = lex::read_token(&mut self.cfile, &*self.herr);
            }
            match token.kind {
                Kind::Identifier => {
                    self.at_line_start = false;
                    if self.handle_macro(&mut token) {
                        continue;
                    }
                    return token;
                }
                Kind::Hash => {
                    if self.at_line_start {
                        self.handle_preprocessor();
                        continue;
                    }
                    self.herr.error_at(&token.pos, "Stray '#' in program");
                    continue;
                }
                Kind::Paste => {
                    if self.at_line_start {
                        self.herr.error_at(&token.pos, "Extraneous '#' ignored");
                        self.handle_preprocessor();
                        continue;
                    }
                    self.herr.error_at(&token.pos, "Stray '##' in program");
                    continue;
                }
                Kind::EndOfCode => {
                    if self.pop_file() {
                        if !self.conditionals.is_empty() {
                            self.herr.error_at(&token.pos, "Expected #endif before end of code");
                            self.conditionals.clear();
                        }
                        return token;
                    }
                    self.at_line_start = true;
                    continue;
                }
                _ => {
                    self.at_line_start = false;
                    return token;
                }
            }
        }
    }

    /// `defined X` / `defined(X)` inside a conditional expression. The
    /// operand is read raw; it must not expand.
    fn resolve_defined(&mut self, origin: Token) -> Token {
        let zero = |pos| Token::new(Kind::Decimal, pos, "0");
        let mut token = match self.next_buffered_raw() {
            Some(t) => t,
            None => {
                self.herr.error_at(&origin.pos, "Expected identifier after `defined`");
                return zero(origin.pos);
            }
        };
        let mut paren = false;
        if token.kind == Kind::LeftParen {
            paren = true;
            token = match self.next_buffered_raw() {
                Some(t) => t,
                None => {
                    self.herr.error_at(&origin.pos, "Expected identifier after `defined`");
                    return zero(origin.pos);
                }
            };
        }
        if token.kind != Kind::Identifier {
            self.herr.error_at(&token.pos, "Expected identifier after `defined`");
            return zero(origin.pos);
        }
        let defined = self.macros.borrow().contains_key(&*token.content);
        if paren {
            match self.next_buffered_raw() {
                Some(t) if t.kind == Kind::RightParen => {}
                _ => self.herr.error_at(&token.pos, "Expected `)` after `defined` operand"),
            }
        }
        Token::new(Kind::Decimal, origin.pos, if defined { "1" } else { "0" })
    }

    fn next_buffered_raw(&mut self) -> Option<Token> {
        while let Some(top) = self.open_buffers.last() {
            let tokens = top.tokens();
            if self.buffer_pos < tokens.len() {
                let token = tokens[self.buffer_pos].clone();
                self.buffer_pos += 1;
                return Some(token);
            }
            if self.open_buffers.len() <= self.buffer_floor {
                return None;
            }
            self.pop_buffer();
        }
        None
    }

    /// Check whether a macro is somewhere on the expansion stack; ISO forbids
    /// re-entering it before its frame is popped.
    fn inside_macro(&self, name: &str) -> bool {
        self.open_buffers.iter().any(|b| b.origin.as_deref() == Some(name))
    }

    /// Resolve an identifier: macro expansion, then keyword, declarator, and
    /// kludge translation. True means a macro was entered and the caller
    /// should fetch the next token instead.
    fn handle_macro(&mut self, token: &mut Token) -> bool {
        let name = token.content.clone();

        let mac = self.macros.borrow().get(&*name).cloned();
        if let Some(mac) = mac {
            if !self.inside_macro(&name) {
                if mac.is_function() {
                    if self.parse_macro_function(&mac) {
                        return true;
                    }
                } else {
                    self.enter_macro(&mac);
                    return true;
                }
            }
        }

        if let Some(&kw) = self.builtins.keywords.get(&*name) {
            token.kind = Kind::Keyword(kw);
            return false;
        }
        if let Some(def) = self.builtins.declarators.get(&*name) {
            token.kind = match def.usage {
                Usage::Primitive => Kind::Declarator(def.clone()),
                Usage::Flag => Kind::DecFlag(def.clone()),
            };
            return false;
        }

        let kludge = self.builtins.kludges.get(&*name).cloned();
        if let Some(mac) = kludge {
            if mac.is_function() {
                if self.parse_macro_function(&mac) {
                    return true;
                }
            } else {
                self.enter_macro(&mac);
                return true;
            }
        }

        false
    }

    /// Enter an object-like macro, if it has any content.
    fn enter_macro(&mut self, mac: &Rc<Macro>) {
        if mac.value.is_empty() {
            return;
        }
        self.push_frame(OpenBuffer {
            tokens: BufferTokens::Shared(mac.clone()),
            origin: Some(mac.name.clone()),
            is_rewind: false,
            buf_pos: 0,
        });
    }

    /// Parse the actuals of a function-like macro call and push its
    /// expansion. The cursor is just past the macro name; when no `(`
    /// follows, nothing is consumed and false is returned so the name lexes
    /// as a plain identifier.
    fn parse_macro_function(&mut self, mac: &Rc<Macro>) -> bool {
        if !self.peek_lparen() {
            return false;
        }
        let actuals = match self.parse_macro_params(mac) {
            Some(actuals) => actuals,
            None => return false,
        };
        self.at_line_start = false;

        let mut expanded = Vec::with_capacity(actuals.len());
        for (i, actual) in actuals.iter().enumerate() {
            if mac.param_needs_expansion(i) {
                expanded.push(self.expand_actual(actual.clone()));
            } else {
                expanded.push(Vec::new());
            }
        }

        log::trace!("expanding macro function {}", mac.name);
        let tokens = mac.substitute_and_unroll(&actuals, &expanded, &*self.herr);
        if tokens.is_empty() {
            return true;
        }
        self.push_frame(OpenBuffer {
            tokens: BufferTokens::Owned(tokens),
            origin: Some(mac.name.clone()),
            is_rewind: false,
            buf_pos: 0,
        });
        true
    }

    /// Consume the `(` opening a macro call, looking past whitespace and
    /// newlines. Restores the reader when there is none.
    fn peek_lparen(&mut self) -> bool {
        while let Some(top) = self.open_buffers.last() {
            let tokens = top.tokens();
            if self.buffer_pos < tokens.len() {
                if tokens[self.buffer_pos].kind == Kind::LeftParen {
                    self.buffer_pos += 1;
                    return true;
                }
                return false;
            }
            if self.open_buffers.len() <= self.buffer_floor {
                return false;
            }
            self.pop_buffer();
        }
        if self.buffer_floor > 0 {
            return false;
        }

        let (pos, lnum, lpos) = (self.cfile.pos, self.cfile.lnum, self.cfile.lpos);
        loop {
            self.cfile.skip_whitespace();
            if self.cfile.at_newline() {
                self.cfile.take_newline();
                continue;
            }
            break;
        }
        if self.cfile.at() == b'(' {
            self.cfile.advance();
            return true;
        }
        self.cfile.pos = pos;
        self.cfile.lnum = lnum;
        self.cfile.lpos = lpos;
        false
    }

    /// Collect macro actuals per ISO: commas at depth one separate arguments
    /// until every slot is filled; a variadic macro's surplus joins the
    /// `__VA_ARGS__` slot, commas included.
    fn parse_macro_params(&mut self, mac: &Macro) -> Option<Vec<Vec<Token>>> {
        let slots = mac.slots();
        let mut args: Vec<Vec<Token>> = Vec::new();
        let mut too_many = 0usize;
        let mut depth = 1usize;
        loop {
            let token = match self.raw_param_token() {
                Some(token) => token,
                None => {
                    self.herr.error_at(
                        &self.cfile.position(),
                        &format!("Unterminated parameters to macro function `{}`", mac.name),
                    );
                    return None;
                }
            };
            match token.kind {
                Kind::LeftParen => depth += 1,
                Kind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Kind::Comma if depth == 1 => {
                    if args.is_empty() {
                        args.push(Vec::new());
                    }
                    if args.len() < slots {
                        args.push(Vec::new());
                        continue;
                    }
                    if !mac.is_variadic {
                        too_many += 1;
                    }
                }
                _ => {}
            }
            if args.is_empty() {
                args.push(Vec::new());
            }
            args.last_mut().unwrap().push(token);
        }

        if too_many > 0 {
            self.herr.error_at(
                &self.cfile.position(),
                &format!(
                    "Too many arguments to macro function `{}`; expected {} but got {}",
                    mac.name,
                    slots,
                    slots + too_many
                ),
            );
        }
        if args.is_empty() && slots > 0 {
            args.push(Vec::new());
        }
        let missing = slots.saturating_sub(args.len());
        if missing > mac.is_variadic as usize {
            self.herr.error_at(
                &self.cfile.position(),
                &format!(
                    "Too few arguments to macro function `{}`; expected {} but got {}",
                    mac.name,
                    slots,
                    args.len()
                ),
            );
        }
        while args.len() < slots {
            args.push(Vec::new());
        }
        Some(args)
    }

    /// One raw token for argument collection: no expansion, newlines skipped,
    /// never crossing a file boundary or the buffer floor.
    fn raw_param_token(&mut self) -> Option<Token> {
        loop {
            if let Some(top) = self.open_buffers.last() {
                let tokens = top.tokens();
                if self.buffer_pos < tokens.len() {
                    let token = tokens[self.buffer_pos].clone();
                    self.buffer_pos += 1;
                    return Some(token);
                }
                if self.open_buffers.len() <= self.buffer_floor {
                    return None;
                }
                self.pop_buffer();
                continue;
            }
            if self.buffer_floor > 0 {
                return None;
            }
            let token = lex::read_token(&mut self.cfile, &*self.herr);
            match token.kind {
                Kind::Newline => continue,
                Kind::EndOfCode => return None,
                _ => return Some(token),
            }
        }
    }

    /// Fully macro-expand one actual under normal facade rules, confined to
    /// its own buffer frames: a call left open at the end of the actual is
    /// not completed from the surrounding text.
    fn expand_actual(&mut self, tokens: Vec<Token>) -> Vec<Token> {
        if tokens.is_empty() {
            return tokens;
        }
        let floor = self.open_buffers.len();
        let saved_floor = mem::replace(&mut self.buffer_floor, floor);
        self.push_frame(OpenBuffer {
            tokens: BufferTokens::Owned(tokens),
            origin: None,
            is_rewind: false,
            buf_pos: 0,
        });

        let mut out = Vec::new();
        while self.open_buffers.len() > floor {
            let top = self.open_buffers.last().unwrap();
            let tokens = top.tokens();
            if self.buffer_pos >= tokens.len() {
                self.pop_buffer();
                continue;
            }
            let mut token = tokens[self.buffer_pos].clone();
            self.buffer_pos += 1;
            if token.kind == Kind::Identifier && self.handle_macro(&mut token) {
                continue;
            }
            out.push(token);
        }
        self.buffer_floor = saved_floor;
        out
    }

    // =========================================================================
    // == The preprocessor director ============================================
    // =========================================================================

    /// Interpret one directive. Entered with the reader just past a `#` at
    /// the start of a logical line. While the conditional stack ends in an
    /// inactive region, keeps fast-skipping source and interpreting
    /// conditional directives until the region closes.
    fn handle_preprocessor(&mut self) {
        loop {
            self.cfile.skip_whitespace();
            let spos = self.cfile.tell();
            while is_letterd(self.cfile.at()) {
                if !self.cfile.advance() {
                    break;
                }
            }
            let directive = String::from_utf8_lossy(self.cfile.slice(spos)).into_owned();
            let live = self.conditionals.last().map_or(true, |c| c.is_true);

            match directive.as_str() {
                "define" => self.define_directive(live),
                "undef" => self.undef_directive(live),
                "if" => self.if_directive(live),
                "ifdef" => self.ifdef_directive(live, true),
                "ifndef" => self.ifdef_directive(live, false),
                "elif" | "elifdef" | "elifndef" => self.elif_directive(&directive),
                "else" => self.else_directive(),
                "endif" => self.endif_directive(),
                "include" => self.include_directive(live, false),
                "include_next" => self.include_directive(live, true),
                "error" => {
                    let msg = self.read_preprocessor_args();
                    if live {
                        let pos = self.cfile.position();
                        self.herr.error_at(&pos, &format!("#error {}", msg));
                    }
                }
                "warning" => {
                    let msg = self.read_preprocessor_args();
                    if live {
                        let pos = self.cfile.position();
                        self.herr.warning_at(&pos, &format!("#warning {}", msg));
                    }
                }
                "pragma" => {
                    let arg = self.read_preprocessor_args();
                    if live && arg == "DEBUG_ENTRY_POINT" {
                        log::debug!("#pragma debug entry point at {}", self.cfile.position());
                    }
                }
                "line" | "import" | "using" => {
                    let _ = self.read_preprocessor_args();
                }
                _ => {
                    if !directive.is_empty() && directive.bytes().all(|b| b.is_ascii_digit()) {
                        // GCC linemarker; accepted, ignored.
                        let _ = self.read_preprocessor_args();
                    } else {
                        let pos = self.cfile.position_at(spos);
                        self.herr.error_at(
                            &pos,
                            &format!("Invalid preprocessor directive `#{}`", directive),
                        );
                        let _ = self.read_preprocessor_args();
                    }
                }
            }

            if self.conditionals.last().map_or(true, |c| c.is_true) {
                return;
            }

            // Inactive region: skim for the next '#' at line start.
            let mut line_start = self.cfile.tell() == self.cfile.lpos;
            loop {
                if self.cfile.eof() {
                    self.herr.error_at(
                        &self.cfile.position(),
                        "Expected closing preprocessor conditionals before end of code",
                    );
                    return;
                }
                match self.cfile.at() {
                    b'\n' | b'\r' => {
                        self.cfile.take_newline();
                        line_start = true;
                    }
                    b' ' | b'\t' | b'\x0B' | b'\x0C' => {
                        self.cfile.advance();
                    }
                    b'/' if self.cfile.peek_next() == b'/' => {
                        self.cfile.advance();
                        lex::skip_line_comment(&mut self.cfile);
                    }
                    b'/' if self.cfile.peek_next() == b'*' => {
                        self.cfile.advance();
                        lex::skip_block_comment(&mut self.cfile);
                    }
                    b'#' if line_start => {
                        self.cfile.advance();
                        break;
                    }
                    _ => {
                        self.cfile.advance();
                        line_start = false;
                    }
                }
            }
        }
    }

    fn if_directive(&mut self, live: bool) {
        if !live {
            self.conditionals.push(Condition {
                is_true: false,
                seen_else: false,
                parents_true: false,
            });
            return;
        }
        let mut tokens = Vec::new();
        loop {
            let token = lex::read_token(&mut self.cfile, &*self.herr);
            match token.kind {
                Kind::EndOfCode | Kind::Newline => break,
                _ => tokens.push(token),
            }
        }
        self.at_line_start = true;

        let mut sub = self.expression_lexer(tokens);
        let expression = ast::parse_expression(&mut sub);
        let active = expression.eval(&*self.herr).map_or(false, |v| v.value != 0);
        self.conditionals.push(Condition {
            is_true: active,
            seen_else: false,
            parents_true: !active,
        });
    }

    fn ifdef_directive(&mut self, live: bool, positive: bool) {
        self.cfile.skip_whitespace();
        if !is_letter(self.cfile.at()) {
            let pos = self.cfile.position();
            self.herr.error_at(&pos, "Expected identifier to check against macros");
            self.conditionals.push(Condition {
                is_true: false,
                seen_else: false,
                parents_true: live,
            });
            return;
        }
        let spos = self.cfile.tell();
        while is_letterd(self.cfile.at()) {
            if !self.cfile.advance() {
                break;
            }
        }
        let name = String::from_utf8_lossy(self.cfile.slice(spos)).into_owned();

        if !live {
            self.conditionals.push(Condition {
                is_true: false,
                seen_else: false,
                parents_true: false,
            });
            return;
        }
        let active = self.macros.borrow().contains_key(&name) == positive;
        self.conditionals.push(Condition {
            is_true: active,
            seen_else: false,
            parents_true: !active,
        });
    }

    fn elif_directive(&mut self, directive: &str) {
        match self.conditionals.last_mut() {
            None => {
                let pos = self.cfile.position();
                self.herr
                    .error_at(&pos, &format!("Unexpected #{} directive; no matching #if", directive));
                let _ = self.read_preprocessor_args();
            }
            Some(c) => {
                if c.seen_else {
                    let pos = self.cfile.position();
                    self.herr.error_at(
                        &pos,
                        &format!(
                            "Unexpected #{} directive: matching #if already has an #else",
                            directive
                        ),
                    );
                }
                if c.is_true {
                    // This chain is spent; lock every later branch out.
                    c.is_true = false;
                    c.parents_true = false;
                } else if c.parents_true {
                    self.conditionals.pop();
                    match directive {
                        "elif" => self.if_directive(true),
                        "elifdef" => self.ifdef_directive(true, true),
                        _ => self.ifdef_directive(true, false),
                    }
                }
            }
        }
    }

    fn else_directive(&mut self) {
        match self.conditionals.last_mut() {
            None => {
                let pos = self.cfile.position();
                self.herr.error_at(&pos, "Unexpected #else directive; no matching #if");
            }
            Some(c) => {
                if c.seen_else {
                    let pos = self.cfile.position();
                    self.herr.error_at(
                        &pos,
                        "Unexpected #else directive: matching #if already has an #else",
                    );
                }
                c.is_true = c.parents_true && !c.is_true;
                c.seen_else = true;
            }
        }
    }

    fn endif_directive(&mut self) {
        if self.conditionals.pop().is_none() {
            let pos = self.cfile.position();
            self.herr.error_at(&pos, "Unexpected #endif directive: no open conditionals");
        }
    }

    fn define_directive(&mut self, live: bool) {
        let args = self.read_preprocessor_args();
        if !live {
            return;
        }
        let bytes = args.as_bytes();
        let mut i = 0;
        while i < bytes.len() && is_useless(bytes[i]) {
            i += 1;
        }
        if i >= bytes.len() || !is_letter(bytes[i]) {
            let pos = self.cfile.position();
            self.herr.error_at(&pos, "Expected macro definiendum");
            return;
        }
        let ns = i;
        while i < bytes.len() && is_letterd(bytes[i]) {
            i += 1;
        }
        let name = args[ns..i].to_owned();

        // Function-like only when the '(' hugs the name.
        let mac = if i < bytes.len() && bytes[i] == b'(' {
            i += 1;
            let (params, variadic) = match self.define_parameters(&args, &mut i) {
                Some(parsed) => parsed,
                None => return,
            };
            let value = lex::tokenize(&self.cfile.name.clone(), &args[i..], &*self.herr);
            Macro::function(&name, params, variadic, value, &*self.herr)
        } else {
            while i < bytes.len() && is_useless(bytes[i]) {
                i += 1;
            }
            let value = lex::tokenize(&self.cfile.name.clone(), &args[i..], &*self.herr);
            Macro::object(&name, value)
        };

        if self.inside_macro(&name) {
            let pos = self.cfile.position();
            self.herr
                .warning_at(&pos, &format!("Redefining macro `{}` while it is being expanded", name));
        }
        log::debug!("#define {} at {}", name, self.cfile.position());
        self.macros.borrow_mut().insert(name, Rc::new(mac));
    }

    /// Parse a macro parameter list out of the directive text. On return `i`
    /// is just past the closing parenthesis.
    fn define_parameters(&mut self, args: &str, i: &mut usize) -> Option<(Vec<String>, bool)> {
        let bytes = args.as_bytes();
        let at = |i: usize| bytes.get(i).copied().unwrap_or(0);
        let mut params = Vec::new();
        let mut variadic = false;

        while is_useless(at(*i)) {
            *i += 1;
        }
        if at(*i) != b')' {
            loop {
                if !is_letter(at(*i)) {
                    if at(*i) == b'.' && at(*i + 1) == b'.' && at(*i + 2) == b'.' {
                        variadic = true;
                        *i += 3;
                        while is_useless(at(*i)) {
                            *i += 1;
                        }
                        if at(*i) != b')' {
                            let pos = self.cfile.position();
                            self.herr.error_at(&pos, "Expected end of parameters after variadic");
                            return None;
                        }
                        break;
                    }
                    let pos = self.cfile.position();
                    self.herr.error_at(&pos, "Expected parameter name for macro declaration");
                    return None;
                }
                let si = *i;
                while is_letterd(at(*i)) {
                    *i += 1;
                }
                params.push(args[si..*i].to_owned());

                while is_useless(at(*i)) {
                    *i += 1;
                }
                if at(*i) == b')' {
                    break;
                }
                if at(*i) == b',' {
                    *i += 1;
                    while is_useless(at(*i)) {
                        *i += 1;
                    }
                    continue;
                }
                if at(*i) == b'.' && at(*i + 1) == b'.' && at(*i + 2) == b'.' {
                    variadic = true;
                    *i += 3;
                    while is_useless(at(*i)) {
                        *i += 1;
                    }
                    if at(*i) == b')' {
                        break;
                    }
                    let pos = self.cfile.position();
                    self.herr.error_at(
                        &pos,
                        "Expected closing parenthesis; no parameters allowed after variadic",
                    );
                    return None;
                }
                let pos = self.cfile.position();
                self.herr.error_at(&pos, "Expected comma or closing parenthesis");
                return None;
            }
        }
        *i += 1; // the ')'
        Some((params, variadic))
    }

    fn undef_directive(&mut self, live: bool) {
        if !live {
            return;
        }
        self.cfile.skip_whitespace();
        if !is_letter(self.cfile.at()) {
            let pos = self.cfile.position();
            self.herr.error_at(&pos, "Expected macro identifier to undefine");
            return;
        }
        let spos = self.cfile.tell();
        while is_letterd(self.cfile.at()) {
            if !self.cfile.advance() {
                break;
            }
        }
        let name = String::from_utf8_lossy(self.cfile.slice(spos)).into_owned();
        self.macros.borrow_mut().shift_remove(&name);
    }

    fn include_directive(&mut self, live: bool, include_next: bool) {
        let fnfind = self.read_preprocessor_args();
        if !live {
            return;
        }
        let bytes = fnfind.as_bytes();
        let mut local = false;
        let mut close = b'>';
        if !include_next && bytes.first() == Some(&b'"') {
            local = true;
            close = b'"';
        } else if bytes.first() != Some(&b'<') {
            let pos = self.cfile.position();
            self.herr
                .error_at(&pos, "Expected filename inside <> or \"\" delimiters");
            return;
        }
        let rest = &fnfind[1..];
        let name = match rest.as_bytes().iter().position(|&b| b == close) {
            Some(end) => &rest[..end],
            None => rest,
        };
        if name.is_empty() {
            let pos = self.cfile.position();
            self.herr.error_at(&pos, "Expected filename inside <> or \"\" delimiters");
            return;
        }

        if self.files.len() > MAX_INCLUDE_DEPTH {
            let pos = self.cfile.position();
            self.herr.error_at(
                &pos,
                "Nested include count is over nine thousand; not including another",
            );
            return;
        }

        let mut opened: Option<(Reader<'static>, Option<usize>, PathBuf)> = None;
        let mut searched: Vec<PathBuf> = Vec::new();
        if local {
            let dir = Path::new(&*self.cfile.name)
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .to_path_buf();
            let candidate = dir.join(name);
            match Reader::open(&candidate) {
                Some(reader) => opened = Some((reader, None, candidate)),
                None => searched.push(dir),
            }
        }
        if opened.is_none() {
            let first = if include_next {
                self.cfile_searchdir.map_or(0, |i| i + 1)
            } else {
                0
            };
            for i in first..self.builtins.search_dir_count() {
                let dir = self.builtins.search_dir(i);
                let candidate = dir.join(name);
                if let Some(reader) = Reader::open(&candidate) {
                    opened = Some((reader, Some(i), candidate));
                    break;
                }
                searched.push(dir.to_path_buf());
            }
        }

        match opened {
            Some((reader, searchdir, path)) => {
                log::debug!("including {}", path.display());
                self.visited_files.insert(path);
                let prior = mem::replace(&mut self.cfile, reader);
                let prior_dir = mem::replace(&mut self.cfile_searchdir, searchdir);
                self.files.push(OpenFile { reader: prior, searchdir: prior_dir });
                self.at_line_start = true;
            }
            None => {
                let mut msg = format!("Could not find {}", name);
                for dir in &searched {
                    msg.push_str(&format!("\n  checked {}", dir.display()));
                }
                let pos = self.cfile.position();
                self.herr.error_at(&pos, &msg);
            }
        }
    }

    /// Read the remainder of the directive's logical line as text: splices
    /// removed, comments elided, strings kept intact, trailing whitespace
    /// trimmed. The terminating newline is left for the caller.
    fn read_preprocessor_args(&mut self) -> String {
        loop {
            while matches!(self.cfile.at(), b' ' | b'\t') {
                if !self.cfile.advance() {
                    return String::new();
                }
            }
            if self.cfile.at() == b'/' && self.cfile.peek_next() == b'/' {
                self.cfile.advance();
                lex::skip_line_comment(&mut self.cfile);
                return String::new();
            }
            if self.cfile.at() == b'/' && self.cfile.peek_next() == b'*' {
                self.cfile.advance();
                lex::skip_block_comment(&mut self.cfile);
                continue;
            }
            if self.cfile.at() == b'\\' && matches!(self.cfile.peek_next(), b'\n' | b'\r') {
                self.cfile.advance();
                self.cfile.take_newline();
                continue;
            }
            break;
        }
        if self.cfile.eof() || self.cfile.at_newline() {
            return String::new();
        }

        let mut res = String::new();
        let mut spos = self.cfile.tell();
        while !self.cfile.eof() && !self.cfile.at_newline() {
            match self.cfile.at() {
                b'/' if self.cfile.peek_next() == b'/' => {
                    res.push_str(&String::from_utf8_lossy(self.cfile.slice(spos)));
                    self.cfile.advance();
                    lex::skip_line_comment(&mut self.cfile);
                    spos = self.cfile.tell();
                    break;
                }
                b'/' if self.cfile.peek_next() == b'*' => {
                    res.push_str(&String::from_utf8_lossy(self.cfile.slice(spos)));
                    res.push(' ');
                    self.cfile.advance();
                    lex::skip_block_comment(&mut self.cfile);
                    spos = self.cfile.tell();
                }
                b'"' | b'\'' => {
                    let qc = self.cfile.getc();
                    lex::skip_string(&mut self.cfile, qc, &*self.herr);
                }
                b'\\' if matches!(self.cfile.peek_next(), b'\n' | b'\r') => {
                    res.push_str(&String::from_utf8_lossy(self.cfile.slice(spos)));
                    self.cfile.advance();
                    self.cfile.take_newline();
                    spos = self.cfile.tell();
                }
                _ => {
                    self.cfile.advance();
                }
            }
        }
        res.push_str(&String::from_utf8_lossy(self.cfile.slice(spos)));
        while res.ends_with(|c: char| matches!(c, ' ' | '\t' | '\x0B' | '\x0C')) {
            res.pop();
        }
        res
    }
}

/// RAII lookahead over a [`Lexer`]. Tokens read through the guard (or the
/// lexer it derefs to) are recorded; [`rewind`] splices them back so they are
/// re-emitted; dropping without rewind concatenates the record onto any
/// enclosing guard.
///
/// [`rewind`]: LookAhead::rewind
pub struct LookAhead<'l, 's> {
    lex: &'l mut Lexer<'s>,
    depth: usize,
}

impl<'l, 's> LookAhead<'l, 's> {
    /// Record a token by hand; `get_token` does this automatically.
    pub fn push(&mut self, token: Token) {
        self.lex.lookaheads[self.depth - 1].push(token);
    }

    /// Replay everything recorded so far. The guard stays usable; new reads
    /// keep recording.
    pub fn rewind(&mut self) {
        let buffer = mem::take(&mut self.lex.lookaheads[self.depth - 1]);
        if buffer.is_empty() {
            return;
        }
        self.lex.push_rewind_buffer(buffer);
    }
}

impl<'l, 's> Deref for LookAhead<'l, 's> {
    type Target = Lexer<'s>;
    fn deref(&self) -> &Lexer<'s> {
        &*self.lex
    }
}

impl<'l, 's> DerefMut for LookAhead<'l, 's> {
    fn deref_mut(&mut self) -> &mut Lexer<'s> {
        &mut *self.lex
    }
}

impl<'l, 's> Drop for LookAhead<'l, 's> {
    fn drop(&mut self) {
        if self.lex.lookaheads.len() != self.depth {
            self.lex.herr.error_at(
                &self.lex.cfile.position(),
                "internal error: lookahead buffer is not owned",
            );
            self.lex.lookaheads.truncate(self.depth);
        }
        let buffer = self.lex.lookaheads.pop().unwrap_or_default();
        if let Some(prev) = self.lex.lookaheads.last_mut() {
            if prev.is_empty() {
                *prev = buffer;
            } else {
                prev.extend(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::Lexer;
    use crate::builtins::{Builtins, Kw, Lookup, Scope, Usage};
    use crate::errors::{ErrorHandler, ErrorLog};
    use crate::lex::Kind;
    use crate::macros::MacroMap;
    use crate::reader::Reader;

    struct Fixture {
        herr: Rc<ErrorLog>,
        macros: Rc<RefCell<MacroMap>>,
        builtins: Rc<Builtins>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                herr: Rc::new(ErrorLog::new()),
                macros: Rc::new(RefCell::new(MacroMap::default())),
                builtins: Rc::new(Builtins::cpp()),
            }
        }

        fn with_builtins(builtins: Builtins) -> Fixture {
            Fixture { builtins: Rc::new(builtins), ..Fixture::new() }
        }

        fn lexer<'s>(&self, src: &'s str) -> Lexer<'s> {
            Lexer::new(
                Reader::from_string("<test>", src, false),
                self.macros.clone(),
                self.builtins.clone(),
                self.herr.clone(),
            )
        }
    }

    fn expect(lex: &mut Lexer, expected: &[(Kind, &str)]) {
        for (kind, text) in expected {
            let token = lex.get_token();
            assert_eq!(&token.kind, kind, "at expected lexeme {:?}", text);
            if !text.is_empty() {
                assert_eq!(&*token.content, *text);
            }
        }
        assert_eq!(lex.get_token().kind, Kind::EndOfCode);
    }

    #[test]
    fn object_macro_chains() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define FOO 1\n#define BAR FOO+FOO\nBAR");
        expect(
            &mut lex,
            &[(Kind::Decimal, "1"), (Kind::Plus, "+"), (Kind::Decimal, "1")],
        );
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn concatenation() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define CAT(a,b) a##b\nCAT(foo,bar)");
        expect(&mut lex, &[(Kind::Identifier, "foobar")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn stringize() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define STR(x) #x\nSTR(hello world)");
        expect(&mut lex, &[(Kind::StrLit, "\"hello world\"")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn conditional_expression() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#if 1+1 == 2\nA\n#else\nB\n#endif");
        expect(&mut lex, &[(Kind::Identifier, "A")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn self_reference_blocked() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define X X\nX");
        expect(&mut lex, &[(Kind::Identifier, "X")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn nested_function_call() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define F(x) x+1\nF(F(2))");
        expect(
            &mut lex,
            &[
                (Kind::Decimal, "2"),
                (Kind::Plus, "+"),
                (Kind::Decimal, "1"),
                (Kind::Plus, "+"),
                (Kind::Decimal, "1"),
            ],
        );
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn function_macros_nest_and_mix() {
        let fx = Fixture::new();
        let mut lex = fx.lexer(
            "#define OBJ1 3 * 5\n\
             #define FN0(X) X + 8\n\
             #define FN1(X, Y) ((X) <= (Y) ? (X) : (Y))\n\
             w = FN1(OBJ1, FN0(3));\n",
        );
        expect(
            &mut lex,
            &[
                (Kind::Identifier, "w"),
                (Kind::Eq, "="),
                (Kind::LeftParen, "("),
                (Kind::LeftParen, "("),
                (Kind::Decimal, "3"),
                (Kind::Star, "*"),
                (Kind::Decimal, "5"),
                (Kind::RightParen, ")"),
                (Kind::LtEq, "<="),
                (Kind::LeftParen, "("),
                (Kind::Decimal, "3"),
                (Kind::Plus, "+"),
                (Kind::Decimal, "8"),
                (Kind::RightParen, ")"),
                (Kind::Question, "?"),
                (Kind::LeftParen, "("),
                (Kind::Decimal, "3"),
                (Kind::Star, "*"),
                (Kind::Decimal, "5"),
                (Kind::RightParen, ")"),
                (Kind::Colon, ":"),
                (Kind::LeftParen, "("),
                (Kind::Decimal, "3"),
                (Kind::Plus, "+"),
                (Kind::Decimal, "8"),
                (Kind::RightParen, ")"),
                (Kind::RightParen, ")"),
                (Kind::Semi, ";"),
            ],
        );
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn function_macro_without_parens_is_plain() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define F(x) x\nF;");
        expect(&mut lex, &[(Kind::Identifier, "F"), (Kind::Semi, ";")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn empty_macro_expands_to_nothing() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define NOTHING\nNOTHING x NOTHING");
        expect(&mut lex, &[(Kind::Identifier, "x")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn variadic_macros() {
        let fx = Fixture::new();
        let mut lex = fx.lexer(
            "#define debug(...) fprintf(stderr, __VA_ARGS__)\n\
             #define showlist(...) puts(#__VA_ARGS__)\n\
             debug(\"X = %d\", x);\n\
             showlist(The first, second item.);\n\
             debug(\"flag\");\n",
        );
        expect(
            &mut lex,
            &[
                (Kind::Identifier, "fprintf"),
                (Kind::LeftParen, "("),
                (Kind::Identifier, "stderr"),
                (Kind::Comma, ","),
                (Kind::StrLit, "\"X = %d\""),
                (Kind::Comma, ","),
                (Kind::Identifier, "x"),
                (Kind::RightParen, ")"),
                (Kind::Semi, ";"),
                (Kind::Identifier, "puts"),
                (Kind::LeftParen, "("),
                (Kind::StrLit, "\"The first, second item.\""),
                (Kind::RightParen, ")"),
                (Kind::Semi, ";"),
                (Kind::Identifier, "fprintf"),
                (Kind::LeftParen, "("),
                (Kind::Identifier, "stderr"),
                (Kind::Comma, ","),
                (Kind::StrLit, "\"flag\""),
                (Kind::RightParen, ")"),
                (Kind::Semi, ";"),
            ],
        );
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn too_many_arguments_diagnosed() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define PAIR(a,b) a b\nPAIR(1,2,3)");
        let _ = lex.get_token();
        while lex.get_token().kind != Kind::EndOfCode {}
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn unterminated_arguments_diagnosed() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define F(x) x\nF(1");
        // The call never completes; the name comes back as an identifier.
        let token = lex.get_token();
        assert!(token.is_identifier("F"));
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn conditional_chains() {
        let fx = Fixture::new();
        let mut lex = fx.lexer(
            "#define A 1\n\
             #define B 0\n\
             #if A == B\n\
             abc\n\
             #elif defined(B)\n\
             #ifndef C\n\
             def\n\
             #else\n\
             ghi\n\
             #endif\n\
             #endif\n",
        );
        expect(&mut lex, &[(Kind::Identifier, "def")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn taken_branch_locks_chain() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#if 1\na\n#elif 1\nb\n#else\nc\n#endif\nd");
        expect(&mut lex, &[(Kind::Identifier, "a"), (Kind::Identifier, "d")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn elifdef_and_elifndef() {
        let fx = Fixture::new();
        let mut lex = fx.lexer(
            "#define SET 1\n\
             #if 0\na\n\
             #elifdef MISSING\nb\n\
             #elifndef MISSING\nc\n\
             #else\nd\n\
             #endif\n",
        );
        expect(&mut lex, &[(Kind::Identifier, "c")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn ifdef_else_round_trip() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define X 1\n#ifdef X\nyes\n#else\nno\n#endif");
        expect(&mut lex, &[(Kind::Identifier, "yes")]);

        let fx = Fixture::new();
        let mut lex = fx.lexer("#ifdef X\nyes\n#else\nno\n#endif");
        expect(&mut lex, &[(Kind::Identifier, "no")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn undef_round_trip() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define X 9\nX\n#undef X\nX");
        expect(&mut lex, &[(Kind::Decimal, "9"), (Kind::Identifier, "X")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn redefinition_is_quiet() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define X 1\n#define X 1\nX");
        expect(&mut lex, &[(Kind::Decimal, "1")]);
        assert_eq!(fx.herr.error_count(), 0);
        assert_eq!(fx.herr.warning_count(), 0);
        assert_eq!(fx.macros.borrow().len(), 1);
    }

    #[test]
    fn defined_without_parens() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define Y\n#if defined Y && !defined N\nok\n#endif");
        expect(&mut lex, &[(Kind::Identifier, "ok")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn undefined_identifiers_are_zero() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#if MISSING\na\n#else\nb\n#endif");
        expect(&mut lex, &[(Kind::Identifier, "b")]);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn unbalanced_conditionals_diagnosed() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#if 1\nx\n");
        let _ = lex.get_token();
        assert_eq!(lex.get_token().kind, Kind::EndOfCode);
        assert_eq!(fx.herr.error_count(), 1);

        let fx = Fixture::new();
        let mut lex = fx.lexer("#endif\nx");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn double_else_diagnosed() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#if 0\n#else\nx\n#else\ny\n#endif\n");
        while lex.get_token().kind != Kind::EndOfCode {}
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn error_and_warning_directives() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#error broken build\n#warning odd build\nx");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 1);
        assert_eq!(fx.herr.warning_count(), 1);
    }

    #[test]
    fn inactive_error_is_silent() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#if 0\n#error never\n#endif\nx");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn linemarkers_and_pragmas_accepted() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("# 42 \"x.h\"\n#pragma once\n#line 7 \"y.h\"\nx");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn unknown_directive_diagnosed() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#frobnicate all the things\nx");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn stray_hash_diagnosed() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("a # b");
        let toks = [lex.get_token(), lex.get_token()];
        assert!(toks[0].is_identifier("a"));
        assert!(toks[1].is_identifier("b"));
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn keywords_and_declarators() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("class unsigned int while x");
        assert_eq!(lex.get_token().kind, Kind::Keyword(Kw::Class));
        match lex.get_token().kind {
            Kind::DecFlag(d) => assert_eq!(d.usage, Usage::Flag),
            kind => panic!("expected DecFlag, got {:?}", kind),
        }
        match lex.get_token().kind {
            Kind::Declarator(d) => assert_eq!(d.usage, Usage::Primitive),
            kind => panic!("expected Declarator, got {:?}", kind),
        }
        assert_eq!(lex.get_token().kind, Kind::Keyword(Kw::While));
        assert!(lex.get_token().is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn kludges_vanish() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("__attribute__((packed)) __restrict x");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn scope_resolution() {
        struct OneType;
        impl Scope for OneType {
            fn look_up(&self, name: &str) -> Option<Lookup> {
                match name {
                    "mytype" => Some(Lookup::Type(Rc::new(crate::builtins::Declarator {
                        name: "mytype".into(),
                        usage: Usage::Primitive,
                    }))),
                    "myvar" => Some(Lookup::Other),
                    _ => None,
                }
            }
        }

        let fx = Fixture::new();
        let mut lex = fx.lexer("mytype myvar other");
        let scope = OneType;
        assert!(matches!(lex.get_token_in_scope(&scope).kind, Kind::Declarator(_)));
        assert_eq!(lex.get_token_in_scope(&scope).kind, Kind::Definition);
        assert_eq!(lex.get_token_in_scope(&scope).kind, Kind::Identifier);
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn lookahead_rewind_replays() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("a b c d");
        let first = {
            let mut la = lex.look_ahead();
            let toks = [la.get_token(), la.get_token(), la.get_token()];
            la.rewind();
            toks
        };
        for expected in &first {
            let replay = lex.get_token();
            assert_eq!(replay.kind, expected.kind);
            assert_eq!(replay.content, expected.content);
        }
        assert!(lex.get_token().is_identifier("d"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn lookahead_drop_concatenates() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("a b c d e");
        {
            let mut outer = lex.look_ahead();
            let _ = outer.get_token();
            {
                let mut inner = outer.look_ahead();
                let _ = inner.get_token();
                let _ = inner.get_token();
                // Dropped without rewind: its record joins the outer buffer.
            }
            outer.rewind();
        }
        let kinds: Vec<_> = (0..3).map(|_| lex.get_token().content.to_string()).collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
        assert!(lex.get_token().is_identifier("d"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn rewound_identifiers_do_not_reexpand() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#define ONE 1\nONE two");
        {
            let mut la = lex.look_ahead();
            assert_eq!(la.get_token().kind, Kind::Decimal);
            la.rewind();
        }
        // The replayed token is the already-expanded literal, not the macro.
        assert_eq!(lex.get_token().kind, Kind::Decimal);
        assert!(lex.get_token().is_identifier("two"));
        assert_eq!(fx.herr.error_count(), 0);
    }

    #[test]
    fn push_buffer_emits_tokens() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("");
        let toks = crate::lex::tokenize("<inject>", "x + 1", &*fx.herr);
        lex.push_buffer(toks);
        expect(
            &mut lex,
            &[(Kind::Identifier, "x"), (Kind::Plus, "+"), (Kind::Decimal, "1")],
        );
    }

    #[test]
    fn includes_and_search_order() {
        let base = std::env::temp_dir().join("quarry_cpp_include_test");
        let sys_a = base.join("sys_a");
        let sys_b = base.join("sys_b");
        std::fs::create_dir_all(&sys_a).unwrap();
        std::fs::create_dir_all(&sys_b).unwrap();
        std::fs::write(base.join("main.cc"), "#include \"local.h\"\n#include <dep.h>\nend\n")
            .unwrap();
        std::fs::write(base.join("local.h"), "local\n").unwrap();
        std::fs::write(sys_a.join("dep.h"), "first\n#include_next <dep.h>\n").unwrap();
        std::fs::write(sys_b.join("dep.h"), "second\n").unwrap();

        let mut builtins = Builtins::cpp();
        builtins.add_search_dir(&sys_a);
        builtins.add_search_dir(&sys_b);
        let fx = Fixture::with_builtins(builtins);

        let reader = Reader::open(&base.join("main.cc")).unwrap();
        let mut lex = Lexer::new(reader, fx.macros.clone(), fx.builtins.clone(), fx.herr.clone());
        let texts: Vec<_> = std::iter::from_fn(|| {
            let t = lex.get_token();
            (t.kind != Kind::EndOfCode).then(|| t.content.to_string())
        })
        .collect();
        assert_eq!(texts, vec!["local", "first", "second", "end"]);
        assert_eq!(fx.herr.error_count(), 0);
        // main.cc, local.h, and both dep.h copies.
        assert_eq!(lex.visited_files().len(), 4);

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn missing_include_lists_search_dirs() {
        let fx = Fixture::new();
        let mut lex = fx.lexer("#include <no_such_header.h>\nx");
        let token = lex.get_token();
        assert!(token.is_identifier("x"));
        assert_eq!(fx.herr.error_count(), 1);
    }

    #[test]
    fn macros_shared_between_lexers() {
        let fx = Fixture::new();
        let mut first = fx.lexer("#define SHARED 7\n");
        assert_eq!(first.get_token().kind, Kind::EndOfCode);

        let mut second = fx.lexer("SHARED");
        expect(&mut second, &[(Kind::Decimal, "7")]);
        assert_eq!(fx.herr.error_count(), 0);
    }
}
