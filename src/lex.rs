use std::fmt;
use std::rc::Rc;

use crate::builtins::{Declarator, Kw};
use crate::errors::ErrorHandler;
use crate::reader::Reader;

/// Where a token came from: file, line, column, and absolute offset.
#[derive(Clone, Debug)]
pub struct Position {
    pub file: Rc<str>,
    pub line: usize,
    pub col: usize,
    pub offset: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// Token kinds. Literal kinds classify only; nothing is converted here.
///
/// `Keyword`, `Declarator`, `DecFlag`, and `Definition` are never produced by
/// the raw tokenizer; they appear once identifier resolution has run.
/// `Param` appears only inside a macro's stored replacement list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Identifier,
    /// A macro parameter reference, marked at definition time.
    Param(u16),

    Decimal,
    Octal,
    Hex,
    Binary,
    Float,
    CharLit,
    StrLit,

    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Semi,
    Comma,
    Scope,
    Colon,
    Ellipsis,
    Dot,
    DotStar,
    Arrow,
    ArrowStar,
    Question,
    Tilde,
    Exclaim,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Amp,
    Pipe,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    CaretEq,
    AmpEq,
    PipeEq,
    EqEq,
    ExclaimEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    LtLt,
    GtGt,
    LtLtEq,
    GtGtEq,
    AmpAmp,
    PipePipe,
    PlusPlus,
    MinusMinus,

    Hash,
    Paste,
    Newline,

    Keyword(Kw),
    Declarator(Rc<Declarator>),
    DecFlag(Rc<Declarator>),
    Definition,

    EndOfCode,
    Invalid,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: Kind,
    pub pos: Position,
    pub content: Rc<str>,
}

impl Token {
    pub fn new(kind: Kind, pos: Position, content: &str) -> Token {
        Token { kind, pos, content: Rc::from(content) }
    }

    pub fn end_of_code(pos: Position) -> Token {
        Token::new(Kind::EndOfCode, pos, "")
    }

    pub fn is_identifier(&self, name: &str) -> bool {
        self.kind == Kind::Identifier && &*self.content == name
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

pub fn is_letter(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

pub fn is_letterd(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

pub fn is_useless(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\x0B' | b'\x0C' | b'\n' | b'\r')
}

fn is_hexdigit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn is_octdigit(b: u8) -> bool {
    matches!(b, b'0'..=b'7')
}

fn is_bindigit(b: u8) -> bool {
    matches!(b, b'0' | b'1')
}

fn token(cfile: &Reader, kind: Kind, spos: usize) -> Token {
    let content = String::from_utf8_lossy(cfile.slice(spos));
    Token { kind, pos: cfile.position_at(spos), content: Rc::from(&*content) }
}

pub(crate) fn skip_line_comment(cfile: &mut Reader) {
    cfile.advance();
    loop {
        if cfile.eof() || cfile.at_newline() {
            return;
        }
        if cfile.at() == b'\\' && matches!(cfile.peek_next(), b'\n' | b'\r') {
            cfile.advance();
            cfile.take_newline();
            continue;
        }
        cfile.advance();
    }
}

pub(crate) fn skip_block_comment(cfile: &mut Reader) {
    // Step past the '*' so "/*/" does not close itself.
    cfile.advance();
    loop {
        if cfile.eof() {
            return;
        }
        if cfile.at_newline() {
            cfile.take_newline();
        } else if cfile.at() == b'*' && cfile.peek_next() == b'/' {
            cfile.skip(2);
            return;
        } else {
            cfile.advance();
        }
    }
}

// Integer-suffix grammar: u|U optionally followed by l|L|ll|LL, or l|L|ll|LL
// optionally followed by u|U. LLu and llU are fine; Llu and lL are not.
fn skip_integer_suffix(cfile: &mut Reader) {
    if cfile.eof() {
        return;
    }
    if matches!(cfile.at(), b'u' | b'U') {
        if !cfile.advance() {
            return;
        }
        if matches!(cfile.at(), b'l' | b'L') {
            let l = cfile.at();
            if cfile.next() == l {
                cfile.advance();
            }
        }
        return;
    }
    let l = cfile.at();
    if l != b'l' && l != b'L' {
        return;
    }
    if !cfile.advance() {
        return;
    }
    if cfile.at() == l && !cfile.advance() {
        return;
    }
    if matches!(cfile.at(), b'u' | b'U') {
        cfile.advance();
    }
}

// Anything word-shaped left at the cursor after a literal is a bad suffix;
// consume it into the token so the stream does not split mid-word.
fn check_literal_tail(cfile: &mut Reader, herr: &dyn ErrorHandler, spos: usize) {
    if !is_letterd(cfile.at()) {
        return;
    }
    while is_letterd(cfile.at()) {
        if !cfile.advance() {
            break;
        }
    }
    herr.error_at(&cfile.position_at(spos), "Malformed suffix on numeric literal");
}

struct StringPrefix {
    valid: bool,
    raw: bool,
}

// Valid prefixes: R, u, u8, U, L, optionally followed by R. The caller only
// tests runs of length <= 2, so u8R never arrives here.
fn parse_string_prefix(pre: &[u8]) -> StringPrefix {
    let mut i = 0;
    if i < pre.len() && pre[i] == b'u' {
        i += 1;
        if i < pre.len() && pre[i] == b'8' {
            i += 1;
        }
    } else if i < pre.len() && matches!(pre[i], b'U' | b'L') {
        i += 1;
    }
    let mut raw = false;
    if i < pre.len() && pre[i] == b'R' {
        raw = true;
        i += 1;
    }
    StringPrefix { valid: i == pre.len(), raw }
}

/// Skip a quoted literal's body. The cursor is at the first content byte;
/// on success it ends just past the closing quote.
pub(crate) fn skip_string(cfile: &mut Reader, qc: u8, herr: &dyn ErrorHandler) -> bool {
    loop {
        if cfile.eof() {
            herr.error_at(&cfile.position(), "Unterminated string literal");
            return false;
        }
        let c = cfile.at();
        if c == qc {
            cfile.advance();
            return true;
        }
        if c == b'\\' {
            cfile.advance();
            if cfile.eof() {
                herr.error_at(&cfile.position(), "Cannot escape the end of the file");
                return false;
            }
            if cfile.at_newline() {
                cfile.take_newline();
            } else {
                cfile.advance();
            }
            continue;
        }
        if matches!(c, b'\n' | b'\r') {
            herr.error_at(&cfile.position(), "Unterminated string literal");
            return false;
        }
        cfile.advance();
    }
}

/// Skip a raw string literal. The cursor is at the opening quote; on success
/// it ends just past the closing quote.
fn skip_rstring(cfile: &mut Reader, herr: &dyn ErrorHandler) -> bool {
    let dpos = cfile.tell() + 1;
    let mut warned = false;
    loop {
        let c = cfile.next();
        if cfile.eof() || matches!(c, b'\n' | b'\r') {
            herr.error_at(&cfile.position(), "Unterminated raw string literal");
            return false;
        }
        if c == b'(' {
            break;
        }
        if matches!(c, b'\\' | b' ' | b'"') && !warned {
            herr.warning_at(
                &cfile.position(),
                "ISO C++ forbids backslash, space, and quote characters \
                 in raw-literal delimiters",
            );
            warned = true;
        }
    }
    let delim = cfile.slice_to(dpos, cfile.tell()).to_vec();
    if delim.len() > 16 && !warned {
        herr.warning_at(&cfile.position(), "Raw-literal delimiter exceeds 16 characters");
    }
    cfile.advance();

    loop {
        if cfile.eof() {
            herr.error_at(&cfile.position(), "Unterminated raw string literal");
            return false;
        }
        if cfile.at() == b')' {
            let end = cfile.tell() + 1;
            if cfile.bytes()[usize::min(end, cfile.len())..].starts_with(&delim)
                && cfile.byte_at(end + delim.len()) == b'"'
            {
                cfile.skip(delim.len() + 2);
                return true;
            }
            cfile.advance();
        } else if cfile.at_newline() {
            cfile.take_newline();
        } else {
            cfile.advance();
        }
    }
}

fn read_number(cfile: &mut Reader, herr: &dyn ErrorHandler, spos: usize) -> Token {
    let mut float = cfile.byte_at(spos) == b'.';
    while cfile.at().is_ascii_digit() {
        cfile.advance();
    }
    if !float && cfile.at() == b'.' {
        float = true;
        cfile.advance();
        while cfile.at().is_ascii_digit() {
            cfile.advance();
        }
    }
    if matches!(cfile.at(), b'e' | b'E') {
        float = true;
        cfile.advance();
        if cfile.at() == b'-' {
            cfile.advance();
        }
        if cfile.eof() {
            herr.error_at(&cfile.position(), "Numeric literal truncated at end of file");
        }
        while cfile.at().is_ascii_digit() {
            cfile.advance();
        }
    }
    if float {
        if matches!(cfile.at(), b'f' | b'F' | b'l' | b'L') {
            cfile.advance();
        }
    } else {
        skip_integer_suffix(cfile);
    }
    check_literal_tail(cfile, herr, spos);
    token(cfile, if float { Kind::Float } else { Kind::Decimal }, spos)
}

/// Extract a single preprocessing token, or a newline token, from the reader.
///
/// Handles ISO translation phases 2 and 3: line splices vanish silently,
/// whitespace and comments separate tokens, and everything else becomes a
/// classified token. No macro awareness, no directive awareness; the caller
/// sees `#`, `##`, and newlines as ordinary tokens. Never crosses the end of
/// the reader; at end-of-code it returns `EndOfCode` forever.
pub fn read_token(cfile: &mut Reader, herr: &dyn ErrorHandler) -> Token {
    cfile.validate(herr);

    loop {
        if cfile.eof() {
            return token(cfile, Kind::EndOfCode, cfile.tell());
        }
        while is_useless(cfile.at()) {
            if cfile.at_newline() {
                let spos = cfile.tell();
                cfile.take_newline();
                return token(cfile, Kind::Newline, spos);
            }
            if !cfile.advance() {
                return token(cfile, Kind::EndOfCode, cfile.tell());
            }
        }

        let spos = cfile.tell();
        match cfile.getc() {
            b'/' => {
                if cfile.at() == b'/' {
                    skip_line_comment(cfile);
                    continue;
                }
                if cfile.at() == b'*' {
                    skip_block_comment(cfile);
                    continue;
                }
                if cfile.take(b'=') {
                    return token(cfile, Kind::SlashEq, spos);
                }
                return token(cfile, Kind::Slash, spos);
            }

            c if is_letter(c) => {
                while !cfile.eof() && is_letterd(cfile.at()) {
                    cfile.advance();
                }
                if cfile.tell() - spos <= 2 && matches!(cfile.at(), b'\'' | b'"') {
                    let quote = cfile.at();
                    let prefix = parse_string_prefix(cfile.slice(spos));
                    if prefix.valid && !(prefix.raw && quote == b'\'') {
                        if prefix.raw {
                            skip_rstring(cfile, herr);
                            return token(cfile, Kind::StrLit, spos);
                        }
                        cfile.advance();
                        skip_string(cfile, quote, herr);
                        let kind = if quote == b'"' { Kind::StrLit } else { Kind::CharLit };
                        return token(cfile, kind, spos);
                    }
                }
                return token(cfile, Kind::Identifier, spos);
            }

            b'0' => {
                if matches!(cfile.at(), b'x' | b'X') {
                    cfile.advance();
                    let dstart = cfile.tell();
                    while is_hexdigit(cfile.at()) {
                        cfile.advance();
                    }
                    if cfile.tell() == dstart {
                        herr.error_at(
                            &cfile.position_at(spos),
                            "Hexadecimal literal has no digits",
                        );
                    }
                    skip_integer_suffix(cfile);
                    check_literal_tail(cfile, herr, spos);
                    return token(cfile, Kind::Hex, spos);
                }
                if matches!(cfile.at(), b'b' | b'B') {
                    cfile.advance();
                    let dstart = cfile.tell();
                    while is_bindigit(cfile.at()) {
                        cfile.advance();
                    }
                    if cfile.tell() == dstart {
                        herr.error_at(&cfile.position_at(spos), "Binary literal has no digits");
                    }
                    skip_integer_suffix(cfile);
                    check_literal_tail(cfile, herr, spos);
                    return token(cfile, Kind::Binary, spos);
                }
                // A lone 0 is an octal literal per ISO.
                while is_octdigit(cfile.at()) {
                    cfile.advance();
                }
                skip_integer_suffix(cfile);
                check_literal_tail(cfile, herr, spos);
                return token(cfile, Kind::Octal, spos);
            }
            b'1'..=b'9' => {
                return read_number(cfile, herr, spos);
            }

            b'"' => {
                if !cfile.take(b'"') {
                    skip_string(cfile, b'"', herr);
                }
                return token(cfile, Kind::StrLit, spos);
            }
            b'\'' => {
                if cfile.at() == b'\'' {
                    herr.error_at(&cfile.position_at(spos), "Zero-length character literal");
                    cfile.advance();
                } else {
                    skip_string(cfile, b'\'', herr);
                }
                return token(cfile, Kind::CharLit, spos);
            }

            b';' => return token(cfile, Kind::Semi, spos),
            b',' => return token(cfile, Kind::Comma, spos),
            b'(' => return token(cfile, Kind::LeftParen, spos),
            b')' => return token(cfile, Kind::RightParen, spos),
            b'[' => return token(cfile, Kind::LeftBracket, spos),
            b']' => return token(cfile, Kind::RightBracket, spos),
            b'{' => return token(cfile, Kind::LeftBrace, spos),
            b'}' => return token(cfile, Kind::RightBrace, spos),
            b'?' => return token(cfile, Kind::Question, spos),
            b'~' => return token(cfile, Kind::Tilde, spos),

            b'+' => {
                let kind = if cfile.take(b'+') {
                    Kind::PlusPlus
                } else if cfile.take(b'=') {
                    Kind::PlusEq
                } else {
                    Kind::Plus
                };
                return token(cfile, kind, spos);
            }
            b'-' => {
                let kind = if cfile.take(b'-') {
                    Kind::MinusMinus
                } else if cfile.take(b'=') {
                    Kind::MinusEq
                } else if cfile.take(b'>') {
                    if cfile.take(b'*') {
                        Kind::ArrowStar
                    } else {
                        Kind::Arrow
                    }
                } else {
                    Kind::Minus
                };
                return token(cfile, kind, spos);
            }
            b'=' => {
                let kind = if cfile.take(b'=') { Kind::EqEq } else { Kind::Eq };
                return token(cfile, kind, spos);
            }
            b'!' => {
                let kind = if cfile.take(b'=') { Kind::ExclaimEq } else { Kind::Exclaim };
                return token(cfile, kind, spos);
            }
            b'*' => {
                let kind = if cfile.take(b'=') { Kind::StarEq } else { Kind::Star };
                return token(cfile, kind, spos);
            }
            b'%' => {
                let kind = if cfile.take(b'=') { Kind::PercentEq } else { Kind::Percent };
                return token(cfile, kind, spos);
            }
            b'^' => {
                let kind = if cfile.take(b'=') { Kind::CaretEq } else { Kind::Caret };
                return token(cfile, kind, spos);
            }
            b'&' => {
                let kind = if cfile.take(b'&') {
                    Kind::AmpAmp
                } else if cfile.take(b'=') {
                    Kind::AmpEq
                } else {
                    Kind::Amp
                };
                return token(cfile, kind, spos);
            }
            b'|' => {
                let kind = if cfile.take(b'|') {
                    Kind::PipePipe
                } else if cfile.take(b'=') {
                    Kind::PipeEq
                } else {
                    Kind::Pipe
                };
                return token(cfile, kind, spos);
            }
            b'<' => {
                let kind = if cfile.take(b'<') {
                    if cfile.take(b'=') {
                        Kind::LtLtEq
                    } else {
                        Kind::LtLt
                    }
                } else if cfile.take(b'=') {
                    Kind::LtEq
                } else {
                    Kind::Lt
                };
                return token(cfile, kind, spos);
            }
            b'>' => {
                let kind = if cfile.take(b'>') {
                    if cfile.take(b'=') {
                        Kind::GtGtEq
                    } else {
                        Kind::GtGt
                    }
                } else if cfile.take(b'=') {
                    Kind::GtEq
                } else {
                    Kind::Gt
                };
                return token(cfile, kind, spos);
            }
            b':' => {
                let kind = if cfile.take(b':') { Kind::Scope } else { Kind::Colon };
                return token(cfile, kind, spos);
            }
            b'.' => {
                if cfile.at().is_ascii_digit() {
                    return read_number(cfile, herr, spos);
                }
                let kind = if cfile.at() == b'.' && cfile.peek_next() == b'.' {
                    cfile.skip(2);
                    Kind::Ellipsis
                } else if cfile.take(b'*') {
                    Kind::DotStar
                } else {
                    Kind::Dot
                };
                return token(cfile, kind, spos);
            }
            b'#' => {
                let kind = if cfile.take(b'#') { Kind::Paste } else { Kind::Hash };
                return token(cfile, kind, spos);
            }

            b'\\' => {
                // Phase 2: a splice disappears without producing a token.
                if cfile.at_newline() {
                    cfile.take_newline();
                    continue;
                }
                herr.error_at(&cfile.position_at(spos), "Stray backslash in program");
                return token(cfile, Kind::Invalid, spos);
            }

            c => {
                herr.error_at(
                    &cfile.position_at(spos),
                    &format!("Unrecognized symbol (char)0x{:02X}", c),
                );
                return token(cfile, Kind::Invalid, spos);
            }
        }
    }
}

/// Tokenize a whole buffer with no preprocessing: no macro expansion, no
/// directive interpretation, and newline tokens dropped. A pure function of
/// `contents`.
pub fn tokenize(name: &str, contents: &str, herr: &dyn ErrorHandler) -> Vec<Token> {
    let mut cfile = Reader::from_string(name, contents, false);
    let mut res = Vec::new();
    loop {
        let tok = read_token(&mut cfile, herr);
        match tok.kind {
            Kind::EndOfCode => break,
            Kind::Newline => continue,
            _ => res.push(tok),
        }
    }
    res
}
