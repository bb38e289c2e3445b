use crate::builtins::Kw;
use crate::cpp::Lexer;
use crate::errors::ErrorHandler;
use crate::lex::{Kind, Position, Token};

/// A conditional-expression result: 64-bit with C-style signedness tracking.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub unsigned: bool,
    pub value: u64,
}

const ZERO: Value = Value { unsigned: false, value: 0 };
const ONE: Value = Value { unsigned: false, value: 1 };

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    BitNot,
    LogicalNot,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    AndAnd,
    OrOr,
    Comma,
}

/// Expression tree for `#if` evaluation. Identifiers that survive macro
/// expansion fold to integer zero at parse time, per ISO.
pub enum Ast {
    Value(Value),
    Error,
    Unary { op: UnaryOp, operand: Box<Ast> },
    Binary { op: BinaryOp, pos: Position, left: Box<Ast>, right: Box<Ast> },
    Ternary { cond: Box<Ast>, then: Box<Ast>, other: Box<Ast> },
}

/// Parse one conditional expression from the (expression-only) lexer.
/// Diagnostics are raised through the lexer's sink; a malformed expression
/// parses to a tree whose evaluation yields `None`.
pub fn parse_expression(lex: &mut Lexer) -> Ast {
    let herr = lex.error_handler().clone();
    let mut token = lex.get_token();
    let ast = parse_binary(lex, &*herr, &mut token, 1);
    if token.kind != Kind::EndOfCode {
        herr.error_at(&token.pos, "Expected end of conditional expression");
    }
    ast
}

fn parse_binary(
    lex: &mut Lexer,
    herr: &dyn ErrorHandler,
    token: &mut Token,
    min_prec: u8,
) -> Ast {
    let mut left = parse_primary(lex, herr, token);
    loop {
        if token.kind == Kind::Question {
            if TERNARY_PREC < min_prec {
                return left;
            }
            *token = lex.get_token();
            let then = parse_binary(lex, herr, token, 1);
            if token.kind == Kind::Colon {
                *token = lex.get_token();
            } else {
                herr.error_at(&token.pos, "Expected `:` in conditional expression");
                return Ast::Error;
            }
            let other = parse_binary(lex, herr, token, TERNARY_PREC);
            left = Ast::Ternary {
                cond: Box::new(left),
                then: Box::new(then),
                other: Box::new(other),
            };
            continue;
        }

        let (op, prec) = match binop(&token.kind) {
            Some(entry) => entry,
            None => return left,
        };
        if prec < min_prec {
            return left;
        }
        let pos = token.pos.clone();
        *token = lex.get_token();

        let right = parse_binary(lex, herr, token, prec + 1);
        left = Ast::Binary { op, pos, left: Box::new(left), right: Box::new(right) };
    }
}

const TERNARY_PREC: u8 = 3;

fn binop(kind: &Kind) -> Option<(BinaryOp, u8)> {
    Some(match kind {
        Kind::Star => (BinaryOp::Mul, 14),
        Kind::Slash => (BinaryOp::Div, 14),
        Kind::Percent => (BinaryOp::Rem, 14),
        Kind::Plus => (BinaryOp::Add, 13),
        Kind::Minus => (BinaryOp::Sub, 13),
        Kind::LtLt => (BinaryOp::Shl, 12),
        Kind::GtGt => (BinaryOp::Shr, 12),
        Kind::Lt => (BinaryOp::Lt, 10),
        Kind::Gt => (BinaryOp::Gt, 10),
        Kind::LtEq => (BinaryOp::Le, 10),
        Kind::GtEq => (BinaryOp::Ge, 10),
        Kind::EqEq => (BinaryOp::Eq, 9),
        Kind::ExclaimEq => (BinaryOp::Ne, 9),
        Kind::Amp => (BinaryOp::BitAnd, 8),
        Kind::Caret => (BinaryOp::BitXor, 7),
        Kind::Pipe => (BinaryOp::BitOr, 6),
        Kind::AmpAmp => (BinaryOp::AndAnd, 5),
        Kind::PipePipe => (BinaryOp::OrOr, 4),
        Kind::Comma => (BinaryOp::Comma, 1),
        _ => return None,
    })
}

fn parse_primary(lex: &mut Lexer, herr: &dyn ErrorHandler, token: &mut Token) -> Ast {
    match token.kind.clone() {
        Kind::Decimal | Kind::Octal | Kind::Hex | Kind::Binary => {
            let value = integer_value(token, herr);
            *token = lex.get_token();
            Ast::Value(value)
        }
        Kind::Float => {
            herr.error_at(&token.pos, "Floating-point literal in conditional expression");
            *token = lex.get_token();
            Ast::Error
        }
        Kind::CharLit => {
            let value = character_value(token, herr);
            *token = lex.get_token();
            Ast::Value(value)
        }
        Kind::StrLit => {
            herr.error_at(&token.pos, "String literal in conditional expression");
            *token = lex.get_token();
            Ast::Error
        }
        Kind::Identifier | Kind::Definition => {
            // Not a macro, not a keyword: reads as zero.
            *token = lex.get_token();
            Ast::Value(ZERO)
        }
        Kind::Keyword(Kw::True) => {
            *token = lex.get_token();
            Ast::Value(ONE)
        }
        Kind::Keyword(_) | Kind::Declarator(_) | Kind::DecFlag(_) => {
            *token = lex.get_token();
            Ast::Value(ZERO)
        }
        Kind::LeftParen => {
            *token = lex.get_token();
            let inner = parse_binary(lex, herr, token, 1);
            if token.kind == Kind::RightParen {
                *token = lex.get_token();
            } else {
                herr.error_at(&token.pos, "Expected `)` in conditional expression");
                return Ast::Error;
            }
            inner
        }
        Kind::Plus => {
            *token = lex.get_token();
            let operand = parse_binary(lex, herr, token, 15);
            Ast::Unary { op: UnaryOp::Plus, operand: Box::new(operand) }
        }
        Kind::Minus => {
            *token = lex.get_token();
            let operand = parse_binary(lex, herr, token, 15);
            Ast::Unary { op: UnaryOp::Neg, operand: Box::new(operand) }
        }
        Kind::Tilde => {
            *token = lex.get_token();
            let operand = parse_binary(lex, herr, token, 15);
            Ast::Unary { op: UnaryOp::BitNot, operand: Box::new(operand) }
        }
        Kind::Exclaim => {
            *token = lex.get_token();
            let operand = parse_binary(lex, herr, token, 15);
            Ast::Unary { op: UnaryOp::LogicalNot, operand: Box::new(operand) }
        }
        Kind::EndOfCode => {
            herr.error_at(&token.pos, "Expected expression in conditional");
            Ast::Error
        }
        _ => {
            herr.error_at(&token.pos, "Unexpected token in conditional expression");
            *token = lex.get_token();
            Ast::Error
        }
    }
}

impl Ast {
    /// Evaluate the tree. `None` means the expression was malformed or hit a
    /// live division by zero; `#if` treats that as false.
    pub fn eval(&self, herr: &dyn ErrorHandler) -> Option<Value> {
        self.eval_live(herr, true)
    }

    fn eval_live(&self, herr: &dyn ErrorHandler, live: bool) -> Option<Value> {
        match self {
            Ast::Value(value) => Some(*value),
            Ast::Error => None,

            Ast::Unary { op, operand } => {
                let mut v = operand.eval_live(herr, live)?;
                match op {
                    UnaryOp::Plus => {}
                    UnaryOp::Neg => v.value = (-(v.value as i64)) as u64,
                    UnaryOp::BitNot => v.value = !v.value,
                    UnaryOp::LogicalNot => {
                        v.unsigned = false;
                        v.value = (v.value == 0) as u64;
                    }
                }
                Some(v)
            }

            Ast::Ternary { cond, then, other } => {
                let cond = cond.eval_live(herr, live)?;
                let taken = cond.value != 0;
                let then = then.eval_live(herr, live && taken)?;
                let other = other.eval_live(herr, live && !taken)?;
                Some(Value {
                    unsigned: then.unsigned | other.unsigned,
                    value: if taken { then.value } else { other.value },
                })
            }

            Ast::Binary { op, pos, left, right } => {
                let mut left = left.eval_live(herr, live)?;
                let right_live = match op {
                    BinaryOp::AndAnd if left.value == 0 => false,
                    BinaryOp::OrOr if left.value != 0 => false,
                    _ => live,
                };
                let mut right = right.eval_live(herr, right_live)?;

                let mut unsigned = match op {
                    BinaryOp::Shl | BinaryOp::Shr => left.unsigned,
                    BinaryOp::AndAnd | BinaryOp::OrOr => false,
                    BinaryOp::Comma => right.unsigned,
                    _ => {
                        // Usual promotion: both sides take the wider signedness.
                        let promoted = left.unsigned | right.unsigned;
                        left.unsigned = promoted;
                        right.unsigned = promoted;
                        match op {
                            BinaryOp::Lt
                            | BinaryOp::Gt
                            | BinaryOp::Le
                            | BinaryOp::Ge
                            | BinaryOp::Eq
                            | BinaryOp::Ne => false,
                            _ => promoted,
                        }
                    }
                };

                let value = match op {
                    BinaryOp::Mul => u64::wrapping_mul(left.value, right.value),
                    BinaryOp::Div | BinaryOp::Rem => {
                        if right.value == 0 {
                            if live {
                                herr.error_at(pos, "Division by zero in conditional expression");
                                return None;
                            }
                            0
                        } else if unsigned {
                            match op {
                                BinaryOp::Div => u64::wrapping_div(left.value, right.value),
                                _ => u64::wrapping_rem(left.value, right.value),
                            }
                        } else {
                            let (l, r) = (left.value as i64, right.value as i64);
                            match op {
                                BinaryOp::Div => i64::wrapping_div(l, r) as u64,
                                _ => i64::wrapping_rem(l, r) as u64,
                            }
                        }
                    }
                    BinaryOp::Add => u64::wrapping_add(left.value, right.value),
                    BinaryOp::Sub => u64::wrapping_sub(left.value, right.value),
                    BinaryOp::Shl => {
                        if right.value >= 64 {
                            0
                        } else {
                            left.value << right.value
                        }
                    }
                    BinaryOp::Shr => {
                        let by = if right.value < 64 { right.value } else { 63 };
                        if unsigned {
                            left.value >> by
                        } else {
                            (left.value as i64 >> by) as u64
                        }
                    }
                    BinaryOp::Lt => {
                        if left.unsigned {
                            (left.value < right.value) as u64
                        } else {
                            ((left.value as i64) < (right.value as i64)) as u64
                        }
                    }
                    BinaryOp::Gt => {
                        if left.unsigned {
                            (left.value > right.value) as u64
                        } else {
                            ((left.value as i64) > (right.value as i64)) as u64
                        }
                    }
                    BinaryOp::Le => {
                        if left.unsigned {
                            (left.value <= right.value) as u64
                        } else {
                            ((left.value as i64) <= (right.value as i64)) as u64
                        }
                    }
                    BinaryOp::Ge => {
                        if left.unsigned {
                            (left.value >= right.value) as u64
                        } else {
                            ((left.value as i64) >= (right.value as i64)) as u64
                        }
                    }
                    BinaryOp::Eq => (left.value == right.value) as u64,
                    BinaryOp::Ne => (left.value != right.value) as u64,
                    BinaryOp::BitAnd => left.value & right.value,
                    BinaryOp::BitXor => left.value ^ right.value,
                    BinaryOp::BitOr => left.value | right.value,
                    BinaryOp::AndAnd => (left.value != 0 && right.value != 0) as u64,
                    BinaryOp::OrOr => (left.value != 0 || right.value != 0) as u64,
                    BinaryOp::Comma => {
                        unsigned = right.unsigned;
                        right.value
                    }
                };
                Some(Value { unsigned, value })
            }
        }
    }
}

/// Convert a classified integer literal. Values that overflow a signed 64-bit
/// range promote to unsigned; values that overflow 64 bits wrap with a
/// warning.
fn integer_value(token: &Token, herr: &dyn ErrorHandler) -> Value {
    let text = &*token.content;
    let (radix, digits) = match token.kind {
        Kind::Hex => (16u32, &text[2..]),
        Kind::Binary => (2, &text[2..]),
        Kind::Octal => (8, text),
        _ => (10, text),
    };

    let mut unsigned = false;
    let mut overflow = false;
    let mut acc: u128 = 0;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => {
                acc = acc * radix as u128 + d as u128;
                if acc > u64::MAX as u128 {
                    overflow = true;
                    acc &= u64::MAX as u128;
                }
            }
            None => {
                if matches!(c, 'u' | 'U') {
                    unsigned = true;
                }
                // 'l'/'L' widths do not matter at this width.
            }
        }
    }
    if overflow {
        herr.warning_at(&token.pos, "Integer literal does not fit in 64 bits; value wrapped");
        unsigned = true;
    }
    let value = acc as u64;
    if !unsigned && value > i64::MAX as u64 {
        unsigned = true;
    }
    Value { unsigned, value }
}

/// Convert a character literal: escapes decoded, multi-character constants
/// packed a byte at a time, encoding prefixes read as unsigned.
fn character_value(token: &Token, herr: &dyn ErrorHandler) -> Value {
    let text = &*token.content;
    let mut chars = text.chars().peekable();
    let mut unsigned = false;
    while let Some(&c) = chars.peek() {
        if c == '\'' {
            chars.next();
            break;
        }
        // Encoding prefix (L, u, u8, U).
        unsigned = true;
        chars.next();
    }

    let mut value: u64 = 0;
    let mut count = 0usize;
    while let Some(c) = chars.next() {
        let c = match c {
            '\'' => break,
            '\\' => match chars.next() {
                Some('a') => 0x07,
                Some('b') => 0x08,
                Some('f') => 0x0C,
                Some('n') => b'\n' as u64,
                Some('r') => b'\r' as u64,
                Some('t') => b'\t' as u64,
                Some('v') => 0x0B,
                Some('x') => {
                    let mut v = 0u64;
                    while let Some(d) = chars.peek().and_then(|c| c.to_digit(16)) {
                        v = (v << 4) | d as u64;
                        chars.next();
                    }
                    v
                }
                Some(d @ '0'..='7') => {
                    let mut v = d.to_digit(8).unwrap() as u64;
                    let mut len = 1;
                    while len < 3 {
                        match chars.peek().and_then(|c| c.to_digit(8)) {
                            Some(d) => {
                                v = (v << 3) | d as u64;
                                chars.next();
                                len += 1;
                            }
                            None => break,
                        }
                    }
                    v
                }
                Some(c @ ('\'' | '"' | '?' | '\\')) => c as u64,
                Some(c) => {
                    herr.warning_at(&token.pos, &format!("Unknown escape sequence `\\{}`", c));
                    c as u64
                }
                None => break,
            },
            c => c as u64,
        };
        value = if unsigned { c } else { (value << 8) | c };
        count += 1;
    }

    // A plain single character above 0x7F is a (negative) signed char.
    if !unsigned && count == 1 && value > 0x7F && value <= 0xFF {
        value = value as u8 as i8 as i64 as u64;
    }
    Value { unsigned, value }
}
