use std::rc::Rc;

use indexmap::IndexMap;

use crate::errors::{ErrorHandler, ErrorLog};
use crate::lex::{tokenize, Kind, Position, Token};

/// Name-to-definition table. Shared immutable definitions: redefinition
/// replaces the entry, and any buffer frame still reading the old definition
/// keeps its own handle.
pub type MacroMap = IndexMap<String, Rc<Macro>>;

/// One `#define`. The replacement list is tokenized at definition time, with
/// parameter references rewritten to `Kind::Param` so substitution is linear
/// in the replacement length.
pub struct Macro {
    pub name: String,
    /// `None` for object-like macros.
    pub params: Option<Vec<String>>,
    pub is_variadic: bool,
    pub value: Vec<Token>,
    /// Parameter slots whose actuals are used in fully-expanded form
    /// somewhere in the replacement.
    expanded_params: Vec<bool>,
}

impl Macro {
    pub fn object(name: &str, value: Vec<Token>) -> Macro {
        Macro {
            name: name.to_owned(),
            params: None,
            is_variadic: false,
            value,
            expanded_params: Vec::new(),
        }
    }

    pub fn function(
        name: &str,
        params: Vec<String>,
        is_variadic: bool,
        mut value: Vec<Token>,
        herr: &dyn ErrorHandler,
    ) -> Macro {
        let slots = params.len() + is_variadic as usize;
        for tok in &mut value {
            if tok.kind != Kind::Identifier {
                continue;
            }
            if let Some(p) = params.iter().position(|p| **p == *tok.content) {
                tok.kind = Kind::Param(p as u16);
            } else if &*tok.content == "__VA_ARGS__" {
                if is_variadic {
                    tok.kind = Kind::Param(params.len() as u16);
                } else {
                    herr.error_at(&tok.pos, "__VA_ARGS__ in a macro that is not variadic");
                }
            }
        }

        let mut expanded_params = vec![false; slots];
        for i in 0..value.len() {
            let p = match value[i].kind {
                Kind::Param(p) => p as usize,
                Kind::Hash => {
                    if !matches!(value.get(i + 1).map(|t| &t.kind), Some(Kind::Param(_))) {
                        herr.error_at(
                            &value[i].pos,
                            "'#' is not followed by a macro parameter",
                        );
                    }
                    continue;
                }
                Kind::Paste if i == 0 || i + 1 == value.len() => {
                    herr.error_at(
                        &value[i].pos,
                        "'##' cannot appear at either end of a macro replacement",
                    );
                    continue;
                }
                _ => continue,
            };
            let prev = i.checked_sub(1).map(|i| &value[i].kind);
            let next = value.get(i + 1).map(|t| &t.kind);
            if !matches!(prev, Some(Kind::Hash) | Some(Kind::Paste))
                && !matches!(next, Some(Kind::Paste))
            {
                expanded_params[p] = true;
            }
        }

        Macro { name: name.to_owned(), params: Some(params), is_variadic, value, expanded_params }
    }

    pub fn is_function(&self) -> bool {
        self.params.is_some()
    }

    /// Actual count this macro binds: named parameters plus the synthetic
    /// `__VA_ARGS__` slot when variadic.
    pub fn slots(&self) -> usize {
        self.params.as_ref().map_or(0, |p| p.len()) + self.is_variadic as usize
    }

    /// Whether slot `i`'s actual is ever used outside `#`/`##` context, and so
    /// must be pre-expanded by the caller.
    pub fn param_needs_expansion(&self, i: usize) -> bool {
        self.expanded_params.get(i).copied().unwrap_or(false)
    }

    /// Substitute actuals into the replacement list.
    ///
    /// `actuals` are the raw argument token sequences, one per slot;
    /// `expanded` are the same sequences fully macro-expanded (only slots
    /// where [`Macro::param_needs_expansion`] holds need real contents, since
    /// recursive expansion runs under the facade, not here). A parameter next
    /// to `#` or `##` substitutes the raw actual, everything else the
    /// expanded one.
    pub fn substitute_and_unroll(
        &self,
        actuals: &[Vec<Token>],
        expanded: &[Vec<Token>],
        herr: &dyn ErrorHandler,
    ) -> Vec<Token> {
        debug_assert_eq!(actuals.len(), self.slots());

        let v = &self.value;
        let mut out: Vec<Token> = Vec::new();
        let mut paste = false;
        let mut placemarker = false;
        let mut i = 0;
        while i < v.len() {
            let tok = &v[i];
            match tok.kind {
                Kind::Hash => {
                    if let Some(&Kind::Param(p)) = v.get(i + 1).map(|t| &t.kind) {
                        let lit = stringize(&actuals[p as usize], tok.pos.clone());
                        push(&mut out, &mut paste, &mut placemarker, lit, herr);
                        i += 2;
                        continue;
                    }
                    push(&mut out, &mut paste, &mut placemarker, tok.clone(), herr);
                }
                Kind::Paste => {
                    if placemarker {
                        placemarker = false;
                    } else {
                        paste = true;
                    }
                }
                Kind::Param(p) => {
                    let p = p as usize;
                    let raw = paste
                        || matches!(v.get(i + 1).map(|t| &t.kind), Some(Kind::Paste));
                    let seq = if raw { &actuals[p] } else { &expanded[p] };
                    if seq.is_empty() {
                        if paste {
                            paste = false;
                        } else {
                            placemarker = true;
                        }
                    } else {
                        for t in seq {
                            push(&mut out, &mut paste, &mut placemarker, t.clone(), herr);
                        }
                    }
                }
                _ => {
                    push(&mut out, &mut paste, &mut placemarker, tok.clone(), herr);
                }
            }
            i += 1;
        }
        out
    }
}

fn push(
    out: &mut Vec<Token>,
    paste: &mut bool,
    placemarker: &mut bool,
    tok: Token,
    herr: &dyn ErrorHandler,
) {
    *placemarker = false;
    if !*paste {
        out.push(tok);
        return;
    }
    *paste = false;
    match out.pop() {
        Some(prev) => {
            let glued = paste_tokens(&prev, &tok, herr);
            out.push(glued);
        }
        None => out.push(tok),
    }
}

/// `A ## B`: byte-concatenate the lexemes and re-lex. Anything but exactly
/// one clean token is a diagnostic and an invalid token.
fn paste_tokens(prev: &Token, next: &Token, herr: &dyn ErrorHandler) -> Token {
    let glued = format!("{}{}", prev.content, next.content);
    let scratch = ErrorLog::new();
    let mut toks = tokenize(&prev.pos.file, &glued, &scratch);
    if toks.len() == 1 && scratch.error_count() == 0 {
        let mut tok = toks.remove(0);
        tok.pos = prev.pos.clone();
        return tok;
    }
    herr.error_at(
        &prev.pos,
        &format!("Pasting `{}` and `{}` does not form a valid token", prev.content, next.content),
    );
    Token::new(Kind::Invalid, prev.pos.clone(), &glued)
}

/// `# param`: one string literal from the unexpanded actual, whitespace
/// between non-adjacent lexemes normalized to single spaces, quotes and
/// backslashes in literal lexemes escaped.
fn stringize(actual: &[Token], pos: Position) -> Token {
    let mut s = String::from("\"");
    let mut prev: Option<&Token> = None;
    for tok in actual {
        if let Some(prev) = prev {
            let adjacent = Rc::ptr_eq(&prev.pos.file, &tok.pos.file)
                && prev.pos.offset + prev.content.len() == tok.pos.offset;
            if !adjacent {
                s.push(' ');
            }
        }
        let quoted = matches!(tok.kind, Kind::CharLit | Kind::StrLit);
        for c in tok.content.chars() {
            if quoted && (c == '"' || c == '\\') {
                s.push('\\');
            }
            s.push(c);
        }
        prev = Some(tok);
    }
    s.push('"');
    Token { kind: Kind::StrLit, pos, content: Rc::from(&*s) }
}

#[cfg(test)]
mod tests {
    use super::Macro;
    use crate::errors::{ErrorHandler, ErrorLog};
    use crate::lex::{tokenize, Kind};

    fn def(params: &[&str], variadic: bool, body: &str) -> (Macro, ErrorLog) {
        let herr = ErrorLog::new();
        let value = tokenize("<define>", body, &herr);
        let params = params.iter().map(|p| p.to_string()).collect();
        let mac = Macro::function("M", params, variadic, value, &herr);
        (mac, herr)
    }

    fn args(herr: &ErrorLog, texts: &[&str]) -> Vec<Vec<crate::lex::Token>> {
        texts.iter().map(|t| tokenize("<arg>", t, herr)).collect()
    }

    #[test]
    fn parameters_marked() {
        let (mac, herr) = def(&["a", "b"], false, "a + b * a");
        let kinds: Vec<_> = mac.value.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![Kind::Param(0), Kind::Plus, Kind::Param(1), Kind::Star, Kind::Param(0)]
        );
        assert!(mac.param_needs_expansion(0));
        assert!(mac.param_needs_expansion(1));
        assert_eq!(herr.error_count(), 0);
    }

    #[test]
    fn paste_operands_stay_raw() {
        let (mac, herr) = def(&["a", "b"], false, "a##b");
        assert!(!mac.param_needs_expansion(0));
        assert!(!mac.param_needs_expansion(1));
        assert_eq!(herr.error_count(), 0);

        let a = args(&herr, &["foo", "bar"]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_identifier("foobar"));
    }

    #[test]
    fn paste_numbers() {
        let (mac, herr) = def(&["a", "b"], false, "a##b");
        let a = args(&herr, &["12", "34"]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, Kind::Decimal);
        assert_eq!(&*out[0].content, "1234");
    }

    #[test]
    fn paste_invalid_result() {
        let (mac, herr) = def(&["a", "b"], false, "a##b");
        let a = args(&herr, &["x", "+"]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        // "x+" lexes as two tokens, so the paste is diagnosed.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, Kind::Invalid);
        assert_eq!(herr.error_count(), 1);
    }

    #[test]
    fn stringize_normalizes_whitespace() {
        let (mac, herr) = def(&["x"], false, "#x");
        let a = args(&herr, &["hello   world"]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, Kind::StrLit);
        assert_eq!(&*out[0].content, "\"hello world\"");

        let a = args(&herr, &["a+b"]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(&*out[0].content, "\"a+b\"");
        assert_eq!(herr.error_count(), 0);
    }

    #[test]
    fn stringize_escapes_quotes() {
        let (mac, herr) = def(&["x"], false, "#x");
        let a = args(&herr, &["\"hi\\n\""]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(&*out[0].content, "\"\\\"hi\\\\n\\\"\"");
        assert_eq!(herr.error_count(), 0);
    }

    #[test]
    fn empty_actual_placemarkers() {
        let (mac, herr) = def(&["a", "b"], false, "a##b");
        let a = args(&herr, &["", "tail"]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_identifier("tail"));

        let a = args(&herr, &["head", ""]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_identifier("head"));
        assert_eq!(herr.error_count(), 0);
    }

    #[test]
    fn variadic_slot() {
        let (mac, herr) = def(&["fmt"], true, "printf(fmt, __VA_ARGS__)");
        assert_eq!(mac.slots(), 2);
        let kinds: Vec<_> = mac.value.iter().map(|t| t.kind.clone()).collect();
        assert!(kinds.contains(&Kind::Param(1)));
        assert_eq!(herr.error_count(), 0);

        // Zero variadic actuals still substitute (as nothing).
        let a = args(&herr, &["\"%d\"", ""]);
        let out = mac.substitute_and_unroll(&a, &a, &herr);
        let text: Vec<_> = out.iter().map(|t| &*t.content).collect();
        assert_eq!(text, vec!["printf", "(", "\"%d\"", ",", ")"]);
    }

    #[test]
    fn va_args_outside_variadic() {
        let (_, herr) = def(&["a"], false, "__VA_ARGS__ a");
        assert_eq!(herr.error_count(), 1);
    }

    #[test]
    fn empty_replacement() {
        let herr = ErrorLog::new();
        let mac = Macro::object("NOTHING", Vec::new());
        assert!(!mac.is_function());
        assert!(mac.value.is_empty());
        let _ = herr;
    }
}
