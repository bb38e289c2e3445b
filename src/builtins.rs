use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::errors::ErrorLog;
use crate::macros::{Macro, MacroMap};

/// Keywords, produced by identifier resolution in the lexer facade. Names
/// that resolve to types or type modifiers are declarators instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kw {
    Asm,
    Break,
    Case,
    Catch,
    Class,
    ConstCast,
    Continue,
    Decltype,
    Default,
    Delete,
    Do,
    DynamicCast,
    Else,
    Enum,
    Explicit,
    Export,
    Extern,
    False,
    For,
    Friend,
    Goto,
    If,
    Namespace,
    New,
    Noexcept,
    Nullptr,
    Operator,
    Private,
    Protected,
    Public,
    ReinterpretCast,
    Return,
    Sizeof,
    StaticAssert,
    StaticCast,
    Struct,
    Switch,
    Template,
    This,
    Throw,
    True,
    Try,
    Typedef,
    Typeid,
    Typename,
    Union,
    Using,
    Virtual,
    While,
}

/// A built-in type name or type-modifier flag, attached as payload when an
/// identifier resolves to one.
#[derive(Debug, PartialEq, Eq)]
pub struct Declarator {
    pub name: Box<str>,
    pub usage: Usage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Usage {
    Primitive,
    Flag,
}

/// Result of a scope query in [`get_token_in_scope`].
///
/// [`get_token_in_scope`]: crate::cpp::Lexer::get_token_in_scope
pub enum Lookup {
    Type(Rc<Declarator>),
    Other,
}

/// Name resolution surface handed to the scope-aware token call. The
/// definition store behind it is an external collaborator.
pub trait Scope {
    fn look_up(&self, name: &str) -> Option<Lookup>;
}

/// Process-wide lexing context: ordered include search path, keyword and
/// declarator maps, and the kludge macros that make compiler intrinsics like
/// `__attribute__` lex as no-ops. Immutable once handed to a lexer.
pub struct Builtins {
    search_dirs: Vec<PathBuf>,
    pub keywords: IndexMap<&'static str, Kw>,
    pub declarators: IndexMap<&'static str, Rc<Declarator>>,
    pub kludges: MacroMap,
}

impl Builtins {
    /// The ISO C++ context with an empty search path.
    pub fn cpp() -> Builtins {
        let mut keywords = IndexMap::default();
        for (name, kw) in [
            ("asm", Kw::Asm),
            ("break", Kw::Break),
            ("case", Kw::Case),
            ("catch", Kw::Catch),
            ("class", Kw::Class),
            ("const_cast", Kw::ConstCast),
            ("continue", Kw::Continue),
            ("decltype", Kw::Decltype),
            ("default", Kw::Default),
            ("delete", Kw::Delete),
            ("do", Kw::Do),
            ("dynamic_cast", Kw::DynamicCast),
            ("else", Kw::Else),
            ("enum", Kw::Enum),
            ("explicit", Kw::Explicit),
            ("export", Kw::Export),
            ("extern", Kw::Extern),
            ("false", Kw::False),
            ("for", Kw::For),
            ("friend", Kw::Friend),
            ("goto", Kw::Goto),
            ("if", Kw::If),
            ("namespace", Kw::Namespace),
            ("new", Kw::New),
            ("noexcept", Kw::Noexcept),
            ("nullptr", Kw::Nullptr),
            ("operator", Kw::Operator),
            ("private", Kw::Private),
            ("protected", Kw::Protected),
            ("public", Kw::Public),
            ("reinterpret_cast", Kw::ReinterpretCast),
            ("return", Kw::Return),
            ("sizeof", Kw::Sizeof),
            ("static_assert", Kw::StaticAssert),
            ("static_cast", Kw::StaticCast),
            ("struct", Kw::Struct),
            ("switch", Kw::Switch),
            ("template", Kw::Template),
            ("this", Kw::This),
            ("throw", Kw::Throw),
            ("true", Kw::True),
            ("try", Kw::Try),
            ("typedef", Kw::Typedef),
            ("typeid", Kw::Typeid),
            ("typename", Kw::Typename),
            ("union", Kw::Union),
            ("using", Kw::Using),
            ("virtual", Kw::Virtual),
            ("while", Kw::While),
        ] {
            keywords.insert(name, kw);
        }

        let mut declarators = IndexMap::default();
        for name in [
            "void", "bool", "char", "wchar_t", "char16_t", "char32_t", "int", "float", "double",
        ] {
            declarators
                .insert(name, Rc::new(Declarator { name: name.into(), usage: Usage::Primitive }));
        }
        for name in [
            "signed", "unsigned", "long", "short", "const", "volatile", "constexpr", "static",
            "mutable", "register", "inline",
        ] {
            declarators.insert(name, Rc::new(Declarator { name: name.into(), usage: Usage::Flag }));
        }

        // Compiler intrinsics that must vanish during lexing. Diagnostics from
        // these fixed definitions are impossible; the scratch sink is enough.
        let scratch = ErrorLog::new();
        let mut kludges = MacroMap::default();
        for name in ["__attribute__", "__declspec"] {
            let mac = Macro::function(name, vec!["spec".to_owned()], false, Vec::new(), &scratch);
            kludges.insert(name.to_owned(), Rc::new(mac));
        }
        for name in ["__extension__", "__restrict", "__restrict__", "__forceinline"] {
            kludges.insert(name.to_owned(), Rc::new(Macro::object(name, Vec::new())));
        }

        Builtins { search_dirs: Vec::new(), keywords, declarators, kludges }
    }

    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    pub fn search_dir_count(&self) -> usize {
        self.search_dirs.len()
    }

    pub fn search_dir(&self, i: usize) -> &Path {
        &self.search_dirs[i]
    }
}
