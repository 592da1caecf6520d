//! Tokens produced by the lexer.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

/// Keywords. Case-insensitive in source; identifiers are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kw {
    Select,
    Distinct,
    From,
    Join,
    On,
    Where,
    Group,
    By,
    Having,
    Order,
    Asc,
    Desc,
    Limit,
    Insert,
    Into,
    Values,
    Update,
    Set,
    Delete,
    Create,
    Table,
    Tables,
    Index,
    Unique,
    Using,
    Materialized,
    View,
    Refresh,
    Drop,
    Snapshot,
    Show,
    Describe,
    Analyze,
    And,
    Or,
    Not,
    Null,
    True,
    False,
    As,
    In,
    Case,
    Function,
    Let,
    Match,
    For,
    While,
    Try,
    Catch,
    Module,
    Macro,
    Import,
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

static KEYWORDS: Lazy<HashMap<&'static str, Kw>> = Lazy::new(|| {
    use Kw::*;
    HashMap::from([
        ("select", Select),
        ("distinct", Distinct),
        ("from", From),
        ("join", Join),
        ("on", On),
        ("where", Where),
        ("group", Group),
        ("by", By),
        ("having", Having),
        ("order", Order),
        ("asc", Asc),
        ("desc", Desc),
        ("limit", Limit),
        ("insert", Insert),
        ("into", Into),
        ("values", Values),
        ("update", Update),
        ("set", Set),
        ("delete", Delete),
        ("create", Create),
        ("table", Table),
        ("tables", Tables),
        ("index", Index),
        ("unique", Unique),
        ("using", Using),
        ("materialized", Materialized),
        ("view", View),
        ("refresh", Refresh),
        ("drop", Drop),
        ("snapshot", Snapshot),
        ("show", Show),
        ("describe", Describe),
        ("analyze", Analyze),
        ("and", And),
        ("or", Or),
        ("not", Not),
        ("null", Null),
        ("true", True),
        ("false", False),
        ("as", As),
        ("in", In),
        ("case", Case),
        ("function", Function),
        ("let", Let),
        ("match", Match),
        ("for", For),
        ("while", While),
        ("try", Try),
        ("catch", Catch),
        ("module", Module),
        ("macro", Macro),
        ("import", Import),
        ("sum", Sum),
        ("count", Count),
        ("avg", Avg),
        ("min", Min),
        ("max", Max),
    ])
});

/// Look up a keyword, case-insensitively.
pub fn keyword(ident: &str) -> Option<Kw> {
    KEYWORDS.get(ident.to_ascii_lowercase().as_str()).copied()
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Integer(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Keyword(Kw),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,    // =
    EqEq,      // ==
    NotEq,     // !=
    Lt,
    Le,
    Gt,
    Ge,
    Coalesce,  // ??
    Cast,      // ::
    Pipe,      // |>
    At,        // @
    FatArrow,  // =>

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,
    Colon,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Integer(v) => write!(f, "{v}"),
            TokenKind::Float(v) => write!(f, "{v}"),
            TokenKind::Str(s) => write!(f, "'{s}'"),
            TokenKind::Ident(name) => write!(f, "{name}"),
            TokenKind::Keyword(kw) => write!(f, "{kw:?}"),
            TokenKind::Plus => f.write_str("+"),
            TokenKind::Minus => f.write_str("-"),
            TokenKind::Star => f.write_str("*"),
            TokenKind::Slash => f.write_str("/"),
            TokenKind::Percent => f.write_str("%"),
            TokenKind::Assign => f.write_str("="),
            TokenKind::EqEq => f.write_str("=="),
            TokenKind::NotEq => f.write_str("!="),
            TokenKind::Lt => f.write_str("<"),
            TokenKind::Le => f.write_str("<="),
            TokenKind::Gt => f.write_str(">"),
            TokenKind::Ge => f.write_str(">="),
            TokenKind::Coalesce => f.write_str("??"),
            TokenKind::Cast => f.write_str("::"),
            TokenKind::Pipe => f.write_str("|>"),
            TokenKind::At => f.write_str("@"),
            TokenKind::FatArrow => f.write_str("=>"),
            TokenKind::LParen => f.write_str("("),
            TokenKind::RParen => f.write_str(")"),
            TokenKind::LBrace => f.write_str("{"),
            TokenKind::RBrace => f.write_str("}"),
            TokenKind::LBracket => f.write_str("["),
            TokenKind::RBracket => f.write_str("]"),
            TokenKind::Comma => f.write_str(","),
            TokenKind::Semicolon => f.write_str(";"),
            TokenKind::Dot => f.write_str("."),
            TokenKind::Colon => f.write_str(":"),
            TokenKind::Eof => f.write_str("<eof>"),
        }
    }
}

/// A token with its source position (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}
