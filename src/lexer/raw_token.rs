use logos::Logos;

// Number literals are parsed inside the lexer callbacks so a malformed or
// out-of-range literal surfaces as a lexing error rather than a bad value.

fn lex_float(lexer: &mut logos::Lexer<RawToken>) -> Option<f64> {
    let value: f64 = lexer.slice().parse().ok()?;
    // Overflow to infinity is a lex error, mirroring strtod's ERANGE.
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

fn lex_radix(lexer: &mut logos::Lexer<RawToken>, radix: u32) -> Option<f64> {
    // Skip the two prefix characters (0x, 0b, 0o).
    let digits = &lexer.slice()[2..];
    u64::from_str_radix(digits, radix).ok().map(|v| v as f64)
}

#[derive(Logos, Debug, PartialEq, Clone, Copy)]
#[logos(skip r"[ \t]+")]
pub enum RawToken {
    // Newlines are surfaced as tokens so the wrapping lexer can count lines;
    // `\r\n` matches as a single token and therefore a single line.
    #[regex(r"\r\n|\n|\r")]
    Newline,

    // Keywords
    #[token("let")]
    Let,
    #[token("if")]
    If,
    #[token("elseif")]
    Elseif,
    #[token("else")]
    Else,
    #[token("loop")]
    Loop,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("fn")]
    Fn,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("nil")]
    Nil,

    // Identifiers and literals
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"[0-9]+\.?[0-9]*([eE][+-]?[0-9]+)?", lex_float)]
    #[regex(r"0[xX][0-9a-fA-F]+", |l| lex_radix(l, 16))]
    #[regex(r"0[bB][01]+", |l| lex_radix(l, 2))]
    #[regex(r"0[oO][0-7]+", |l| lex_radix(l, 8))]
    Num(f64),

    // Multi-character symbols
    #[token("..")]
    Concat,
    #[token("+=")]
    AddAssign,
    #[token("-=")]
    SubAssign,
    #[token("*=")]
    MulAssign,
    #[token("/=")]
    DivAssign,
    #[token("%=")]
    ModAssign,
    #[token("==")]
    Eq,
    #[token("!=")]
    Neq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("&&")]
    And,
    #[token("||")]
    Or,

    // Single-character symbols
    #[token("+")]
    Add,
    #[token("-")]
    Sub,
    #[token("*")]
    Mul,
    #[token("/")]
    Div,
    #[token("%")]
    Mod,
    #[token("=")]
    Assign,
    #[token("!")]
    Not,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
}
