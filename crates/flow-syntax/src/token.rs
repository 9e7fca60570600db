//! Lexer for the configuration language.

use crate::parser::ParseError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword-free name segment.
    Ident(String),
    /// Double-quoted string literal, unescaped.
    Str(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// `true` or `false`.
    Bool(bool),
    /// `null`.
    Null,
    /// `=`
    Assign,
    /// `.`
    Dot,
    /// `,`
    Comma,
    /// `-`
    Minus,
    /// `{`
    LCurly,
    /// `}`
    RCurly,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// End of input.
    Eof,
}

/// A token together with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// What was lexed.
    pub kind: TokenKind,
    /// Byte offset of the first character of the token.
    pub offset: usize,
}

/// Compute the 1-based line and column of a byte offset.
#[must_use]
pub fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in src.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Lex an entire source string into tokens, ending with [`TokenKind::Eof`].
pub fn lex(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let start = i;
                i += 2;
                loop {
                    if i + 1 >= bytes.len() {
                        return Err(unterminated(src, start, "block comment"));
                    }
                    if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b'=' => {
                tokens.push(Token { kind: TokenKind::Assign, offset: i });
                i += 1;
            }
            b'.' => {
                tokens.push(Token { kind: TokenKind::Dot, offset: i });
                i += 1;
            }
            b',' => {
                tokens.push(Token { kind: TokenKind::Comma, offset: i });
                i += 1;
            }
            b'-' => {
                tokens.push(Token { kind: TokenKind::Minus, offset: i });
                i += 1;
            }
            b'{' => {
                tokens.push(Token { kind: TokenKind::LCurly, offset: i });
                i += 1;
            }
            b'}' => {
                tokens.push(Token { kind: TokenKind::RCurly, offset: i });
                i += 1;
            }
            b'[' => {
                tokens.push(Token { kind: TokenKind::LBracket, offset: i });
                i += 1;
            }
            b']' => {
                tokens.push(Token { kind: TokenKind::RBracket, offset: i });
                i += 1;
            }
            b'"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(i) {
                        None | Some(b'\n') => {
                            return Err(unterminated(src, start, "string literal"));
                        }
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let esc = bytes.get(i + 1).copied();
                            match esc {
                                Some(b'n') => value.push('\n'),
                                Some(b't') => value.push('\t'),
                                Some(b'\\') => value.push('\\'),
                                Some(b'"') => value.push('"'),
                                _ => {
                                    return Err(invalid(src, i, "unknown escape sequence"));
                                }
                            }
                            i += 2;
                        }
                        Some(_) => {
                            // Consume a full UTF-8 character, not a byte.
                            let rest = &src[i..];
                            let ch = rest.chars().next().unwrap_or('\u{fffd}');
                            value.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(value), offset: start });
            }
            b'0'..=b'9' => {
                let start = i;
                let mut is_float = false;
                while i < bytes.len() {
                    match bytes[i] {
                        b'0'..=b'9' | b'_' => i += 1,
                        b'.' if !is_float
                            && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) =>
                        {
                            is_float = true;
                            i += 1;
                        }
                        b'e' | b'E' if bytes
                            .get(i + 1)
                            .is_some_and(|c| c.is_ascii_digit() || *c == b'-' || *c == b'+') =>
                        {
                            is_float = true;
                            i += 2;
                        }
                        _ => break,
                    }
                }
                let text: String = src[start..i].chars().filter(|c| *c != '_').collect();
                let kind = if is_float {
                    TokenKind::Float(
                        text.parse()
                            .map_err(|_| invalid(src, start, "malformed float literal"))?,
                    )
                } else {
                    TokenKind::Int(
                        text.parse()
                            .map_err(|_| invalid(src, start, "malformed integer literal"))?,
                    )
                };
                tokens.push(Token { kind, offset: start });
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let ident = &src[start..i];
                let kind = match ident {
                    "true" => TokenKind::Bool(true),
                    "false" => TokenKind::Bool(false),
                    "null" => TokenKind::Null,
                    _ => TokenKind::Ident(ident.to_string()),
                };
                tokens.push(Token { kind, offset: start });
            }
            _ => return Err(invalid(src, i, "unexpected character")),
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, offset: src.len() });
    Ok(tokens)
}

fn invalid(src: &str, offset: usize, what: &str) -> ParseError {
    let (line, column) = line_col(src, offset);
    ParseError::Lex { what: what.to_string(), line, column }
}

fn unterminated(src: &str, offset: usize, what: &str) -> ParseError {
    let (line, column) = line_col(src, offset);
    ParseError::Unterminated { what: what.to_string(), line, column }
}
