use crate::RillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Int,
    KwDef,
    KwRemote,
    Plus,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Newline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: Pos,
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic()
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'
}

/// Scans the full source up front. Newline runs collapse into a single
/// `Newline` token; the parser uses them as statement separators in blocks.
pub fn lex(source: &str) -> Result<Vec<Token>, RillError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0usize;
    let mut line = 1usize;
    let mut col = 1usize;

    while index < chars.len() {
        let ch = chars[index];

        if ch == ' ' || ch == '\t' {
            index += 1;
            col += 1;
            continue;
        }

        // Line comments run to end-of-line.
        if ch == '#' {
            while index < chars.len() && chars[index] != '\n' {
                index += 1;
                col += 1;
            }
            continue;
        }

        if ch == '\n' || ch == '\r' {
            let pos = Pos { line, column: col };
            while index < chars.len() && (chars[index] == '\n' || chars[index] == '\r') {
                if chars[index] == '\n' {
                    line += 1;
                    col = 1;
                }
                index += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Newline,
                text: "\n".to_string(),
                pos,
            });
            continue;
        }

        let single = match ch {
            '+' => Some(TokenKind::Plus),
            '=' => Some(TokenKind::Assign),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            ',' => Some(TokenKind::Comma),
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token {
                kind,
                text: ch.to_string(),
                pos: Pos { line, column: col },
            });
            index += 1;
            col += 1;
            continue;
        }

        if ch.is_ascii_digit() {
            let start = index;
            let pos = Pos { line, column: col };
            while index < chars.len() && chars[index].is_ascii_digit() {
                index += 1;
                col += 1;
            }
            let text: String = chars[start..index].iter().collect();
            tokens.push(Token {
                kind: TokenKind::Int,
                text,
                pos,
            });
            continue;
        }

        if is_ident_start(ch) {
            let start = index;
            let pos = Pos { line, column: col };
            index += 1;
            col += 1;
            while index < chars.len() && is_ident_continue(chars[index]) {
                index += 1;
                col += 1;
            }
            let text: String = chars[start..index].iter().collect();
            let kind = match text.as_str() {
                "def" => TokenKind::KwDef,
                "remote" => TokenKind::KwRemote,
                _ => TokenKind::Ident,
            };
            tokens.push(Token { kind, text, pos });
            continue;
        }

        return Err(RillError::Syntax(format!(
            "unexpected character `{ch}` at {}:{}",
            line, col
        )));
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source)
            .expect("lex")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn lexes_assignment_and_addition() {
        assert_eq!(
            kinds("x = 1+20"),
            vec![
                TokenKind::Ident,
                TokenKind::Assign,
                TokenKind::Int,
                TokenKind::Plus,
                TokenKind::Int,
            ]
        );
    }

    #[test]
    fn lexes_keywords_and_tagged_remote() {
        assert_eq!(
            kinds("remote[gpu](def)"),
            vec![
                TokenKind::KwRemote,
                TokenKind::LBracket,
                TokenKind::Ident,
                TokenKind::RBracket,
                TokenKind::LParen,
                TokenKind::KwDef,
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn collapses_newline_runs_and_skips_comments() {
        assert_eq!(
            kinds("{\n\r\n1 # trailing\n}"),
            vec![
                TokenKind::LBrace,
                TokenKind::Newline,
                TokenKind::Int,
                TokenKind::Newline,
                TokenKind::RBrace,
            ]
        );
    }

    #[test]
    fn rejects_unknown_characters() {
        let err = lex("1 % 2").expect_err("should fail");
        assert!(matches!(err, RillError::Syntax(_)));
        assert!(err.to_string().contains('%'));
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = lex("a\n  b").expect("lex");
        assert_eq!(tokens[2].pos, Pos { line: 2, column: 3 });
    }
}
