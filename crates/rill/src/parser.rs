use crate::ast::{Expr, NodeId};
use crate::lexer::{lex, Token, TokenKind};
use crate::RillError;

/// Parses one top-level expression (a REPL line or a serialized program).
/// The first error aborts the parse; there is no recovery.
pub fn parse_program(source: &str) -> Result<Expr, RillError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(tokens);
    parser.skip_newlines();
    let expr = parser.parse_expr()?;
    parser.skip_newlines();
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|token| token.kind == kind)
    }

    fn peek_kind_at(&self, offset: usize, kind: TokenKind) -> bool {
        self.tokens
            .get(self.pos + offset)
            .is_some_and(|token| token.kind == kind)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn consume(&mut self, kind: TokenKind, expected: &str) -> Result<Token, RillError> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                let token = token.clone();
                self.pos += 1;
                Ok(token)
            }
            Some(token) => Err(RillError::Syntax(format!(
                "expected {expected} but found `{}` at {}",
                token.text, token.pos
            ))),
            None => Err(RillError::Syntax(format!(
                "expected {expected} but input ended"
            ))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek_kind(TokenKind::Newline) {
            self.pos += 1;
        }
    }

    fn expect_eof(&self) -> Result<(), RillError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(RillError::Syntax(format!(
                "unexpected trailing input `{}` at {}",
                token.text, token.pos
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, RillError> {
        if self.peek_kind(TokenKind::KwDef) {
            return self.parse_def();
        }
        if self.peek_kind(TokenKind::Ident) && self.peek_kind_at(1, TokenKind::Assign) {
            return self.parse_assign();
        }
        self.parse_additive()
    }

    fn parse_def(&mut self) -> Result<Expr, RillError> {
        self.consume(TokenKind::KwDef, "`def`")?;
        let name = self.consume(TokenKind::Ident, "function name")?.text;
        self.consume(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.peek_kind(TokenKind::RParen) {
            loop {
                params.push(self.consume(TokenKind::Ident, "parameter name")?.text);
                if !self.peek_kind(TokenKind::Comma) {
                    break;
                }
                self.pos += 1;
            }
        }
        self.consume(TokenKind::RParen, "`)`")?;
        let body = self.parse_expr()?;
        Ok(Expr::FnDef {
            name,
            params,
            body: std::sync::Arc::new(body),
        })
    }

    fn parse_assign(&mut self) -> Result<Expr, RillError> {
        let name = self.consume(TokenKind::Ident, "identifier")?.text;
        self.consume(TokenKind::Assign, "`=`")?;
        let value = self.parse_expr()?;
        Ok(Expr::Assign {
            name,
            value: Box::new(value),
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, RillError> {
        let mut lhs = self.parse_operand()?;
        while self.peek_kind(TokenKind::Plus) {
            self.pos += 1;
            let rhs = self.parse_operand()?;
            lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_operand(&mut self) -> Result<Expr, RillError> {
        if self.peek_kind(TokenKind::KwRemote) {
            return self.parse_remote();
        }
        if self.peek_kind(TokenKind::LBrace) {
            return self.parse_block();
        }
        if self.peek_kind(TokenKind::LParen) {
            self.pos += 1;
            let inner = self.parse_expr()?;
            self.consume(TokenKind::RParen, "`)`")?;
            return Ok(inner);
        }

        let Some(token) = self.advance() else {
            return Err(RillError::Syntax("unexpected end of input".to_string()));
        };
        match token.kind {
            TokenKind::Int => token.text.parse::<i64>().map(Expr::Int).map_err(|_| {
                RillError::Syntax(format!(
                    "integer literal `{}` out of range at {}",
                    token.text, token.pos
                ))
            }),
            TokenKind::Ident => {
                if self.peek_kind(TokenKind::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.peek_kind(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.peek_kind(TokenKind::Comma) {
                                break;
                            }
                            self.pos += 1;
                        }
                    }
                    self.consume(TokenKind::RParen, "`)`")?;
                    Ok(Expr::FnCall {
                        name: token.text,
                        args,
                    })
                } else {
                    Ok(Expr::Var(token.text))
                }
            }
            _ => Err(RillError::Syntax(format!(
                "unexpected token `{}` at {}",
                token.text, token.pos
            ))),
        }
    }

    fn parse_block(&mut self) -> Result<Expr, RillError> {
        let open = self.consume(TokenKind::LBrace, "`{`")?;
        let mut exprs = Vec::new();
        loop {
            self.skip_newlines();
            if self.peek_kind(TokenKind::RBrace) {
                self.pos += 1;
                break;
            }
            if self.peek().is_none() {
                return Err(RillError::Syntax(format!(
                    "unterminated block starting at {}",
                    open.pos
                )));
            }
            exprs.push(self.parse_expr()?);
            if !self.peek_kind(TokenKind::Newline) && !self.peek_kind(TokenKind::RBrace) {
                self.consume(TokenKind::Newline, "newline or `}` after block statement")?;
            }
        }
        if exprs.is_empty() {
            return Err(RillError::Syntax(format!(
                "empty block at {}",
                open.pos
            )));
        }
        Ok(Expr::Block(exprs))
    }

    fn parse_remote(&mut self) -> Result<Expr, RillError> {
        self.consume(TokenKind::KwRemote, "`remote`")?;
        let tag = if self.peek_kind(TokenKind::LBracket) {
            self.pos += 1;
            let tag = self.consume(TokenKind::Ident, "worker tag")?.text;
            self.consume(TokenKind::RBracket, "`]`")?;
            Some(tag)
        } else {
            None
        };
        self.consume(TokenKind::LParen, "`(`")?;
        let inner = self.parse_expr()?;
        self.consume(TokenKind::RParen, "`)`")?;
        Ok(Expr::Remote {
            node: NodeId::fresh(),
            inner: Box::new(inner),
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_folds_left() {
        let expr = parse_program("1+2+3").expect("parse");
        let Expr::Add(lhs, rhs) = expr else {
            panic!("expected add");
        };
        assert!(matches!(*lhs, Expr::Add(_, _)));
        assert!(matches!(*rhs, Expr::Int(3)));
    }

    #[test]
    fn parses_assignment_chain() {
        let expr = parse_program("x = y = 2").expect("parse");
        let Expr::Assign { name, value } = expr else {
            panic!("expected assignment");
        };
        assert_eq!(name, "x");
        assert!(matches!(*value, Expr::Assign { .. }));
    }

    #[test]
    fn parses_def_with_expression_body() {
        let expr = parse_program("def inc(a) a+1").expect("parse");
        let Expr::FnDef { name, params, body } = expr else {
            panic!("expected def");
        };
        assert_eq!(name, "inc");
        assert_eq!(params, vec!["a".to_string()]);
        assert!(matches!(*body.as_ref(), Expr::Add(_, _)));
    }

    #[test]
    fn parses_call_with_arguments() {
        let expr = parse_program("add(2, x+1)").expect("parse");
        let Expr::FnCall { name, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "add");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn parses_remote_with_and_without_tag() {
        let expr = parse_program("remote(1+2)").expect("parse");
        assert!(matches!(expr, Expr::Remote { tag: None, .. }));

        let expr = parse_program("remote[gpu](x)").expect("parse");
        let Expr::Remote { tag, .. } = expr else {
            panic!("expected remote");
        };
        assert_eq!(tag.as_deref(), Some("gpu"));
    }

    #[test]
    fn remote_nodes_get_distinct_ids() {
        let Expr::Add(lhs, rhs) = parse_program("remote(2)+remote(3)").expect("parse") else {
            panic!("expected add");
        };
        let (Expr::Remote { node: left, .. }, Expr::Remote { node: right, .. }) =
            (*lhs, *rhs)
        else {
            panic!("expected remote operands");
        };
        assert_ne!(left, right);
    }

    #[test]
    fn parses_multi_statement_block() {
        let expr = parse_program("{\nx = 2\nx+3\n}").expect("parse");
        let Expr::Block(exprs) = expr else {
            panic!("expected block");
        };
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn rejects_empty_block() {
        let err = parse_program("{\n}").expect_err("should fail");
        assert!(matches!(err, RillError::Syntax(_)));
    }

    #[test]
    fn rejects_trailing_input() {
        let err = parse_program("1 2").expect_err("should fail");
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn rejects_unterminated_block() {
        let err = parse_program("{\n1").expect_err("should fail");
        assert!(err.to_string().contains("unterminated"));
    }
}
