// crates/elspeth-expr/src/parser.rs
// ============================================================================
// Module: ELSPETH Expression Parser
// Description: Recursive-descent parser enforcing the §4.6 AST whitelist.
// ============================================================================

//! ## Overview
//! The parser is the single enforcement point for the whitelist: there is
//! no separate "validator" pass that walks a permissive AST afterwards.
//! Anything the grammar below cannot produce (a lambda, a comprehension,
//! an arbitrary call, an attribute other than `.get`, a slice, ...) is a
//! [`ExpressionError::Security`] raised the moment the parser would have
//! to accept it.

use crate::ast::ArithOp;
use crate::ast::BoolOp;
use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::error::ExpressionError;
use crate::lexer::Token;
use crate::lexer::TokenKind;
use crate::lexer::tokenize;

/// Maximum nesting depth of the expression tree, mirroring the DSL
/// nesting guard used elsewhere in the workspace against pathological
/// inputs (deeply nested parentheses, lists, or ternaries).
pub const MAX_NESTING_DEPTH: usize = 64;

/// Parses `source` into a whitelisted [`Expr`] tree.
///
/// # Errors
///
/// Returns [`ExpressionError::Syntax`] for malformed source,
/// [`ExpressionError::Security`] for constructs outside the whitelist.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, index: 0, depth: 0 };
    let expr = parser.parse_ternary()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        &self.tokens[self.index]
    }

    fn position(&self) -> usize {
        self.current().position
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.index].clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.index += 1;
        }
        token
    }

    fn expect_eof(&self) -> Result<(), ExpressionError> {
        if matches!(self.current().kind, TokenKind::Eof) {
            Ok(())
        } else {
            Err(ExpressionError::Syntax {
                position: self.position(),
                message: "trailing input after expression".to_string(),
            })
        }
    }

    fn with_nesting<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<T, ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ExpressionError::Security {
                position: self.position(),
                message: format!("expression nesting exceeds {MAX_NESTING_DEPTH} levels"),
            });
        }
        let result = body(self);
        self.depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Grammar: ternary > or > and > not > comparison > arith > term
    //          > unary > postfix > primary
    // ------------------------------------------------------------------

    fn parse_ternary(&mut self) -> Result<Expr, ExpressionError> {
        self.with_nesting(|parser| {
            let value_if = parser.parse_or()?;
            if matches!(parser.current().kind, TokenKind::If) {
                parser.advance();
                let cond = parser.parse_or()?;
                parser.expect(&TokenKind::Else)?;
                let value_else = parser.parse_ternary()?;
                Ok(Expr::Ternary {
                    cond: Box::new(cond),
                    value_if: Box::new(value_if),
                    value_else: Box::new(value_else),
                })
            } else {
                Ok(value_if)
            }
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut operands = vec![self.parse_and()?];
        while matches!(self.current().kind, TokenKind::Or) {
            self.advance();
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::BoolChain { op: BoolOp::Or, operands }
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut operands = vec![self.parse_not()?];
        while matches!(self.current().kind, TokenKind::And) {
            self.advance();
            operands.push(self.parse_not()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::BoolChain { op: BoolOp::And, operands }
        })
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.current().kind, TokenKind::Not) {
            self.advance();
            let inner = self.with_nesting(Self::parse_not)?;
            Ok(Expr::Not(Box::new(inner)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_arith()?;
        let mut rest = Vec::new();
        loop {
            let Some(op) = self.peek_compare_op() else { break };
            self.consume_compare_op(&op);
            if matches!(op, CompareOp::Is | CompareOp::IsNot) {
                // `is`/`is not` are only ever valid against `None` (§4.6).
                let position = self.position();
                let rhs = self.parse_arith()?;
                if !matches!(rhs, Expr::NoneLit) {
                    return Err(ExpressionError::Security {
                        position,
                        message: "'is'/'is not' may only compare against None".to_string(),
                    });
                }
                rest.push((op, rhs));
            } else {
                rest.push((op, self.parse_arith()?));
            }
        }
        Ok(if rest.is_empty() {
            first
        } else {
            Expr::Compare { first: Box::new(first), rest }
        })
    }

    fn peek_compare_op(&self) -> Option<CompareOp> {
        match &self.current().kind {
            TokenKind::Eq => Some(CompareOp::Eq),
            TokenKind::NotEq => Some(CompareOp::NotEq),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::LtEq => Some(CompareOp::LtEq),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::GtEq => Some(CompareOp::GtEq),
            TokenKind::In => Some(CompareOp::In),
            TokenKind::Is => Some(CompareOp::Is),
            TokenKind::Not
                if matches!(self.tokens.get(self.index + 1).map(|t| &t.kind), Some(TokenKind::In)) =>
            {
                Some(CompareOp::NotIn)
            }
            _ => None,
        }
    }

    fn consume_compare_op(&mut self, op: &CompareOp) {
        match op {
            CompareOp::NotIn => {
                self.advance();
                self.advance();
            }
            CompareOp::Is => {
                self.advance();
                if matches!(self.current().kind, TokenKind::Not) {
                    self.advance();
                }
            }
            _ => {
                self.advance();
            }
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => ArithOp::Add,
                TokenKind::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Arith { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => ArithOp::Mul,
                TokenKind::Slash => ArithOp::Div,
                TokenKind::DoubleSlash => ArithOp::FloorDiv,
                TokenKind::Percent => ArithOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Arith { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.current().kind {
            TokenKind::Plus => {
                self.advance();
                Ok(Expr::UnaryPlus(Box::new(self.with_nesting(Self::parse_unary)?)))
            }
            TokenKind::Minus => {
                self.advance();
                Ok(Expr::UnaryMinus(Box::new(self.with_nesting(Self::parse_unary)?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current().kind {
                TokenKind::LBracket => {
                    let position = self.position();
                    if !expr.is_row_derived() {
                        return Err(ExpressionError::Security {
                            position,
                            message: "subscripts are only allowed on row-derived values"
                                .to_string(),
                        });
                    }
                    self.advance();
                    let index = self.with_nesting(Self::parse_ternary)?;
                    self.expect(&TokenKind::RBracket)?;
                    expr = Expr::Subscript { base: Box::new(expr), index: Box::new(index) };
                }
                TokenKind::Dot => {
                    let position = self.position();
                    if !expr.is_row_derived() {
                        return Err(ExpressionError::Security {
                            position,
                            message: "attribute access is only allowed on row-derived values"
                                .to_string(),
                        });
                    }
                    self.advance();
                    let ident = self.expect_ident()?;
                    if ident != "get" {
                        return Err(ExpressionError::Security {
                            position,
                            message: format!(
                                "only 'row.get(...)' is allowed, found attribute '{ident}'"
                            ),
                        });
                    }
                    self.expect(&TokenKind::LParen)?;
                    let key = self.with_nesting(Self::parse_ternary)?;
                    let default = if matches!(self.current().kind, TokenKind::Comma) {
                        self.advance();
                        Some(Box::new(self.with_nesting(Self::parse_ternary)?))
                    } else {
                        None
                    };
                    self.expect(&TokenKind::RParen)?;
                    expr = Expr::Get { base: Box::new(expr), key: Box::new(key), default };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Row => {
                self.advance();
                Ok(Expr::Row)
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::None => {
                self.advance();
                Ok(Expr::NoneLit)
            }
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expr::Number(value))
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            TokenKind::Ident(name) => Err(ExpressionError::Security {
                position: token.position,
                message: format!(
                    "name '{name}' is not allowed; only 'row', 'True', 'False', and 'None' may \
                     appear as bare names"
                ),
            }),
            TokenKind::LParen => self.with_nesting(|parser| {
                parser.advance();
                let first = parser.parse_ternary()?;
                if matches!(parser.current().kind, TokenKind::Comma) {
                    let mut items = vec![first];
                    while matches!(parser.current().kind, TokenKind::Comma) {
                        parser.advance();
                        if matches!(parser.current().kind, TokenKind::RParen) {
                            break;
                        }
                        items.push(parser.parse_ternary()?);
                    }
                    parser.expect(&TokenKind::RParen)?;
                    Ok(Expr::Tuple(items))
                } else {
                    parser.expect(&TokenKind::RParen)?;
                    Ok(first)
                }
            }),
            TokenKind::LBracket => self.with_nesting(|parser| {
                parser.advance();
                let items = parser.parse_bracketed_list(&TokenKind::RBracket)?;
                Ok(Expr::List(items))
            }),
            TokenKind::LBrace => self.with_nesting(Self::parse_brace_literal),
            _ => Err(ExpressionError::Syntax {
                position: token.position,
                message: format!("unexpected token {:?}", token.kind),
            }),
        }
    }

    fn parse_brace_literal(&mut self) -> Result<Expr, ExpressionError> {
        self.advance();
        if matches!(self.current().kind, TokenKind::RBrace) {
            self.advance();
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.parse_ternary()?;
        if matches!(self.current().kind, TokenKind::Colon) {
            self.advance();
            let first_value = self.parse_ternary()?;
            let mut entries = vec![(first, first_value)];
            while matches!(self.current().kind, TokenKind::Comma) {
                self.advance();
                if matches!(self.current().kind, TokenKind::RBrace) {
                    break;
                }
                let key = self.parse_ternary()?;
                self.expect(&TokenKind::Colon)?;
                let value = self.parse_ternary()?;
                entries.push((key, value));
            }
            self.expect(&TokenKind::RBrace)?;
            Ok(Expr::Dict(entries))
        } else {
            let mut items = vec![first];
            while matches!(self.current().kind, TokenKind::Comma) {
                self.advance();
                if matches!(self.current().kind, TokenKind::RBrace) {
                    break;
                }
                items.push(self.parse_ternary()?);
            }
            self.expect(&TokenKind::RBrace)?;
            Ok(Expr::Set(items))
        }
    }

    fn parse_bracketed_list(
        &mut self,
        closing: &TokenKind,
    ) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if &self.current().kind == closing {
            self.advance();
            return Ok(items);
        }
        items.push(self.parse_ternary()?);
        while matches!(self.current().kind, TokenKind::Comma) {
            self.advance();
            if &self.current().kind == closing {
                break;
            }
            items.push(self.parse_ternary()?);
        }
        self.expect(closing)?;
        Ok(items)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ExpressionError> {
        if &self.current().kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(ExpressionError::Syntax {
                position: self.position(),
                message: format!("expected {kind:?}, found {:?}", self.current().kind),
            })
        }
    }

    fn expect_ident(&mut self) -> Result<String, ExpressionError> {
        match self.current().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ExpressionError::Syntax {
                position: self.position(),
                message: format!("expected identifier, found {other:?}"),
            }),
        }
    }
}
