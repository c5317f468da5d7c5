use super::{
    SourceFile,
    ast::{Expression, Opcode, Statement},
    lexer::{self, Keyword, Lexer, Token, TokenKind},
};
use crate::diagnostics::Message;

/// Recursive descent over the token stream. The grammar is expression
/// oriented: a module is a list of `expr ;` statements, optionally prefixed
/// with a `wait (id, ...)` dependency list. Comma chains associate left, so
/// `a, b, c` is `Comma(Comma(a, b), c)`.
///
/// The first syntax error aborts the parse; the caller records the message
/// and skips the later stages.
#[derive(Debug)]
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    peeked: Option<Token>,
}

impl<'source> Parser<'source> {
    pub fn parse_module(source_file: &'source SourceFile) -> Result<Vec<Statement>, Message> {
        let mut parser = Self {
            lexer: Lexer::new(source_file),
            peeked: None,
        };

        let mut statements = Vec::new();
        while parser.peek()?.is_some() {
            statements.push(parser.parse_statement()?);
        }

        Ok(statements)
    }

    fn peek(&mut self) -> Result<Option<&Token>, Message> {
        if self.peeked.is_none() {
            self.peeked = self.lexer.next_token()?;
        }

        Ok(self.peeked.as_ref())
    }

    fn next(&mut self) -> Result<Option<Token>, Message> {
        match self.peeked.take() {
            Some(token) => Ok(Some(token)),
            None => self.lexer.next_token(),
        }
    }

    fn end_of_file_error(&self, expecting: &str) -> Message {
        Message::error(
            self.lexer.location_at_end(),
            format!("Expected {expecting} but reached the end of the module"),
        )
    }

    fn expect_next(&mut self, expecting: &str) -> Result<Token, Message> {
        self.next()?
            .ok_or_else(|| self.end_of_file_error(expecting))
    }

    fn expect_next_to_be(&mut self, kind: TokenKind, expecting: &str) -> Result<Token, Message> {
        let token = self.expect_next(expecting)?;

        if token.kind != kind {
            return Err(Message::error(
                token.loc,
                format!(
                    "Expected {expecting} but found `{}`",
                    self.lexer.source().value_of_span(token.span)
                ),
            ));
        }

        Ok(token)
    }

    fn next_is(&mut self, kind: TokenKind) -> Result<bool, Message> {
        Ok(self.peek()?.is_some_and(|token| token.kind == kind))
    }

    fn token_text(&self, token: &Token) -> &'source str {
        self.lexer.source().value_of_span(token.span)
    }

    /* Statements */

    fn parse_statement(&mut self) -> Result<Statement, Message> {
        if self.next_is(TokenKind::Keyword(Keyword::Wait))? {
            return self.parse_wait_statement();
        }

        let expression = self.parse_expression()?;
        let loc = expression.loc;
        self.expect_next_to_be(TokenKind::Semicolon, "`;`")?;

        Ok(Statement::expression(loc, expression))
    }

    /// wait (a, b) expression ;
    fn parse_wait_statement(&mut self) -> Result<Statement, Message> {
        let keyword = self.expect_next("`wait`")?;
        self.expect_next_to_be(TokenKind::OpenParen, "`(`")?;

        let mut id_list = Vec::new();
        loop {
            let id = self.expect_next_to_be(TokenKind::Identifier, "an identifier")?;
            id_list.push(self.token_text(&id).to_owned());

            if !self.next_is(TokenKind::Comma)? {
                break;
            }
            self.next()?;
        }

        self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;

        let expression = self.parse_expression()?;
        self.expect_next_to_be(TokenKind::Semicolon, "`;`")?;

        Ok(Statement::wait(keyword.loc, id_list, expression))
    }

    /* Expressions, lowest precedence first */

    fn parse_expression(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_assignment()?;

        while self.next_is(TokenKind::Comma)? {
            let comma = self.expect_next("`,`")?;
            let right = self.parse_assignment()?;
            expression = Expression::binary(comma.loc, Opcode::Comma, expression, right);
        }

        Ok(expression)
    }

    fn parse_assignment(&mut self) -> Result<Expression, Message> {
        // Any expression is admitted on the left; the type checker rejects
        // non-identifier targets with a proper diagnostic.
        let target = self.parse_conditional()?;

        if self.next_is(TokenKind::Equals)? {
            let equals = self.expect_next("`=`")?;
            let value = self.parse_assignment()?;
            return Ok(Expression::binary(equals.loc, Opcode::Assign, target, value));
        }

        Ok(target)
    }

    /// cond ? positive : negative, encoded as `Conditional(cond, Alt(p, n))`
    fn parse_conditional(&mut self) -> Result<Expression, Message> {
        let condition = self.parse_logical_or()?;

        if !self.next_is(TokenKind::Question)? {
            return Ok(condition);
        }

        let question = self.expect_next("`?`")?;
        let positive = self.parse_expression()?;
        let colon = self.expect_next_to_be(TokenKind::Colon, "`:`")?;
        let negative = self.parse_assignment()?;

        let alt = Expression::binary(colon.loc, Opcode::Alt, positive, negative);
        Ok(Expression::binary(
            question.loc,
            Opcode::Conditional,
            condition,
            alt,
        ))
    }

    fn parse_logical_or(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_logical_and()?;

        while self.next_is(TokenKind::LogicalOr)? {
            let operator = self.expect_next("`||`")?;
            let right = self.parse_logical_and()?;
            expression = Expression::binary(operator.loc, Opcode::Or, expression, right);
        }

        Ok(expression)
    }

    fn parse_logical_and(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_equality()?;

        while self.next_is(TokenKind::LogicalAnd)? {
            let operator = self.expect_next("`&&`")?;
            let right = self.parse_equality()?;
            expression = Expression::binary(operator.loc, Opcode::And, expression, right);
        }

        Ok(expression)
    }

    fn parse_equality(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_relational()?;

        while self.next_is(TokenKind::DoubleEquals)? || self.next_is(TokenKind::NotEquals)? {
            let operator = self.expect_next("a comparison")?;
            let opcode = match operator.kind {
                TokenKind::DoubleEquals => Opcode::Equal,
                _ => Opcode::NotEqual,
            };
            let right = self.parse_relational()?;
            expression = Expression::binary(operator.loc, opcode, expression, right);
        }

        Ok(expression)
    }

    fn parse_relational(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_term()?;

        loop {
            let opcode = match self.peek()?.map(|t| t.kind) {
                Some(TokenKind::LessThan) => Opcode::Less,
                Some(TokenKind::LessThanOrEqualTo) => Opcode::LessEqual,
                Some(TokenKind::GreaterThan) => Opcode::Greater,
                Some(TokenKind::GreaterThanOrEqualTo) => Opcode::GreaterEqual,
                _ => break,
            };

            let operator = self.expect_next("a comparison")?;
            let right = self.parse_term()?;
            expression = Expression::binary(operator.loc, opcode, expression, right);
        }

        Ok(expression)
    }

    fn parse_term(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_factor()?;

        while self.peek()?.is_some_and(|t| t.kind.is_term_operator()) {
            let operator = self.expect_next("an operator")?;
            let opcode = match operator.kind {
                TokenKind::Plus => Opcode::Add,
                _ => Opcode::Subtract,
            };
            let right = self.parse_factor()?;
            expression = Expression::binary(operator.loc, opcode, expression, right);
        }

        Ok(expression)
    }

    fn parse_factor(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_unary()?;

        while self.peek()?.is_some_and(|t| t.kind.is_factor_operator()) {
            let operator = self.expect_next("an operator")?;
            let opcode = match operator.kind {
                TokenKind::Asterisk => Opcode::Multiply,
                _ => Opcode::Divide,
            };
            let right = self.parse_unary()?;
            expression = Expression::binary(operator.loc, opcode, expression, right);
        }

        Ok(expression)
    }

    fn parse_unary(&mut self) -> Result<Expression, Message> {
        if self.peek()?.is_some_and(|t| t.kind.is_unary_operator()) {
            let operator = self.expect_next("an operator")?;
            let opcode = match operator.kind {
                TokenKind::Bang => Opcode::Not,
                _ => Opcode::Minus,
            };
            let operand = self.parse_unary()?;
            return Ok(Expression::unary(operator.loc, opcode, operand));
        }

        self.parse_postfix()
    }

    /// Array accesses and calls chain onto a primary: `f(x)[0]`
    fn parse_postfix(&mut self) -> Result<Expression, Message> {
        let mut expression = self.parse_primary()?;

        loop {
            if self.next_is(TokenKind::OpenBracket)? {
                let bracket = self.expect_next("`[`")?;
                let index = self.parse_expression()?;
                self.expect_next_to_be(TokenKind::CloseBracket, "`]`")?;
                expression =
                    Expression::binary(bracket.loc, Opcode::ArrayAccess, expression, index);
            } else if self.next_is(TokenKind::OpenParen)? {
                let paren = self.expect_next("`(`")?;

                if self.next_is(TokenKind::CloseParen)? {
                    self.next()?;
                    expression = Expression::nullary_call(paren.loc, expression);
                } else {
                    let arguments = self.parse_expression()?;
                    self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;
                    expression =
                        Expression::binary(paren.loc, Opcode::Call, expression, arguments);
                }
            } else {
                break;
            }
        }

        Ok(expression)
    }

    fn parse_primary(&mut self) -> Result<Expression, Message> {
        let token = self.expect_next("an expression")?;

        match token.kind {
            TokenKind::NumberLiteral => {
                let text = self.token_text(&token);
                let value = text.parse::<f64>().map_err(|_| {
                    Message::error(token.loc, format!("Invalid number literal `{text}`"))
                })?;
                Ok(Expression::number(token.loc, value))
            }
            TokenKind::StringLiteral => {
                let raw = &self.token_text(&token)[1..self.token_text(&token).len() - 1];
                Ok(Expression::string(
                    token.loc,
                    lexer::unescape(raw),
                    raw.to_owned(),
                ))
            }
            TokenKind::BooleanLiteral => {
                Ok(Expression::boolean(token.loc, self.token_text(&token) == "true"))
            }
            TokenKind::Identifier => Ok(Expression::identifier(
                token.loc,
                self.token_text(&token).to_owned(),
            )),
            TokenKind::OpenBracket => {
                if self.next_is(TokenKind::CloseBracket)? {
                    self.next()?;
                    return Ok(Expression::array(token.loc, None));
                }

                let items = self.parse_expression()?;
                self.expect_next_to_be(TokenKind::CloseBracket, "`]`")?;
                Ok(Expression::array(token.loc, Some(items)))
            }
            TokenKind::OpenParen => {
                let expression = self.parse_expression()?;
                self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;
                Ok(expression)
            }
            _ => Err(Message::error(
                token.loc,
                format!(
                    "Expected an expression but found `{}`",
                    self.token_text(&token)
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{SourceFileOrigin, ast::ExpressionKind};

    fn parse(contents: &str) -> Result<Vec<Statement>, Message> {
        let source = SourceFile {
            contents: contents.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        Parser::parse_module(&source)
    }

    #[test]
    fn comma_chains_lean_left() {
        let statements = parse("a, b, c;").unwrap();
        let outer = &statements[0].expression;
        assert_eq!(outer.opcode, Opcode::Comma);

        let ExpressionKind::Binary { left, right } = &outer.kind else {
            panic!("expected binary");
        };
        assert_eq!(left.opcode, Opcode::Comma);
        assert_eq!(right.as_ref().unwrap().identifier_name(), Some("c"));
    }

    #[test]
    fn conditional_wraps_branches_in_alt() {
        let statements = parse("x = a ? 1 : 2;").unwrap();
        let ExpressionKind::Binary { right, .. } = &statements[0].expression.kind else {
            panic!("expected assignment");
        };

        let conditional = right.as_ref().unwrap();
        assert_eq!(conditional.opcode, Opcode::Conditional);
        let ExpressionKind::Binary { right, .. } = &conditional.kind else {
            panic!("expected binary");
        };
        assert_eq!(right.as_ref().unwrap().opcode, Opcode::Alt);
    }

    #[test]
    fn wait_statement_collects_ids() {
        let statements = parse("wait (a, b) a + b;").unwrap();
        let crate::frontend::ast::StatementKind::Wait { id_list } = &statements[0].kind else {
            panic!("expected wait statement");
        };
        assert_eq!(id_list, &["a", "b"]);
    }

    #[test]
    fn calls_and_indexing_chain() {
        let statements = parse("x = mean(samples)[0];").unwrap();
        let ExpressionKind::Binary { right, .. } = &statements[0].expression.kind else {
            panic!("expected assignment");
        };
        assert_eq!(right.as_ref().unwrap().opcode, Opcode::ArrayAccess);
    }

    #[test]
    fn nullary_call_has_no_argument_list() {
        let statements = parse("x = pi();").unwrap();
        let ExpressionKind::Binary { right, .. } = &statements[0].expression.kind else {
            panic!("expected assignment");
        };
        let call = right.as_ref().unwrap();
        assert_eq!(call.opcode, Opcode::Call);
        let ExpressionKind::Binary { right, .. } = &call.kind else {
            panic!("expected binary");
        };
        assert!(right.is_none());
    }

    #[test]
    fn missing_semicolon_is_a_syntax_error() {
        let error = parse("x = 1").unwrap_err();
        assert!(error.text.contains("Expected `;`"));
    }

    #[test]
    fn empty_array_literal() {
        let statements = parse("x = [];").unwrap();
        let ExpressionKind::Binary { right, .. } = &statements[0].expression.kind else {
            panic!("expected assignment");
        };
        let ExpressionKind::Array { items, .. } = &right.as_ref().unwrap().kind else {
            panic!("expected array literal");
        };
        assert!(items.is_none());
    }
}
