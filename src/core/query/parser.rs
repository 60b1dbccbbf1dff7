use super::lexer::{Token, TokenType};
use crate::core::errors::*;
use serde_json::{Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Variable(String),
    BindVar(String),
    Attribute(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionRef {
    Named(String),
    Bind(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Collection(CollectionRef),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    For { var: String, source: Source },
    Filter(Expr),
    Let { var: String, expr: Expr },
    Limit { offset: Expr, count: Expr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyKind {
    Insert,
    Update,
    Replace,
    Remove,
}

impl ModifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifyKind::Insert => "INSERT",
            ModifyKind::Update => "UPDATE",
            ModifyKind::Replace => "REPLACE",
            ModifyKind::Remove => "REMOVE",
        }
    }
}

/// A data-modifying terminal: `INSERT doc INTO c`, `UPDATE key WITH patch IN c`,
/// `REPLACE key WITH doc IN c` or `REMOVE key IN c`.
#[derive(Debug, Clone, PartialEq)]
pub struct Modification {
    pub kind: ModifyKind,
    pub target: Expr,
    pub with: Option<Expr>,
    pub collection: CollectionRef,
    pub options: Option<Expr>,
    pub returning: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Return { distinct: bool, expr: Expr },
    Modify(Modification),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub with: Vec<CollectionRef>,
    pub clauses: Vec<Clause>,
    pub terminal: Terminal,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    scope: Vec<String>,
    // Set while parsing a modification target, where a bare IN starts the
    // collection clause instead of a membership test.
    in_is_clause: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            scope: Vec::new(),
            in_is_clause: false,
        }
    }

    pub fn parse(&mut self) -> Result<Query> {
        if self.is_at_end() {
            return Err(Error::parse("empty query"));
        }

        let mut with = Vec::new();
        if self.match_token(&[TokenType::With]) {
            loop {
                with.push(self.collection_ref()?);
                if !self.match_token(&[TokenType::Comma]) {
                    break;
                }
            }
        }

        let mut clauses = Vec::new();
        let terminal = loop {
            let token = self.current().clone();
            match token.token_type {
                TokenType::For => {
                    self.advance();
                    let var = self.declare()?;
                    self.expect(TokenType::In)?;
                    let source = self.source()?;
                    self.scope.push(var.clone());
                    clauses.push(Clause::For { var, source });
                }
                TokenType::Filter => {
                    self.advance();
                    clauses.push(Clause::Filter(self.expression()?));
                }
                TokenType::Let => {
                    self.advance();
                    let var = self.declare()?;
                    self.expect(TokenType::Assign)?;
                    let expr = self.expression()?;
                    self.scope.push(var.clone());
                    clauses.push(Clause::Let { var, expr });
                }
                TokenType::Limit => {
                    self.advance();
                    let first = self.limit_value()?;
                    let (offset, count) = if self.match_token(&[TokenType::Comma]) {
                        (first, self.limit_value()?)
                    } else {
                        (Expr::Literal(Value::from(0)), first)
                    };
                    clauses.push(Clause::Limit { offset, count });
                }
                TokenType::Return => {
                    self.advance();
                    let distinct = self.match_token(&[TokenType::Distinct]);
                    break Terminal::Return {
                        distinct,
                        expr: self.expression()?,
                    };
                }
                TokenType::Insert | TokenType::Update | TokenType::Replace | TokenType::Remove => {
                    break Terminal::Modify(self.modification()?);
                }
                _ => {
                    return Err(self.unexpected("FOR, FILTER, LET, LIMIT, RETURN or a data modification"));
                }
            }
        };

        if !self.is_at_end() {
            return Err(self.unexpected("end of query"));
        }

        Ok(Query { with, clauses, terminal })
    }

    fn modification(&mut self) -> Result<Modification> {
        let kind = match self.advance().token_type {
            TokenType::Insert => ModifyKind::Insert,
            TokenType::Update => ModifyKind::Update,
            TokenType::Replace => ModifyKind::Replace,
            _ => ModifyKind::Remove,
        };

        self.in_is_clause = true;
        let target = self.expression();
        let with = match target {
            Ok(_) if matches!(kind, ModifyKind::Update | ModifyKind::Replace)
                && self.match_token(&[TokenType::With]) =>
            {
                Some(self.expression())
            }
            _ => None,
        };
        self.in_is_clause = false;
        let target = target?;
        let with = with.transpose()?;

        match kind {
            ModifyKind::Insert => {
                if !self.match_token(&[TokenType::Into, TokenType::In]) {
                    return Err(self.unexpected("INTO"));
                }
            }
            _ => {
                if !self.match_token(&[TokenType::In, TokenType::Into]) {
                    return Err(self.unexpected("IN"));
                }
            }
        }
        let collection = self.collection_ref()?;

        let options = if self.match_token(&[TokenType::Options]) {
            let options = self.expression()?;
            if !matches!(options, Expr::Object(_) | Expr::BindVar(_)) {
                return Err(Error::parse("OPTIONS must be an object"));
            }
            Some(options)
        } else {
            None
        };

        let returning = if self.match_token(&[TokenType::Return]) {
            self.scope.push("NEW".to_string());
            self.scope.push("OLD".to_string());
            let expr = self.expression()?;
            self.scope.truncate(self.scope.len() - 2);
            Some(expr)
        } else {
            None
        };

        Ok(Modification {
            kind,
            target,
            with,
            collection,
            options,
            returning,
        })
    }

    fn source(&mut self) -> Result<Source> {
        if self.check(TokenType::BindCollection) {
            let name = self.advance().value.clone();
            return Ok(Source::Collection(CollectionRef::Bind(name)));
        }

        if self.check(TokenType::Ident) {
            let name = self.current().value.clone();
            let follows_access = matches!(
                self.peek_type(),
                TokenType::Dot | TokenType::LBracket
            );
            if !self.scope.contains(&name) && !follows_access {
                self.advance();
                return Ok(Source::Collection(CollectionRef::Named(name)));
            }
        }

        Ok(Source::Expr(self.expression()?))
    }

    fn collection_ref(&mut self) -> Result<CollectionRef> {
        if self.match_token(&[TokenType::Ident]) {
            return Ok(CollectionRef::Named(self.previous().value.clone()));
        }
        if self.match_token(&[TokenType::BindCollection]) {
            return Ok(CollectionRef::Bind(self.previous().value.clone()));
        }
        if self.match_token(&[TokenType::String]) {
            return Ok(CollectionRef::Named(self.previous().value.clone()));
        }
        Err(self.unexpected("collection name"))
    }

    fn limit_value(&mut self) -> Result<Expr> {
        if self.match_token(&[TokenType::Number]) {
            return self.number(&self.previous().value.clone()).map(Expr::Literal);
        }
        if self.match_token(&[TokenType::BindVar]) {
            return Ok(Expr::BindVar(self.previous().value.clone()));
        }
        Err(self.unexpected("a number or bind parameter in LIMIT"))
    }

    fn declare(&mut self) -> Result<String> {
        if !self.check(TokenType::Ident) {
            return Err(self.unexpected("variable name"));
        }
        let name = self.advance().value.clone();
        if self.scope.contains(&name) || name == "NEW" || name == "OLD" {
            return Err(Error::parse(format!("variable '{}' is assigned multiple times", name)));
        }
        Ok(name)
    }

    pub fn expression(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;

        while self.match_token(&[TokenType::Or]) {
            let right = self.and_expr()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;

        while self.match_token(&[TokenType::And]) {
            let right = self.equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.relational()?;

        loop {
            let op = if self.match_token(&[TokenType::Eq]) {
                BinaryOp::Eq
            } else if self.match_token(&[TokenType::Neq]) {
                BinaryOp::Neq
            } else if !self.in_is_clause && self.match_token(&[TokenType::In]) {
                BinaryOp::In
            } else if !self.in_is_clause && self.check(TokenType::Not) && self.peek_type() == TokenType::In {
                self.advance();
                self.advance();
                BinaryOp::NotIn
            } else {
                break;
            };
            let right = self.relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;

        loop {
            let op = match self.current().token_type {
                TokenType::Lt => BinaryOp::Lt,
                TokenType::Lte => BinaryOp::Lte,
                TokenType::Gt => BinaryOp::Gt,
                TokenType::Gte => BinaryOp::Gte,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;

        loop {
            let op = match self.current().token_type {
                TokenType::Plus => BinaryOp::Add,
                TokenType::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;

        loop {
            let op = match self.current().token_type {
                TokenType::Star => BinaryOp::Mul,
                TokenType::Slash => BinaryOp::Div,
                TokenType::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.current().token_type {
            TokenType::Not => UnaryOp::Not,
            TokenType::Minus => UnaryOp::Neg,
            TokenType::Plus => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.match_token(&[TokenType::Dot]) {
                let token = self.advance().clone();
                let is_name = token.token_type == TokenType::Ident
                    || token.value.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
                if !is_name {
                    return Err(Error::parse(format!(
                        "expected attribute name after '.' at position {}",
                        token.pos
                    )));
                }
                expr = Expr::Attribute(Box::new(expr), token.value);
            } else if self.match_token(&[TokenType::LBracket]) {
                let index = self.nested(|p| p.expression())?;
                self.expect(TokenType::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.current().clone();
        match token.token_type {
            TokenType::Number => {
                self.advance();
                Ok(Expr::Literal(self.number(&token.value)?))
            }
            TokenType::String => {
                self.advance();
                Ok(Expr::Literal(Value::String(token.value)))
            }
            TokenType::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenType::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenType::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenType::BindVar => {
                self.advance();
                Ok(Expr::BindVar(token.value))
            }
            TokenType::Ident => {
                self.advance();
                if !self.scope.contains(&token.value) {
                    return Err(Error::parse(format!(
                        "variable '{}' is not declared at position {}",
                        token.value, token.pos
                    )));
                }
                Ok(Expr::Variable(token.value))
            }
            TokenType::LParen => {
                self.advance();
                let expr = self.nested(|p| p.expression())?;
                self.expect(TokenType::RParen)?;
                Ok(expr)
            }
            TokenType::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenType::RBracket) {
                    items.push(self.nested(|p| p.expression())?);
                    if !self.match_token(&[TokenType::Comma]) {
                        break;
                    }
                }
                self.expect(TokenType::RBracket)?;
                Ok(Expr::Array(items))
            }
            TokenType::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                while !self.check(TokenType::RBrace) {
                    let key = self.advance().clone();
                    let valid_key = matches!(key.token_type, TokenType::Ident | TokenType::String)
                        || key.value.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
                    if !valid_key {
                        return Err(Error::parse(format!(
                            "expected attribute name at position {}",
                            key.pos
                        )));
                    }
                    self.expect(TokenType::Colon)?;
                    fields.push((key.value, self.nested(|p| p.expression())?));
                    if !self.match_token(&[TokenType::Comma]) {
                        break;
                    }
                }
                self.expect(TokenType::RBrace)?;
                Ok(Expr::Object(fields))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    /// Parses a bracketed sub-expression, where IN is always an operator.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::replace(&mut self.in_is_clause, false);
        let result = f(self);
        self.in_is_clause = saved;
        result
    }

    fn number(&self, text: &str) -> Result<Value> {
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::from(int));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| Error::parse(format!("invalid number: {}", text)))
    }

    fn unexpected(&self, expected: &str) -> Error {
        let token = self.current();
        Error::parse(format!(
            "expected {} at position {}, got {}",
            expected, token.pos, token.token_type
        ))
    }

    fn expect(&mut self, token_type: TokenType) -> Result<()> {
        if self.match_token(&[token_type]) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", token_type)))
        }
    }

    fn current(&self) -> &Token {
        if self.pos >= self.tokens.len() {
            &self.tokens[self.tokens.len() - 1]
        } else {
            &self.tokens[self.pos]
        }
    }

    fn peek_type(&self) -> TokenType {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.token_type)
            .unwrap_or(TokenType::Eof)
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn check(&self, token_type: TokenType) -> bool {
        if self.is_at_end() {
            token_type == TokenType::Eof
        } else {
            self.current().token_type == token_type
        }
    }

    fn match_token(&mut self, types: &[TokenType]) -> bool {
        for &token_type in types {
            if token_type != TokenType::Eof && self.check(token_type) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.pos += 1;
        }
        self.previous()
    }

    fn is_at_end(&self) -> bool {
        self.current().token_type == TokenType::Eof
    }
}

pub fn parse_query(query: &str) -> Result<Query> {
    let tokens = super::lexer::tokenize(query)?;
    let mut parser = Parser::new(tokens);
    parser.parse()
}
