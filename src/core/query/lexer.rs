use crate::core::errors::*;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Eof,
    Illegal,

    Ident,
    String,
    Number,
    BindVar,
    BindCollection,
    True,
    False,
    Null,

    For,
    In,
    Filter,
    Let,
    Limit,
    Return,
    Distinct,
    Insert,
    Update,
    Replace,
    Remove,
    Into,
    With,
    Options,

    And,
    Or,
    Not,

    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Assign,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            TokenType::Eof => "end of query",
            TokenType::Illegal => "ILLEGAL",
            TokenType::Ident => "identifier",
            TokenType::String => "string",
            TokenType::Number => "number",
            TokenType::BindVar => "bind parameter",
            TokenType::BindCollection => "collection bind parameter",
            TokenType::True => "TRUE",
            TokenType::False => "FALSE",
            TokenType::Null => "NULL",
            TokenType::For => "FOR",
            TokenType::In => "IN",
            TokenType::Filter => "FILTER",
            TokenType::Let => "LET",
            TokenType::Limit => "LIMIT",
            TokenType::Return => "RETURN",
            TokenType::Distinct => "DISTINCT",
            TokenType::Insert => "INSERT",
            TokenType::Update => "UPDATE",
            TokenType::Replace => "REPLACE",
            TokenType::Remove => "REMOVE",
            TokenType::Into => "INTO",
            TokenType::With => "WITH",
            TokenType::Options => "OPTIONS",
            TokenType::And => "AND",
            TokenType::Or => "OR",
            TokenType::Not => "NOT",
            TokenType::Eq => "==",
            TokenType::Neq => "!=",
            TokenType::Gt => ">",
            TokenType::Gte => ">=",
            TokenType::Lt => "<",
            TokenType::Lte => "<=",
            TokenType::Assign => "=",
            TokenType::Plus => "+",
            TokenType::Minus => "-",
            TokenType::Star => "*",
            TokenType::Slash => "/",
            TokenType::Percent => "%",
            TokenType::LParen => "(",
            TokenType::RParen => ")",
            TokenType::LBracket => "[",
            TokenType::RBracket => "]",
            TokenType::LBrace => "{",
            TokenType::RBrace => "}",
            TokenType::Comma => ",",
            TokenType::Dot => ".",
            TokenType::Colon => ":",
        };
        write!(f, "{}", text)
    }
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenType>> = Lazy::new(|| {
    HashMap::from([
        ("FOR", TokenType::For),
        ("IN", TokenType::In),
        ("FILTER", TokenType::Filter),
        ("LET", TokenType::Let),
        ("LIMIT", TokenType::Limit),
        ("RETURN", TokenType::Return),
        ("DISTINCT", TokenType::Distinct),
        ("INSERT", TokenType::Insert),
        ("UPDATE", TokenType::Update),
        ("REPLACE", TokenType::Replace),
        ("REMOVE", TokenType::Remove),
        ("INTO", TokenType::Into),
        ("WITH", TokenType::With),
        ("OPTIONS", TokenType::Options),
        ("AND", TokenType::And),
        ("OR", TokenType::Or),
        ("NOT", TokenType::Not),
        ("TRUE", TokenType::True),
        ("FALSE", TokenType::False),
        ("NULL", TokenType::Null),
    ])
});

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    pub pos: usize,
}

impl Token {
    fn new(token_type: TokenType, value: impl Into<String>, pos: usize) -> Self {
        Self {
            token_type,
            value: value.into(),
            pos,
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    ch: char,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let mut lexer = Self {
            input: input.chars().collect(),
            pos: 0,
            ch: '\0',
        };
        lexer.read_char();
        lexer
    }

    fn read_char(&mut self) {
        self.ch = self.input.get(self.pos).copied().unwrap_or('\0');
        self.pos += 1;
    }

    fn peek_char(&self) -> char {
        self.input.get(self.pos).copied().unwrap_or('\0')
    }

    fn single(&mut self, token_type: TokenType, pos: usize) -> Token {
        let tok = Token::new(token_type, self.ch.to_string(), pos);
        self.read_char();
        tok
    }

    /// Consumes a two-character operator when the next character is
    /// `second`, otherwise the single-character `fallback`.
    fn pair(&mut self, second: char, double: TokenType, fallback: TokenType, pos: usize) -> Token {
        if self.peek_char() == second {
            let text: String = [self.ch, second].iter().collect();
            self.read_char();
            self.read_char();
            Token::new(double, text, pos)
        } else {
            self.single(fallback, pos)
        }
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace_and_comments()?;

        let token_pos = self.pos.saturating_sub(1);

        let token = match self.ch {
            '\0' => Token::new(TokenType::Eof, "", token_pos),
            '(' => self.single(TokenType::LParen, token_pos),
            ')' => self.single(TokenType::RParen, token_pos),
            '[' => self.single(TokenType::LBracket, token_pos),
            ']' => self.single(TokenType::RBracket, token_pos),
            '{' => self.single(TokenType::LBrace, token_pos),
            '}' => self.single(TokenType::RBrace, token_pos),
            ',' => self.single(TokenType::Comma, token_pos),
            '.' => self.single(TokenType::Dot, token_pos),
            ':' => self.single(TokenType::Colon, token_pos),
            '+' => self.single(TokenType::Plus, token_pos),
            '-' => self.single(TokenType::Minus, token_pos),
            '*' => self.single(TokenType::Star, token_pos),
            '/' => self.single(TokenType::Slash, token_pos),
            '%' => self.single(TokenType::Percent, token_pos),
            '=' => self.pair('=', TokenType::Eq, TokenType::Assign, token_pos),
            '!' => self.pair('=', TokenType::Neq, TokenType::Not, token_pos),
            '>' => self.pair('=', TokenType::Gte, TokenType::Gt, token_pos),
            '<' => self.pair('=', TokenType::Lte, TokenType::Lt, token_pos),
            '&' if self.peek_char() == '&' => self.pair('&', TokenType::And, TokenType::Illegal, token_pos),
            '|' if self.peek_char() == '|' => self.pair('|', TokenType::Or, TokenType::Illegal, token_pos),
            '"' | '\'' => {
                let value = self.read_string(token_pos)?;
                Token::new(TokenType::String, value, token_pos)
            }
            '`' => {
                let value = self.read_string(token_pos)?;
                Token::new(TokenType::Ident, value, token_pos)
            }
            '@' => {
                self.read_char();
                let token_type = if self.ch == '@' {
                    self.read_char();
                    TokenType::BindCollection
                } else {
                    TokenType::BindVar
                };
                if !is_ident_start(self.ch) && !self.ch.is_ascii_digit() {
                    return Err(Error::parse(format!(
                        "expected bind parameter name at position {}",
                        token_pos
                    )));
                }
                let value = self.read_identifier();
                Token::new(token_type, value, token_pos)
            }
            ch if is_ident_start(ch) => {
                let value = self.read_identifier();
                let token_type = KEYWORDS
                    .get(value.to_ascii_uppercase().as_str())
                    .copied()
                    .unwrap_or(TokenType::Ident);
                Token::new(token_type, value, token_pos)
            }
            ch if ch.is_ascii_digit() => {
                let value = self.read_number();
                Token::new(TokenType::Number, value, token_pos)
            }
            _ => self.single(TokenType::Illegal, token_pos),
        };

        Ok(token)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            while self.ch.is_whitespace() {
                self.read_char();
            }

            match (self.ch, self.peek_char()) {
                ('/', '/') => {
                    while self.ch != '\n' && self.ch != '\0' {
                        self.read_char();
                    }
                }
                ('/', '*') => {
                    let start = self.pos - 1;
                    self.read_char();
                    self.read_char();
                    while !(self.ch == '*' && self.peek_char() == '/') {
                        if self.ch == '\0' {
                            return Err(Error::parse(format!("unterminated comment at position {}", start)));
                        }
                        self.read_char();
                    }
                    self.read_char();
                    self.read_char();
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos - 1;
        while is_ident_start(self.ch) || self.ch.is_ascii_digit() {
            self.read_char();
        }
        self.input[start..self.pos - 1].iter().collect()
    }

    fn read_number(&mut self) -> String {
        let start = self.pos - 1;
        while self.ch.is_ascii_digit() {
            self.read_char();
        }

        if self.ch == '.' && self.peek_char().is_ascii_digit() {
            self.read_char();
            while self.ch.is_ascii_digit() {
                self.read_char();
            }
        }

        if self.ch == 'e' || self.ch == 'E' {
            let next = self.peek_char();
            if next.is_ascii_digit() || next == '-' || next == '+' {
                self.read_char();
                self.read_char();
                while self.ch.is_ascii_digit() {
                    self.read_char();
                }
            }
        }

        self.input[start..self.pos - 1].iter().collect()
    }

    fn read_string(&mut self, start: usize) -> Result<String> {
        let quote = self.ch;
        self.read_char();

        let mut value = String::new();
        loop {
            match self.ch {
                '\0' => {
                    return Err(Error::parse(format!("unterminated string at position {}", start)));
                }
                '\\' => {
                    self.read_char();
                    let escaped = match self.ch {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\0' => {
                            return Err(Error::parse(format!("unterminated string at position {}", start)));
                        }
                        other => other,
                    };
                    value.push(escaped);
                }
                ch if ch == quote => break,
                ch => value.push(ch),
            }
            self.read_char();
        }

        self.read_char();
        Ok(value)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

pub fn tokenize(query: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(query);
    let mut tokens = Vec::new();

    loop {
        let token = lexer.next_token()?;
        if token.token_type == TokenType::Illegal {
            return Err(Error::parse(format!(
                "illegal token at position {}: {}",
                token.pos, token.value
            )));
        }
        let is_eof = token.token_type == TokenType::Eof;
        tokens.push(token);
        if is_eof {
            break;
        }
    }

    Ok(tokens)
}
