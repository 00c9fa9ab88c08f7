//! Sandboxed expression language used by rule placeholders and `dsl` matchers.
//!
//! Only calls to the functions in [`FUNCTIONS`] are accepted. Function names are
//! checked while parsing, so an expression naming anything else is rejected
//! before a single sub-expression runs.

use crate::template::ResponseInfo;
use crate::{Result, ScanError};
use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;

type BuiltinFn = fn(&[DslValue]) -> Result<DslValue>;

const ALPHANUMERIC: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// The whole callable surface of the language.
pub static FUNCTIONS: Lazy<HashMap<&'static str, BuiltinFn>> = Lazy::new(|| {
    let mut functions: HashMap<&'static str, BuiltinFn> = HashMap::new();
    functions.insert("contains", builtin_contains);
    functions.insert("to_lower", builtin_to_lower);
    functions.insert("rand_base", builtin_rand_base);
    functions
});

#[derive(Debug, Clone, PartialEq)]
pub enum DslValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for DslValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DslValue::String(s) => write!(f, "{}", s),
            DslValue::Integer(i) => write!(f, "{}", i),
            DslValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl DslValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            DslValue::Boolean(b) => *b,
            DslValue::String(s) => !s.is_empty(),
            DslValue::Integer(i) => *i != 0,
        }
    }

    pub fn to_integer(&self) -> Result<i64> {
        match self {
            DslValue::Integer(i) => Ok(*i),
            DslValue::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| ScanError::Evaluation(format!("cannot convert '{}' to integer: {}", s, e))),
            DslValue::Boolean(b) => Ok(i64::from(*b)),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, DslValue::String(s) if s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    StringLiteral(String),
    IntegerLiteral(i64),
    BooleanLiteral(bool),
    LeftParen,
    RightParen,
    Comma,
    Dot,
    And,
    Or,
    Not,
    Equal,
    NotEqual,
    Eof,
}

struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current_char = chars.first().copied();
        Lexer {
            input: chars,
            position: 0,
            current_char,
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn read_string(&mut self, quote: char) -> Result<String> {
        let mut result = String::new();
        self.advance();

        while let Some(ch) = self.current_char {
            if ch == quote {
                self.advance();
                return Ok(result);
            } else if ch == '\\' {
                self.advance();
                match self.current_char {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('r') => result.push('\r'),
                    Some(c) => result.push(c),
                    None => return Err(ScanError::Evaluation("incomplete escape sequence".to_string())),
                }
                self.advance();
            } else {
                result.push(ch);
                self.advance();
            }
        }

        Err(ScanError::Evaluation("unterminated string literal".to_string()))
    }

    fn read_number(&mut self) -> Result<Token> {
        let mut result = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
            .parse()
            .map(Token::IntegerLiteral)
            .map_err(|e| ScanError::Evaluation(format!("invalid number '{}': {}", result, e)))
    }

    fn read_identifier(&mut self) -> Token {
        let mut result = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match result.as_str() {
            "true" | "True" => Token::BooleanLiteral(true),
            "false" | "False" => Token::BooleanLiteral(false),
            _ => Token::Identifier(result),
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        loop {
            match self.current_char {
                None => return Ok(Token::Eof),
                Some(ch) if ch.is_whitespace() => self.advance(),
                Some(q @ ('"' | '\'')) => return Ok(Token::StringLiteral(self.read_string(q)?)),
                Some(ch) if ch.is_ascii_digit() => return self.read_number(),
                Some(ch) if ch.is_alphabetic() || ch == '_' => return Ok(self.read_identifier()),
                Some('(') => {
                    self.advance();
                    return Ok(Token::LeftParen);
                }
                Some(')') => {
                    self.advance();
                    return Ok(Token::RightParen);
                }
                Some(',') => {
                    self.advance();
                    return Ok(Token::Comma);
                }
                Some('.') => {
                    self.advance();
                    return Ok(Token::Dot);
                }
                Some('&') => {
                    self.advance();
                    if self.current_char == Some('&') {
                        self.advance();
                        return Ok(Token::And);
                    }
                    return Err(ScanError::Evaluation("unexpected character: &".to_string()));
                }
                Some('|') => {
                    self.advance();
                    if self.current_char == Some('|') {
                        self.advance();
                        return Ok(Token::Or);
                    }
                    return Err(ScanError::Evaluation("unexpected character: |".to_string()));
                }
                Some('!') => {
                    self.advance();
                    if self.current_char == Some('=') {
                        self.advance();
                        return Ok(Token::NotEqual);
                    }
                    return Ok(Token::Not);
                }
                Some('=') => {
                    self.advance();
                    if self.current_char == Some('=') {
                        self.advance();
                        return Ok(Token::Equal);
                    }
                    return Err(ScanError::Evaluation("unexpected character: =".to_string()));
                }
                Some(ch) => {
                    return Err(ScanError::Evaluation(format!("unexpected character: {}", ch)));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum AstNode {
    Literal(DslValue),
    /// Dotted names such as `response.body` are folded into one variable.
    Variable(String),
    FunctionCall { name: String, args: Vec<AstNode> },
    BinaryOp { left: Box<AstNode>, operator: BinaryOperator, right: Box<AstNode> },
    Not(Box<AstNode>),
}

#[derive(Debug, Clone, Copy)]
pub enum BinaryOperator {
    And,
    Or,
    Equal,
    NotEqual,
}

struct Parser {
    lexer: Lexer,
    current_token: Token,
}

impl Parser {
    fn new(mut lexer: Lexer) -> Result<Self> {
        let current_token = lexer.next_token()?;
        Ok(Parser { lexer, current_token })
    }

    fn advance(&mut self) -> Result<()> {
        self.current_token = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.current_token == expected {
            self.advance()
        } else {
            Err(ScanError::Evaluation(format!(
                "expected {:?}, found {:?}",
                expected, self.current_token
            )))
        }
    }

    fn parse(&mut self) -> Result<AstNode> {
        let node = self.parse_or()?;
        if self.current_token != Token::Eof {
            return Err(ScanError::Evaluation(format!(
                "unexpected trailing token {:?}",
                self.current_token
            )));
        }
        Ok(node)
    }

    fn parse_or(&mut self) -> Result<AstNode> {
        let mut left = self.parse_and()?;
        while self.current_token == Token::Or {
            self.advance()?;
            let right = self.parse_and()?;
            left = AstNode::BinaryOp {
                left: Box::new(left),
                operator: BinaryOperator::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<AstNode> {
        let mut left = self.parse_equality()?;
        while self.current_token == Token::And {
            self.advance()?;
            let right = self.parse_equality()?;
            left = AstNode::BinaryOp {
                left: Box::new(left),
                operator: BinaryOperator::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<AstNode> {
        let mut left = self.parse_unary()?;
        loop {
            let operator = match self.current_token {
                Token::Equal => BinaryOperator::Equal,
                Token::NotEqual => BinaryOperator::NotEqual,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = AstNode::BinaryOp {
                left: Box::new(left),
                operator,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<AstNode> {
        if self.current_token == Token::Not {
            self.advance()?;
            let operand = self.parse_unary()?;
            return Ok(AstNode::Not(Box::new(operand)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<AstNode> {
        match self.current_token.clone() {
            Token::StringLiteral(s) => {
                self.advance()?;
                Ok(AstNode::Literal(DslValue::String(s)))
            }
            Token::IntegerLiteral(i) => {
                self.advance()?;
                Ok(AstNode::Literal(DslValue::Integer(i)))
            }
            Token::BooleanLiteral(b) => {
                self.advance()?;
                Ok(AstNode::Literal(DslValue::Boolean(b)))
            }
            Token::Identifier(name) => {
                self.advance()?;
                if self.current_token == Token::LeftParen {
                    if !FUNCTIONS.contains_key(name.as_str()) {
                        return Err(ScanError::Evaluation(format!("function '{}' is not allowed", name)));
                    }
                    self.advance()?;
                    let mut args = Vec::new();
                    if self.current_token != Token::RightParen {
                        loop {
                            args.push(self.parse_or()?);
                            if self.current_token == Token::Comma {
                                self.advance()?;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RightParen)?;
                    Ok(AstNode::FunctionCall { name, args })
                } else {
                    let mut path = name;
                    while self.current_token == Token::Dot {
                        self.advance()?;
                        match self.current_token.clone() {
                            Token::Identifier(property) => {
                                self.advance()?;
                                path.push('.');
                                path.push_str(&property);
                            }
                            other => {
                                return Err(ScanError::Evaluation(format!(
                                    "expected property name, found {:?}",
                                    other
                                )))
                            }
                        }
                    }
                    Ok(AstNode::Variable(path))
                }
            }
            Token::LeftParen => {
                self.advance()?;
                let expr = self.parse_or()?;
                self.expect(Token::RightParen)?;
                Ok(expr)
            }
            other => Err(ScanError::Evaluation(format!("unexpected token {:?}", other))),
        }
    }
}

/// Parse an expression without running it.
pub fn parse(expression: &str) -> Result<AstNode> {
    Parser::new(Lexer::new(expression))?.parse()
}

/// Variable bindings visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct DslContext {
    variables: HashMap<String, DslValue>,
}

impl DslContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an HTTP response as `body`, `status_code`, `headers`, `header`,
    /// `content_length` and the same names under `response.`.
    pub fn from_response(response: &ResponseInfo) -> Self {
        let mut context = Self::new();
        let header_text = response.header_text();
        let bindings = [
            ("body", DslValue::String(response.body.clone())),
            ("status_code", DslValue::Integer(i64::from(response.status_code))),
            ("headers", DslValue::String(header_text.clone())),
            ("header", DslValue::String(header_text)),
            ("content_length", DslValue::Integer(response.body.len() as i64)),
        ];
        for (name, value) in bindings {
            context.set_variable(format!("response.{}", name), value.clone());
            context.set_variable(name.to_string(), value);
        }
        context
    }

    pub fn set_variable(&mut self, name: String, value: DslValue) {
        self.variables.insert(name, value);
    }

    pub fn evaluate(&self, node: &AstNode) -> Result<DslValue> {
        match node {
            AstNode::Literal(value) => Ok(value.clone()),
            AstNode::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| ScanError::Evaluation(format!("name '{}' is not defined", name))),
            AstNode::FunctionCall { name, args } => {
                let func = FUNCTIONS
                    .get(name.as_str())
                    .ok_or_else(|| ScanError::Evaluation(format!("function '{}' is not allowed", name)))?;
                let values = args
                    .iter()
                    .map(|arg| self.evaluate(arg))
                    .collect::<Result<Vec<_>>>()?;
                func(&values)
            }
            AstNode::BinaryOp { left, operator, right } => {
                let left_val = self.evaluate(left)?;
                match operator {
                    BinaryOperator::And if !left_val.is_truthy() => Ok(DslValue::Boolean(false)),
                    BinaryOperator::Or if left_val.is_truthy() => Ok(DslValue::Boolean(true)),
                    BinaryOperator::And | BinaryOperator::Or => {
                        Ok(DslValue::Boolean(self.evaluate(right)?.is_truthy()))
                    }
                    BinaryOperator::Equal => Ok(DslValue::Boolean(values_equal(&left_val, &self.evaluate(right)?))),
                    BinaryOperator::NotEqual => {
                        Ok(DslValue::Boolean(!values_equal(&left_val, &self.evaluate(right)?)))
                    }
                }
            }
            AstNode::Not(operand) => Ok(DslValue::Boolean(!self.evaluate(operand)?.is_truthy())),
        }
    }

    pub fn evaluate_expression(&self, expression: &str) -> Result<DslValue> {
        let ast = parse(expression)?;
        self.evaluate(&ast)
    }
}

fn values_equal(left: &DslValue, right: &DslValue) -> bool {
    match (left, right) {
        (DslValue::Integer(a), DslValue::Integer(b)) => a == b,
        (DslValue::Boolean(a), DslValue::Boolean(b)) => a == b,
        _ => left.to_string() == right.to_string(),
    }
}

/// Evaluate a standalone expression with no variables bound, as used inside
/// `{{...}}` placeholders. An empty result is an error.
pub fn evaluate(expression: &str) -> Result<DslValue> {
    let value = DslContext::new().evaluate_expression(expression)?;
    if value.is_empty() {
        return Err(ScanError::Evaluation(format!(
            "evaluation result is empty for expression: {}",
            expression
        )));
    }
    Ok(value)
}

fn builtin_contains(args: &[DslValue]) -> Result<DslValue> {
    if args.len() != 2 {
        return Err(ScanError::Evaluation("contains() takes 2 arguments".to_string()));
    }
    let haystack = args[0].to_string();
    let needle = args[1].to_string();
    Ok(DslValue::Boolean(haystack.contains(&needle)))
}

fn builtin_to_lower(args: &[DslValue]) -> Result<DslValue> {
    if args.len() != 1 {
        return Err(ScanError::Evaluation("to_lower() takes 1 argument".to_string()));
    }
    Ok(DslValue::String(args[0].to_string().to_lowercase()))
}

fn builtin_rand_base(args: &[DslValue]) -> Result<DslValue> {
    if args.is_empty() || args.len() > 2 {
        return Err(ScanError::Evaluation("rand_base() takes 1 or 2 arguments".to_string()));
    }

    let length = args[0].to_integer()?;
    let length = usize::try_from(length)
        .map_err(|_| ScanError::Evaluation(format!("rand_base() length must be positive, got {}", length)))?;
    let charset: Vec<char> = match args.get(1) {
        Some(custom) => custom.to_string().chars().collect(),
        None => ALPHANUMERIC.chars().collect(),
    };
    if charset.is_empty() {
        return Err(ScanError::Evaluation("rand_base() charset is empty".to_string()));
    }

    let mut rng = rand::thread_rng();
    let result: String = (0..length)
        .map(|_| charset[rng.gen_range(0..charset.len())])
        .collect();

    Ok(DslValue::String(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_evaluation_error(result: Result<DslValue>) -> bool {
        matches!(result, Err(ScanError::Evaluation(_)))
    }

    #[test]
    fn test_only_whitelisted_calls_parse() {
        for expression in [r#"__import__("os")"#, "system('id')", r#"to_lower(exec("x"))"#] {
            assert!(parse(expression).is_err(), "{} parsed", expression);
            assert!(is_evaluation_error(evaluate(expression)));
        }
        assert!(parse(r#"contains(to_lower("A"), "a")"#).is_ok());
    }

    #[test]
    fn test_placeholder_evaluation_has_no_variables() {
        assert!(is_evaluation_error(evaluate("body")));
        assert!(is_evaluation_error(evaluate("response.body")));
    }

    #[test]
    fn test_builtin_contracts() {
        assert_eq!(evaluate(r#"to_lower("NGINX")"#).unwrap(), DslValue::String("nginx".to_string()));
        assert_eq!(evaluate("contains('Apache/2.4', 'Apache')").unwrap(), DslValue::Boolean(true));
        assert_eq!(evaluate("rand_base(4, 'x')").unwrap().to_string(), "xxxx");

        let token = evaluate("rand_base(12)").unwrap().to_string();
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        // Empty results and bad arity are errors.
        assert!(is_evaluation_error(evaluate("rand_base(0)")));
        assert!(is_evaluation_error(evaluate("to_lower()")));
        assert!(is_evaluation_error(evaluate("contains('a')")));
        assert!(is_evaluation_error(evaluate("rand_base(-1)")));
    }

    #[test]
    fn test_response_bindings() {
        let response = ResponseInfo::new(
            200,
            vec![("Set-Cookie".to_string(), "PHPSESSID=1".to_string())],
            "<h1>Admin</h1>",
        );
        let context = DslContext::from_response(&response);

        let matched = context
            .evaluate_expression(r#"contains(to_lower(body), "admin") && status_code == 200"#)
            .unwrap();
        assert!(matched.is_truthy());
        assert!(context
            .evaluate_expression(r#"contains(headers, "PHPSESSID") && !(response.status_code != 200)"#)
            .unwrap()
            .is_truthy());
        assert!(!context.evaluate_expression("content_length == 0").unwrap().is_truthy());
    }

    #[test]
    fn test_booleans_render_lowercase() {
        assert_eq!(DslValue::Boolean(true).to_string(), "true");
        assert_eq!(evaluate("True").unwrap(), DslValue::Boolean(true));
    }
}
