// Restricted expression evaluator for transformer and code nodes
//
// User-authored transforms run through this evaluator instead of any
// in-process script engine: arithmetic, comparisons, boolean logic, dotted
// field access into the node input, and a closed set of string/array
// functions. No host access of any kind.
//
// Grammar (precedence low to high):
//   or     := and ("||" and)*
//   and    := cmp ("&&" cmp)*
//   cmp    := sum (("=="|"!="|"<"|"<="|">"|">=") sum)?
//   sum    := term (("+"|"-") term)*
//   term   := unary (("*"|"/"|"%") unary)*
//   unary  := ("-"|"!") unary | primary
//   primary := number | string | true | false | null
//            | ident ("." ident)* | ident "(" args ")" | "(" or ")"

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("Parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Type error: {0}")]
    Type(String),
    #[error("Division by zero")]
    DivisionByZero,
}

type ExprResult<T> = std::result::Result<T, ExprError>;

/// Evaluate an expression against the node's input data
pub fn evaluate(source: &str, data: &Value) -> ExprResult<Value> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    eval(&expr, data)
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> ExprResult<Vec<(usize, Token)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push((
                    i,
                    Token::Op(match c {
                        '+' => "+",
                        '-' => "-",
                        '*' => "*",
                        '/' => "/",
                        _ => "%",
                    }),
                ));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two = if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    Some(match c {
                        '=' => "==",
                        '!' => "!=",
                        '<' => "<=",
                        _ => ">=",
                    })
                } else {
                    None
                };
                if let Some(op) = two {
                    tokens.push((i, Token::Op(op)));
                    i += 2;
                } else {
                    match c {
                        '!' => {
                            tokens.push((i, Token::Op("!")));
                            i += 1;
                        }
                        '<' => {
                            tokens.push((i, Token::Op("<")));
                            i += 1;
                        }
                        '>' => {
                            tokens.push((i, Token::Op(">")));
                            i += 1;
                        }
                        _ => {
                            return Err(ExprError::Parse {
                                offset: i,
                                message: "single '=' is not an operator".into(),
                            })
                        }
                    }
                }
            }
            '&' | '|' => {
                if i + 1 < bytes.len() && bytes[i + 1] == bytes[i] {
                    tokens.push((i, Token::Op(if c == '&' { "&&" } else { "||" })));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        offset: i,
                        message: format!("unexpected character '{c}'"),
                    });
                }
            }
            '\'' | '"' => {
                let quote = bytes[i];
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ExprError::Parse {
                        offset: i,
                        message: "unterminated string literal".into(),
                    });
                }
                tokens.push((i, Token::Str(source[start..j].to_string())));
                i = j + 1;
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &source[start..i];
                let value = text.parse::<f64>().map_err(|_| ExprError::Parse {
                    offset: start,
                    message: format!("bad number literal '{text}'"),
                })?;
                tokens.push((start, Token::Number(value)));
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'$'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(source[start..i].to_string())));
            }
            _ => {
                return Err(ExprError::Parse {
                    offset: i,
                    message: format!("unexpected character '{c}'"),
                })
            }
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(String),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(usize::MAX)
    }

    fn expect_end(&self) -> ExprResult<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ExprError::Parse {
                offset: self.offset(),
                message: "trailing input after expression".into(),
            })
        }
    }

    fn parse_or(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op("||")) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Binary("||", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::Op("&&")) {
            self.bump();
            let right = self.parse_cmp()?;
            left = Expr::Binary("&&", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> ExprResult<Expr> {
        let left = self.parse_sum()?;
        if let Some(Token::Op(op)) = self.peek() {
            if matches!(*op, "==" | "!=" | "<" | "<=" | ">" | ">=") {
                let op = *op;
                self.bump();
                let right = self.parse_sum()?;
                return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
            }
        }
        Ok(left)
    }

    fn parse_sum(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_term()?;
        while let Some(Token::Op(op @ ("+" | "-"))) = self.peek() {
            let op = *op;
            self.bump();
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ ("*" | "/" | "%"))) = self.peek() {
            let op = *op;
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ExprResult<Expr> {
        match self.peek() {
            Some(Token::Op("-")) => {
                self.bump();
                Ok(Expr::Unary("-", Box::new(self.parse_unary()?)))
            }
            Some(Token::Op("!")) => {
                self.bump();
                Ok(Expr::Unary("!", Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> ExprResult<Expr> {
        let offset = self.offset();
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Literal(json!(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        self.bump();
                        let mut args = Vec::new();
                        if self.peek() != Some(&Token::RParen) {
                            loop {
                                args.push(self.parse_or()?);
                                match self.peek() {
                                    Some(Token::Comma) => {
                                        self.bump();
                                    }
                                    _ => break,
                                }
                            }
                        }
                        match self.bump() {
                            Some(Token::RParen) => Ok(Expr::Call(name, args)),
                            _ => Err(ExprError::Parse {
                                offset,
                                message: "expected ')' after arguments".into(),
                            }),
                        }
                    } else {
                        Ok(Expr::Path(name))
                    }
                }
            },
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Parse {
                        offset,
                        message: "expected ')'".into(),
                    }),
                }
            }
            other => Err(ExprError::Parse {
                offset,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval(expr: &Expr, data: &Value) -> ExprResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(crate::template::lookup_path(data, path)
            .cloned()
            .unwrap_or(Value::Null)),
        Expr::Unary(op, inner) => {
            let value = eval(inner, data)?;
            match *op {
                "-" => Ok(json!(-as_number(&value)?)),
                "!" => Ok(Value::Bool(!truthy(&value))),
                _ => unreachable!(),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit boolean operators
            match *op {
                "&&" => {
                    let left = eval(lhs, data)?;
                    return if truthy(&left) {
                        eval(rhs, data)
                    } else {
                        Ok(left)
                    };
                }
                "||" => {
                    let left = eval(lhs, data)?;
                    return if truthy(&left) {
                        Ok(left)
                    } else {
                        eval(rhs, data)
                    };
                }
                _ => {}
            }
            let left = eval(lhs, data)?;
            let right = eval(rhs, data)?;
            eval_binary(op, &left, &right)
        }
        Expr::Call(name, args) => {
            let values: Vec<Value> = args
                .iter()
                .map(|a| eval(a, data))
                .collect::<ExprResult<_>>()?;
            call_function(name, &values)
        }
    }
}

fn eval_binary(op: &str, left: &Value, right: &Value) -> ExprResult<Value> {
    match op {
        "+" => {
            // String concatenation when either side is a string
            if left.is_string() || right.is_string() {
                Ok(Value::String(format!(
                    "{}{}",
                    as_display(left),
                    as_display(right)
                )))
            } else {
                Ok(json!(as_number(left)? + as_number(right)?))
            }
        }
        "-" => Ok(json!(as_number(left)? - as_number(right)?)),
        "*" => Ok(json!(as_number(left)? * as_number(right)?)),
        "/" => {
            let divisor = as_number(right)?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(json!(as_number(left)? / divisor))
        }
        "%" => {
            let divisor = as_number(right)?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(json!(as_number(left)? % divisor))
        }
        "==" => Ok(Value::Bool(loose_eq(left, right))),
        "!=" => Ok(Value::Bool(!loose_eq(left, right))),
        "<" => Ok(Value::Bool(as_number(left)? < as_number(right)?)),
        "<=" => Ok(Value::Bool(as_number(left)? <= as_number(right)?)),
        ">" => Ok(Value::Bool(as_number(left)? > as_number(right)?)),
        ">=" => Ok(Value::Bool(as_number(left)? >= as_number(right)?)),
        _ => unreachable!(),
    }
}

fn call_function(name: &str, args: &[Value]) -> ExprResult<Value> {
    let arg = |i: usize| args.get(i).unwrap_or(&Value::Null);
    match name {
        "upper" => Ok(Value::String(as_display(arg(0)).to_uppercase())),
        "lower" => Ok(Value::String(as_display(arg(0)).to_lowercase())),
        "trim" => Ok(Value::String(as_display(arg(0)).trim().to_string())),
        "length" => match arg(0) {
            Value::String(s) => Ok(json!(s.chars().count())),
            Value::Array(a) => Ok(json!(a.len())),
            Value::Object(o) => Ok(json!(o.len())),
            _ => Ok(json!(0)),
        },
        "concat" => Ok(Value::String(
            args.iter().map(as_display).collect::<Vec<_>>().join(""),
        )),
        "contains" => match (arg(0), arg(1)) {
            (Value::Array(a), needle) => Ok(Value::Bool(a.contains(needle))),
            (haystack, needle) => Ok(Value::Bool(
                as_display(haystack).contains(&as_display(needle)),
            )),
        },
        "join" => {
            let sep = match arg(1) {
                Value::Null => ",".to_string(),
                v => as_display(v),
            };
            match arg(0) {
                Value::Array(items) => Ok(Value::String(
                    items.iter().map(as_display).collect::<Vec<_>>().join(&sep),
                )),
                other => Ok(Value::String(as_display(other))),
            }
        }
        "round" => Ok(json!(as_number(arg(0))?.round())),
        "abs" => Ok(json!(as_number(arg(0))?.abs())),
        "min" => Ok(json!(as_number(arg(0))?.min(as_number(arg(1))?))),
        "max" => Ok(json!(as_number(arg(0))?.max(as_number(arg(1))?))),
        "number" => Ok(json!(as_number(arg(0))?)),
        "string" => Ok(Value::String(as_display(arg(0)))),
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn as_number(value: &Value) -> ExprResult<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExprError::Type("number out of range".into())),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ExprError::Type(format!("'{s}' is not a number"))),
        Value::Null => Ok(0.0),
        other => Err(ExprError::Type(format!("{other} is not a number"))),
    }
}

fn as_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    // Numeric strings compare equal to their numbers
    match (as_number(left), as_number(right)) {
        (Ok(l), Ok(r)) => {
            (left.is_number() || left.is_string())
                && (right.is_number() || right.is_string())
                && l == r
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_with_precedence() {
        assert_eq!(evaluate("1 + 2 * 3", &json!({})).unwrap(), json!(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &json!({})).unwrap(), json!(9.0));
    }

    #[test]
    fn field_access_resolves_into_data() {
        let data = json!({"order": {"total": 40, "currency": "EUR"}});
        let total = evaluate("order.total * 1.1", &data).unwrap();
        assert!((total.as_f64().unwrap() - 44.0).abs() < 1e-9);
        assert_eq!(
            evaluate("order.currency == 'EUR'", &data).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn missing_paths_are_null() {
        assert_eq!(evaluate("missing.path", &json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn string_concat_and_functions() {
        let data = json!({"name": "ada"});
        assert_eq!(
            evaluate("'Hello ' + upper(name)", &data).unwrap(),
            json!("Hello ADA")
        );
        assert_eq!(evaluate("length('abc')", &json!({})).unwrap(), json!(3));
        assert_eq!(
            evaluate("trim('  x  ')", &json!({})).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn boolean_logic_short_circuits() {
        let data = json!({"a": true});
        assert_eq!(evaluate("a && 'yes'", &data).unwrap(), json!("yes"));
        assert_eq!(evaluate("!a || 'no'", &data).unwrap(), json!("no"));
        // Right side never evaluated, so its division by zero never fires
        assert_eq!(evaluate("false && 1 / 0", &data).unwrap(), json!(false));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(evaluate("1 / 0", &json!({})), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn unknown_function_is_rejected() {
        assert!(matches!(
            evaluate("system('rm -rf /')", &json!({})),
            Err(ExprError::UnknownFunction(_))
        ));
    }

    #[test]
    fn comparison_coerces_numeric_strings() {
        let data = json!({"count": "5"});
        assert_eq!(evaluate("count > 3", &data).unwrap(), json!(true));
    }

    #[test]
    fn parse_errors_carry_offsets() {
        assert!(matches!(
            evaluate("1 + ", &json!({})),
            Err(ExprError::Parse { .. })
        ));
        assert!(matches!(
            evaluate("'unterminated", &json!({})),
            Err(ExprError::Parse { .. })
        ));
    }

    #[test]
    fn array_functions() {
        let data = json!({"tags": ["a", "b", "c"]});
        assert_eq!(evaluate("length(tags)", &data).unwrap(), json!(3));
        assert_eq!(
            evaluate("join(tags, '-')", &data).unwrap(),
            json!("a-b-c")
        );
        assert_eq!(
            evaluate("contains(tags, 'b')", &data).unwrap(),
            json!(true)
        );
    }
}
