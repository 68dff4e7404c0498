//! 条件式の評価
//!
//! ブレークポイントの条件は停止したスレッドの文脈で評価され、0なら停止しない。

use crate::Result;

/// 式が参照する停止中のターゲットの状態
pub trait EvalScope {
    /// レジスタ名から値を得る
    fn register(&self, name: &str) -> Option<u64>;
    /// `vaddr`から`size`バイト（1/2/4/8）を読む
    fn memory(&self, vaddr: u64, size: usize) -> Option<u64>;
    /// シンボル（グローバル変数・関数）のアドレスを得る
    fn symbol(&self, name: &str) -> Option<u64>;
}

/// 条件式の評価器
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, scope: &dyn EvalScope) -> Result<u64>;
}

/// 式の抽象構文木
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Literal(u64),
    /// レジスタ名か、グローバル変数の値
    Name(String),
    /// `&name`: シンボルのアドレス
    AddressOf(String),
    /// `*expr`（8バイト）、`*32 expr`のように幅を指定できる
    Deref { size: usize, expr: Box<Expression> },
    Unary { op: UnaryOp, expr: Box<Expression> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinaryOp {
    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 10,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::BitAnd => 5,
            BinaryOp::BitXor => 4,
            BinaryOp::BitOr => 3,
            BinaryOp::And => 2,
            BinaryOp::Or => 1,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "&" => BinaryOp::BitAnd,
            "^" => BinaryOp::BitXor,
            "|" => BinaryOp::BitOr,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: [&str; 21] = [
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "*", "/", "%", "+", "-", "<", ">", "&", "^", "|", "!", "~",
    "=",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                i += 1;
            }
            let text = &input[start..i];
            let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else {
                text.parse::<u64>()
            }
            .map_err(|_| anyhow::anyhow!("Invalid number: {}", text))?;
            tokens.push(Token::Number(value));
        } else if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            i += 1;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b':') {
                i += 1;
            }
            tokens.push(Token::Ident(input[start..i].trim_start_matches('$').to_string()));
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else {
            let op = OPERATORS
                .iter()
                .find(|op| input[i..].starts_with(**op))
                .ok_or_else(|| anyhow::anyhow!("Unexpected character '{}'", c))?;
            if *op == "=" {
                return Err(anyhow::anyhow!("Assignment is not allowed in conditions"));
            }
            tokens.push(Token::Op(*op));
            i += op.len();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expression(&mut self, min_prec: u8) -> Result<Expression> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(s)) => match BinaryOp::from_token(s) {
                    Some(op) => op,
                    None => break,
                },
                _ => break,
            };
            if op.precedence() < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(op.precedence() + 1)?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expression::Literal(n)),
            Some(Token::Ident(name)) => Ok(Expression::Name(name)),
            Some(Token::LParen) => {
                let expr = self.expression(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(anyhow::anyhow!("Missing closing parenthesis ')'")),
                }
            }
            Some(Token::Op("-")) => Ok(Expression::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.unary()?),
            }),
            Some(Token::Op("!")) => Ok(Expression::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.unary()?),
            }),
            Some(Token::Op("~")) => Ok(Expression::Unary {
                op: UnaryOp::BitNot,
                expr: Box::new(self.unary()?),
            }),
            Some(Token::Op("&")) => match self.next() {
                Some(Token::Ident(name)) => Ok(Expression::AddressOf(name)),
                _ => Err(anyhow::anyhow!("'&' must be followed by a symbol name")),
            },
            Some(Token::Op("*")) => {
                // 幅の指定: *8 / *16 / *32 / *64
                let size = match self.peek() {
                    Some(Token::Number(bits @ (8 | 16 | 32 | 64))) => {
                        let size = (*bits / 8) as usize;
                        self.pos += 1;
                        size
                    }
                    _ => 8,
                };
                Ok(Expression::Deref {
                    size,
                    expr: Box::new(self.unary()?),
                })
            }
            Some(token) => Err(anyhow::anyhow!("Unexpected token {:?}", token)),
            None => Err(anyhow::anyhow!("Unexpected end of expression")),
        }
    }
}

/// 条件式をパースする
pub fn parse_condition(input: &str) -> Result<Expression> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(anyhow::anyhow!("Empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression(0)?;
    if let Some(token) = parser.peek() {
        return Err(anyhow::anyhow!("Unexpected token {:?}", token));
    }
    Ok(expr)
}

/// 構文木を評価する
pub fn evaluate_expression(expr: &Expression, scope: &dyn EvalScope) -> Result<u64> {
    Ok(match expr {
        Expression::Literal(n) => *n,
        Expression::Name(name) => {
            if let Some(value) = scope.register(name) {
                value
            } else {
                let vaddr = scope
                    .symbol(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown name '{}'", name))?;
                scope
                    .memory(vaddr, 8)
                    .ok_or_else(|| anyhow::anyhow!("Failed to read '{}' at {:#x}", name, vaddr))?
            }
        }
        Expression::AddressOf(name) => scope
            .symbol(name)
            .ok_or_else(|| anyhow::anyhow!("Symbol '{}' not found", name))?,
        Expression::Deref { size, expr } => {
            let vaddr = evaluate_expression(expr, scope)?;
            scope
                .memory(vaddr, *size)
                .ok_or_else(|| anyhow::anyhow!("Failed to read memory at {:#x}", vaddr))?
        }
        Expression::Unary { op, expr } => {
            let v = evaluate_expression(expr, scope)?;
            match op {
                UnaryOp::Neg => v.wrapping_neg(),
                UnaryOp::Not => (v == 0) as u64,
                UnaryOp::BitNot => !v,
            }
        }
        Expression::Binary { op, lhs, rhs } => {
            let l = evaluate_expression(lhs, scope)?;
            // 短絡評価
            match op {
                BinaryOp::And if l == 0 => return Ok(0),
                BinaryOp::Or if l != 0 => return Ok(1),
                _ => {}
            }
            let r = evaluate_expression(rhs, scope)?;
            match op {
                BinaryOp::Mul => l.wrapping_mul(r),
                BinaryOp::Div => l.checked_div(r).ok_or_else(|| anyhow::anyhow!("Division by zero"))?,
                BinaryOp::Rem => l.checked_rem(r).ok_or_else(|| anyhow::anyhow!("Division by zero"))?,
                BinaryOp::Add => l.wrapping_add(r),
                BinaryOp::Sub => l.wrapping_sub(r),
                BinaryOp::Shl => l.checked_shl(r as u32).unwrap_or(0),
                BinaryOp::Shr => l.checked_shr(r as u32).unwrap_or(0),
                BinaryOp::Lt => (l < r) as u64,
                BinaryOp::Le => (l <= r) as u64,
                BinaryOp::Gt => (l > r) as u64,
                BinaryOp::Ge => (l >= r) as u64,
                BinaryOp::Eq => (l == r) as u64,
                BinaryOp::Ne => (l != r) as u64,
                BinaryOp::BitAnd => l & r,
                BinaryOp::BitXor => l ^ r,
                BinaryOp::BitOr => l | r,
                BinaryOp::And | BinaryOp::Or => (r != 0) as u64,
            }
        }
    })
}

/// 整数・レジスタ・メモリ参照だけを扱う評価器
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl ConditionEvaluator for BasicEvaluator {
    fn evaluate(&self, condition: &str, scope: &dyn EvalScope) -> Result<u64> {
        let expr = parse_condition(condition)?;
        evaluate_expression(&expr, scope)
    }
}
