//! Expression trees: parsing and constant folding.
//!
//! The statement compiler drives codegen directly, but expressions are
//! built as small trees first so the optimizer can fold constants and
//! reorder commutative operands before emission.

use beryl_parser::{Token, TokenStream};

use crate::compiler::Compiler;
use crate::decl::{expect, expect_ident, parse_params, skip_balanced_braces};
use crate::error::CompileErrorKind;
use crate::model::Param;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LAnd,
    LOr,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl BinOp {
    /// True for operators where operand order does not matter.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::Eq | BinOp::Ne | BinOp::BAnd | BinOp::BOr | BinOp::BXor
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    LNot,
    BNot,
}

/// Compound-assignment flavors; `Plain` is `=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Plain,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

/// What a call expression calls.
#[derive(Debug)]
pub enum Callee {
    /// Bare name: global function, own method, cofunction or a type
    /// conversion.
    Name(String),
    /// `Type::name(...)`.
    Scoped(String, String),
    /// `object.name(...)`.
    Member(Box<Expr>, String),
    /// Any other expression producing a delegate or task.
    Expr(Box<Expr>),
}

/// Body of a lambda expression.
#[derive(Debug)]
pub enum LambdaBody {
    /// `=> expr` form.
    Expr(Box<Expr>),
    /// `=> { … }` form; the block is compiled later from its token
    /// position.
    Block {
        /// Token index of the `{`.
        start: usize,
    },
}

/// An anonymous delegate literal.
#[derive(Debug)]
pub struct LambdaExpr {
    /// Declared parameters.
    pub params: Vec<Param>,
    /// Declared return type, `type_ids::UNDEFINED` for void or
    /// expression-bodied lambdas.
    pub ret: u32,
    /// The body.
    pub body: LambdaBody,
}

/// One parsed expression.
#[derive(Debug)]
pub enum Expr {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    Null,
    This,
    Ident(String),
    Member(Box<Expr>, String),
    Call {
        callee: Callee,
        args: Vec<Expr>,
    },
    New {
        type_name: String,
        args: Vec<Expr>,
    },
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Assign(AssignOp, Box<Expr>, Box<Expr>),
    IncDec {
        dec: bool,
        post: bool,
        target: Box<Expr>,
    },
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    TypeOf(Box<Expr>),
    SameRef(Box<Expr>, Box<Expr>),
    Lambda(LambdaExpr),
}

impl Expr {
    /// True for literal leaves.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::IntLit(_) | Expr::FloatLit(_) | Expr::StrLit(_) | Expr::Null
        )
    }

    /// Collect every identifier name referenced in the tree, in order
    /// of first appearance. Used for closure capture discovery.
    pub fn collect_idents(&self, out: &mut Vec<String>) {
        match self {
            Expr::Ident(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Member(obj, _) => obj.collect_idents(out),
            Expr::Call { callee, args } => {
                match callee {
                    Callee::Member(obj, _) => obj.collect_idents(out),
                    Callee::Expr(e) => e.collect_idents(out),
                    Callee::Name(name) => {
                        if !out.contains(name) {
                            out.push(name.clone());
                        }
                    }
                    Callee::Scoped(..) => {}
                }
                for a in args {
                    a.collect_idents(out);
                }
            }
            Expr::New { args, .. } => {
                for a in args {
                    a.collect_idents(out);
                }
            }
            Expr::Unary(_, e) | Expr::TypeOf(e) => e.collect_idents(out),
            Expr::IncDec { target, .. } => target.collect_idents(out),
            Expr::Binary(_, a, b) | Expr::Assign(_, a, b) | Expr::SameRef(a, b) => {
                a.collect_idents(out);
                b.collect_idents(out);
            }
            Expr::Ternary(c, t, e) => {
                c.collect_idents(out);
                t.collect_idents(out);
                e.collect_idents(out);
            }
            Expr::Lambda(lambda) => {
                if let LambdaBody::Expr(e) = &lambda.body {
                    e.collect_idents(out);
                }
            }
            _ => {}
        }
    }
}

type ExprResult = Result<Expr, CompileErrorKind>;

/// Nesting limit of the recursive-descent expression parser. Deeper
/// input reports a compile error instead of exhausting the native
/// stack.
const MAX_PARSE_DEPTH: u32 = 1000;

/// Bump the recursion depth, failing once the parser limit is hit.
fn deeper(depth: u32) -> Result<u32, CompileErrorKind> {
    if depth >= MAX_PARSE_DEPTH {
        Err(CompileErrorKind::ParserLimitExceeded)
    } else {
        Ok(depth + 1)
    }
}

/// Parse one expression from the token stream.
pub(crate) fn parse_expr(comp: &Compiler, ts: &mut TokenStream) -> ExprResult {
    parse_assign(comp, ts, 0)
}

fn parse_assign(comp: &Compiler, ts: &mut TokenStream, depth: u32) -> ExprResult {
    let depth = deeper(depth)?;
    let lhs = parse_ternary(comp, ts, depth)?;
    let op = match ts.peek() {
        Token::Assign => AssignOp::Plain,
        Token::PlusAssign => AssignOp::Add,
        Token::MinusAssign => AssignOp::Sub,
        Token::StarAssign => AssignOp::Mul,
        Token::SlashAssign => AssignOp::Div,
        Token::PercentAssign => AssignOp::Mod,
        Token::AmpAssign => AssignOp::BAnd,
        Token::PipeAssign => AssignOp::BOr,
        Token::CaretAssign => AssignOp::BXor,
        Token::ShlAssign => AssignOp::Shl,
        Token::ShrAssign => AssignOp::Shr,
        _ => return Ok(lhs),
    };
    ts.next();
    let rhs = parse_assign(comp, ts, depth)?;
    Ok(Expr::Assign(op, Box::new(lhs), Box::new(rhs)))
}

fn parse_ternary(comp: &Compiler, ts: &mut TokenStream, depth: u32) -> ExprResult {
    let depth = deeper(depth)?;
    let cond = parse_binary(comp, ts, 0, depth)?;
    if !ts.eat(&Token::Question) {
        return Ok(cond);
    }
    let then = parse_assign(comp, ts, depth)?;
    expect(ts, &Token::Colon)?;
    let otherwise = parse_ternary(comp, ts, depth)?;
    Ok(Expr::Ternary(
        Box::new(cond),
        Box::new(then),
        Box::new(otherwise),
    ))
}

/// Binary operator table: (token, operator, precedence). Precedence
/// follows C.
fn binop_of(tok: &Token) -> Option<(BinOp, u8)> {
    Some(match tok {
        Token::OrOr | Token::Or => (BinOp::LOr, 1),
        Token::AndAnd | Token::And => (BinOp::LAnd, 2),
        Token::Pipe => (BinOp::BOr, 3),
        Token::Caret => (BinOp::BXor, 4),
        Token::Amp => (BinOp::BAnd, 5),
        Token::Eq => (BinOp::Eq, 6),
        Token::Ne => (BinOp::Ne, 6),
        Token::Lt => (BinOp::Lt, 7),
        Token::Le => (BinOp::Le, 7),
        Token::Gt => (BinOp::Gt, 7),
        Token::Ge => (BinOp::Ge, 7),
        Token::Shl => (BinOp::Shl, 8),
        Token::Shr => (BinOp::Shr, 8),
        Token::Plus => (BinOp::Add, 9),
        Token::Minus => (BinOp::Sub, 9),
        Token::Star => (BinOp::Mul, 10),
        Token::Slash => (BinOp::Div, 10),
        Token::Percent => (BinOp::Mod, 10),
        _ => return None,
    })
}

fn parse_binary(comp: &Compiler, ts: &mut TokenStream, min_prec: u8, depth: u32) -> ExprResult {
    let depth = deeper(depth)?;
    let mut lhs = parse_unary(comp, ts, depth)?;
    while let Some((op, prec)) = binop_of(ts.peek()) {
        if prec < min_prec {
            break;
        }
        ts.next();
        let rhs = parse_binary(comp, ts, prec + 1, depth)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_unary(comp: &Compiler, ts: &mut TokenStream, depth: u32) -> ExprResult {
    let depth = deeper(depth)?;
    match ts.peek() {
        Token::Minus => {
            ts.next();
            Ok(Expr::Unary(UnOp::Neg, Box::new(parse_unary(comp, ts, depth)?)))
        }
        Token::Bang | Token::Not => {
            ts.next();
            Ok(Expr::Unary(UnOp::LNot, Box::new(parse_unary(comp, ts, depth)?)))
        }
        Token::Tilde => {
            ts.next();
            Ok(Expr::Unary(UnOp::BNot, Box::new(parse_unary(comp, ts, depth)?)))
        }
        Token::PlusPlus => {
            ts.next();
            Ok(Expr::IncDec {
                dec: false,
                post: false,
                target: Box::new(parse_unary(comp, ts, depth)?),
            })
        }
        Token::MinusMinus => {
            ts.next();
            Ok(Expr::IncDec {
                dec: true,
                post: false,
                target: Box::new(parse_unary(comp, ts, depth)?),
            })
        }
        _ => parse_postfix(comp, ts, depth),
    }
}

fn parse_postfix(comp: &Compiler, ts: &mut TokenStream, depth: u32) -> ExprResult {
    let mut expr = parse_primary(comp, ts, depth)?;
    loop {
        match ts.peek() {
            Token::Dot => {
                ts.next();
                let name = expect_ident(ts)?;
                if ts.peek() == &Token::LParen {
                    let args = parse_args(comp, ts, depth)?;
                    expr = Expr::Call {
                        callee: Callee::Member(Box::new(expr), name),
                        args,
                    };
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            }
            Token::LParen => {
                let args = parse_args(comp, ts, depth)?;
                expr = match expr {
                    Expr::Ident(name) => Expr::Call {
                        callee: Callee::Name(name),
                        args,
                    },
                    other => Expr::Call {
                        callee: Callee::Expr(Box::new(other)),
                        args,
                    },
                };
            }
            Token::PlusPlus => {
                ts.next();
                expr = Expr::IncDec {
                    dec: false,
                    post: true,
                    target: Box::new(expr),
                };
            }
            Token::MinusMinus => {
                ts.next();
                expr = Expr::IncDec {
                    dec: true,
                    post: true,
                    target: Box::new(expr),
                };
            }
            _ => return Ok(expr),
        }
    }
}

fn parse_args(
    comp: &Compiler,
    ts: &mut TokenStream,
    depth: u32,
) -> Result<Vec<Expr>, CompileErrorKind> {
    expect(ts, &Token::LParen)?;
    let mut args = Vec::new();
    if ts.eat(&Token::RParen) {
        return Ok(args);
    }
    loop {
        args.push(parse_assign(comp, ts, depth)?);
        if ts.eat(&Token::RParen) {
            return Ok(args);
        }
        expect(ts, &Token::Comma)?;
    }
}

fn parse_primary(comp: &Compiler, ts: &mut TokenStream, depth: u32) -> ExprResult {
    match ts.peek().clone() {
        Token::IntLit(v) => {
            ts.next();
            Ok(Expr::IntLit(v))
        }
        Token::FloatLit(v) => {
            ts.next();
            Ok(Expr::FloatLit(v))
        }
        Token::StrLit(s) => {
            ts.next();
            Ok(Expr::StrLit(s))
        }
        Token::True => {
            ts.next();
            Ok(Expr::IntLit(1))
        }
        Token::False => {
            ts.next();
            Ok(Expr::IntLit(0))
        }
        Token::Null => {
            ts.next();
            Ok(Expr::Null)
        }
        Token::This => {
            ts.next();
            Ok(Expr::This)
        }
        Token::New => {
            ts.next();
            let type_name = expect_ident(ts)?;
            let args = if ts.peek() == &Token::LParen {
                parse_args(comp, ts, depth)?
            } else {
                Vec::new()
            };
            Ok(Expr::New { type_name, args })
        }
        Token::TypeOf => {
            ts.next();
            expect(ts, &Token::LParen)?;
            let inner = parse_assign(comp, ts, depth)?;
            expect(ts, &Token::RParen)?;
            Ok(Expr::TypeOf(Box::new(inner)))
        }
        Token::SameRef => {
            ts.next();
            expect(ts, &Token::LParen)?;
            let a = parse_assign(comp, ts, depth)?;
            expect(ts, &Token::Comma)?;
            let b = parse_assign(comp, ts, depth)?;
            expect(ts, &Token::RParen)?;
            Ok(Expr::SameRef(Box::new(a), Box::new(b)))
        }
        Token::LParen => {
            // Could be a lambda parameter list or a parenthesized
            // expression; try the lambda shape first.
            if let Some(lambda) = try_parse_lambda(comp, ts, depth)? {
                return Ok(Expr::Lambda(lambda));
            }
            ts.next();
            let inner = parse_assign(comp, ts, depth)?;
            expect(ts, &Token::RParen)?;
            Ok(inner)
        }
        Token::Ident(name) => {
            ts.next();
            if ts.peek() == &Token::ColonColon {
                ts.next();
                let member = expect_ident(ts)?;
                let args = parse_args(comp, ts, depth)?;
                return Ok(Expr::Call {
                    callee: Callee::Scoped(name, member),
                    args,
                });
            }
            Ok(Expr::Ident(name))
        }
        Token::Eof => Err(CompileErrorKind::UnexpectedEof),
        other => Err(CompileErrorKind::UnexpectedToken(other.describe())),
    }
}

/// Tentatively parse `(params) => body`. Restores the stream position
/// and returns `None` when the shape does not match.
fn try_parse_lambda(
    comp: &Compiler,
    ts: &mut TokenStream,
    depth: u32,
) -> Result<Option<LambdaExpr>, CompileErrorKind> {
    let mark = ts.tell();
    let params = match parse_params(comp, ts) {
        Ok(params) => params,
        Err(_) => {
            ts.seek(mark);
            return Ok(None);
        }
    };
    if !ts.eat(&Token::Arrow) {
        ts.seek(mark);
        return Ok(None);
    }
    let body = if ts.peek() == &Token::LBrace {
        let start = ts.tell();
        skip_balanced_braces(ts);
        LambdaBody::Block { start }
    } else {
        LambdaBody::Expr(Box::new(parse_assign(comp, ts, depth)?))
    };
    Ok(Some(LambdaExpr {
        params,
        ret: beryl_bytecode::type_ids::UNDEFINED,
        body,
    }))
}

// ===== Constant folding =====

/// Fold constant subtrees in place. Returns how many nodes were
/// eliminated; the count feeds the optimizer statistics.
pub(crate) fn fold(expr: Expr, folds: &mut u32) -> Expr {
    match expr {
        Expr::Unary(op, inner) => {
            let inner = fold(*inner, folds);
            match (op, &inner) {
                (UnOp::Neg, Expr::IntLit(v)) => {
                    *folds += 1;
                    Expr::IntLit(v.wrapping_neg())
                }
                (UnOp::Neg, Expr::FloatLit(v)) => {
                    *folds += 1;
                    Expr::FloatLit(-v)
                }
                (UnOp::LNot, Expr::IntLit(v)) => {
                    *folds += 1;
                    Expr::IntLit((*v == 0) as i64)
                }
                (UnOp::BNot, Expr::IntLit(v)) => {
                    *folds += 1;
                    Expr::IntLit(!*v)
                }
                _ => Expr::Unary(op, Box::new(inner)),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = fold(*lhs, folds);
            let rhs = fold(*rhs, folds);
            if let Some(result) = fold_binary(op, &lhs, &rhs) {
                *folds += 1;
                return result;
            }
            Expr::Binary(op, Box::new(lhs), Box::new(rhs))
        }
        Expr::Ternary(cond, then, otherwise) => {
            let cond = fold(*cond, folds);
            if let Expr::IntLit(v) = cond {
                *folds += 1;
                return if v != 0 {
                    fold(*then, folds)
                } else {
                    fold(*otherwise, folds)
                };
            }
            Expr::Ternary(
                Box::new(cond),
                Box::new(fold(*then, folds)),
                Box::new(fold(*otherwise, folds)),
            )
        }
        Expr::Assign(op, lhs, rhs) => {
            Expr::Assign(op, lhs, Box::new(fold(*rhs, folds)))
        }
        Expr::Call { callee, args } => Expr::Call {
            callee,
            args: args.into_iter().map(|a| fold(a, folds)).collect(),
        },
        Expr::New { type_name, args } => Expr::New {
            type_name,
            args: args.into_iter().map(|a| fold(a, folds)).collect(),
        },
        other => other,
    }
}

fn fold_binary(op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
    match (lhs, rhs) {
        (Expr::IntLit(a), Expr::IntLit(b)) => {
            let (a, b) = (*a, *b);
            Some(match op {
                BinOp::Add => Expr::IntLit(a.wrapping_add(b)),
                BinOp::Sub => Expr::IntLit(a.wrapping_sub(b)),
                BinOp::Mul => Expr::IntLit(a.wrapping_mul(b)),
                // Division by a constant zero stays in the tree so the
                // runtime exception fires where the source says.
                BinOp::Div if b != 0 => Expr::IntLit(a.wrapping_div(b)),
                BinOp::Mod if b != 0 => Expr::IntLit(a.wrapping_rem(b)),
                BinOp::Eq => Expr::IntLit((a == b) as i64),
                BinOp::Ne => Expr::IntLit((a != b) as i64),
                BinOp::Lt => Expr::IntLit((a < b) as i64),
                BinOp::Le => Expr::IntLit((a <= b) as i64),
                BinOp::Gt => Expr::IntLit((a > b) as i64),
                BinOp::Ge => Expr::IntLit((a >= b) as i64),
                BinOp::LAnd => Expr::IntLit((a != 0 && b != 0) as i64),
                BinOp::LOr => Expr::IntLit((a != 0 || b != 0) as i64),
                BinOp::BAnd => Expr::IntLit(a & b),
                BinOp::BOr => Expr::IntLit(a | b),
                BinOp::BXor => Expr::IntLit(a ^ b),
                BinOp::Shl => Expr::IntLit(a.wrapping_shl(b as u32)),
                BinOp::Shr => Expr::IntLit(a.wrapping_shr(b as u32)),
                _ => return None,
            })
        }
        (Expr::FloatLit(a), Expr::FloatLit(b)) => {
            let (a, b) = (*a, *b);
            Some(match op {
                BinOp::Add => Expr::FloatLit(a + b),
                BinOp::Sub => Expr::FloatLit(a - b),
                BinOp::Mul => Expr::FloatLit(a * b),
                BinOp::Div if b != 0.0 => Expr::FloatLit(a / b),
                BinOp::Eq => Expr::IntLit((a == b) as i64),
                BinOp::Ne => Expr::IntLit((a != b) as i64),
                BinOp::Lt => Expr::IntLit((a < b) as i64),
                BinOp::Le => Expr::IntLit((a <= b) as i64),
                BinOp::Gt => Expr::IntLit((a > b) as i64),
                BinOp::Ge => Expr::IntLit((a >= b) as i64),
                _ => return None,
            })
        }
        (Expr::StrLit(a), Expr::StrLit(b)) => match op {
            BinOp::Add => Some(Expr::StrLit(format!("{a}{b}"))),
            BinOp::Eq => Some(Expr::IntLit((a == b) as i64)),
            BinOp::Ne => Some(Expr::IntLit((a != b) as i64)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beryl_parser::Lexer;

    fn parse(src: &str) -> Expr {
        let comp = Compiler::new();
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut ts = TokenStream::new(tokens);
        parse_expr(&comp, &mut ts).unwrap()
    }

    fn parse_folded(src: &str) -> Expr {
        let mut folds = 0;
        fold(parse(src), &mut folds)
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 folds to 7, not 9.
        assert!(matches!(parse_folded("1 + 2 * 3"), Expr::IntLit(7)));
        // (1 + 2) * 3 folds to 9.
        assert!(matches!(parse_folded("(1 + 2) * 3"), Expr::IntLit(9)));
    }

    #[test]
    fn test_keyword_operators() {
        assert!(matches!(parse_folded("1 and 0"), Expr::IntLit(0)));
        assert!(matches!(parse_folded("1 or 0"), Expr::IntLit(1)));
        assert!(matches!(parse_folded("not 5"), Expr::IntLit(0)));
    }

    #[test]
    fn test_div_by_zero_not_folded() {
        assert!(matches!(parse_folded("1 / 0"), Expr::Binary(BinOp::Div, ..)));
    }

    #[test]
    fn test_string_concat_folds() {
        match parse_folded("\"a\" + \"b\"") {
            Expr::StrLit(s) => assert_eq!(s, "ab"),
            other => panic!("expected folded string, got {other:?}"),
        }
    }

    #[test]
    fn test_ternary_folds_to_branch() {
        assert!(matches!(parse_folded("1 ? 2 : 3"), Expr::IntLit(2)));
        assert!(matches!(parse_folded("0 ? 2 : 3"), Expr::IntLit(3)));
    }

    #[test]
    fn test_member_call_shape() {
        match parse("obj.next(1, 2)") {
            Expr::Call {
                callee: Callee::Member(obj, name),
                args,
            } => {
                assert!(matches!(*obj, Expr::Ident(_)));
                assert_eq!(name, "next");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_lambda_expression_body() {
        match parse("(int x) => x + 1") {
            Expr::Lambda(lambda) => {
                assert_eq!(lambda.params.len(), 1);
                assert!(matches!(lambda.body, LambdaBody::Expr(_)));
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_parenthesized_expr_is_not_lambda() {
        // `x` is no type name, so this must fall back to grouping.
        assert!(matches!(parse("(5)"), Expr::IntLit(5)));
    }

    #[test]
    fn test_scoped_call() {
        match parse("math::max(1, 2)") {
            Expr::Call {
                callee: Callee::Scoped(ty, name),
                ..
            } => {
                assert_eq!(ty, "math");
                assert_eq!(name, "max");
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_capture_collection() {
        let expr = parse("a + b * a");
        let mut names = Vec::new();
        expr.collect_idents(&mut names);
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_deep_nesting_reports_parser_limit() {
        // Thousands of nested parens must surface a compile error, not
        // exhaust the native stack.
        let mut src = String::new();
        for _ in 0..5000 {
            src.push('(');
        }
        src.push('1');
        for _ in 0..5000 {
            src.push(')');
        }
        let comp = Compiler::new();
        let tokens = Lexer::new(&src).tokenize().unwrap();
        let mut ts = TokenStream::new(tokens);
        assert!(matches!(
            parse_expr(&comp, &mut ts),
            Err(CompileErrorKind::ParserLimitExceeded)
        ));
    }

    #[test]
    fn test_reasonable_nesting_stays_parseable() {
        let mut src = String::new();
        for _ in 0..50 {
            src.push('(');
        }
        src.push('1');
        for _ in 0..50 {
            src.push(')');
        }
        assert!(matches!(parse_folded(&src), Expr::IntLit(1)));
    }
}
