//! 文本表达式语法
//!
//! ```text
//! expr     = lambda | or
//! lambda   = ident "=>" expr | "(" [ident {"," ident}] ")" "=>" expr
//! or       = and { "||" and }
//! and      = eq { "&&" eq }
//! eq       = rel { ("==" | "!=") rel }
//! rel      = add { ("<=" | ">=" | "<" | ">") add | "is" type | "as" type }
//! add      = unary { ("+" | "-") unary }
//! unary    = ("!" | "-") unary | postfix
//! postfix  = primary { "." ident ["<" type ">"] ["(" args ")"] }
//! primary  = number | string | "true" | "false" | "null" | ident ["(" args ")"] | "(" expr ")"
//! ```

use winnow::ascii::multispace0;
use winnow::combinator::{alt, cut_err, opt, separated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{literal, take_while};

use crate::expression::{BinaryOperator, UnaryOperator};
use crate::value::Value;

/// 文本表达式语法树（未解析符号）
#[derive(Debug, Clone, PartialEq)]
pub enum Syntax {
    Literal(Value),
    Ident(String),
    Member {
        target: Box<Syntax>,
        name: String,
    },
    Call {
        target: Option<Box<Syntax>>,
        name: String,
        type_arguments: Vec<String>,
        arguments: Vec<Syntax>,
    },
    Unary(UnaryOperator, Box<Syntax>),
    Binary(BinaryOperator, Box<Syntax>, Box<Syntax>),
    TypeIs(Box<Syntax>, String),
    TypeAs(Box<Syntax>, String),
    Lambda(Vec<String>, Box<Syntax>),
}

/// 解析完整表达式
pub fn parse_expression(input: &str) -> Result<Syntax, String> {
    (ws, expr, ws)
        .map(|(_, e, _)| e)
        .parse(input)
        .map_err(|e| e.to_string())
}

fn ws(input: &mut &str) -> ModalResult<()> {
    multispace0.void().parse_next(input)
}

fn ident<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    if !input.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

/// 关键字，后面不能紧跟标识符字符
fn kw<'a>(keyword: &'static str) -> impl FnMut(&mut &'a str) -> ModalResult<()> {
    move |input: &mut &'a str| {
        let saved = *input;
        literal(keyword).parse_next(input)?;
        if input.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            *input = saved;
            return Err(ErrMode::Backtrack(ContextError::new()));
        }
        Ok(())
    }
}

fn type_name(input: &mut &str) -> ModalResult<String> {
    let name = take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        .parse_next(input)?;
    Ok(name.to_string())
}

fn expr(input: &mut &str) -> ModalResult<Syntax> {
    alt((lambda, or_expr)).parse_next(input)
}

fn lambda(input: &mut &str) -> ModalResult<Syntax> {
    let params = alt((ident.map(|p| vec![p]), lambda_params)).parse_next(input)?;
    ws.parse_next(input)?;
    literal("=>").parse_next(input)?;
    ws.parse_next(input)?;
    let body = cut_err(expr).parse_next(input)?;
    Ok(Syntax::Lambda(
        params.into_iter().map(str::to_string).collect(),
        Box::new(body),
    ))
}

fn lambda_params<'a>(input: &mut &'a str) -> ModalResult<Vec<&'a str>> {
    literal("(").parse_next(input)?;
    ws.parse_next(input)?;
    let params: Vec<&'a str> =
        separated(0.., (ws, ident, ws).map(|(_, p, _)| p), literal(",")).parse_next(input)?;
    ws.parse_next(input)?;
    literal(")").parse_next(input)?;
    Ok(params)
}

fn binary(op: BinaryOperator, left: Syntax, right: Syntax) -> Syntax {
    Syntax::Binary(op, Box::new(left), Box::new(right))
}

fn or_expr(input: &mut &str) -> ModalResult<Syntax> {
    let mut left = and_expr.parse_next(input)?;
    loop {
        ws.parse_next(input)?;
        if opt(literal("||")).parse_next(input)?.is_none() {
            break;
        }
        ws.parse_next(input)?;
        let right = cut_err(and_expr).parse_next(input)?;
        left = binary(BinaryOperator::OrElse, left, right);
    }
    Ok(left)
}

fn and_expr(input: &mut &str) -> ModalResult<Syntax> {
    let mut left = eq_expr.parse_next(input)?;
    loop {
        ws.parse_next(input)?;
        if opt(literal("&&")).parse_next(input)?.is_none() {
            break;
        }
        ws.parse_next(input)?;
        let right = cut_err(eq_expr).parse_next(input)?;
        left = binary(BinaryOperator::AndAlso, left, right);
    }
    Ok(left)
}

fn eq_expr(input: &mut &str) -> ModalResult<Syntax> {
    let mut left = rel_expr.parse_next(input)?;
    loop {
        ws.parse_next(input)?;
        let op = opt(alt((
            literal("==").value(BinaryOperator::Equal),
            literal("!=").value(BinaryOperator::NotEqual),
        )))
        .parse_next(input)?;
        let Some(op) = op else { break };
        ws.parse_next(input)?;
        let right = cut_err(rel_expr).parse_next(input)?;
        left = binary(op, left, right);
    }
    Ok(left)
}

fn rel_expr(input: &mut &str) -> ModalResult<Syntax> {
    let mut left = add_expr.parse_next(input)?;
    loop {
        ws.parse_next(input)?;
        if opt(kw("is")).parse_next(input)?.is_some() {
            ws.parse_next(input)?;
            let ty = cut_err(type_name).parse_next(input)?;
            left = Syntax::TypeIs(Box::new(left), ty);
            continue;
        }
        if opt(kw("as")).parse_next(input)?.is_some() {
            ws.parse_next(input)?;
            let ty = cut_err(type_name).parse_next(input)?;
            left = Syntax::TypeAs(Box::new(left), ty);
            continue;
        }
        let op = opt(alt((
            literal("<=").value(BinaryOperator::LessThanOrEqual),
            literal(">=").value(BinaryOperator::GreaterThanOrEqual),
            literal("<").value(BinaryOperator::LessThan),
            literal(">").value(BinaryOperator::GreaterThan),
        )))
        .parse_next(input)?;
        let Some(op) = op else { break };
        ws.parse_next(input)?;
        let right = cut_err(add_expr).parse_next(input)?;
        left = binary(op, left, right);
    }
    Ok(left)
}

fn add_expr(input: &mut &str) -> ModalResult<Syntax> {
    let mut left = unary_expr.parse_next(input)?;
    loop {
        ws.parse_next(input)?;
        let op = opt(alt((
            literal("+").value(BinaryOperator::Add),
            literal("-").value(BinaryOperator::Subtract),
        )))
        .parse_next(input)?;
        let Some(op) = op else { break };
        ws.parse_next(input)?;
        let right = cut_err(unary_expr).parse_next(input)?;
        left = binary(op, left, right);
    }
    Ok(left)
}

fn unary_expr(input: &mut &str) -> ModalResult<Syntax> {
    if input.starts_with("!=") {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    if opt(literal("!")).parse_next(input)?.is_some() {
        ws.parse_next(input)?;
        let inner = cut_err(unary_expr).parse_next(input)?;
        return Ok(Syntax::Unary(UnaryOperator::Not, Box::new(inner)));
    }
    if opt(literal("-")).parse_next(input)?.is_some() {
        ws.parse_next(input)?;
        let inner = cut_err(unary_expr).parse_next(input)?;
        return Ok(Syntax::Unary(UnaryOperator::Negate, Box::new(inner)));
    }
    postfix_expr.parse_next(input)
}

fn postfix_expr(input: &mut &str) -> ModalResult<Syntax> {
    let mut target = primary.parse_next(input)?;
    loop {
        let saved = *input;
        ws.parse_next(input)?;
        if opt(literal(".")).parse_next(input)?.is_none() {
            *input = saved;
            break;
        }
        ws.parse_next(input)?;
        let name = cut_err(ident)
            .context(StrContext::Expected(StrContextValue::Description(
                "member name after '.'",
            )))
            .parse_next(input)?
            .to_string();
        let type_arguments = opt(type_arguments).parse_next(input)?.unwrap_or_default();
        ws.parse_next(input)?;
        if opt(literal("(")).parse_next(input)?.is_some() {
            let arguments = call_arguments.parse_next(input)?;
            target = Syntax::Call {
                target: Some(Box::new(target)),
                name,
                type_arguments,
                arguments,
            };
        } else {
            target = Syntax::Member {
                target: Box::new(target),
                name,
            };
        }
    }
    Ok(target)
}

fn type_arguments(input: &mut &str) -> ModalResult<Vec<String>> {
    literal("<").parse_next(input)?;
    let types: Vec<String> =
        separated(1.., (ws, type_name, ws).map(|(_, t, _)| t), literal(",")).parse_next(input)?;
    literal(">").parse_next(input)?;
    Ok(types)
}

fn call_arguments(input: &mut &str) -> ModalResult<Vec<Syntax>> {
    ws.parse_next(input)?;
    if opt(literal(")")).parse_next(input)?.is_some() {
        return Ok(Vec::new());
    }
    let args: Vec<Syntax> =
        separated(1.., (ws, expr, ws).map(|(_, e, _)| e), literal(",")).parse_next(input)?;
    ws.parse_next(input)?;
    cut_err(literal(")")).parse_next(input)?;
    Ok(args)
}

fn primary(input: &mut &str) -> ModalResult<Syntax> {
    alt((
        number.map(Syntax::Literal),
        quoted_string.map(|s| Syntax::Literal(Value::String(s))),
        kw("true").map(|_| Syntax::Literal(Value::Bool(true))),
        kw("false").map(|_| Syntax::Literal(Value::Bool(false))),
        kw("null").map(|_| Syntax::Literal(Value::Null)),
        paren_expr,
        ident_primary,
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "expression",
    )))
    .parse_next(input)
}

fn number(input: &mut &str) -> ModalResult<Value> {
    let integer = take_while(1.., |c: char| c.is_ascii_digit()).parse_next(input)?;
    let saved = *input;
    if opt(literal(".")).parse_next(input)?.is_some() {
        if let Some(fraction) =
            opt(take_while(1.., |c: char| c.is_ascii_digit())).parse_next(input)?
        {
            let v: f64 = format!("{integer}.{fraction}")
                .parse()
                .map_err(|_| ErrMode::Cut(ContextError::new()))?;
            return Ok(Value::Float(v));
        }
        // `1.ToString()` 之类：点号属于成员访问
        *input = saved;
    }
    let v: i64 = integer
        .parse()
        .map_err(|_| ErrMode::Cut(ContextError::new()))?;
    Ok(Value::Int(v))
}

fn quoted_string(input: &mut &str) -> ModalResult<String> {
    literal("\"").parse_next(input)?;
    let content = take_while(0.., |c: char| c != '"').parse_next(input)?;
    cut_err(literal("\""))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing quote",
        )))
        .parse_next(input)?;
    Ok(content.to_string())
}

fn paren_expr(input: &mut &str) -> ModalResult<Syntax> {
    literal("(").parse_next(input)?;
    ws.parse_next(input)?;
    let inner = cut_err(expr).parse_next(input)?;
    ws.parse_next(input)?;
    cut_err(literal(")")).parse_next(input)?;
    Ok(inner)
}

fn ident_primary(input: &mut &str) -> ModalResult<Syntax> {
    let name = ident.parse_next(input)?.to_string();
    let saved = *input;
    ws.parse_next(input)?;
    if opt(literal("(")).parse_next(input)?.is_some() {
        let arguments = call_arguments.parse_next(input)?;
        return Ok(Syntax::Call {
            target: None,
            name,
            type_arguments: Vec::new(),
            arguments,
        });
    }
    *input = saved;
    Ok(Syntax::Ident(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<Syntax> {
        Box::new(Syntax::Ident(name.to_string()))
    }

    #[test]
    fn test_precedence() {
        let syntax = parse_expression("age >= 18 && age <= 65 || vip").unwrap();
        match syntax {
            Syntax::Binary(BinaryOperator::OrElse, left, right) => {
                assert!(matches!(*left, Syntax::Binary(BinaryOperator::AndAlso, _, _)));
                assert_eq!(right, ident("vip"));
            }
            other => panic!("unexpected syntax: {other:?}"),
        }
    }

    #[test]
    fn test_member_chain_and_call() {
        let syntax = parse_expression("addresses.Any(a => a.use == \"home\")").unwrap();
        match syntax {
            Syntax::Call {
                target: Some(target),
                name,
                arguments,
                ..
            } => {
                assert_eq!(target, ident("addresses"));
                assert_eq!(name, "Any");
                assert!(matches!(arguments[0], Syntax::Lambda(ref p, _) if p == &["a"]));
            }
            other => panic!("unexpected syntax: {other:?}"),
        }
    }

    #[test]
    fn test_index_plus_one() {
        assert_eq!(
            parse_expression("index + 1").unwrap(),
            Syntax::Binary(
                BinaryOperator::Add,
                ident("index"),
                Box::new(Syntax::Literal(Value::Int(1)))
            )
        );
    }

    #[test]
    fn test_generic_method_and_not() {
        let syntax = parse_expression("!participation.OfType<Participation>().Any()").unwrap();
        assert!(matches!(syntax, Syntax::Unary(UnaryOperator::Not, _)));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_expression("2.5").unwrap(), Syntax::Literal(Value::Float(2.5)));
        assert_eq!(parse_expression("null").unwrap(), Syntax::Literal(Value::Null));
        assert_eq!(
            parse_expression(" \"abc\" ").unwrap(),
            Syntax::Literal(Value::from("abc"))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("age >=").is_err());
        assert!(parse_expression("(age").is_err());
        assert!(parse_expression("\"open").is_err());
    }
}
