//! In-process evaluation of attribute expressions against features

use std::cmp::Ordering;

use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlValue};

use crate::dataset::{AttributeValue, Feature};
use crate::error::{FilterError, Result};

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    fn from_attribute(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Null => Value::Null,
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Integer(i) => Value::Number(*i as f64),
            AttributeValue::Real(r) => Value::Number(*r),
            AttributeValue::Text(s) => Value::Text(s.clone()),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    fn truth(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            Value::Text(s) => Some(!s.is_empty()),
        }
    }
}

fn unsupported(what: impl std::fmt::Display) -> FilterError {
    FilterError::invalid_expression(format!("{} cannot be evaluated in process", what))
}

fn is_supported_operator(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::And
            | BinaryOperator::Or
            | BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo
            | BinaryOperator::StringConcat
    )
}

/// Walk the expression and reject what [`evaluate`] cannot handle
pub(super) fn check(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => Ok(()),
        Expr::Value(v) => literal(&v.value).map(|_| ()),
        Expr::BinaryOp { left, op, right } => {
            if !is_supported_operator(op) {
                return Err(unsupported(format!("operator {}", op)));
            }
            check(left)?;
            check(right)
        }
        Expr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not | UnaryOperator::Minus | UnaryOperator::Plus => check(expr),
            other => Err(unsupported(format!("operator {}", other))),
        },
        Expr::Nested(inner)
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::Cast { expr: inner, .. } => check(inner),
        Expr::InList { expr, list, .. } => {
            check(expr)?;
            list.iter().try_for_each(check)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            check(expr)?;
            check(low)?;
            check(high)
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            check(expr)?;
            check(pattern)
        }
        other => Err(unsupported(format!("'{}'", other))),
    }
}

fn literal(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Number(text, _) => text
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| FilterError::invalid_expression(format!("bad number {}", text))),
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        other => Err(unsupported(format!("literal {}", other))),
    }
}

fn not(value: Value) -> Value {
    match value.truth() {
        Some(b) => Value::Bool(!b),
        None => Value::Null,
    }
}

fn and(left: Value, right: Value) -> Value {
    match (left.truth(), right.truth()) {
        (Some(false), _) | (_, Some(false)) => Value::Bool(false),
        (Some(true), Some(true)) => Value::Bool(true),
        _ => Value::Null,
    }
}

fn or(left: Value, right: Value) -> Value {
    match (left.truth(), right.truth()) {
        (Some(true), _) | (_, Some(true)) => Value::Bool(true),
        (Some(false), Some(false)) => Value::Bool(false),
        _ => Value::Null,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(left.as_text()?.cmp(&right.as_text()?)),
        },
    }
}

fn comparison(op: &BinaryOperator, left: &Value, right: &Value) -> Value {
    let Some(ordering) = compare(left, right) else {
        return Value::Null;
    };
    let result = match op {
        BinaryOperator::Eq => ordering == Ordering::Equal,
        BinaryOperator::NotEq => ordering != Ordering::Equal,
        BinaryOperator::Lt => ordering == Ordering::Less,
        BinaryOperator::LtEq => ordering != Ordering::Greater,
        BinaryOperator::Gt => ordering == Ordering::Greater,
        BinaryOperator::GtEq => ordering != Ordering::Less,
        _ => return Value::Null,
    };
    Value::Bool(result)
}

fn arithmetic(op: &BinaryOperator, left: &Value, right: &Value) -> Value {
    if let BinaryOperator::StringConcat = op {
        return match (left.as_text(), right.as_text()) {
            (Some(a), Some(b)) => Value::Text(a + &b),
            _ => Value::Null,
        };
    }
    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Value::Null;
    };
    match op {
        BinaryOperator::Plus => Value::Number(a + b),
        BinaryOperator::Minus => Value::Number(a - b),
        BinaryOperator::Multiply => Value::Number(a * b),
        BinaryOperator::Divide if b != 0.0 => Value::Number(a / b),
        BinaryOperator::Modulo if b != 0.0 => Value::Number(a % b),
        _ => Value::Null,
    }
}

/// SQL LIKE with `%` and `_` wildcards
fn like(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let text = fold(text);
    let pattern = fold(pattern);
    // dp[j]: pattern[..j] matches text[..i]
    let mut dp = vec![false; pattern.len() + 1];
    dp[0] = true;
    for j in 1..=pattern.len() {
        dp[j] = dp[j - 1] && pattern[j - 1] == '%';
    }
    for c in &text {
        let mut next = vec![false; pattern.len() + 1];
        for j in 1..=pattern.len() {
            next[j] = match pattern[j - 1] {
                '%' => next[j - 1] || dp[j],
                '_' => dp[j - 1],
                p => dp[j - 1] && p == *c,
            };
        }
        dp = next;
    }
    dp[pattern.len()]
}

fn binary(op: &BinaryOperator, left: Value, right: Value) -> Result<Value> {
    Ok(match op {
        BinaryOperator::And => and(left, right),
        BinaryOperator::Or => or(left, right),
        BinaryOperator::Eq
        | BinaryOperator::NotEq
        | BinaryOperator::Lt
        | BinaryOperator::LtEq
        | BinaryOperator::Gt
        | BinaryOperator::GtEq => comparison(op, &left, &right),
        op if is_supported_operator(op) => arithmetic(op, &left, &right),
        other => return Err(unsupported(format!("operator {}", other))),
    })
}

pub(super) fn evaluate(expr: &Expr, feature: &Feature) -> Result<Value> {
    match expr {
        Expr::Identifier(ident) => Ok(field(feature, &ident.value)),
        Expr::CompoundIdentifier(parts) => Ok(parts
            .last()
            .map_or(Value::Null, |ident| field(feature, &ident.value))),
        Expr::Value(v) => literal(&v.value),
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => evaluate(inner, feature),
        Expr::BinaryOp { left, op, right } => {
            binary(op, evaluate(left, feature)?, evaluate(right, feature)?)
        }
        Expr::UnaryOp { op, expr } => {
            let value = evaluate(expr, feature)?;
            match op {
                UnaryOperator::Not => Ok(not(value)),
                UnaryOperator::Minus => Ok(value.as_number().map_or(Value::Null, |n| Value::Number(-n))),
                UnaryOperator::Plus => Ok(value),
                other => Err(unsupported(format!("operator {}", other))),
            }
        }
        Expr::IsNull(inner) => Ok(Value::Bool(evaluate(inner, feature)? == Value::Null)),
        Expr::IsNotNull(inner) => Ok(Value::Bool(evaluate(inner, feature)? != Value::Null)),
        Expr::IsTrue(inner) => Ok(Value::Bool(evaluate(inner, feature)?.truth() == Some(true))),
        Expr::IsFalse(inner) => Ok(Value::Bool(evaluate(inner, feature)?.truth() == Some(false))),
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = evaluate(expr, feature)?;
            if needle == Value::Null {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                let candidate = evaluate(item, feature)?;
                if compare(&needle, &candidate) == Some(Ordering::Equal) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let value = evaluate(expr, feature)?;
            let lower = comparison(&BinaryOperator::GtEq, &value, &evaluate(low, feature)?);
            let upper = comparison(&BinaryOperator::LtEq, &value, &evaluate(high, feature)?);
            let inside = and(lower, upper);
            Ok(if *negated { not(inside) } else { inside })
        }
        Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => like_expr(feature, expr, pattern, *negated, false),
        Expr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => like_expr(feature, expr, pattern, *negated, true),
        other => Err(unsupported(format!("'{}'", other))),
    }
}

fn like_expr(
    feature: &Feature,
    expr: &Expr,
    pattern: &Expr,
    negated: bool,
    case_insensitive: bool,
) -> Result<Value> {
    let text = evaluate(expr, feature)?.as_text();
    let pattern = evaluate(pattern, feature)?.as_text();
    Ok(match (text, pattern) {
        (Some(t), Some(p)) => Value::Bool(like(&t, &p, case_insensitive) != negated),
        _ => Value::Null,
    })
}

fn field(feature: &Feature, name: &str) -> Value {
    feature
        .attribute(name)
        .map_or(Value::Null, Value::from_attribute)
}

#[cfg(test)]
mod tests {
    use super::super::AttributeFilter;
    use super::*;

    fn city(population: i64, name: &str) -> Feature {
        Feature::new(1, None)
            .with_attribute("population", AttributeValue::Integer(population))
            .with_attribute("name", AttributeValue::Text(name.to_string()))
            .with_attribute("area", AttributeValue::Null)
    }

    fn matches(expr: &str, feature: &Feature) -> bool {
        AttributeFilter::parse(expr).unwrap().matches(feature).unwrap()
    }

    #[test]
    fn test_comparisons() {
        let f = city(150, "Arles");
        assert!(matches("population > 100", &f));
        assert!(!matches("population > 150", &f));
        assert!(matches("population BETWEEN 100 AND 200", &f));
        assert!(matches("name = 'Arles'", &f));
        assert!(matches("population * 2 = 300", &f));
    }

    #[test]
    fn test_null_semantics() {
        let f = city(10, "Nîmes");
        assert!(!matches("area > 1", &f));
        assert!(!matches("NOT (area > 1)", &f));
        assert!(matches("area IS NULL", &f));
        assert!(matches("area > 1 OR population = 10", &f));
    }

    #[test]
    fn test_like_and_in() {
        let f = city(10, "Avignon");
        assert!(matches("name LIKE 'Av%'", &f));
        assert!(matches("name LIKE 'A_ignon'", &f));
        assert!(!matches("name LIKE 'av%'", &f));
        assert!(matches("name ILIKE 'av%'", &f));
        assert!(matches("population IN (1, 10, 100)", &f));
        assert!(matches("name NOT IN ('Paris')", &f));
    }

    #[test]
    fn test_functions_are_not_evaluable() {
        let filter = AttributeFilter::parse("upper(name) = 'X'").unwrap();
        assert!(filter.check_evaluable().is_err());
        assert!(AttributeFilter::parse("population > 1")
            .unwrap()
            .check_evaluable()
            .is_ok());
    }
}
