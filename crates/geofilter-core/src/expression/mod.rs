//! Attribute filter expressions
//!
//! Attribute filters are SQL boolean expressions (`population > 100 AND name
//! LIKE 'A%'`). They are parsed with `sqlparser` so that field references can
//! be checked against the dataset before anything reaches a backend, rendered
//! back for the database backends and evaluated in process for the generic
//! driver.

mod eval;

use std::collections::BTreeSet;

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, SetExpr, Statement,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

pub use eval::Value;

use crate::dataset::{DatasetHandle, Feature, FeatureId};
use crate::error::{FilterError, Result};
use crate::request::CombineOperator;

/// Subset expression that matches no feature
pub const MATCH_NOTHING: &str = "1 = 0";

/// A parsed attribute filter
#[derive(Debug, Clone)]
pub struct AttributeFilter {
    expr: Expr,
}

impl AttributeFilter {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FilterError::invalid_expression("attribute expression is empty"));
        }
        let sql = format!("SELECT 1 WHERE {}", text);
        let statements = Parser::parse_sql(&GenericDialect {}, &sql)
            .map_err(|e| FilterError::invalid_expression(format!("'{}': {}", text, e)))?;
        let [Statement::Query(query)] = statements.as_slice() else {
            return Err(FilterError::invalid_expression(format!(
                "'{}' is not a single boolean expression",
                text
            )));
        };
        match query.body.as_ref() {
            SetExpr::Select(select) => match &select.selection {
                Some(expr) => Ok(Self { expr: expr.clone() }),
                None => Err(FilterError::invalid_expression("attribute expression is empty")),
            },
            _ => Err(FilterError::invalid_expression(format!(
                "'{}' is not a boolean expression",
                text
            ))),
        }
    }

    /// Field names referenced by the expression, lowercased
    pub fn fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        collect_fields(&self.expr, &mut fields);
        fields
    }

    /// Fail with `InvalidExpression` when the expression names unknown fields
    pub fn check_fields(&self, dataset: &DatasetHandle) -> Result<()> {
        let unknown: Vec<String> = self
            .fields()
            .into_iter()
            .filter(|f| !dataset.has_field(f))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(FilterError::invalid_expression(format!(
                "unknown field(s) in {}: {}",
                dataset.id,
                unknown.join(", ")
            )))
        }
    }

    /// Fail when the expression uses constructs the in-process evaluator lacks
    pub fn check_evaluable(&self) -> Result<()> {
        eval::check(&self.expr)
    }

    /// Normalized SQL text
    pub fn to_sql(&self) -> String {
        self.expr.to_string()
    }

    pub fn evaluate(&self, feature: &Feature) -> Result<Value> {
        eval::evaluate(&self.expr, feature)
    }

    /// SQL three-valued filtering: only `TRUE` keeps a feature
    pub fn matches(&self, feature: &Feature) -> Result<bool> {
        Ok(matches!(self.evaluate(feature)?, Value::Bool(true)))
    }
}

fn collect_fields(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Identifier(ident) => {
            out.insert(ident.value.to_ascii_lowercase());
        }
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last() {
                out.insert(last.value.to_ascii_lowercase());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_fields(left, out);
            collect_fields(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::Cast { expr, .. } => collect_fields(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_fields(expr, out);
            for item in list {
                collect_fields(item, out);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_fields(expr, out);
            collect_fields(low, out);
            collect_fields(high, out);
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            collect_fields(expr, out);
            collect_fields(pattern, out);
        }
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                        | FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => collect_fields(e, out),
                        _ => {}
                    }
                }
            }
        }
        _ => {}
    }
}

/// Double-quote an SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote an SQL string literal
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `column IN (ids)`, or [`MATCH_NOTHING`] for an empty id set
pub fn id_list_expression(column: &str, ids: &[FeatureId]) -> String {
    if ids.is_empty() {
        return MATCH_NOTHING.to_string();
    }
    let list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("{} IN ({})", column, list.join(", "))
}

/// Merge a new filter with an already active subset
pub fn combine(existing: Option<&str>, new: &str, operator: CombineOperator) -> String {
    let existing = existing.map(str::trim).filter(|e| !e.is_empty());
    match (existing, operator) {
        (None, _) | (_, CombineOperator::Replace) => new.to_string(),
        (Some(old), CombineOperator::And) => format!("({}) AND ({})", old, new),
        (Some(old), CombineOperator::Or) => format!("({}) OR ({})", old, new),
        (Some(old), CombineOperator::AndNot) => format!("({}) AND NOT ({})", old, new),
    }
}

/// AND together the non-empty parts
pub fn and_all<'a>(parts: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let parts: Vec<&str> = parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [] => None,
        [only] => Some(only.to_string()),
        many => Some(
            many.iter()
                .map(|p| format!("({})", p))
                .collect::<Vec<_>>()
                .join(" AND "),
        ),
    }
}
