//! Canonical query text.
//!
//! Two queries that normalize to the same string are the same query: the
//! canonical form drives both cache fingerprints and materialized-view
//! substitution. Keywords are uppercased, spacing is single, literals are
//! printed canonically, and `=` becomes `==`.

use varve_store::Datum;

use crate::lang::ast::{
    AggFunc, BinOp, Expr, JoinClause, OrderKey, SelectItem, SelectStmt, TableSource, UnOp,
};

pub fn normalize_select(stmt: &SelectStmt) -> String {
    let mut out = String::from("SELECT ");
    if stmt.distinct {
        out.push_str("DISTINCT ");
    }
    let items: Vec<String> = stmt.items.iter().map(normalize_item).collect();
    out.push_str(&items.join(", "));
    out.push_str(" FROM ");
    out.push_str(&normalize_source(&stmt.from));
    if let Some(JoinClause { source, on }) = &stmt.join {
        out.push_str(" JOIN ");
        out.push_str(&normalize_source(source));
        out.push_str(" ON ");
        out.push_str(&normalize_expr(on));
    }
    if let Some(where_clause) = &stmt.where_clause {
        out.push_str(" WHERE ");
        out.push_str(&normalize_expr(where_clause));
    }
    if !stmt.group_by.is_empty() {
        out.push_str(" GROUP BY ");
        let keys: Vec<String> = stmt.group_by.iter().map(normalize_expr).collect();
        out.push_str(&keys.join(", "));
    }
    if let Some(having) = &stmt.having {
        out.push_str(" HAVING ");
        out.push_str(&normalize_expr(having));
    }
    if !stmt.order_by.is_empty() {
        out.push_str(" ORDER BY ");
        let keys: Vec<String> = stmt
            .order_by
            .iter()
            .map(|OrderKey { expr, ascending }| {
                format!("{} {}", normalize_expr(expr), if *ascending { "ASC" } else { "DESC" })
            })
            .collect();
        out.push_str(&keys.join(", "));
    }
    if let Some(limit) = stmt.limit {
        out.push_str(&format!(" LIMIT {limit}"));
    }
    out
}

fn normalize_source(source: &TableSource) -> String {
    match &source.snapshot {
        Some(snap) => format!("{}@{snap}", source.table),
        None => source.table.clone(),
    }
}

fn normalize_item(item: &SelectItem) -> String {
    match item {
        SelectItem::Star => "*".to_string(),
        SelectItem::Expr { expr, alias } => match alias {
            Some(alias) => format!("{} AS {alias}", normalize_expr(expr)),
            None => normalize_expr(expr),
        },
    }
}

fn normalize_datum(d: &Datum) -> String {
    match d {
        Datum::Str(s) => format!("'{}'", s.replace('\'', "\\'")),
        Datum::Null => "NULL".to_string(),
        Datum::Bool(b) => b.to_string().to_uppercase(),
        other => other.to_string(),
    }
}

pub fn normalize_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(d) => normalize_datum(d),
        Expr::Ident(name) => name.clone(),
        Expr::Field(inner, name) => format!("{}.{name}", normalize_expr(inner)),
        Expr::IndexAt(inner, index) => {
            format!("{}[{}]", normalize_expr(inner), normalize_expr(index))
        }
        Expr::Unary { op, expr } => match op {
            UnOp::Neg => format!("(- {})", normalize_expr(expr)),
            UnOp::Not => format!("(NOT {})", normalize_expr(expr)),
        },
        Expr::Binary { op, lhs, rhs } => {
            let symbol = match op {
                BinOp::And => "AND",
                BinOp::Or => "OR",
                other => other.symbol(),
            };
            format!("({} {symbol} {})", normalize_expr(lhs), normalize_expr(rhs))
        }
        Expr::Cast { expr, ty } => {
            format!("({} :: {})", normalize_expr(expr), ty.to_ascii_lowercase())
        }
        Expr::Call { name, args } => {
            let args: Vec<String> = args.iter().map(normalize_expr).collect();
            format!("{name}({})", args.join(", "))
        }
        Expr::Aggregate { func, arg, window } => {
            let marker = if *window { "@" } else { "" };
            let inner = arg.as_ref().map_or_else(|| "*".to_string(), |a| normalize_expr(a));
            format!("{marker}{}({inner})", agg_name(*func))
        }
        Expr::List(items) => {
            let items: Vec<String> = items.iter().map(normalize_expr).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::StructLit(fields) => {
            let fields: Vec<String> =
                fields.iter().map(|(k, v)| format!("{k}: {}", normalize_expr(v))).collect();
            format!("{{{}}}", fields.join(", "))
        }
        // Procedural forms never appear in cached/query-plane text, but the
        // writer stays total.
        Expr::Function { .. }
        | Expr::Block(_)
        | Expr::Match { .. }
        | Expr::For { .. }
        | Expr::While { .. }
        | Expr::Try { .. } => format!("{expr:?}"),
    }
}

fn agg_name(func: AggFunc) -> &'static str {
    func.name()
}
