//! Abstract syntax: statements and expressions.

use varve_store::Datum;

/// Aggregate functions. A `window: true` aggregate (written `@SUM(...)`)
/// computes a running value over the frame `UNBOUNDED PRECEDING AND CURRENT
/// ROW` instead of collapsing its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Count => "COUNT",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Coalesce,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Datum),
    Ident(String),
    /// `qualifier.name`: a table-qualified column, or a struct field when
    /// the qualifier resolves to a struct at evaluation time.
    Field(Box<Expr>, String),
    /// `expr[index]`
    IndexAt(Box<Expr>, Box<Expr>),
    Unary { op: UnOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// `expr :: type-name`
    Cast { expr: Box<Expr>, ty: String },
    Call { name: String, args: Vec<Expr> },
    Aggregate { func: AggFunc, arg: Option<Box<Expr>>, window: bool },
    List(Vec<Expr>),
    StructLit(Vec<(String, Expr)>),
    /// `FUNCTION name(params) { body }` in expression position is anonymous.
    Function { name: Option<String>, params: Vec<String>, body: Box<Expr> },
    Block(Vec<BlockItem>),
    Match { scrutinee: Box<Expr>, arms: Vec<MatchArm> },
    For { var: String, iter: Box<Expr>, body: Box<Expr> },
    While { cond: Box<Expr>, body: Box<Expr> },
    Try { body: Box<Expr>, catch: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockItem {
    Let { name: String, value: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Datum),
    /// Binds the scrutinee.
    Binding(String),
    Wildcard,
}

/// `FROM t` or `FROM t@snapshot` (time-travel binding).
#[derive(Debug, Clone, PartialEq)]
pub struct TableSource {
    pub table: String,
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub source: TableSource,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: TableSource,
    pub join: Option<JoinClause>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Table,
    Index,
    View,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStmt),
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        where_clause: Option<Expr>,
    },
    Delete {
        table: String,
        where_clause: Option<Expr>,
    },
    CreateTable {
        name: String,
        columns: Vec<ColumnSpec>,
    },
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        using: Option<String>,
        unique: bool,
    },
    CreateView {
        name: String,
        query: SelectStmt,
    },
    CreateSnapshot {
        name: String,
    },
    RefreshView {
        name: String,
    },
    Drop {
        kind: DropKind,
        name: String,
    },
    ShowTables,
    Describe {
        table: String,
    },
    Analyze {
        table: String,
    },
    FunctionDef {
        name: String,
        params: Vec<String>,
        body: Expr,
    },
    Let {
        name: String,
        value: Expr,
    },
    Expr(Expr),
}

impl Statement {
    /// Data-plane statements route through the planner/executor; the rest
    /// run in the language evaluator.
    pub fn is_data_plane(&self) -> bool {
        !matches!(
            self,
            Statement::FunctionDef { .. } | Statement::Let { .. } | Statement::Expr(_)
        )
    }
}
