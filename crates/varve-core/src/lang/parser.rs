//! Recursive-descent parser for the query/procedural language.

use varve_store::Datum;

use crate::error::{EngineError, Result};

use super::ast::*;
use super::lexer::tokenize;
use super::token::{Kw, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse a whole source string into statements separated by `;`.
pub fn parse_program(src: &str) -> Result<Vec<Statement>> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut out = Vec::new();
    loop {
        while parser.eat(&TokenKind::Semicolon) {}
        if parser.at_eof() {
            return Ok(out);
        }
        out.push(parser.parse_statement()?);
    }
}

/// Parse exactly one statement.
pub fn parse_statement(src: &str) -> Result<Statement> {
    let mut statements = parse_program(src)?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Err(EngineError::syntax("empty input", 1, 1)),
        _ => Err(EngineError::syntax("expected a single statement", 1, 1)),
    }
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_ahead(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn at_eof(&self) -> bool {
        *self.peek_kind() == TokenKind::Eof
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn err_here(&self, message: impl Into<String>) -> EngineError {
        let t = self.peek();
        EngineError::syntax(message, t.line, t.column)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if *self.peek_kind() == TokenKind::Keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn at_kw(&self, kw: Kw) -> bool {
        *self.peek_kind() == TokenKind::Keyword(kw)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {kind}, found {}", self.peek_kind())))
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {kw:?}, found {}", self.peek_kind())))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(name)
            }
            other => Err(self.err_here(format!("expected identifier, found {other}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    pub fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek_kind() {
            TokenKind::Keyword(Kw::Select) => Ok(Statement::Select(self.parse_select()?)),
            TokenKind::Keyword(Kw::Insert) => self.parse_insert(),
            TokenKind::Keyword(Kw::Update) => self.parse_update(),
            TokenKind::Keyword(Kw::Delete) => self.parse_delete(),
            TokenKind::Keyword(Kw::Create) => self.parse_create(),
            TokenKind::Keyword(Kw::Drop) => self.parse_drop(),
            TokenKind::Keyword(Kw::Refresh) => {
                self.bump();
                self.expect_kw(Kw::Materialized)?;
                self.expect_kw(Kw::View)?;
                Ok(Statement::RefreshView { name: self.expect_ident()? })
            }
            TokenKind::Keyword(Kw::Show) => {
                self.bump();
                self.expect_kw(Kw::Tables)?;
                Ok(Statement::ShowTables)
            }
            TokenKind::Keyword(Kw::Describe) => {
                self.bump();
                Ok(Statement::Describe { table: self.expect_ident()? })
            }
            TokenKind::Keyword(Kw::Analyze) => {
                self.bump();
                Ok(Statement::Analyze { table: self.expect_ident()? })
            }
            TokenKind::Keyword(Kw::Function) => {
                self.bump();
                let name = self.expect_ident()?;
                let params = self.parse_param_list()?;
                let body = self.parse_block()?;
                Ok(Statement::FunctionDef { name, params, body })
            }
            TokenKind::Keyword(Kw::Let) => {
                self.bump();
                let name = self.expect_ident()?;
                self.expect(&TokenKind::Assign)?;
                let value = self.parse_expr()?;
                Ok(Statement::Let { name, value })
            }
            TokenKind::Keyword(kw @ (Kw::Module | Kw::Macro | Kw::Import)) => {
                Err(self.err_here(format!("{kw:?} is not supported")))
            }
            _ => Ok(Statement::Expr(self.parse_expr()?)),
        }
    }

    fn parse_select(&mut self) -> Result<SelectStmt> {
        self.expect_kw(Kw::Select)?;
        let distinct = self.eat_kw(Kw::Distinct);

        let mut items = Vec::new();
        loop {
            if self.eat(&TokenKind::Star) {
                items.push(SelectItem::Star);
            } else {
                let expr = self.parse_expr()?;
                let alias = if self.eat_kw(Kw::As) { Some(self.expect_ident()?) } else { None };
                items.push(SelectItem::Expr { expr, alias });
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        self.expect_kw(Kw::From)?;
        let from = self.parse_table_source()?;

        let join = if self.eat_kw(Kw::Join) {
            let source = self.parse_table_source()?;
            self.expect_kw(Kw::On)?;
            let on = self.parse_expr()?;
            Some(JoinClause { source, on })
        } else {
            None
        };

        let where_clause =
            if self.eat_kw(Kw::Where) { Some(self.parse_expr()?) } else { None };

        let mut group_by = Vec::new();
        if self.eat_kw(Kw::Group) {
            self.expect_kw(Kw::By)?;
            loop {
                group_by.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let having = if self.eat_kw(Kw::Having) { Some(self.parse_expr()?) } else { None };

        let mut order_by = Vec::new();
        if self.eat_kw(Kw::Order) {
            self.expect_kw(Kw::By)?;
            loop {
                let expr = self.parse_expr()?;
                let ascending = if self.eat_kw(Kw::Desc) {
                    false
                } else {
                    self.eat_kw(Kw::Asc);
                    true
                };
                order_by.push(OrderKey { expr, ascending });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let limit = if self.eat_kw(Kw::Limit) {
            match self.bump().kind {
                TokenKind::Integer(n) if n >= 0 => Some(n as u64),
                other => return Err(self.err_here(format!("expected row count, found {other}"))),
            }
        } else {
            None
        };

        Ok(SelectStmt {
            distinct,
            items,
            from,
            join,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
        })
    }

    fn parse_table_source(&mut self) -> Result<TableSource> {
        let table = self.expect_ident()?;
        let snapshot = if self.eat(&TokenKind::At) {
            Some(match self.bump().kind {
                TokenKind::Ident(name) => name,
                // Commit hex prefixes are quoted: `t@'1a2b3c'`. An all-digit
                // prefix also lexes as a bare integer.
                TokenKind::Str(reference) => reference,
                TokenKind::Integer(n) => n.to_string(),
                other => {
                    return Err(self.err_here(format!("expected snapshot reference, found {other}")))
                }
            })
        } else {
            None
        };
        Ok(TableSource { table, snapshot })
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_kw(Kw::Insert)?;
        self.expect_kw(Kw::Into)?;
        let table = self.expect_ident()?;

        let columns = if self.eat(&TokenKind::LParen) {
            let mut cols = Vec::new();
            loop {
                cols.push(self.expect_ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect_kw(Kw::Values)?;
        let mut rows = Vec::new();
        loop {
            self.expect(&TokenKind::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            rows.push(row);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::Insert { table, columns, rows })
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect_kw(Kw::Update)?;
        let table = self.expect_ident()?;
        self.expect_kw(Kw::Set)?;
        let mut assignments = Vec::new();
        loop {
            let column = self.expect_ident()?;
            self.expect(&TokenKind::Assign)?;
            assignments.push((column, self.parse_expr()?));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let where_clause =
            if self.eat_kw(Kw::Where) { Some(self.parse_expr()?) } else { None };
        Ok(Statement::Update { table, assignments, where_clause })
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect_kw(Kw::Delete)?;
        self.expect_kw(Kw::From)?;
        let table = self.expect_ident()?;
        let where_clause =
            if self.eat_kw(Kw::Where) { Some(self.parse_expr()?) } else { None };
        Ok(Statement::Delete { table, where_clause })
    }

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect_kw(Kw::Create)?;
        if self.eat_kw(Kw::Table) {
            let name = self.expect_ident()?;
            self.expect(&TokenKind::LParen)?;
            let mut columns = Vec::new();
            loop {
                let col_name = self.expect_ident()?;
                let type_name = self.expect_ident()?;
                let nullable = if self.eat_kw(Kw::Not) {
                    self.expect_kw(Kw::Null)?;
                    false
                } else {
                    true
                };
                columns.push(ColumnSpec { name: col_name, type_name, nullable });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            return Ok(Statement::CreateTable { name, columns });
        }
        if self.eat_kw(Kw::Materialized) {
            self.expect_kw(Kw::View)?;
            let name = self.expect_ident()?;
            self.expect_kw(Kw::As)?;
            let query = self.parse_select()?;
            return Ok(Statement::CreateView { name, query });
        }
        if self.eat_kw(Kw::Snapshot) {
            return Ok(Statement::CreateSnapshot { name: self.expect_ident()? });
        }
        let unique_first = self.eat_kw(Kw::Unique);
        if self.eat_kw(Kw::Index) {
            let name = self.expect_ident()?;
            self.expect_kw(Kw::On)?;
            let table = self.expect_ident()?;
            self.expect(&TokenKind::LParen)?;
            let mut columns = Vec::new();
            loop {
                columns.push(self.expect_ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            let using = if self.eat_kw(Kw::Using) { Some(self.expect_ident()?) } else { None };
            let unique = unique_first || self.eat_kw(Kw::Unique);
            return Ok(Statement::CreateIndex { name, table, columns, using, unique });
        }
        Err(self.err_here("expected TABLE, INDEX, MATERIALIZED VIEW, or SNAPSHOT after CREATE"))
    }

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect_kw(Kw::Drop)?;
        let kind = if self.eat_kw(Kw::Table) {
            DropKind::Table
        } else if self.eat_kw(Kw::Index) {
            DropKind::Index
        } else if self.eat_kw(Kw::View) {
            DropKind::View
        } else if self.eat_kw(Kw::Snapshot) {
            DropKind::Snapshot
        } else {
            return Err(self.err_here("expected TABLE, INDEX, VIEW, or SNAPSHOT after DROP"));
        };
        Ok(Statement::Drop { kind, name: self.expect_ident()? })
    }

    fn parse_param_list(&mut self) -> Result<Vec<String>> {
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
        }
        Ok(params)
    }

    // -----------------------------------------------------------------------
    // Expressions (precedence climbing)
    // -----------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_coalesce()
    }

    fn parse_coalesce(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_or()?;
        while self.eat(&TokenKind::Coalesce) {
            let rhs = self.parse_or()?;
            lhs = Expr::Binary { op: BinOp::Coalesce, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_kw(Kw::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat_kw(Kw::And) {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_kw(Kw::Not) {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary { op: UnOp::Not, expr: Box::new(expr) });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_pipe()?;
        let op = match self.peek_kind() {
            TokenKind::EqEq | TokenKind::Assign => BinOp::Eq,
            TokenKind::NotEq => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Ge => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_pipe()?;
        Ok(Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    /// `x |> f` applies `f` to `x`; `x |> f(a)` prepends `x` to the args.
    fn parse_pipe(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        while self.eat(&TokenKind::Pipe) {
            let rhs = self.parse_additive()?;
            lhs = match rhs {
                Expr::Call { name, mut args } => {
                    args.insert(0, lhs);
                    Expr::Call { name, args }
                }
                Expr::Ident(name) => Expr::Call { name, args: vec![lhs] },
                _ => return Err(self.err_here("right side of |> must be a function")),
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnOp::Neg, expr: Box::new(expr) });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Cast) {
                let ty = self.expect_ident()?;
                expr = Expr::Cast { expr: Box::new(expr), ty };
            } else if self.eat(&TokenKind::Dot) {
                let field = self.expect_ident()?;
                expr = Expr::Field(Box::new(expr), field);
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&TokenKind::RBracket)?;
                expr = Expr::IndexAt(Box::new(expr), Box::new(index));
            } else if *self.peek_kind() == TokenKind::LParen {
                let Expr::Ident(name) = expr else {
                    return Err(self.err_here("only named functions can be called"));
                };
                self.bump();
                let mut args = Vec::new();
                if !self.eat(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                }
                expr = Expr::Call { name, args };
            } else {
                return Ok(expr);
            }
        }
    }

    fn aggregate_kw(&self) -> Option<AggFunc> {
        match self.peek_kind() {
            TokenKind::Keyword(Kw::Sum) => Some(AggFunc::Sum),
            TokenKind::Keyword(Kw::Count) => Some(AggFunc::Count),
            TokenKind::Keyword(Kw::Avg) => Some(AggFunc::Avg),
            TokenKind::Keyword(Kw::Min) => Some(AggFunc::Min),
            TokenKind::Keyword(Kw::Max) => Some(AggFunc::Max),
            _ => None,
        }
    }

    fn parse_aggregate(&mut self, window: bool) -> Result<Expr> {
        let func = self.aggregate_kw().ok_or_else(|| self.err_here("expected an aggregate"))?;
        self.bump();
        self.expect(&TokenKind::LParen)?;
        let arg = if self.eat(&TokenKind::Star) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        self.expect(&TokenKind::RParen)?;
        Ok(Expr::Aggregate { func, arg, window })
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.aggregate_kw().is_some() {
            return self.parse_aggregate(false);
        }
        match self.peek_kind().clone() {
            TokenKind::At => {
                self.bump();
                if self.aggregate_kw().is_some() {
                    self.parse_aggregate(true)
                } else {
                    Err(self.err_here("expected an aggregate after '@'"))
                }
            }
            TokenKind::Integer(v) => {
                self.bump();
                Ok(Expr::Literal(Datum::Int(v)))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(Expr::Literal(Datum::Float(v)))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(Expr::Literal(Datum::Str(s)))
            }
            TokenKind::Keyword(Kw::Null) => {
                self.bump();
                Ok(Expr::Literal(Datum::Null))
            }
            TokenKind::Keyword(Kw::True) => {
                self.bump();
                Ok(Expr::Literal(Datum::Bool(true)))
            }
            TokenKind::Keyword(Kw::False) => {
                self.bump();
                Ok(Expr::Literal(Datum::Bool(false)))
            }
            TokenKind::Ident(name) => {
                self.bump();
                Ok(Expr::Ident(name))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBracket)?;
                }
                Ok(Expr::List(items))
            }
            TokenKind::LBrace => self.parse_block_or_struct(),
            TokenKind::Keyword(Kw::Function) => {
                self.bump();
                let name = match self.peek_kind().clone() {
                    TokenKind::Ident(name) => {
                        self.bump();
                        Some(name)
                    }
                    _ => None,
                };
                let params = self.parse_param_list()?;
                let body = self.parse_block()?;
                Ok(Expr::Function { name, params, body: Box::new(body) })
            }
            TokenKind::Keyword(Kw::Match) => {
                self.bump();
                let scrutinee = self.parse_expr()?;
                self.expect(&TokenKind::LBrace)?;
                let mut arms = Vec::new();
                while self.eat_kw(Kw::Case) {
                    let pattern = self.parse_pattern()?;
                    self.expect(&TokenKind::FatArrow)?;
                    let body = self.parse_expr()?;
                    arms.push(MatchArm { pattern, body });
                    self.eat(&TokenKind::Comma);
                }
                self.expect(&TokenKind::RBrace)?;
                if arms.is_empty() {
                    return Err(self.err_here("match needs at least one case"));
                }
                Ok(Expr::Match { scrutinee: Box::new(scrutinee), arms })
            }
            TokenKind::Keyword(Kw::For) => {
                self.bump();
                let var = self.expect_ident()?;
                self.expect_kw(Kw::In)?;
                let iter = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Expr::For { var, iter: Box::new(iter), body: Box::new(body) })
            }
            TokenKind::Keyword(Kw::While) => {
                self.bump();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Expr::While { cond: Box::new(cond), body: Box::new(body) })
            }
            TokenKind::Keyword(Kw::Try) => {
                self.bump();
                let body = self.parse_expr()?;
                self.expect_kw(Kw::Catch)?;
                let catch = self.parse_expr()?;
                Ok(Expr::Try { body: Box::new(body), catch: Box::new(catch) })
            }
            other => Err(self.err_here(format!("unexpected {other}"))),
        }
    }

    fn parse_pattern(&mut self) -> Result<Pattern> {
        let negative = self.eat(&TokenKind::Minus);
        match self.peek_kind().clone() {
            TokenKind::Integer(v) => {
                self.bump();
                Ok(Pattern::Literal(Datum::Int(if negative { -v } else { v })))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(Pattern::Literal(Datum::Float(if negative { -v } else { v })))
            }
            TokenKind::Str(s) if !negative => {
                self.bump();
                Ok(Pattern::Literal(Datum::Str(s)))
            }
            TokenKind::Keyword(Kw::Null) if !negative => {
                self.bump();
                Ok(Pattern::Literal(Datum::Null))
            }
            TokenKind::Keyword(Kw::True) if !negative => {
                self.bump();
                Ok(Pattern::Literal(Datum::Bool(true)))
            }
            TokenKind::Keyword(Kw::False) if !negative => {
                self.bump();
                Ok(Pattern::Literal(Datum::Bool(false)))
            }
            TokenKind::Ident(name) if !negative => {
                self.bump();
                if name == "_" {
                    Ok(Pattern::Wildcard)
                } else {
                    Ok(Pattern::Binding(name))
                }
            }
            other => Err(self.err_here(format!("unexpected pattern {other}"))),
        }
    }

    /// A `{ ... }` block: statements (LET or expressions), value of the last
    /// expression.
    fn parse_block(&mut self) -> Result<Expr> {
        self.expect(&TokenKind::LBrace)?;
        let mut items = Vec::new();
        loop {
            while self.eat(&TokenKind::Semicolon) {}
            if self.eat(&TokenKind::RBrace) {
                return Ok(Expr::Block(items));
            }
            if self.eat_kw(Kw::Let) {
                let name = self.expect_ident()?;
                self.expect(&TokenKind::Assign)?;
                let value = self.parse_expr()?;
                items.push(BlockItem::Let { name, value });
            } else {
                items.push(BlockItem::Expr(self.parse_expr()?));
            }
        }
    }

    /// Disambiguate `{ k: v }` struct literals from blocks by lookahead.
    fn parse_block_or_struct(&mut self) -> Result<Expr> {
        let is_struct = *self.peek_ahead(1) == TokenKind::RBrace
            || (matches!(self.peek_ahead(1), TokenKind::Ident(_))
                && *self.peek_ahead(2) == TokenKind::Colon);
        if !is_struct {
            return self.parse_block();
        }
        self.expect(&TokenKind::LBrace)?;
        let mut fields = Vec::new();
        if !self.eat(&TokenKind::RBrace) {
            loop {
                let name = self.expect_ident()?;
                self.expect(&TokenKind::Colon)?;
                fields.push((name, self.parse_expr()?));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RBrace)?;
        }
        Ok(Expr::StructLit(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_with_all_clauses() {
        let stmt = parse_statement(
            "SELECT DISTINCT id, v AS val FROM t JOIN u ON id == uid \
             WHERE v > 10 GROUP BY id HAVING COUNT(*) > 1 \
             ORDER BY id DESC LIMIT 5",
        )
        .unwrap();
        let Statement::Select(select) = stmt else { panic!("not a select") };
        assert!(select.distinct);
        assert_eq!(select.items.len(), 2);
        assert_eq!(select.from.table, "t");
        assert!(select.join.is_some());
        assert!(select.where_clause.is_some());
        assert_eq!(select.group_by.len(), 1);
        assert!(select.having.is_some());
        assert!(!select.order_by[0].ascending);
        assert_eq!(select.limit, Some(5));
    }

    #[test]
    fn time_travel_reference() {
        let stmt = parse_statement("SELECT v FROM t@s1 WHERE id = 1").unwrap();
        let Statement::Select(select) = stmt else { panic!("not a select") };
        assert_eq!(select.from.snapshot.as_deref(), Some("s1"));
    }

    #[test]
    fn single_equals_is_equality_in_where() {
        let stmt = parse_statement("SELECT v FROM t WHERE id = 2").unwrap();
        let Statement::Select(select) = stmt else { panic!("not a select") };
        let Some(Expr::Binary { op, .. }) = select.where_clause else { panic!("no where") };
        assert_eq!(op, BinOp::Eq);
    }

    #[test]
    fn insert_multiple_rows() {
        let stmt =
            parse_statement("INSERT INTO t (id, v) VALUES (1, 10), (2, 20), (3, 30)").unwrap();
        let Statement::Insert { table, columns, rows } = stmt else { panic!("not insert") };
        assert_eq!(table, "t");
        assert_eq!(columns.unwrap().len(), 2);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn update_and_delete() {
        let stmt = parse_statement("UPDATE t SET v = 99 WHERE id = 1").unwrap();
        assert!(matches!(stmt, Statement::Update { .. }));
        let stmt = parse_statement("DELETE FROM t WHERE id = 3").unwrap();
        assert!(matches!(stmt, Statement::Delete { .. }));
    }

    #[test]
    fn create_table_with_nullability() {
        let stmt = parse_statement("CREATE TABLE t (id int NOT NULL, v int)").unwrap();
        let Statement::CreateTable { columns, .. } = stmt else { panic!("not create") };
        assert!(!columns[0].nullable);
        assert!(columns[1].nullable);
    }

    #[test]
    fn create_index_variants() {
        let stmt = parse_statement("CREATE INDEX t_id ON t (id) USING btree UNIQUE").unwrap();
        let Statement::CreateIndex { using, unique, .. } = stmt else { panic!("not index") };
        assert_eq!(using.as_deref(), Some("btree"));
        assert!(unique);

        let stmt = parse_statement("CREATE UNIQUE INDEX t_id ON t (id)").unwrap();
        let Statement::CreateIndex { unique, .. } = stmt else { panic!("not index") };
        assert!(unique);
    }

    #[test]
    fn materialized_view_and_refresh() {
        let stmt =
            parse_statement("CREATE MATERIALIZED VIEW mv AS SELECT id, v FROM t WHERE v >= 20")
                .unwrap();
        assert!(matches!(stmt, Statement::CreateView { .. }));
        let stmt = parse_statement("REFRESH MATERIALIZED VIEW mv").unwrap();
        assert!(matches!(stmt, Statement::RefreshView { .. }));
    }

    #[test]
    fn introspection_statements() {
        assert!(matches!(parse_statement("SHOW TABLES").unwrap(), Statement::ShowTables));
        assert!(matches!(parse_statement("DESCRIBE t").unwrap(), Statement::Describe { .. }));
        assert!(matches!(parse_statement("ANALYZE t").unwrap(), Statement::Analyze { .. }));
    }

    #[test]
    fn function_definition_and_recursion() {
        let stmt = parse_statement(
            "FUNCTION fib(n) { MATCH n { case 0 => 0, case 1 => 1, case _ => fib(n - 1) + fib(n - 2) } }",
        )
        .unwrap();
        let Statement::FunctionDef { name, params, body } = stmt else { panic!("not a def") };
        assert_eq!(name, "fib");
        assert_eq!(params, vec!["n"]);
        let Expr::Block(items) = body else { panic!("body not a block") };
        assert!(matches!(items[0], BlockItem::Expr(Expr::Match { .. })));
    }

    #[test]
    fn procedural_loops_and_try() {
        assert!(parse_statement("FOR x IN range(10) { x * 2 }").is_ok());
        assert!(parse_statement("WHILE n > 0 { LET n = n - 1 }").is_ok());
        assert!(parse_statement("TRY 1 / 0 CATCH 0").is_ok());
    }

    #[test]
    fn pipe_rewrites_to_call() {
        let Statement::Expr(expr) = parse_statement("5 |> double").unwrap() else {
            panic!("not expr")
        };
        assert_eq!(expr, Expr::Call { name: "double".into(), args: vec![Expr::Literal(Datum::Int(5))] });

        let Statement::Expr(expr) = parse_statement("5 |> add(3)").unwrap() else {
            panic!("not expr")
        };
        let Expr::Call { name, args } = expr else { panic!("not call") };
        assert_eq!(name, "add");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn window_aggregate_marker() {
        let stmt = parse_statement("SELECT @SUM(v) FROM t").unwrap();
        let Statement::Select(select) = stmt else { panic!("not select") };
        let SelectItem::Expr { expr, .. } = &select.items[0] else { panic!("star") };
        assert!(matches!(expr, Expr::Aggregate { window: true, .. }));
    }

    #[test]
    fn struct_and_list_literals() {
        assert!(matches!(
            parse_statement("LET s = {a: 1, b: 'x'}").unwrap(),
            Statement::Let { .. }
        ));
        let Statement::Let { value, .. } = parse_statement("LET l = [1, 2, 3]").unwrap() else {
            panic!()
        };
        assert!(matches!(value, Expr::List(_)));
    }

    #[test]
    fn module_macro_import_rejected() {
        for src in ["MODULE m", "MACRO m", "IMPORT m"] {
            let err = parse_statement(src).unwrap_err();
            assert_eq!(err.code(), 10, "{src}");
        }
    }

    #[test]
    fn cast_and_coalesce() {
        let Statement::Expr(expr) = parse_statement("v ?? 0 :: int").unwrap() else { panic!() };
        // `::` binds tighter than `??`.
        let Expr::Binary { op: BinOp::Coalesce, rhs, .. } = expr else { panic!("not coalesce") };
        assert!(matches!(*rhs, Expr::Cast { .. }));
    }

    #[test]
    fn program_with_multiple_statements() {
        let stmts = parse_program("LET a = 1; LET b = 2; a + b").unwrap();
        assert_eq!(stmts.len(), 3);
    }
}
