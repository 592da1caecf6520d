//! The query/procedural language: lexer, parser, AST, values, environments,
//! and the evaluator.

pub mod ast;
pub mod env;
pub mod eval;
pub mod lexer;
pub mod ops;
pub mod parser;
pub mod token;
pub mod value;

pub use ast::{Expr, SelectStmt, Statement};
pub use env::{Capture, EnvRef, Environment};
pub use eval::Interpreter;
pub use lexer::tokenize;
pub use parser::{parse_program, parse_statement};
pub use value::{FunctionValue, Value};
