//! varve-core: the engine of the varve lakehouse database.
//!
//! Re-exports the embedding API (`Database`, `Session`, `Outcome`), the
//! Merkle timeline, the planner/executor, and the language runtime.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod hotpath;
pub mod lang;
pub mod obs;
pub mod plan;
pub mod session;
pub mod timeline;

pub use cache::{CacheEntry, Fingerprint, ResultCache};

pub use catalog::Catalog;

pub use config::EngineConfig;

pub use engine::{Engine, WriteOutcome};

pub use error::{EngineError, Result};

pub use exec::{ExecContext, RowStream};

pub use hotpath::{HotPath, HotPathConfig};

pub use lang::{parse_program, parse_statement, Interpreter, Value};

pub use obs::{init_tracing, QuerySpan};

pub use plan::{AccessOp, QueryPlan};

pub use session::{Database, Outcome, Session};

pub use timeline::{
    Commit, GcReport, Quarantine, TableChange, TableRef, Timeline, VerifyIssue, VerifyReport,
};

pub use varve_store::{
    BlobStore, ColumnDef, DataType, Datum, DatabaseSchema, FsBlobStore, Hash256, IndexDef,
    IndexKind, Row, StripeSet, TableDef,
};
