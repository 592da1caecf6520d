//! varve-store: persistence layer for the varve lakehouse engine.
//!
//! Re-exports the blob store, columnar stripe codec, secondary indexes, and
//! schema registry for programmatic access.

pub mod blob;
pub mod datum;
pub mod error;
pub mod hash;
pub mod index;
pub mod schema;
pub mod stripe;

pub use blob::fs::FsBlobStore;
pub use blob::mem::MemBlobStore;
pub use blob::BlobStore;

pub use datum::{DataType, Datum, Row};

pub use error::{Result, StorageError};

pub use hash::{CommitId, Hash256, StripeId};

pub use index::{index_key, IndexStore, Locator, SecondaryIndex};

pub use schema::{
    ColumnDef, DatabaseSchema, IndexDef, IndexKind, SchemaRegistry, TableDef, ViewDef, SCHEMA_KEY,
};

pub use stripe::{
    encode_stripe, parse_stripe, read_stripe_footer, set_key, stripe_key, BloomFilter,
    ColumnStats, Compression, EncodedStripe, Encoding, Footer, ParsedStripe, PrunePredicate,
    StripeOptions, StripeSet, DEFAULT_PAGE_BYTES, DEFAULT_STRIPE_ROWS,
};
