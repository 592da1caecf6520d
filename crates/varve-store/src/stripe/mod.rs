//! Immutable columnar stripes.
//!
//! A stripe holds up to a configured number of rows, one or more pages per
//! column, and a footer with per-column statistics used for pruning. Stripes
//! are content-addressed: the trailing hash covers every preceding byte, and
//! the blob key is derived from it.
//!
//! Byte layout (all integers little-endian, hashes SHA-256):
//!
//! ```text
//! magic(4) | version(2) | column_count(2)
//! per column: encoding(1) | compression(1) | page_count(2) | pages[...]
//! footer { per-column stats, bloom?, schema_fingerprint(32) }
//! footer_len(4) | stripe_hash(32)
//! ```

pub mod bloom;
pub mod decode;
pub mod encode;

use serde::{Deserialize, Serialize};

use crate::datum::Datum;
use crate::hash::{Hash256, StripeId};

pub use bloom::BloomFilter;
pub use decode::{parse_stripe, read_stripe_footer, ParsedStripe};
pub use encode::{encode_stripe, EncodedStripe, StripeOptions};

pub const STRIPE_MAGIC: &[u8; 4] = b"VRVS";
pub const STRIPE_VERSION: u16 = 1;

/// Default row capacity of a stripe.
pub const DEFAULT_STRIPE_ROWS: usize = 10_000;

/// Default target size of one page.
pub const DEFAULT_PAGE_BYTES: usize = 64 * 1024;

/// Per-column page encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Plain,
    Rle,
    Dict,
}

impl Encoding {
    pub fn tag(&self) -> u8 {
        match self {
            Encoding::Plain => 0,
            Encoding::Rle => 1,
            Encoding::Dict => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Encoding::Plain),
            1 => Some(Encoding::Rle),
            2 => Some(Encoding::Dict),
            _ => None,
        }
    }
}

/// Per-page compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Deflate,
}

impl Compression {
    pub fn tag(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Deflate),
            _ => None,
        }
    }
}

/// Footer statistics for one column. Min/max bound all non-null values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub row_count: u64,
    pub null_count: u64,
    pub min: Option<Datum>,
    pub max: Option<Datum>,
    pub encoding: Encoding,
    pub compression: Compression,
    pub bloom: Option<BloomFilter>,
}

/// Stripe footer: one stats block per column plus the schema fingerprint the
/// stripe was written under.
#[derive(Debug, Clone, PartialEq)]
pub struct Footer {
    pub columns: Vec<ColumnStats>,
    pub schema_fingerprint: Hash256,
}

impl Footer {
    pub fn row_count(&self) -> u64 {
        self.columns.first().map_or(0, |c| c.row_count)
    }

    /// Footer-level pruning: can this stripe contain rows matching `pred`?
    /// Errs on the side of `true`; `false` is a proof of absence.
    pub fn may_match(&self, pred: &PrunePredicate) -> bool {
        match pred {
            PrunePredicate::Range { column, lo, hi, lo_inclusive, hi_inclusive } => {
                let Some(stats) = self.columns.get(*column) else {
                    return true;
                };
                let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
                    // No non-null values at all; comparisons cannot match.
                    return false;
                };
                if let Some(lo) = lo {
                    let ord = max.total_cmp(lo);
                    if ord == std::cmp::Ordering::Less
                        || (!lo_inclusive && ord == std::cmp::Ordering::Equal)
                    {
                        return false;
                    }
                }
                if let Some(hi) = hi {
                    let ord = min.total_cmp(hi);
                    if ord == std::cmp::Ordering::Greater
                        || (!hi_inclusive && ord == std::cmp::Ordering::Equal)
                    {
                        return false;
                    }
                }
                true
            }
            PrunePredicate::Membership { column, values } => {
                let Some(stats) = self.columns.get(*column) else {
                    return true;
                };
                let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
                    return false;
                };
                values.iter().any(|v| {
                    if let Some(bloom) = &stats.bloom {
                        if !bloom.contains(v) {
                            return false;
                        }
                    }
                    min.total_cmp(v) != std::cmp::Ordering::Greater
                        && max.total_cmp(v) != std::cmp::Ordering::Less
                })
            }
        }
    }
}

/// A single-column predicate the decoder can prune on.
#[derive(Debug, Clone, PartialEq)]
pub enum PrunePredicate {
    Range {
        column: usize,
        lo: Option<Datum>,
        hi: Option<Datum>,
        lo_inclusive: bool,
        hi_inclusive: bool,
    },
    Membership { column: usize, values: Vec<Datum> },
}

/// The ordered stripe list of one table at one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StripeSet {
    pub stripes: Vec<StripeId>,
}

impl StripeSet {
    pub fn new(stripes: Vec<StripeId>) -> Self {
        Self { stripes }
    }

    /// Merkle root over the ordered stripe hashes. Pairwise tree; an odd
    /// node is promoted unchanged; the empty set roots at the zero hash.
    pub fn merkle_root(&self) -> Hash256 {
        if self.stripes.is_empty() {
            return Hash256::zero();
        }
        let mut level: Vec<Hash256> = self.stripes.clone();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                if pair.len() == 2 {
                    next.push(Hash256::compute_parts(&[pair[0].as_bytes(), pair[1].as_bytes()]));
                } else {
                    next.push(pair[0]);
                }
            }
            level = next;
        }
        level[0]
    }
}

/// Blob key of a stripe.
pub fn stripe_key(table: &str, id: &StripeId) -> String {
    format!("stripes/{table}/{}", id.to_hex())
}

/// Blob key of a stripe-set manifest.
pub fn set_key(table: &str, set_hash: &Hash256) -> String {
    format!("stripes/{table}/sets/{}", set_hash.to_hex())
}
