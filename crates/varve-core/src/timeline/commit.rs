//! Commit records and their binary codec.
//!
//! Layout (little-endian, SHA-256 hashes):
//!
//! ```text
//! magic(4) | version(2) | parent_id(32) | timestamp(8) |
//! author_len(2) | author | op_len(2) | op |
//! table_ref_count(2) | { name_len(2) | name | stripe_set_hash(32) }* |
//! content_hash(32)
//! ```
//!
//! `content_hash = H(parent_id || timestamp || table_refs_hash || op)` and
//! the commit id is `H(content_hash)`; the id is not stored, it is recomputed
//! on load and by `verify`.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use varve_store::{CommitId, Hash256};

use crate::error::{EngineError, Result};

pub const COMMIT_MAGIC: &[u8; 4] = b"VRVC";
pub const COMMIT_VERSION: u16 = 1;

/// One table's state inside a commit: the Merkle root over its ordered
/// stripe hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub table: String,
    pub stripe_set_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub id: CommitId,
    pub parent: CommitId,
    pub timestamp_micros: i64,
    pub author: String,
    pub operation: String,
    pub table_refs: Vec<TableRef>,
    pub content_hash: Hash256,
}

fn table_refs_hash(refs: &[TableRef]) -> Hash256 {
    let mut bytes = Vec::new();
    for r in refs {
        bytes.extend_from_slice(&(r.table.len() as u16).to_le_bytes());
        bytes.extend_from_slice(r.table.as_bytes());
        bytes.extend_from_slice(r.stripe_set_hash.as_bytes());
    }
    Hash256::compute(&bytes)
}

impl Commit {
    pub fn build(
        parent: CommitId,
        timestamp_micros: i64,
        author: impl Into<String>,
        operation: impl Into<String>,
        table_refs: Vec<TableRef>,
    ) -> Self {
        let author = author.into();
        let operation = operation.into();
        let content_hash = Hash256::compute_parts(&[
            parent.as_bytes(),
            &timestamp_micros.to_le_bytes(),
            table_refs_hash(&table_refs).as_bytes(),
            operation.as_bytes(),
        ]);
        let id = Hash256::compute(content_hash.as_bytes());
        Self { id, parent, timestamp_micros, author, operation, table_refs, content_hash }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent.is_zero()
    }

    /// Recompute the content hash from the commit's fields.
    pub fn expected_content_hash(&self) -> Hash256 {
        Hash256::compute_parts(&[
            self.parent.as_bytes(),
            &self.timestamp_micros.to_le_bytes(),
            table_refs_hash(&self.table_refs).as_bytes(),
            self.operation.as_bytes(),
        ])
    }

    /// Check both hash links: content over fields, id over content.
    pub fn verify_hashes(&self) -> std::result::Result<(), &'static str> {
        if self.expected_content_hash() != self.content_hash {
            return Err("content_hash");
        }
        if Hash256::compute(self.content_hash.as_bytes()) != self.id {
            return Err("id");
        }
        Ok(())
    }

    /// The state hash for `table` if this commit touched it.
    pub fn table_ref(&self, table: &str) -> Option<&TableRef> {
        self.table_refs.iter().find(|r| r.table == table)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let io = |e: std::io::Error| EngineError::Internal(format!("commit encode: {e}"));
        let mut out = Vec::new();
        out.extend_from_slice(COMMIT_MAGIC);
        out.write_u16::<LittleEndian>(COMMIT_VERSION).map_err(io)?;
        out.extend_from_slice(self.parent.as_bytes());
        out.write_i64::<LittleEndian>(self.timestamp_micros).map_err(io)?;
        out.write_u16::<LittleEndian>(self.author.len() as u16).map_err(io)?;
        out.extend_from_slice(self.author.as_bytes());
        out.write_u16::<LittleEndian>(self.operation.len() as u16).map_err(io)?;
        out.extend_from_slice(self.operation.as_bytes());
        out.write_u16::<LittleEndian>(self.table_refs.len() as u16).map_err(io)?;
        for r in &self.table_refs {
            out.write_u16::<LittleEndian>(r.table.len() as u16).map_err(io)?;
            out.extend_from_slice(r.table.as_bytes());
            out.extend_from_slice(r.stripe_set_hash.as_bytes());
        }
        out.extend_from_slice(self.content_hash.as_bytes());
        Ok(out)
    }

    /// Decode and verify a commit record. The id is recomputed from the
    /// embedded content hash and checked against the recomputed content.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt =
            |detail: &str| EngineError::Integrity(format!("corrupt commit record: {detail}"));
        let io = |_e: std::io::Error| corrupt("truncated");

        let mut cur = std::io::Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).map_err(io)?;
        if &magic != COMMIT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = cur.read_u16::<LittleEndian>().map_err(io)?;
        if version != COMMIT_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let mut parent = [0u8; 32];
        cur.read_exact(&mut parent).map_err(io)?;
        let timestamp_micros = cur.read_i64::<LittleEndian>().map_err(io)?;

        let author_len = cur.read_u16::<LittleEndian>().map_err(io)? as usize;
        let mut author = vec![0u8; author_len];
        cur.read_exact(&mut author).map_err(io)?;
        let author = String::from_utf8(author).map_err(|_| corrupt("author not utf-8"))?;

        let op_len = cur.read_u16::<LittleEndian>().map_err(io)? as usize;
        let mut op = vec![0u8; op_len];
        cur.read_exact(&mut op).map_err(io)?;
        let operation = String::from_utf8(op).map_err(|_| corrupt("operation not utf-8"))?;

        let ref_count = cur.read_u16::<LittleEndian>().map_err(io)? as usize;
        let mut table_refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let name_len = cur.read_u16::<LittleEndian>().map_err(io)? as usize;
            let mut name = vec![0u8; name_len];
            cur.read_exact(&mut name).map_err(io)?;
            let table = String::from_utf8(name).map_err(|_| corrupt("table name not utf-8"))?;
            let mut hash = [0u8; 32];
            cur.read_exact(&mut hash).map_err(io)?;
            table_refs.push(TableRef { table, stripe_set_hash: Hash256::from_bytes(hash) });
        }

        let mut content = [0u8; 32];
        cur.read_exact(&mut content).map_err(io)?;
        if cur.position() as usize != bytes.len() {
            return Err(corrupt("trailing bytes"));
        }

        let commit = Self {
            id: Hash256::compute(&content),
            parent: Hash256::from_bytes(parent),
            timestamp_micros,
            author,
            operation,
            table_refs,
            content_hash: Hash256::from_bytes(content),
        };
        if let Err(field) = commit.verify_hashes() {
            return Err(corrupt(&format!("{field} mismatch")));
        }
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Commit {
        Commit::build(
            Hash256::zero(),
            1_700_000_000_000_000,
            "tester",
            "insert into t",
            vec![TableRef { table: "t".into(), stripe_set_hash: Hash256::compute(b"set") }],
        )
    }

    #[test]
    fn id_is_hash_of_content_hash() {
        let c = sample();
        assert_eq!(c.id, Hash256::compute(c.content_hash.as_bytes()));
        c.verify_hashes().unwrap();
    }

    #[test]
    fn encode_decode_roundtrip() {
        let c = sample();
        let bytes = c.encode().unwrap();
        let back = Commit::decode(&bytes).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn tampered_record_rejected() {
        let c = sample();
        let mut bytes = c.encode().unwrap();
        // Flip one byte of the timestamp region.
        bytes[40] ^= 0x01;
        assert!(Commit::decode(&bytes).is_err());
    }

    #[test]
    fn content_hash_covers_every_field() {
        let base = sample();
        let other_parent = Commit::build(
            Hash256::compute(b"p"),
            base.timestamp_micros,
            base.author.clone(),
            base.operation.clone(),
            base.table_refs.clone(),
        );
        assert_ne!(base.id, other_parent.id);

        let other_refs = Commit::build(
            base.parent,
            base.timestamp_micros,
            base.author.clone(),
            base.operation.clone(),
            vec![],
        );
        assert_ne!(base.id, other_refs.id);
    }

    #[test]
    fn genesis_has_zero_parent() {
        assert!(sample().is_genesis());
    }

    #[test]
    fn truncated_record_rejected() {
        let bytes = sample().encode().unwrap();
        assert!(Commit::decode(&bytes[..bytes.len() - 5]).is_err());
    }
}
