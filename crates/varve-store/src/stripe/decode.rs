//! Stripe parsing and decoding.
//!
//! Parsing verifies the trailing content hash before anything else; a
//! mismatch is `CorruptStripe` and nothing inside the blob is trusted.
//! Decoding is column-at-a-time so a projection only inflates the pages it
//! needs.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;

use super::bloom::BloomFilter;
use super::{ColumnStats, Compression, Encoding, Footer, STRIPE_MAGIC, STRIPE_VERSION};
use crate::datum::{Datum, Row};
use crate::error::{Result, StorageError};
use crate::hash::{Hash256, StripeId};

struct Page {
    compressed: bool,
    raw_len: u32,
    data: Vec<u8>,
}

struct ColumnPages {
    encoding: Encoding,
    compression: Compression,
    pages: Vec<Page>,
}

/// A verified stripe with its footer parsed and page bytes held raw.
pub struct ParsedStripe {
    id: StripeId,
    footer: Footer,
    columns: Vec<ColumnPages>,
}

fn corrupt(id: &str, detail: impl Into<String>) -> StorageError {
    StorageError::CorruptStripe { stripe: id.to_string(), detail: detail.into() }
}

/// Parse and verify a stripe blob. When `expect` is given, the embedded
/// content hash must match it (the blob key is the hash, so a mismatch means
/// the blob was tampered with or misfiled).
pub fn parse_stripe(bytes: &[u8], expect: Option<&StripeId>) -> Result<ParsedStripe> {
    let label = expect.map_or_else(|| "unknown".to_string(), Hash256::short);
    if bytes.len() < 4 + 2 + 2 + 4 + 32 {
        return Err(corrupt(&label, "truncated"));
    }

    let (body, stored_hash) = bytes.split_at(bytes.len() - 32);
    let computed = Hash256::compute(body);
    if computed.as_bytes() != stored_hash {
        return Err(corrupt(&label, "content hash mismatch"));
    }
    if let Some(expected) = expect {
        if &computed != expected {
            return Err(corrupt(&label, format!("stripe id mismatch: blob hashes to {}", computed.short())));
        }
    }

    let mut cur = std::io::Cursor::new(body);
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if &magic != STRIPE_MAGIC {
        return Err(corrupt(&label, "bad magic"));
    }
    let version = cur.read_u16::<LittleEndian>()?;
    if version != STRIPE_VERSION {
        return Err(corrupt(&label, format!("unsupported version {version}")));
    }
    let column_count = cur.read_u16::<LittleEndian>()? as usize;

    let footer_len =
        u32::from_le_bytes(body[body.len() - 4..].try_into().expect("slice of 4")) as usize;
    let footer_start = body
        .len()
        .checked_sub(4 + footer_len)
        .ok_or_else(|| corrupt(&label, "footer length exceeds stripe"))?;

    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let encoding = Encoding::from_tag(cur.read_u8()?)
            .ok_or_else(|| corrupt(&label, "unknown encoding tag"))?;
        let compression = Compression::from_tag(cur.read_u8()?)
            .ok_or_else(|| corrupt(&label, "unknown compression tag"))?;
        let page_count = cur.read_u16::<LittleEndian>()? as usize;
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let compressed = cur.read_u8()? != 0;
            let raw_len = cur.read_u32::<LittleEndian>()?;
            let data_len = cur.read_u32::<LittleEndian>()? as usize;
            let mut data = vec![0u8; data_len];
            cur.read_exact(&mut data)?;
            pages.push(Page { compressed, raw_len, data });
        }
        columns.push(ColumnPages { encoding, compression, pages });
    }

    if cur.position() as usize != footer_start {
        return Err(corrupt(&label, "column sections do not line up with footer"));
    }

    let footer = read_footer(&body[footer_start..body.len() - 4], column_count, &label)?;
    Ok(ParsedStripe { id: computed, footer, columns })
}

/// Parse only the footer of a stripe blob (still verifies the hash).
pub fn read_stripe_footer(bytes: &[u8], expect: Option<&StripeId>) -> Result<Footer> {
    Ok(parse_stripe(bytes, expect)?.footer)
}

impl ParsedStripe {
    pub fn id(&self) -> &StripeId {
        &self.id
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn row_count(&self) -> u64 {
        self.footer.row_count()
    }

    /// Decode one column in stripe-local row order.
    pub fn decode_column(&self, col: usize) -> Result<Vec<Datum>> {
        let label = self.id.short();
        let column = self
            .columns
            .get(col)
            .ok_or_else(|| corrupt(&label, format!("no column {col}")))?;
        let expected_rows = self
            .footer
            .columns
            .get(col)
            .map_or(0, |s| s.row_count) as usize;

        let mut values = Vec::with_capacity(expected_rows);
        for page in &column.pages {
            let raw = inflate_page(page, &label)?;
            decode_page(&raw, column.encoding, &label, &mut values)?;
        }
        if values.len() != expected_rows {
            return Err(corrupt(
                &label,
                format!("column {col} decoded {} rows, footer says {expected_rows}", values.len()),
            ));
        }
        Ok(values)
    }

    /// Decode rows. With a projection, emitted rows contain exactly the
    /// projected columns in the given order; otherwise all columns.
    pub fn decode_rows(&self, projection: Option<&[usize]>) -> Result<Vec<Row>> {
        let cols: Vec<usize> = match projection {
            Some(p) => p.to_vec(),
            None => (0..self.columns.len()).collect(),
        };
        let decoded: Vec<Vec<Datum>> =
            cols.iter().map(|&c| self.decode_column(c)).collect::<Result<_>>()?;
        let rows = self.row_count() as usize;
        let mut out = Vec::with_capacity(rows);
        for i in 0..rows {
            out.push(decoded.iter().map(|col| col[i].clone()).collect());
        }
        Ok(out)
    }
}

fn inflate_page(page: &Page, label: &str) -> Result<Vec<u8>> {
    if !page.compressed {
        return Ok(page.data.clone());
    }
    let mut raw = Vec::with_capacity(page.raw_len as usize);
    let mut decoder = DeflateDecoder::new(page.data.as_slice());
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| corrupt(label, format!("page inflate failed: {e}")))?;
    if raw.len() != page.raw_len as usize {
        return Err(corrupt(label, "page raw length mismatch"));
    }
    Ok(raw)
}

fn decode_page(raw: &[u8], encoding: Encoding, label: &str, out: &mut Vec<Datum>) -> Result<()> {
    let mut cur = std::io::Cursor::new(raw);
    match encoding {
        Encoding::Plain => {
            while (cur.position() as usize) < raw.len() {
                out.push(read_datum(&mut cur)?);
            }
        }
        Encoding::Rle => {
            while (cur.position() as usize) < raw.len() {
                let run = cur.read_u32::<LittleEndian>()?;
                let value = read_datum(&mut cur)?;
                for _ in 0..run {
                    out.push(value.clone());
                }
            }
        }
        Encoding::Dict => {
            let dict_len = cur.read_u16::<LittleEndian>()? as usize;
            let mut dict = Vec::with_capacity(dict_len);
            for _ in 0..dict_len {
                dict.push(read_datum(&mut cur)?);
            }
            let count = cur.read_u32::<LittleEndian>()?;
            for _ in 0..count {
                let code = cur.read_u16::<LittleEndian>()? as usize;
                let value = dict
                    .get(code)
                    .ok_or_else(|| corrupt(label, format!("dictionary code {code} out of range")))?;
                out.push(value.clone());
            }
        }
    }
    Ok(())
}

pub(crate) fn read_datum(cur: &mut std::io::Cursor<&[u8]>) -> Result<Datum> {
    let tag = cur.read_u8()?;
    Ok(match tag {
        0 => Datum::Null,
        1 => Datum::Int(cur.read_i64::<LittleEndian>()?),
        2 => Datum::Float(f64::from_bits(cur.read_u64::<LittleEndian>()?)),
        3 => Datum::Bool(cur.read_u8()? != 0),
        4 => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            cur.read_exact(&mut bytes)?;
            Datum::Str(String::from_utf8(bytes).map_err(|_| StorageError::CorruptBlob {
                key: "datum".to_string(),
                detail: "non-utf8 string payload".to_string(),
            })?)
        }
        5 => Datum::Timestamp(cur.read_i64::<LittleEndian>()?),
        6 => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            cur.read_exact(&mut bytes)?;
            Datum::Binary(bytes)
        }
        other => {
            return Err(StorageError::CorruptBlob {
                key: "datum".to_string(),
                detail: format!("unknown datum tag {other}"),
            })
        }
    })
}

fn read_footer(bytes: &[u8], column_count: usize, label: &str) -> Result<Footer> {
    if bytes.len() < 32 {
        return Err(corrupt(label, "footer truncated"));
    }
    let (stats_bytes, fp_bytes) = bytes.split_at(bytes.len() - 32);
    let mut cur = std::io::Cursor::new(stats_bytes);
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let row_count = cur.read_u64::<LittleEndian>()?;
        let null_count = cur.read_u64::<LittleEndian>()?;
        let min = if cur.read_u8()? != 0 { Some(read_datum(&mut cur)?) } else { None };
        let max = if cur.read_u8()? != 0 { Some(read_datum(&mut cur)?) } else { None };
        let encoding = Encoding::from_tag(cur.read_u8()?)
            .ok_or_else(|| corrupt(label, "footer encoding tag"))?;
        let compression = Compression::from_tag(cur.read_u8()?)
            .ok_or_else(|| corrupt(label, "footer compression tag"))?;
        let bloom = if cur.read_u8()? != 0 {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut raw = vec![0u8; len];
            cur.read_exact(&mut raw)?;
            Some(
                BloomFilter::from_bytes(&raw)
                    .ok_or_else(|| corrupt(label, "malformed bloom filter"))?,
            )
        } else {
            None
        };
        columns.push(ColumnStats { row_count, null_count, min, max, encoding, compression, bloom });
    }
    let mut fp = [0u8; 32];
    fp.copy_from_slice(fp_bytes);
    Ok(Footer { columns, schema_fingerprint: Hash256::from_bytes(fp) })
}

#[cfg(test)]
mod tests {
    use super::super::encode::{encode_stripe, StripeOptions};
    use super::super::PrunePredicate;
    use super::*;
    use crate::datum::DataType;
    use crate::schema::{ColumnDef, TableDef};

    fn table() -> TableDef {
        TableDef::new(
            "t",
            vec![
                ColumnDef::new("id", DataType::Int, false),
                ColumnDef::new("tag", DataType::Str, true),
                ColumnDef::new("score", DataType::Float, true),
            ],
        )
    }

    fn sample_rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| {
                vec![
                    Datum::Int(i),
                    if i % 7 == 0 {
                        Datum::Null
                    } else {
                        Datum::Str(if i % 2 == 0 { "even" } else { "odd" }.to_string())
                    },
                    Datum::Float(i as f64 / 3.0),
                ]
            })
            .collect()
    }

    #[test]
    fn roundtrip_all_encodings() {
        let rows = sample_rows(5000);
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let parsed = parse_stripe(&enc.bytes, Some(&enc.id)).unwrap();
        assert_eq!(parsed.decode_rows(None).unwrap(), rows);
    }

    #[test]
    fn projection_decodes_selected_columns_only() {
        let rows = sample_rows(100);
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let parsed = parse_stripe(&enc.bytes, Some(&enc.id)).unwrap();
        let projected = parsed.decode_rows(Some(&[2, 0])).unwrap();
        assert_eq!(projected[4], vec![Datum::Float(4.0 / 3.0), Datum::Int(4)]);
    }

    #[test]
    fn corrupt_byte_detected() {
        let rows = sample_rows(50);
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let mut bytes = enc.bytes.clone();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        match parse_stripe(&bytes, Some(&enc.id)) {
            Err(StorageError::CorruptStripe { detail, .. }) => {
                assert!(detail.contains("hash mismatch"));
            }
            other => panic!("expected CorruptStripe, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn wrong_expected_id_detected() {
        let rows = sample_rows(10);
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let wrong = Hash256::compute(b"other");
        assert!(parse_stripe(&enc.bytes, Some(&wrong)).is_err());
    }

    #[test]
    fn truncated_blob_rejected() {
        let rows = sample_rows(10);
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        assert!(parse_stripe(&enc.bytes[..10], None).is_err());
    }

    #[test]
    fn footer_prunes_before_decode() {
        let rows = sample_rows(1000);
        let opts = StripeOptions { bloom_columns: vec![0], ..StripeOptions::default() };
        let enc = encode_stripe(&table(), &rows, &opts).unwrap();
        let footer = read_stripe_footer(&enc.bytes, Some(&enc.id)).unwrap();
        let out_of_range = PrunePredicate::Range {
            column: 0,
            lo: Some(Datum::Int(5000)),
            hi: None,
            lo_inclusive: true,
            hi_inclusive: true,
        };
        assert!(!footer.may_match(&out_of_range));
        let absent = PrunePredicate::Membership { column: 0, values: vec![Datum::Int(123456)] };
        assert!(!footer.may_match(&absent));
        let present = PrunePredicate::Membership { column: 0, values: vec![Datum::Int(42)] };
        assert!(footer.may_match(&present));
    }

    #[test]
    fn large_stripe_spans_multiple_pages() {
        let rows: Vec<Row> = (0..20_000)
            .map(|i| {
                vec![Datum::Int(i), Datum::Str(format!("row-{i}-padding-padding")), Datum::Float(i as f64)]
            })
            .collect();
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let parsed = parse_stripe(&enc.bytes, Some(&enc.id)).unwrap();
        assert_eq!(parsed.decode_rows(None).unwrap().len(), 20_000);
    }
}
