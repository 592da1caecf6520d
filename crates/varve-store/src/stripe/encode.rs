//! Stripe encoding: rows in, content-addressed bytes out.

use std::collections::HashMap;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::DeflateEncoder;
use tracing::debug;

use super::bloom::BloomFilter;
use super::{
    ColumnStats, Compression, Encoding, Footer, DEFAULT_PAGE_BYTES, STRIPE_MAGIC, STRIPE_VERSION,
};
use crate::datum::{Datum, Row};
use crate::error::{Result, StorageError};
use crate::hash::{Hash256, StripeId};
use crate::schema::TableDef;

/// Knobs for the encoder. Bloom columns are positions in layout order.
#[derive(Debug, Clone)]
pub struct StripeOptions {
    pub page_target_bytes: usize,
    pub bloom_columns: Vec<usize>,
    pub bloom_bits_per_value: usize,
    pub bloom_max_bits: usize,
}

impl Default for StripeOptions {
    fn default() -> Self {
        Self {
            page_target_bytes: DEFAULT_PAGE_BYTES,
            bloom_columns: Vec::new(),
            bloom_bits_per_value: 10,
            bloom_max_bits: 1 << 19,
        }
    }
}

/// A fully encoded stripe, ready to be written at `stripes/<table>/<hash>`.
#[derive(Debug, Clone)]
pub struct EncodedStripe {
    pub id: StripeId,
    pub bytes: Vec<u8>,
    pub footer: Footer,
}

impl EncodedStripe {
    pub fn row_count(&self) -> u64 {
        self.footer.row_count()
    }
}

/// Encode `rows` (already coerced to the table's column types) into a stripe.
pub fn encode_stripe(table: &TableDef, rows: &[Row], opts: &StripeOptions) -> Result<EncodedStripe> {
    if rows.is_empty() {
        return Err(StorageError::Encode("cannot encode an empty stripe".to_string()));
    }
    let column_count = table.columns.len();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != column_count {
            return Err(StorageError::Encode(format!(
                "row {i} has {} values, table {} has {column_count} columns",
                row.len(),
                table.name
            )));
        }
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(STRIPE_MAGIC);
    bytes.write_u16::<LittleEndian>(STRIPE_VERSION)?;
    bytes.write_u16::<LittleEndian>(column_count as u16)?;

    let mut stats = Vec::with_capacity(column_count);
    for col in 0..column_count {
        let values: Vec<&Datum> = rows.iter().map(|r| &r[col]).collect();
        let encoding = choose_encoding(&values);
        let pages = encode_pages(&values, encoding, opts.page_target_bytes)?;

        // Compress page-wise; the column codec tag records whether any page
        // actually took the codec.
        let mut compressed_any = false;
        let mut page_bufs = Vec::with_capacity(pages.len());
        for raw in pages {
            match try_deflate(&raw) {
                Some(packed) => {
                    compressed_any = true;
                    page_bufs.push((true, raw.len() as u32, packed));
                }
                None => {
                    let len = raw.len() as u32;
                    page_bufs.push((false, len, raw));
                }
            }
        }
        let compression = if compressed_any { Compression::Deflate } else { Compression::None };

        bytes.write_u8(encoding.tag())?;
        bytes.write_u8(compression.tag())?;
        bytes.write_u16::<LittleEndian>(page_bufs.len() as u16)?;
        for (applied, raw_len, data) in &page_bufs {
            bytes.write_u8(*applied as u8)?;
            bytes.write_u32::<LittleEndian>(*raw_len)?;
            bytes.write_u32::<LittleEndian>(data.len() as u32)?;
            bytes.extend_from_slice(data);
        }

        stats.push(column_stats(&values, encoding, compression, col, opts));
    }

    let footer = Footer { columns: stats, schema_fingerprint: table.schema_fingerprint() };
    let mut footer_bytes = Vec::new();
    write_footer(&mut footer_bytes, &footer)?;
    bytes.extend_from_slice(&footer_bytes);
    bytes.write_u32::<LittleEndian>(footer_bytes.len() as u32)?;

    let id = Hash256::compute(&bytes);
    bytes.extend_from_slice(id.as_bytes());

    debug!(
        event = "stripe.encoded",
        table = %table.name,
        stripe = %id.short(),
        rows = rows.len(),
        bytes = bytes.len(),
    );
    Ok(EncodedStripe { id, bytes, footer })
}

/// Pick an encoding by cardinality sampling: low-distinct string columns take
/// the dictionary, run-heavy columns take RLE, everything else stays plain.
fn choose_encoding(values: &[&Datum]) -> Encoding {
    let step = (values.len() / 256).max(1);
    let sample: Vec<&Datum> = values.iter().step_by(step).copied().collect();
    let distinct: std::collections::HashSet<&Datum> = sample.iter().copied().collect();

    let stringy = values.iter().any(|v| matches!(v, Datum::Str(_)));
    if stringy && sample.len() >= 8 && distinct.len() * 8 <= sample.len() {
        return Encoding::Dict;
    }

    let mut runs = 1usize;
    for pair in values.windows(2) {
        if pair[0] != pair[1] {
            runs += 1;
        }
    }
    if runs * 4 <= values.len() {
        return Encoding::Rle;
    }
    Encoding::Plain
}

fn encode_pages(values: &[&Datum], encoding: Encoding, page_target: usize) -> Result<Vec<Vec<u8>>> {
    match encoding {
        Encoding::Plain => {
            let mut pages = Vec::new();
            let mut buf = Vec::new();
            for v in values {
                write_datum(&mut buf, v)?;
                if buf.len() >= page_target {
                    pages.push(std::mem::take(&mut buf));
                }
            }
            if !buf.is_empty() {
                pages.push(buf);
            }
            Ok(pages)
        }
        Encoding::Rle => {
            let mut pages = Vec::new();
            let mut buf = Vec::new();
            let mut iter = values.iter();
            let mut current = *iter.next().expect("non-empty column");
            let mut run = 1u32;
            for v in iter {
                if *v == current {
                    run += 1;
                } else {
                    write_run(&mut buf, run, current)?;
                    if buf.len() >= page_target {
                        pages.push(std::mem::take(&mut buf));
                    }
                    current = *v;
                    run = 1;
                }
            }
            write_run(&mut buf, run, current)?;
            pages.push(buf);
            Ok(pages)
        }
        Encoding::Dict => {
            let mut pages = Vec::new();
            let mut start = 0usize;
            while start < values.len() {
                let mut dict: Vec<&Datum> = Vec::new();
                let mut codes_by_value: HashMap<&Datum, u16> = HashMap::new();
                let mut codes: Vec<u16> = Vec::new();
                let mut estimate = 8usize;
                let mut i = start;
                while i < values.len() {
                    let v = values[i];
                    let code = match codes_by_value.get(v) {
                        Some(c) => *c,
                        None => {
                            if dict.len() == u16::MAX as usize {
                                break;
                            }
                            let c = dict.len() as u16;
                            dict.push(v);
                            codes_by_value.insert(v, c);
                            estimate += datum_size(v);
                            c
                        }
                    };
                    codes.push(code);
                    estimate += 2;
                    i += 1;
                    if estimate >= page_target {
                        break;
                    }
                }
                let mut buf = Vec::with_capacity(estimate);
                buf.write_u16::<LittleEndian>(dict.len() as u16)?;
                for entry in &dict {
                    write_datum(&mut buf, entry)?;
                }
                buf.write_u32::<LittleEndian>(codes.len() as u32)?;
                for code in &codes {
                    buf.write_u16::<LittleEndian>(*code)?;
                }
                pages.push(buf);
                start = i;
            }
            Ok(pages)
        }
    }
}

fn write_run(buf: &mut Vec<u8>, run: u32, value: &Datum) -> Result<()> {
    buf.write_u32::<LittleEndian>(run)?;
    write_datum(buf, value)?;
    Ok(())
}

fn column_stats(
    values: &[&Datum],
    encoding: Encoding,
    compression: Compression,
    col: usize,
    opts: &StripeOptions,
) -> ColumnStats {
    let mut null_count = 0u64;
    let mut min: Option<&Datum> = None;
    let mut max: Option<&Datum> = None;
    for v in values {
        if v.is_null() {
            null_count += 1;
            continue;
        }
        min = Some(match min {
            Some(m) if m.total_cmp(v) != std::cmp::Ordering::Greater => m,
            _ => v,
        });
        max = Some(match max {
            Some(m) if m.total_cmp(v) != std::cmp::Ordering::Less => m,
            _ => v,
        });
    }
    let bloom = if opts.bloom_columns.contains(&col) {
        let mut filter = BloomFilter::with_capacity(
            values.len() - null_count as usize,
            opts.bloom_bits_per_value,
            opts.bloom_max_bits,
        );
        for v in values {
            if !v.is_null() {
                filter.insert(v);
            }
        }
        Some(filter)
    } else {
        None
    };
    ColumnStats {
        row_count: values.len() as u64,
        null_count,
        min: min.cloned(),
        max: max.cloned(),
        encoding,
        compression,
        bloom,
    }
}

/// Deflate `raw` if it is worth it: inputs under 64 bytes or outputs that do
/// not shrink stay uncompressed.
fn try_deflate(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 64 {
        return None;
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(raw).ok()?;
    let packed = encoder.finish().ok()?;
    if packed.len() < raw.len() {
        Some(packed)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Datum wire codec (shared with the footer and the decoder)
// ---------------------------------------------------------------------------

pub(crate) fn write_datum(buf: &mut Vec<u8>, d: &Datum) -> Result<()> {
    match d {
        Datum::Null => buf.write_u8(0)?,
        Datum::Int(v) => {
            buf.write_u8(1)?;
            buf.write_i64::<LittleEndian>(*v)?;
        }
        Datum::Float(f) => {
            buf.write_u8(2)?;
            buf.write_u64::<LittleEndian>(f.to_bits())?;
        }
        Datum::Bool(b) => {
            buf.write_u8(3)?;
            buf.write_u8(*b as u8)?;
        }
        Datum::Str(s) => {
            buf.write_u8(4)?;
            buf.write_u32::<LittleEndian>(s.len() as u32)?;
            buf.extend_from_slice(s.as_bytes());
        }
        Datum::Timestamp(t) => {
            buf.write_u8(5)?;
            buf.write_i64::<LittleEndian>(*t)?;
        }
        Datum::Binary(b) => {
            buf.write_u8(6)?;
            buf.write_u32::<LittleEndian>(b.len() as u32)?;
            buf.extend_from_slice(b);
        }
    }
    Ok(())
}

pub(crate) fn datum_size(d: &Datum) -> usize {
    match d {
        Datum::Null => 1,
        Datum::Int(_) | Datum::Timestamp(_) | Datum::Float(_) => 9,
        Datum::Bool(_) => 2,
        Datum::Str(s) => 5 + s.len(),
        Datum::Binary(b) => 5 + b.len(),
    }
}

pub(crate) fn write_footer(buf: &mut Vec<u8>, footer: &Footer) -> Result<()> {
    for col in &footer.columns {
        buf.write_u64::<LittleEndian>(col.row_count)?;
        buf.write_u64::<LittleEndian>(col.null_count)?;
        match &col.min {
            Some(d) => {
                buf.write_u8(1)?;
                write_datum(buf, d)?;
            }
            None => buf.write_u8(0)?,
        }
        match &col.max {
            Some(d) => {
                buf.write_u8(1)?;
                write_datum(buf, d)?;
            }
            None => buf.write_u8(0)?,
        }
        buf.write_u8(col.encoding.tag())?;
        buf.write_u8(col.compression.tag())?;
        match &col.bloom {
            Some(bloom) => {
                buf.write_u8(1)?;
                let bytes = bloom.to_bytes();
                buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
                buf.extend_from_slice(&bytes);
            }
            None => buf.write_u8(0)?,
        }
    }
    buf.extend_from_slice(footer.schema_fingerprint.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DataType;
    use crate::schema::ColumnDef;

    fn table() -> TableDef {
        TableDef::new(
            "t",
            vec![
                ColumnDef::new("id", DataType::Int, false),
                ColumnDef::new("name", DataType::Str, true),
            ],
        )
    }

    #[test]
    fn empty_stripe_rejected() {
        assert!(encode_stripe(&table(), &[], &StripeOptions::default()).is_err());
    }

    #[test]
    fn row_width_validated() {
        let rows = vec![vec![Datum::Int(1)]];
        let err = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("columns"));
    }

    #[test]
    fn id_is_hash_of_preceding_bytes() {
        let rows = vec![
            vec![Datum::Int(1), Datum::Str("a".into())],
            vec![Datum::Int(2), Datum::Str("b".into())],
        ];
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let body = &enc.bytes[..enc.bytes.len() - 32];
        assert_eq!(Hash256::compute(body), enc.id);
        assert_eq!(&enc.bytes[enc.bytes.len() - 32..], enc.id.as_bytes());
    }

    #[test]
    fn stats_bound_values() {
        let rows = vec![
            vec![Datum::Int(5), Datum::Null],
            vec![Datum::Int(-3), Datum::Str("x".into())],
            vec![Datum::Int(9), Datum::Null],
        ];
        let enc = encode_stripe(&table(), &rows, &StripeOptions::default()).unwrap();
        let id_stats = &enc.footer.columns[0];
        assert_eq!(id_stats.min, Some(Datum::Int(-3)));
        assert_eq!(id_stats.max, Some(Datum::Int(9)));
        assert_eq!(id_stats.null_count, 0);
        let name_stats = &enc.footer.columns[1];
        assert_eq!(name_stats.null_count, 2);
        assert_eq!(name_stats.row_count, 3);
    }

    #[test]
    fn low_cardinality_strings_take_dictionary() {
        let values: Vec<Datum> = (0..1000)
            .map(|i| Datum::Str(if i % 2 == 0 { "yes" } else { "no" }.to_string()))
            .collect();
        let refs: Vec<&Datum> = values.iter().collect();
        assert_eq!(choose_encoding(&refs), Encoding::Dict);
    }

    #[test]
    fn long_runs_take_rle() {
        let values: Vec<Datum> = (0..1000).map(|i| Datum::Int(i / 100)).collect();
        let refs: Vec<&Datum> = values.iter().collect();
        assert_eq!(choose_encoding(&refs), Encoding::Rle);
    }

    #[test]
    fn high_cardinality_stays_plain() {
        let values: Vec<Datum> = (0..1000).map(Datum::Int).collect();
        let refs: Vec<&Datum> = values.iter().collect();
        assert_eq!(choose_encoding(&refs), Encoding::Plain);
    }

    #[test]
    fn bloom_built_for_configured_columns() {
        let rows = vec![
            vec![Datum::Int(1), Datum::Str("a".into())],
            vec![Datum::Int(2), Datum::Str("b".into())],
        ];
        let opts = StripeOptions { bloom_columns: vec![0], ..StripeOptions::default() };
        let enc = encode_stripe(&table(), &rows, &opts).unwrap();
        let bloom = enc.footer.columns[0].bloom.as_ref().unwrap();
        assert!(bloom.contains(&Datum::Int(1)));
        assert!(enc.footer.columns[1].bloom.is_none());
    }
}
