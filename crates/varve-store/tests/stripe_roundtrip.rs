//! Property test: decode(encode(rows)) == rows for arbitrary typed batches.

use proptest::prelude::*;

use varve_store::datum::{DataType, Datum, Row};
use varve_store::schema::{ColumnDef, TableDef};
use varve_store::stripe::{encode_stripe, parse_stripe, StripeOptions};

fn arb_datum(ty: DataType) -> BoxedStrategy<Datum> {
    let base = match ty {
        DataType::Int => any::<i64>().prop_map(Datum::Int).boxed(),
        DataType::Float => any::<f64>().prop_map(Datum::Float).boxed(),
        DataType::Str => "[a-z]{0,12}".prop_map(Datum::Str).boxed(),
        DataType::Bool => any::<bool>().prop_map(Datum::Bool).boxed(),
        DataType::Timestamp => any::<i64>().prop_map(Datum::Timestamp).boxed(),
        DataType::Binary => proptest::collection::vec(any::<u8>(), 0..16)
            .prop_map(Datum::Binary)
            .boxed(),
    };
    prop_oneof![
        9 => base,
        1 => Just(Datum::Null),
    ]
    .boxed()
}

fn test_table() -> TableDef {
    TableDef::new(
        "prop",
        vec![
            ColumnDef::new("a", DataType::Int, true),
            ColumnDef::new("b", DataType::Str, true),
            ColumnDef::new("c", DataType::Float, true),
            ColumnDef::new("d", DataType::Bool, true),
        ],
    )
}

fn arb_rows() -> impl Strategy<Value = Vec<Row>> {
    proptest::collection::vec(
        (
            arb_datum(DataType::Int),
            arb_datum(DataType::Str),
            arb_datum(DataType::Float),
            arb_datum(DataType::Bool),
        )
            .prop_map(|(a, b, c, d)| vec![a, b, c, d]),
        1..200,
    )
}

proptest! {
    #[test]
    fn encode_decode_roundtrip(rows in arb_rows()) {
        let table = test_table();
        let opts = StripeOptions { bloom_columns: vec![0, 1], ..StripeOptions::default() };
        let enc = encode_stripe(&table, &rows, &opts).unwrap();
        let parsed = parse_stripe(&enc.bytes, Some(&enc.id)).unwrap();
        let decoded = parsed.decode_rows(None).unwrap();
        prop_assert_eq!(decoded, rows);
    }

    #[test]
    fn footer_stats_bound_contents(rows in arb_rows()) {
        let table = test_table();
        let enc = encode_stripe(&table, &rows, &StripeOptions::default()).unwrap();
        for (col, stats) in enc.footer.columns.iter().enumerate() {
            let values: Vec<&Datum> = rows.iter().map(|r| &r[col]).collect();
            let nulls = values.iter().filter(|v| v.is_null()).count() as u64;
            prop_assert_eq!(stats.null_count, nulls);
            prop_assert_eq!(stats.row_count, rows.len() as u64);
            for v in values.iter().filter(|v| !v.is_null()) {
                let min = stats.min.as_ref().unwrap();
                let max = stats.max.as_ref().unwrap();
                prop_assert_ne!(v.total_cmp(min), std::cmp::Ordering::Less);
                prop_assert_ne!(v.total_cmp(max), std::cmp::Ordering::Greater);
            }
        }
    }

    #[test]
    fn bloom_has_no_false_negatives(rows in arb_rows()) {
        let table = test_table();
        let opts = StripeOptions { bloom_columns: vec![1], ..StripeOptions::default() };
        let enc = encode_stripe(&table, &rows, &opts).unwrap();
        let bloom = enc.footer.columns[1].bloom.as_ref().unwrap();
        for row in &rows {
            if !row[1].is_null() {
                prop_assert!(bloom.contains(&row[1]));
            }
        }
    }
}
