use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::sequence::{self, CLASSIFICATION, PRODUCT};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagingAttributes {
    pub form: String,
    pub unit_code: String,
    pub total_quantity: i64,
    pub barcode_quantity: i64,
    pub barcode_unit_code: String,
    pub barcode_total_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackRecord {
    pub product_code: String,
    pub source_code: String,
    pub classification_code: String,
    pub product_name: String,
    #[serde(flatten)]
    pub packaging: PackagingAttributes,
}

const COLUMNS: &str = "product_code, source_code, classification_code, product_name, \
     packaging_form, packaging_unit_code, total_quantity, barcode_quantity, \
     barcode_unit_code, barcode_total_quantity";

fn from_row(row: &Row<'_>) -> rusqlite::Result<FallbackRecord> {
    Ok(FallbackRecord {
        product_code: row.get(0)?,
        source_code: row.get(1)?,
        classification_code: row.get(2)?,
        product_name: row.get(3)?,
        packaging: PackagingAttributes {
            form: row.get(4)?,
            unit_code: row.get(5)?,
            total_quantity: row.get(6)?,
            barcode_quantity: row.get(7)?,
            barcode_unit_code: row.get(8)?,
            barcode_total_quantity: row.get(9)?,
        },
    })
}

pub fn find_by_source(conn: &Connection, code: &str) -> anyhow::Result<Option<FallbackRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM ma2 WHERE source_code = ?1");
    conn.query_row(&sql, [code], from_row)
        .optional()
        .with_context(|| format!("select ma2 row for {code}"))
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<FallbackRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM ma2 ORDER BY product_code");
    let mut stmt = conn.prepare(&sql).context("prepare ma2 list")?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Returns the existing record for `code`, or mints and stores a new one.
/// An empty `code` gets a fresh `product` value. A lost insert race returns
/// the winner's row.
pub(crate) fn register(
    conn: &mut Connection,
    code: &str,
    name: &str,
    packaging: &PackagingAttributes,
) -> anyhow::Result<FallbackRecord> {
    if let Some(existing) = find_by_source(conn, code)? {
        return Ok(existing);
    }

    let product_code = if code.is_empty() {
        sequence::next_sequence(conn, PRODUCT).context("mint product code")?
    } else {
        code.to_string()
    };
    let classification_code =
        sequence::next_sequence(conn, CLASSIFICATION).context("mint classification code")?;

    let sql = format!(
        "INSERT OR IGNORE INTO ma2 ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    );
    conn.execute(
        &sql,
        params![
            product_code,
            code,
            classification_code,
            name,
            packaging.form,
            packaging.unit_code,
            packaging.total_quantity,
            packaging.barcode_quantity,
            packaging.barcode_unit_code,
            packaging.barcode_total_quantity,
        ],
    )
    .with_context(|| format!("insert ma2 row for {code}"))?;
    tracing::info!(
        "fallback registered code={:?} product={} classification={}",
        code,
        product_code,
        classification_code
    );

    find_by_source(conn, code)?
        .ok_or_else(|| anyhow!("ma2 row for {code:?} missing after insert"))
}

/// Overwrites the descriptive attributes of an existing record. Codes are kept.
pub(crate) fn update_attributes(
    conn: &Connection,
    product_code: &str,
    name: &str,
    packaging: &PackagingAttributes,
) -> anyhow::Result<()> {
    conn.execute(
        "
        UPDATE ma2 SET
            product_name = ?2,
            packaging_form = ?3,
            packaging_unit_code = ?4,
            total_quantity = ?5,
            barcode_quantity = ?6,
            barcode_unit_code = ?7,
            barcode_total_quantity = ?8
        WHERE product_code = ?1
        ",
        params![
            product_code,
            name,
            packaging.form,
            packaging.unit_code,
            packaging.total_quantity,
            packaging.barcode_quantity,
            packaging.barcode_unit_code,
            packaging.barcode_total_quantity,
        ],
    )
    .with_context(|| format!("update ma2 row {product_code}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestDb;

    #[test]
    fn second_registration_reuses_classification_code() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let attrs = PackagingAttributes {
            form: "PTP".into(),
            total_quantity: 100,
            ..PackagingAttributes::default()
        };

        let first = register(&mut conn, "4900000000001", "謎の薬", &attrs).unwrap();
        let second = register(&mut conn, "4900000000001", "別名", &attrs).unwrap();
        assert_eq!(first.classification_code, "classification00000001");
        assert_eq!(second.classification_code, first.classification_code);
        assert_eq!(second.product_code, "4900000000001");
        assert_eq!(second.product_name, "謎の薬");

        // nothing was minted on the second call
        let third = register(&mut conn, "4900000000002", "", &attrs).unwrap();
        assert_eq!(third.classification_code, "classification00000002");
    }

    #[test]
    fn empty_code_mints_a_product_code() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let rec = register(&mut conn, "", "手入力品", &PackagingAttributes::default()).unwrap();
        assert_eq!(rec.product_code, "product00000001");
        assert_eq!(rec.source_code, "");
        let again = register(&mut conn, "", "手入力品", &PackagingAttributes::default()).unwrap();
        assert_eq!(again.product_code, rec.product_code);
    }

    #[test]
    fn update_keeps_codes_and_list_is_ordered() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let b = register(&mut conn, "B", "b", &PackagingAttributes::default()).unwrap();
        register(&mut conn, "A", "a", &PackagingAttributes::default()).unwrap();

        let attrs = PackagingAttributes {
            unit_code: "12".into(),
            ..PackagingAttributes::default()
        };
        update_attributes(&conn, &b.product_code, "b2", &attrs).unwrap();

        let all = list(&conn).unwrap();
        assert_eq!(
            all.iter().map(|r| r.product_code.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(all[1].classification_code, b.classification_code);
        assert_eq!(all[1].product_name, "b2");
        assert_eq!(all[1].packaging.unit_code, "12");
    }
}
