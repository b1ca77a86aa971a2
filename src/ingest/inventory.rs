use anyhow::{Context, bail};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::ingest::organized_flag;
use crate::resolver::Resolver;
use crate::text::{clean_field, decode_sjis, format_quantity, normalize_date};
use crate::units::UnitMap;

const COL_PRODUCT_NAME: usize = 12;
const COL_PACK_UNIT: usize = 16;
const COL_PACK_QUANTITY: usize = 17;
const COL_STOCK_COUNT: usize = 21;
const COL_BARCODE_UNIT: usize = 23;
const COL_YJ_CODE: usize = 42;
const COL_JAN_CODE: usize = 45;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRecord {
    pub date: String,
    pub yj_code: String,
    pub jan_code: String,
    pub product_name: String,
    pub pack_unit_code: String,
    pub pack_quantity: String,
    pub stock_count: String,
    pub stock_quantity: String,
    pub barcode_unit_code: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    pub total_count: usize,
    pub created_count: usize,
    pub records: Vec<InventoryRecord>,
}

fn decimal(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(0.0)
}

/// Unit names in the file are mapped to unit codes; unknown names are kept.
// Header field 5 is the count date. Data rows need at least 46 fields.
pub fn parse(bytes: &[u8], units: &UnitMap) -> anyhow::Result<Vec<InventoryRecord>> {
    let text = decode_sjis(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = reader.records();

    let header = match rows.next() {
        Some(r) => r.context("read inventory header row")?,
        None => bail!("inventory file is empty"),
    };
    if header.len() <= 4 {
        bail!("inventory header row has {} fields, expected at least 5", header.len());
    }
    let date = normalize_date(&clean_field(&header[4]));

    let mut out = Vec::new();
    for (line, record) in rows.enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("inventory row {}: {}", line + 2, e);
                continue;
            }
        };
        if record.len() <= COL_JAN_CODE {
            continue;
        }
        let pack_quantity = clean_field(&record[COL_PACK_QUANTITY]);
        let stock_count = clean_field(&record[COL_STOCK_COUNT]);
        let stock_quantity = format_quantity(decimal(&stock_count) * decimal(&pack_quantity));
        out.push(InventoryRecord {
            date: date.clone(),
            yj_code: clean_field(&record[COL_YJ_CODE]),
            jan_code: clean_field(&record[COL_JAN_CODE]),
            product_name: clean_field(&record[COL_PRODUCT_NAME]),
            pack_unit_code: units.to_code(&record[COL_PACK_UNIT]),
            pack_quantity,
            stock_count,
            stock_quantity,
            barcode_unit_code: units.to_code(&record[COL_BARCODE_UNIT]),
        });
    }
    Ok(out)
}

/// Upserts one row per (date, product). The stored product name prefers
/// the resolved canonical name.
pub fn ingest(
    conn: &mut Connection,
    resolver: &Resolver,
    mut records: Vec<InventoryRecord>,
) -> anyhow::Result<InventorySummary> {
    let mut created = 0usize;
    let mut flags = Vec::with_capacity(records.len());
    for rec in records.iter_mut() {
        let resolved = resolver
            .resolve_or_fallback(conn, &rec.jan_code, &rec.product_name)
            .with_context(|| format!("resolve inventory product {}", rec.jan_code))?;
        if resolved.was_created {
            created += 1;
        }
        rec.yj_code = resolved.record.yj_code;
        if !resolved.record.product_name.is_empty() {
            rec.product_name = resolved.record.product_name;
        }
        flags.push(organized_flag(conn, &rec.jan_code));
    }

    let tx = conn.transaction().context("begin inventory upsert tx")?;
    {
        let mut stmt = tx
            .prepare(
                "
                INSERT INTO inventory_records (
                    date, jan_code, yj_code, product_name, pack_unit_code, pack_quantity,
                    stock_count, stock_quantity, barcode_unit_code, organized
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(date, jan_code) DO UPDATE SET
                    yj_code = excluded.yj_code,
                    product_name = excluded.product_name,
                    pack_unit_code = excluded.pack_unit_code,
                    pack_quantity = excluded.pack_quantity,
                    stock_count = excluded.stock_count,
                    stock_quantity = excluded.stock_quantity,
                    barcode_unit_code = excluded.barcode_unit_code,
                    organized = excluded.organized
                ",
            )
            .context("prepare inventory upsert")?;
        for (rec, flag) in records.iter().zip(flags) {
            stmt.execute(params![
                rec.date,
                rec.jan_code,
                rec.yj_code,
                rec.product_name,
                rec.pack_unit_code,
                rec.pack_quantity,
                rec.stock_count,
                rec.stock_quantity,
                rec.barcode_unit_code,
                flag,
            ])
            .with_context(|| format!("upsert inventory row {} {}", rec.date, rec.jan_code))?;
        }
    }
    tx.commit().context("commit inventory upsert tx")?;

    Ok(InventorySummary {
        total_count: records.len(),
        created_count: created,
        records,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::{TestDb, sjis};

    pub(crate) fn inventory_row(
        jan: &str,
        name: &str,
        pack_unit: &str,
        pack_qty: &str,
        count: &str,
    ) -> String {
        let mut cells = vec![String::new(); 46];
        cells[COL_PRODUCT_NAME] = name.into();
        cells[COL_PACK_UNIT] = pack_unit.into();
        cells[COL_PACK_QUANTITY] = pack_qty.into();
        cells[COL_STOCK_COUNT] = count.into();
        cells[COL_BARCODE_UNIT] = "錠".into();
        cells[COL_JAN_CODE] = jan.into();
        cells.join(",")
    }

    #[test]
    fn header_date_and_unit_codes() {
        let units = UnitMap::from_pairs([("1", "錠"), ("5", "箱")]);
        let file = format!(
            "H,x,x,x,\"2025-06-30\"\n{}\nshort,row\n",
            inventory_row("4900000000001", "院内A", "箱", "100", "3")
        );
        let rows = parse(&sjis(&file), &units).unwrap();
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.date, "20250630");
        assert_eq!(r.pack_unit_code, "5");
        assert_eq!(r.barcode_unit_code, "1");
        assert_eq!(r.stock_quantity, "300");
    }

    #[test]
    fn missing_header_field_is_an_error() {
        assert!(parse(&sjis("H,x\n"), &UnitMap::default()).is_err());
        assert!(parse(b"", &UnitMap::default()).is_err());
    }

    #[test]
    fn upsert_keeps_one_row_per_day_and_product() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let resolver = Resolver::new();
        let units = UnitMap::default();

        let file = |count: &str| {
            let row = inventory_row("4900000000001", "院内A", "", "10", count);
            sjis(&format!("H,x,x,x,20250630\n{row}\n"))
        };
        let first = ingest(&mut conn, &resolver, parse(&file("2"), &units).unwrap()).unwrap();
        assert_eq!(first.created_count, 1);
        ingest(&mut conn, &resolver, parse(&file("4"), &units).unwrap()).unwrap();

        let (n, qty): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(stock_quantity) FROM inventory_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(qty, "40");
    }
}
