use anyhow::Context;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::resolver::Resolver;
use crate::sequence::{self, CLIENT};
use crate::text::{format_quantity, normalize_date};

/// One movement line as posted by the in/out screen.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MovementRecord {
    #[serde(rename = "iodJan")]
    pub jan_code: String,
    #[serde(rename = "iodDate")]
    pub date: String,
    /// 1 = out, 2 = in.
    #[serde(rename = "iodType")]
    pub kind: i64,
    #[serde(rename = "iodJanQuantity")]
    pub barcode_quantity: f64,
    #[serde(rename = "iodJanUnit")]
    pub barcode_unit: String,
    #[serde(rename = "iodQuantity")]
    pub quantity: f64,
    #[serde(rename = "iodUnit")]
    pub unit: String,
    #[serde(rename = "iodPackaging")]
    pub packaging: String,
    #[serde(rename = "iodUnitPrice")]
    pub unit_price: f64,
    #[serde(rename = "iodSubtotal")]
    pub subtotal: f64,
    #[serde(rename = "iodExpiryDate")]
    pub expiry_date: String,
    #[serde(rename = "iodLotNumber")]
    pub lot_number: String,
    #[serde(rename = "iodOroshiCode")]
    pub oroshi_code: String,
    #[serde(rename = "iodReceiptNumber")]
    pub receipt_number: String,
    #[serde(rename = "iodLineNumber")]
    pub line_number: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementSummary {
    pub total_count: usize,
    pub created_count: usize,
    pub skipped_count: usize,
}

/// Rows without a product code or with a zero quantity are skipped.
pub fn ingest(
    conn: &mut Connection,
    resolver: &Resolver,
    records: Vec<MovementRecord>,
) -> anyhow::Result<MovementSummary> {
    let mut summary = MovementSummary {
        total_count: records.len(),
        ..MovementSummary::default()
    };

    let mut kept = Vec::with_capacity(records.len());
    for mut rec in records {
        if rec.jan_code.trim().is_empty() || rec.quantity == 0.0 {
            summary.skipped_count += 1;
            continue;
        }
        rec.jan_code = rec.jan_code.trim().to_string();
        rec.date = normalize_date(&rec.date);
        let resolved = resolver
            .resolve_or_fallback(conn, &rec.jan_code, "")
            .with_context(|| format!("resolve movement product {}", rec.jan_code))?;
        if resolved.was_created {
            summary.created_count += 1;
        }
        kept.push(rec);
    }

    let tx = conn.transaction().context("begin movement save tx")?;
    {
        let mut stmt = tx
            .prepare(
                "
                INSERT INTO movement_records (
                    jan_code, date, kind, barcode_quantity, barcode_unit, quantity, unit,
                    packaging, unit_price, subtotal, expiry_date, lot_number, oroshi_code,
                    receipt_number, line_number
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(date, receipt_number, line_number, jan_code) DO UPDATE SET
                    kind = excluded.kind,
                    barcode_quantity = excluded.barcode_quantity,
                    barcode_unit = excluded.barcode_unit,
                    quantity = excluded.quantity,
                    unit = excluded.unit,
                    packaging = excluded.packaging,
                    unit_price = excluded.unit_price,
                    subtotal = excluded.subtotal,
                    expiry_date = excluded.expiry_date,
                    lot_number = excluded.lot_number,
                    oroshi_code = excluded.oroshi_code
                ",
            )
            .context("prepare movement upsert")?;
        for rec in &kept {
            stmt.execute(params![
                rec.jan_code,
                rec.date,
                rec.kind,
                format_quantity(rec.barcode_quantity),
                rec.barcode_unit,
                format_quantity(rec.quantity),
                rec.unit,
                rec.packaging,
                format_quantity(rec.unit_price),
                format_quantity(rec.subtotal),
                rec.expiry_date,
                rec.lot_number,
                rec.oroshi_code,
                rec.receipt_number,
                rec.line_number,
            ])
            .with_context(|| format!("upsert movement row {} {}", rec.date, rec.jan_code))?;
        }
    }
    tx.commit().context("commit movement save tx")?;

    tracing::info!(
        "movement save: total={} created={} skipped={}",
        summary.total_count,
        summary.created_count,
        summary.skipped_count
    );
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    #[serde(rename = "inoutcode")]
    pub client_code: String,
    pub name: String,
    #[serde(rename = "oroshicode")]
    pub oroshi_code: String,
}

pub fn list_clients(conn: &Connection) -> anyhow::Result<Vec<Client>> {
    let mut stmt = conn
        .prepare("SELECT client_code, name, oroshi_code FROM clients ORDER BY client_code")
        .context("prepare client list")?;
    let rows = stmt.query_map([], |row| {
        Ok(Client {
            client_code: row.get(0)?,
            name: row.get(1)?,
            oroshi_code: row.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn save_client(conn: &mut Connection, name: &str, oroshi_code: &str) -> anyhow::Result<Client> {
    let client_code = sequence::next_sequence(conn, CLIENT).context("mint client code")?;
    conn.execute(
        "INSERT INTO clients (client_code, name, oroshi_code) VALUES (?1, ?2, ?3)",
        params![client_code, name, oroshi_code],
    )
    .with_context(|| format!("insert client {client_code}"))?;
    Ok(Client {
        client_code,
        name: name.to_string(),
        oroshi_code: oroshi_code.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestDb;

    #[test]
    fn skips_blank_codes_and_zero_quantities() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let resolver = Resolver::new();
        let body = r#"[
            {"iodJan": "4900000000001", "iodDate": "2025-06-05", "iodType": 1,
             "iodJanQuantity": 2, "iodQuantity": 20, "iodReceiptNumber": "M1", "iodLineNumber": 1},
            {"iodJan": "", "iodDate": "2025-06-05", "iodQuantity": 5},
            {"iodJan": "4900000000002", "iodDate": "2025-06-05", "iodQuantity": 0}
        ]"#;
        let records: Vec<MovementRecord> = serde_json::from_str(body).unwrap();

        let summary = ingest(&mut conn, &resolver, records.clone()).unwrap();
        assert_eq!(summary.total_count, 3);
        assert_eq!(summary.skipped_count, 2);
        assert_eq!(summary.created_count, 1);

        // saving the same line again updates in place
        ingest(&mut conn, &resolver, records).unwrap();
        let (n, date, qty): (i64, String, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(date), MAX(barcode_quantity) FROM movement_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(date, "20250605");
        assert_eq!(qty, "2");
    }

    #[test]
    fn clients_get_sequential_codes() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let a = save_client(&mut conn, "東邦薬品", "123").unwrap();
        let b = save_client(&mut conn, "スズケン", "").unwrap();
        assert_eq!(a.client_code, "client00000001");
        assert_eq!(b.client_code, "client00000002");
        let all = list_clients(&conn).unwrap();
        assert_eq!(all, vec![a, b]);
    }
}
