use anyhow::Context;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::ingest::organized_flag;
use crate::resolver::Resolver;
use crate::text::decode_sjis;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatRecord {
    pub oroshi_code: String,
    pub date: String,
    pub flag: String,
    pub receipt_number: String,
    pub line_number: String,
    pub jan_code: String,
    pub product_name: String,
    pub quantity: String,
    pub unit_price: String,
    pub subtotal: String,
    pub package_price: String,
    pub expiry_date: String,
    pub lot_number: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatSummary {
    pub total_count: usize,
    pub created_count: usize,
    pub duplicate_count: usize,
    pub records: Vec<DatRecord>,
}

fn field(line: &[u8], start: usize, end: usize) -> String {
    let end = end.min(line.len());
    if start >= end {
        return String::new();
    }
    decode_sjis(&line[start..end]).trim().to_string()
}

// S20 lines set the wholesaler code for the D20 lines that follow.
pub fn parse(bytes: &[u8]) -> Vec<DatRecord> {
    let mut oroshi_code = String::new();
    let mut out = Vec::new();
    for line in bytes.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b"S20") {
            oroshi_code = field(line, 3, 12);
            continue;
        }
        if !line.starts_with(b"D20") {
            continue;
        }
        out.push(DatRecord {
            oroshi_code: oroshi_code.clone(),
            flag: field(line, 3, 4),
            date: field(line, 4, 12),
            receipt_number: field(line, 12, 22),
            line_number: field(line, 22, 24),
            jan_code: field(line, 25, 38),
            product_name: field(line, 38, 78),
            quantity: field(line, 78, 83),
            unit_price: field(line, 83, 92),
            subtotal: field(line, 92, 101),
            package_price: field(line, 101, 109),
            expiry_date: field(line, 109, 115),
            lot_number: field(line, 115, 121),
        });
    }
    out
}

/// Resolves each row's product and inserts rows not already stored.
/// A row already present for the same date, receipt, line and code counts
/// as a duplicate.
pub fn ingest(
    conn: &mut Connection,
    resolver: &Resolver,
    records: Vec<DatRecord>,
) -> anyhow::Result<DatSummary> {
    let mut summary = DatSummary {
        total_count: records.len(),
        ..DatSummary::default()
    };

    let mut flags = Vec::with_capacity(records.len());
    for rec in &records {
        let resolved = resolver
            .resolve_or_fallback(conn, &rec.jan_code, &rec.product_name)
            .with_context(|| format!("resolve DAT product {}", rec.jan_code))?;
        if resolved.was_created {
            summary.created_count += 1;
        }
        flags.push(organized_flag(conn, &rec.jan_code));
    }

    let tx = conn.transaction().context("begin DAT insert tx")?;
    {
        let mut stmt = tx
            .prepare(
                "
                INSERT OR IGNORE INTO dat_records (
                    oroshi_code, date, flag, receipt_number, line_number, jan_code,
                    product_name, quantity, unit_price, subtotal, package_price,
                    expiry_date, lot_number, organized
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ",
            )
            .context("prepare DAT insert")?;
        for (rec, flag) in records.iter().zip(flags) {
            let n = stmt
                .execute(params![
                    rec.oroshi_code,
                    rec.date,
                    rec.flag,
                    rec.receipt_number,
                    rec.line_number,
                    rec.jan_code,
                    rec.product_name,
                    rec.quantity,
                    rec.unit_price,
                    rec.subtotal,
                    rec.package_price,
                    rec.expiry_date,
                    rec.lot_number,
                    flag,
                ])
                .with_context(|| {
                    format!("insert DAT row {}/{}", rec.receipt_number, rec.line_number)
                })?;
            if n == 0 {
                summary.duplicate_count += 1;
            }
        }
    }
    tx.commit().context("commit DAT insert tx")?;

    tracing::info!(
        "DAT ingest: total={} created={} duplicates={}",
        summary.total_count,
        summary.created_count,
        summary.duplicate_count
    );
    summary.records = records;
    Ok(summary)
}
