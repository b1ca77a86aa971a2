use anyhow::Context;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::ingest::organized_flag;
use crate::resolver::Resolver;
use crate::text::{clean_field, decode_sjis, normalize_date};
use crate::units::UnitMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub date: String,
    pub yj_code: String,
    pub jan_code: String,
    pub product_name: String,
    pub amount: String,
    pub unit_code: String,
    pub unit_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_count: usize,
    pub created_count: usize,
    pub records: Vec<UsageRecord>,
}

pub fn parse(bytes: &[u8]) -> anyhow::Result<Vec<UsageRecord>> {
    let text = decode_sjis(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut out = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("read usage row {}", line + 2))?;
        if record.len() < 6 {
            tracing::warn!("usage row {} has {} fields, skipping", line + 2, record.len());
            continue;
        }
        out.push(UsageRecord {
            date: normalize_date(&record[0]),
            yj_code: clean_field(&record[1]),
            jan_code: clean_field(&record[2]),
            product_name: clean_field(&record[3]),
            amount: clean_field(&record[4]),
            unit_code: clean_field(&record[5]),
            unit_name: String::new(),
        });
    }
    Ok(out)
}

/// Resolves every row, then replaces the batch's date range in one transaction.
pub fn ingest(
    conn: &mut Connection,
    resolver: &Resolver,
    units: &UnitMap,
    mut records: Vec<UsageRecord>,
) -> anyhow::Result<UsageSummary> {
    let mut created = 0usize;
    let mut flags = Vec::with_capacity(records.len());
    for rec in records.iter_mut() {
        rec.unit_name = units.resolve(&rec.unit_code);
        let resolved = resolver
            .resolve_or_fallback(conn, &rec.jan_code, &rec.product_name)
            .with_context(|| format!("resolve usage product {}", rec.jan_code))?;
        if resolved.was_created {
            created += 1;
        }
        if rec.yj_code.is_empty() {
            rec.yj_code = resolved.record.yj_code;
        }
        flags.push(organized_flag(conn, &rec.jan_code));
    }

    let range = records
        .iter()
        .map(|r| r.date.as_str())
        .filter(|d| !d.is_empty())
        .fold(None, |acc: Option<(&str, &str)>, d| match acc {
            None => Some((d, d)),
            Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
        })
        .map(|(lo, hi)| (lo.to_string(), hi.to_string()));

    let tx = conn.transaction().context("begin usage replace tx")?;
    if let Some((from, to)) = &range {
        let removed = tx
            .execute(
                "DELETE FROM usage_records WHERE date BETWEEN ?1 AND ?2",
                params![from, to],
            )
            .context("delete usage range")?;
        tracing::info!("usage: replacing {} rows in {}..={}", removed, from, to);
    }
    {
        let mut stmt = tx
            .prepare(
                "
                INSERT INTO usage_records (
                    date, yj_code, jan_code, product_name, amount, unit_code, unit_name, organized
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )
            .context("prepare usage insert")?;
        for (rec, flag) in records.iter().zip(flags) {
            stmt.execute(params![
                rec.date,
                rec.yj_code,
                rec.jan_code,
                rec.product_name,
                rec.amount,
                rec.unit_code,
                rec.unit_name,
                flag,
            ])
            .with_context(|| format!("insert usage row {} {}", rec.date, rec.jan_code))?;
        }
    }
    tx.commit().context("commit usage replace tx")?;

    Ok(UsageSummary {
        total_count: records.len(),
        created_count: created,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestDb, sjis};

    const FILE: &str = "日付,YJ,JAN,品名,数量,単位\n\
        2025/06/01,,\"4900000000001\",院内A,3,1\n\
        2025/06/03,YJX,4900000000002,院内B,2,9\n\
        short,row\n";

    #[test]
    fn parses_rows_and_skips_short_ones() {
        let rows = parse(&sjis(FILE)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, "20250601");
        assert_eq!(rows[0].jan_code, "4900000000001");
        assert_eq!(rows[1].yj_code, "YJX");
    }

    #[test]
    fn reupload_replaces_the_date_range() {
        let db = TestDb::new();
        let mut conn = db.connect();
        let resolver = Resolver::new();
        let units = UnitMap::from_pairs([("1", "錠")]);

        let first = ingest(&mut conn, &resolver, &units, parse(&sjis(FILE)).unwrap()).unwrap();
        assert_eq!(first.total_count, 2);
        assert_eq!(first.created_count, 2);
        assert_eq!(first.records[0].unit_name, "錠");
        assert_eq!(first.records[1].unit_name, "9");
        // blank classification taken from the resolved record
        assert!(first.records[0].yj_code.starts_with("classification"));

        let again = ingest(&mut conn, &resolver, &units, parse(&sjis(FILE)).unwrap()).unwrap();
        assert_eq!(again.created_count, 0);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 2);
    }
}
