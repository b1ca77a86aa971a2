use std::path::Path;

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use serde::Serialize;

use crate::text::decode_sjis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    /// Drug-classification catalog (JCSHMS), keyed by column 0.
    Primary,
    /// Barcode/packaging catalog (JANCODE), keyed by column 1.
    Barcode,
}

impl CatalogKind {
    pub fn table(self) -> &'static str {
        match self {
            CatalogKind::Primary => "jcshms",
            CatalogKind::Barcode => "jancode",
        }
    }

    pub fn column_count(self) -> usize {
        match self {
            CatalogKind::Primary => 125,
            CatalogKind::Barcode => 30,
        }
    }

    pub fn key_index(self) -> usize {
        match self {
            CatalogKind::Primary => 0,
            CatalogKind::Barcode => 1,
        }
    }

    pub fn column_name(self, idx: usize) -> String {
        match self {
            CatalogKind::Primary => format!("jc{idx:03}"),
            CatalogKind::Barcode => format!("ja{idx:03}"),
        }
    }

    fn has_header(self) -> bool {
        matches!(self, CatalogKind::Barcode)
    }
}

// Primary catalog columns.
pub const JC_YJ_CODE: usize = 9;
pub const JC_PRODUCT_NAME: usize = 18;
pub const JC_SPEC: usize = 20;
pub const JC_KANA_NAME: usize = 22;
pub const JC_GENERIC_NAME: usize = 24;
pub const JC_MAKER_NAME: usize = 30;
pub const JC_PACKAGING_FORM: usize = 37;
pub const JC_QUANTITY_PER_PACK: usize = 38;
pub const JC_PACKAGING_UNIT: usize = 39;
pub const JC_INNER_QUANTITY: usize = 40;
pub const JC_TOTAL_QUANTITY: usize = 44;
pub const JC_PRICE_COEFFICIENT: usize = 48;
pub const JC_UNIT_PRICE: usize = 49;
pub const JC_DOYAKU: usize = 61;
pub const JC_GEKIYAKU: usize = 62;
pub const JC_MAYAKU: usize = 63;
pub const JC_KOUSEISHINYAKU: usize = 64;
pub const JC_KAKUSEIZAI: usize = 65;
pub const JC_KAKUSEIZAI_GENRYOU: usize = 66;
pub const JC_DISPENSING_UNIT: usize = 121;

// Barcode catalog columns.
pub const JA_INNER_QUANTITY: usize = 6;
pub const JA_UNIT_CODE: usize = 7;
pub const JA_TOTAL_QUANTITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub kind: CatalogKind,
    pub columns: Vec<String>,
}

impl CatalogRecord {
    pub fn get(&self, idx: usize) -> &str {
        self.columns.get(idx).map(String::as_str).unwrap_or("")
    }
}

/// Exact-match lookup by product code. Returns the first matching row.
pub fn lookup(
    conn: &Connection,
    kind: CatalogKind,
    code: &str,
) -> anyhow::Result<Option<CatalogRecord>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
        kind.table(),
        kind.column_name(kind.key_index())
    );
    let width = kind.column_count();
    let columns = conn
        .query_row(&sql, [code], |row| {
            (0..width)
                .map(|i| row.get::<usize, Option<String>>(i).map(Option::unwrap_or_default))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .optional()
        .with_context(|| format!("lookup {} in {}", code, kind.table()))?;
    Ok(columns.map(|columns| CatalogRecord { kind, columns }))
}

pub fn contains(conn: &Connection, kind: CatalogKind, code: &str) -> anyhow::Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
        kind.table(),
        kind.column_name(kind.key_index())
    );
    let hit = conn
        .query_row(&sql, [code], |_| Ok(()))
        .optional()
        .with_context(|| format!("look up {} in {}", code, kind.table()))?;
    Ok(hit.is_some())
}

/// Replaces a catalog table wholesale from a Shift-JIS CSV file.
pub fn load_csv(conn: &mut Connection, kind: CatalogKind, path: &Path) -> anyhow::Result<usize> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = decode_sjis(&bytes);
    let width = kind.column_count();

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(kind.has_header())
        .flexible(true)
        .from_reader(text.as_bytes());

    let placeholders = (1..=width)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_sql = format!(
        "INSERT OR REPLACE INTO {} VALUES ({placeholders})",
        kind.table()
    );

    let tx = conn
        .transaction()
        .with_context(|| format!("begin {} refresh", kind.table()))?;
    tx.execute(&format!("DELETE FROM {}", kind.table()), [])
        .with_context(|| format!("clear {}", kind.table()))?;

    let mut loaded = 0usize;
    {
        let mut stmt = tx
            .prepare(&insert_sql)
            .with_context(|| format!("prepare {} insert", kind.table()))?;
        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("{}: skipping row {}: {}", path.display(), line + 1, e);
                    continue;
                }
            };
            let mut fields = record
                .iter()
                .map(|f| f.trim().to_string())
                .collect::<Vec<_>>();
            fields.resize(width, String::new());
            if fields[kind.key_index()].is_empty() {
                continue;
            }
            stmt.execute(params_from_iter(fields.iter()))
                .with_context(|| format!("insert row {} into {}", line + 1, kind.table()))?;
            loaded += 1;
        }
    }
    tx.commit()
        .with_context(|| format!("commit {} refresh", kind.table()))?;
    Ok(loaded)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProductHit {
    pub yj: String,
    pub jan: String,
    pub name: String,
    pub spec: String,
    pub pack_qty_number: String,
    pub pack_qty_unit_code: String,
    pub pack_total: String,
    pub coef: String,
    pub unit_name: String,
    pub unit_yaku: String,
}

/// Substring search over product name (or kana name) and strength text.
pub fn search_products(
    conn: &Connection,
    name: &str,
    spec: &str,
) -> anyhow::Result<Vec<ProductHit>> {
    let sql = format!(
        "
        SELECT
          p.jc{JC_YJ_CODE:03},
          p.jc000,
          p.jc{JC_PRODUCT_NAME:03},
          p.jc{JC_SPEC:03},
          COALESCE(b.ja{JA_INNER_QUANTITY:03}, ''),
          COALESCE(b.ja{JA_UNIT_CODE:03}, ''),
          p.jc{JC_TOTAL_QUANTITY:03},
          COALESCE(NULLIF(p.jc{JC_PRICE_COEFFICIENT:03}, ''), '0'),
          p.jc{JC_PACKAGING_UNIT:03},
          COALESCE(NULLIF(p.jc{JC_UNIT_PRICE:03}, ''), '0')
        FROM jcshms p
        LEFT JOIN jancode b ON b.ja001 = p.jc000
        WHERE (p.jc{JC_PRODUCT_NAME:03} LIKE ?1 OR p.jc{JC_KANA_NAME:03} LIKE ?1)
          AND p.jc{JC_SPEC:03} LIKE ?2
        ORDER BY p.jc000
        LIMIT 100
        "
    );
    let name_pat = format!("%{name}%");
    let spec_pat = format!("%{spec}%");
    let mut stmt = conn.prepare(&sql).context("prepare product search")?;
    let rows = stmt.query_map([&name_pat, &spec_pat], |row| {
        Ok(ProductHit {
            yj: row.get(0)?,
            jan: row.get(1)?,
            name: row.get(2)?,
            spec: row.get(3)?,
            pack_qty_number: row.get(4)?,
            pack_qty_unit_code: row.get(5)?,
            pack_total: row.get(6)?,
            coef: row.get(7)?,
            unit_name: row.get(8)?,
            unit_yaku: row.get(9)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        match r {
            Ok(hit) => out.push(hit),
            Err(e) => tracing::warn!("product search: skipping row: {}", e),
        }
    }
    Ok(out)
}
