use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::catalog::{self, CatalogKind, CatalogRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub jan_code: String,
    pub yj_code: String,
    pub product_name: String,
    pub spec_text: String,
    pub generic_name: String,
    pub maker_name: String,
    pub packaging_form: String,
    pub quantity_per_pack: String,
    pub packaging_unit: String,
    pub inner_quantity: String,
    pub total_quantity: String,
    pub sub_unit_code: String,
    pub dispensing_unit_code: String,
    pub unit_price: String,
    pub doyaku: String,
    pub gekiyaku: String,
    pub mayaku: String,
    pub kouseishinyaku: String,
    pub kakuseizai: String,
    pub kakuseizai_genryou: String,
    /// Every primary catalog column (`jc000..jc124`), blank when no row matched.
    pub primary_columns: Vec<String>,
    /// Every barcode catalog column (`ja000..ja029`).
    pub barcode_columns: Vec<String>,
}

impl CanonicalRecord {
    pub fn primary(&self, idx: usize) -> &str {
        self.primary_columns.get(idx).map(String::as_str).unwrap_or("")
    }

    pub fn barcode(&self, idx: usize) -> &str {
        self.barcode_columns.get(idx).map(String::as_str).unwrap_or("")
    }
}

/// Fields of [`CanonicalRecord`] that can be copied from a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    YjCode,
    ProductName,
    SpecText,
    GenericName,
    MakerName,
    PackagingForm,
    QuantityPerPack,
    PackagingUnit,
    InnerQuantity,
    TotalQuantity,
    SubUnitCode,
    DispensingUnitCode,
    UnitPrice,
    Doyaku,
    Gekiyaku,
    Mayaku,
    Kouseishinyaku,
    Kakuseizai,
    KakuseizaiGenryou,
}

impl CanonicalField {
    fn slot_mut(self, rec: &mut CanonicalRecord) -> &mut String {
        match self {
            CanonicalField::YjCode => &mut rec.yj_code,
            CanonicalField::ProductName => &mut rec.product_name,
            CanonicalField::SpecText => &mut rec.spec_text,
            CanonicalField::GenericName => &mut rec.generic_name,
            CanonicalField::MakerName => &mut rec.maker_name,
            CanonicalField::PackagingForm => &mut rec.packaging_form,
            CanonicalField::QuantityPerPack => &mut rec.quantity_per_pack,
            CanonicalField::PackagingUnit => &mut rec.packaging_unit,
            CanonicalField::InnerQuantity => &mut rec.inner_quantity,
            CanonicalField::TotalQuantity => &mut rec.total_quantity,
            CanonicalField::SubUnitCode => &mut rec.sub_unit_code,
            CanonicalField::DispensingUnitCode => &mut rec.dispensing_unit_code,
            CanonicalField::UnitPrice => &mut rec.unit_price,
            CanonicalField::Doyaku => &mut rec.doyaku,
            CanonicalField::Gekiyaku => &mut rec.gekiyaku,
            CanonicalField::Mayaku => &mut rec.mayaku,
            CanonicalField::Kouseishinyaku => &mut rec.kouseishinyaku,
            CanonicalField::Kakuseizai => &mut rec.kakuseizai,
            CanonicalField::KakuseizaiGenryou => &mut rec.kakuseizai_genryou,
        }
    }
}

/// A column in one of the two catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogField {
    Primary(usize),
    Barcode(usize),
}

// Entries for one destination are in precedence order; a later source only
// fills a field that is still empty. Raw catalog columns are copied whole.
pub static FIELD_MAP: &[(CanonicalField, CatalogField)] = &[
    (CanonicalField::YjCode, CatalogField::Primary(catalog::JC_YJ_CODE)),
    (CanonicalField::ProductName, CatalogField::Primary(catalog::JC_PRODUCT_NAME)),
    (CanonicalField::SpecText, CatalogField::Primary(catalog::JC_SPEC)),
    (CanonicalField::GenericName, CatalogField::Primary(catalog::JC_GENERIC_NAME)),
    (CanonicalField::MakerName, CatalogField::Primary(catalog::JC_MAKER_NAME)),
    (CanonicalField::PackagingForm, CatalogField::Primary(catalog::JC_PACKAGING_FORM)),
    (CanonicalField::QuantityPerPack, CatalogField::Primary(catalog::JC_QUANTITY_PER_PACK)),
    (CanonicalField::PackagingUnit, CatalogField::Primary(catalog::JC_PACKAGING_UNIT)),
    (CanonicalField::InnerQuantity, CatalogField::Primary(catalog::JC_INNER_QUANTITY)),
    (CanonicalField::InnerQuantity, CatalogField::Barcode(catalog::JA_INNER_QUANTITY)),
    (CanonicalField::TotalQuantity, CatalogField::Primary(catalog::JC_TOTAL_QUANTITY)),
    (CanonicalField::TotalQuantity, CatalogField::Barcode(catalog::JA_TOTAL_QUANTITY)),
    (CanonicalField::SubUnitCode, CatalogField::Barcode(catalog::JA_UNIT_CODE)),
    (CanonicalField::DispensingUnitCode, CatalogField::Primary(catalog::JC_DISPENSING_UNIT)),
    (CanonicalField::UnitPrice, CatalogField::Primary(catalog::JC_UNIT_PRICE)),
    (CanonicalField::Doyaku, CatalogField::Primary(catalog::JC_DOYAKU)),
    (CanonicalField::Gekiyaku, CatalogField::Primary(catalog::JC_GEKIYAKU)),
    (CanonicalField::Mayaku, CatalogField::Primary(catalog::JC_MAYAKU)),
    (CanonicalField::Kouseishinyaku, CatalogField::Primary(catalog::JC_KOUSEISHINYAKU)),
    (CanonicalField::Kakuseizai, CatalogField::Primary(catalog::JC_KAKUSEIZAI)),
    (
        CanonicalField::KakuseizaiGenryou,
        CatalogField::Primary(catalog::JC_KAKUSEIZAI_GENRYOU),
    ),
];

fn padded(columns: Option<&[String]>, kind: CatalogKind) -> Vec<String> {
    let mut out = columns.map(<[String]>::to_vec).unwrap_or_default();
    out.resize(kind.column_count(), String::new());
    out
}

/// Builds a record from whichever catalogs matched. `None` if neither did.
pub fn from_catalogs(
    code: &str,
    primary: Option<&CatalogRecord>,
    barcode: Option<&CatalogRecord>,
) -> Option<CanonicalRecord> {
    if primary.is_none() && barcode.is_none() {
        return None;
    }
    let mut rec = CanonicalRecord {
        jan_code: code.to_string(),
        primary_columns: padded(primary.map(|r| r.columns.as_slice()), CatalogKind::Primary),
        barcode_columns: padded(barcode.map(|r| r.columns.as_slice()), CatalogKind::Barcode),
        ..CanonicalRecord::default()
    };
    for (dest, src) in FIELD_MAP {
        let value = match src {
            CatalogField::Primary(idx) => primary.map(|r| r.get(*idx)),
            CatalogField::Barcode(idx) => barcode.map(|r| r.get(*idx)),
        };
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        let slot = dest.slot_mut(&mut rec);
        if slot.is_empty() {
            *slot = value.to_string();
        }
    }
    Some(rec)
}

const NAMED_COLUMNS: [&str; 20] = [
    "jan_code",
    "yj_code",
    "product_name",
    "spec_text",
    "generic_name",
    "maker_name",
    "packaging_form",
    "quantity_per_pack",
    "packaging_unit",
    "inner_quantity",
    "total_quantity",
    "sub_unit_code",
    "dispensing_unit_code",
    "unit_price",
    "doyaku",
    "gekiyaku",
    "mayaku",
    "kouseishinyaku",
    "kakuseizai",
    "kakuseizai_genryou",
];

/// Named columns followed by `jc000..jc124` and `ja000..ja029`.
fn column_names() -> Vec<String> {
    let catalog = [CatalogKind::Primary, CatalogKind::Barcode]
        .into_iter()
        .flat_map(|kind| (0..kind.column_count()).map(move |i| kind.column_name(i)));
    NAMED_COLUMNS.iter().map(|c| c.to_string()).chain(catalog).collect()
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalRecord> {
    let named = NAMED_COLUMNS.len();
    let primary_width = CatalogKind::Primary.column_count();
    let barcode_width = CatalogKind::Barcode.column_count();
    let range = |start: usize, width: usize| -> rusqlite::Result<Vec<String>> {
        (start..start + width).map(|i| row.get::<usize, String>(i)).collect()
    };
    Ok(CanonicalRecord {
        jan_code: row.get(0)?,
        yj_code: row.get(1)?,
        product_name: row.get(2)?,
        spec_text: row.get(3)?,
        generic_name: row.get(4)?,
        maker_name: row.get(5)?,
        packaging_form: row.get(6)?,
        quantity_per_pack: row.get(7)?,
        packaging_unit: row.get(8)?,
        inner_quantity: row.get(9)?,
        total_quantity: row.get(10)?,
        sub_unit_code: row.get(11)?,
        dispensing_unit_code: row.get(12)?,
        unit_price: row.get(13)?,
        doyaku: row.get(14)?,
        gekiyaku: row.get(15)?,
        mayaku: row.get(16)?,
        kouseishinyaku: row.get(17)?,
        kakuseizai: row.get(18)?,
        kakuseizai_genryou: row.get(19)?,
        primary_columns: range(named, primary_width)?,
        barcode_columns: range(named + primary_width, barcode_width)?,
    })
}

pub fn get(conn: &Connection, code: &str) -> anyhow::Result<Option<CanonicalRecord>> {
    let sql = format!("SELECT {} FROM ma0 WHERE jan_code = ?1", column_names().join(", "));
    conn.query_row(&sql, [code], from_row)
        .optional()
        .with_context(|| format!("select ma0 row for {code}"))
}

/// Insert-if-absent. Returns true when this call wrote the row.
pub(crate) fn insert_if_absent(
    conn: &Connection,
    rec: &CanonicalRecord,
) -> anyhow::Result<bool> {
    let columns = column_names();
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR IGNORE INTO ma0 ({}) VALUES ({placeholders})",
        columns.join(", ")
    );
    let named = [
        &rec.jan_code,
        &rec.yj_code,
        &rec.product_name,
        &rec.spec_text,
        &rec.generic_name,
        &rec.maker_name,
        &rec.packaging_form,
        &rec.quantity_per_pack,
        &rec.packaging_unit,
        &rec.inner_quantity,
        &rec.total_quantity,
        &rec.sub_unit_code,
        &rec.dispensing_unit_code,
        &rec.unit_price,
        &rec.doyaku,
        &rec.gekiyaku,
        &rec.mayaku,
        &rec.kouseishinyaku,
        &rec.kakuseizai,
        &rec.kakuseizai_genryou,
    ];
    let primary = padded(Some(rec.primary_columns.as_slice()), CatalogKind::Primary);
    let barcode = padded(Some(rec.barcode_columns.as_slice()), CatalogKind::Barcode);
    let values = named.into_iter().chain(primary.iter()).chain(barcode.iter());
    let n = conn
        .execute(&sql, params_from_iter(values))
        .with_context(|| format!("insert ma0 row for {}", rec.jan_code))?;
    Ok(n > 0)
}

/// Fills a blank classification code. Never overwrites a non-blank one.
pub(crate) fn backfill_classification(
    conn: &Connection,
    code: &str,
    yj: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE ma0 SET yj_code = ?1 WHERE jan_code = ?2 AND yj_code = ''",
        params![yj, code],
    )
    .with_context(|| format!("backfill yj for {code}"))?;
    Ok(())
}

/// Display name for a classification code, from the primary catalog first.
pub fn product_name_for_classification(conn: &Connection, yj: &str) -> anyhow::Result<String> {
    let from_catalog: Option<String> = conn
        .query_row(
            &format!(
                "SELECT jc{:03} FROM jcshms WHERE jc{:03} = ?1 AND jc{:03} <> '' LIMIT 1",
                catalog::JC_PRODUCT_NAME,
                catalog::JC_YJ_CODE,
                catalog::JC_PRODUCT_NAME
            ),
            [yj],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("select catalog name for {yj}"))?;
    if let Some(name) = from_catalog {
        return Ok(name);
    }
    let stored: Option<String> = conn
        .query_row(
            "SELECT product_name FROM ma0 WHERE yj_code = ?1 AND product_name <> '' LIMIT 1",
            [yj],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("select ma0 name for {yj}"))?;
    Ok(stored.unwrap_or_default())
}
