pub mod filter;
pub mod packaging;

use std::collections::BTreeMap;

use anyhow::Context;
use rusqlite::{Connection, Row, params_from_iter};
use serde::Serialize;

use crate::catalog;
use crate::units::UnitMap;

pub use filter::{AggregateFilters, ControlCategory};
use packaging::{Packaging, derived_quantity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Dat,
    Usage,
    Inventory,
    Movement,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Dat, Source::Usage, Source::Inventory, Source::Movement];

    pub fn tag(self) -> &'static str {
        match self {
            Source::Dat => "DAT",
            Source::Usage => "USAGE",
            Source::Inventory => "INVENTORY",
            Source::Movement => "MOVEMENT",
        }
    }

    /// Uniform transaction columns. An empty `per_unit` means "use the
    /// product's inner packaging quantity".
    fn select_sql(self) -> &'static str {
        match self {
            Source::Dat => {
                "SELECT jan_code AS jan, date, flag AS kind, quantity AS count, '' AS per_unit,
                        '' AS own_yj, product_name AS own_name, '' AS own_unit,
                        unit_price, subtotal, expiry_date AS expiry, lot_number AS lot,
                        oroshi_code AS oroshi, receipt_number AS receipt, line_number AS line
                 FROM dat_records"
            }
            Source::Usage => {
                "SELECT jan_code AS jan, date, '' AS kind, amount AS count, '1' AS per_unit,
                        yj_code AS own_yj, product_name AS own_name, unit_name AS own_unit,
                        '' AS unit_price, '' AS subtotal, '' AS expiry, '' AS lot,
                        '' AS oroshi, '' AS receipt, '' AS line
                 FROM usage_records"
            }
            Source::Inventory => {
                "SELECT jan_code AS jan, date, '' AS kind, stock_count AS count,
                        pack_quantity AS per_unit, yj_code AS own_yj, product_name AS own_name,
                        pack_unit_code AS own_unit, '' AS unit_price, '' AS subtotal,
                        '' AS expiry, '' AS lot, '' AS oroshi, '' AS receipt, '' AS line
                 FROM inventory_records"
            }
            Source::Movement => {
                "SELECT jan_code AS jan, date, CAST(kind AS TEXT) AS kind,
                        barcode_quantity AS count, '' AS per_unit, '' AS own_yj,
                        '' AS own_name, unit AS own_unit, unit_price, subtotal,
                        expiry_date AS expiry, lot_number AS lot, oroshi_code AS oroshi,
                        receipt_number AS receipt, CAST(line_number AS TEXT) AS line
                 FROM movement_records"
            }
        }
    }

    fn label(self, kind: &str) -> String {
        let label = match (self, kind) {
            (Source::Dat, "1") => "納品",
            (Source::Dat, "2") => "返品",
            (Source::Dat, other) => other,
            (Source::Usage, _) => "処方",
            (Source::Inventory, _) => "棚卸",
            (Source::Movement, "1") => "出庫",
            (Source::Movement, "2") => "入庫",
            (Source::Movement, other) => other,
        };
        label.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    pub yj: String,
    pub product_name: String,
    pub jan_code: String,
    pub date: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub quantity: String,
    pub unit: String,
    pub packaging: String,
    pub count: String,
    pub unit_price: String,
    pub subtotal: String,
    pub expiry_date: String,
    pub lot_number: String,
    pub oroshi_code: String,
    pub receipt_number: String,
    pub line_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationGroup {
    pub product_name: String,
    pub groups: BTreeMap<String, Vec<Detail>>,
}

pub type AggregateResult = BTreeMap<String, ClassificationGroup>;

#[derive(Debug, Clone, Default)]
struct PrimaryCols {
    yj: String,
    name: String,
    form: String,
    quantity_per_pack: String,
    unit: String,
    inner_quantity: String,
    total_quantity: String,
}

#[derive(Debug, Clone, Default)]
struct BarcodeCols {
    inner_quantity: String,
    unit_code: String,
    total_quantity: String,
}

#[derive(Debug, Clone, Default)]
struct CanonicalCols {
    yj: String,
    name: String,
    form: String,
    quantity_per_pack: String,
    unit: String,
    inner_quantity: String,
    total_quantity: String,
    sub_unit_code: String,
}

#[derive(Debug, Clone, Default)]
struct JoinedRow {
    jan: String,
    date: String,
    kind: String,
    count: String,
    per_unit: String,
    own_yj: String,
    own_name: String,
    own_unit: String,
    unit_price: String,
    subtotal: String,
    expiry: String,
    lot: String,
    oroshi: String,
    receipt: String,
    line: String,
    primary: PrimaryCols,
    barcode: BarcodeCols,
    canonical: CanonicalCols,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinedField {
    Yj,
    Name,
    Form,
    QuantityPerPack,
    Unit,
    InnerQuantity,
    TotalQuantity,
    SubUnitCode,
}

fn first_non_empty<'a>(candidates: impl IntoIterator<Item = &'a str>) -> String {
    candidates
        .into_iter()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or("")
        .to_string()
}

impl JoinedRow {
    /// `[primary, barcode, canonical, own]` for `field`; absent layers are "".
    fn layers(&self, field: JoinedField) -> [&str; 4] {
        let (p, b, c) = (&self.primary, &self.barcode, &self.canonical);
        match field {
            JoinedField::Yj => [p.yj.as_str(), "", c.yj.as_str(), self.own_yj.as_str()],
            JoinedField::Name => [p.name.as_str(), "", c.name.as_str(), self.own_name.as_str()],
            JoinedField::Form => [p.form.as_str(), "", c.form.as_str(), ""],
            JoinedField::QuantityPerPack => {
                [p.quantity_per_pack.as_str(), "", c.quantity_per_pack.as_str(), ""]
            }
            JoinedField::Unit => [p.unit.as_str(), "", c.unit.as_str(), self.own_unit.as_str()],
            JoinedField::InnerQuantity => [
                p.inner_quantity.as_str(),
                b.inner_quantity.as_str(),
                c.inner_quantity.as_str(),
                "",
            ],
            JoinedField::TotalQuantity => [
                p.total_quantity.as_str(),
                b.total_quantity.as_str(),
                c.total_quantity.as_str(),
                "",
            ],
            JoinedField::SubUnitCode => ["", b.unit_code.as_str(), c.sub_unit_code.as_str(), ""],
        }
    }

    fn resolve(&self, field: JoinedField) -> String {
        first_non_empty(self.layers(field))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let s = |i: usize| -> rusqlite::Result<String> {
            Ok(row.get::<usize, Option<String>>(i)?.unwrap_or_default())
        };
        Ok(Self {
            jan: s(0)?,
            date: s(1)?,
            kind: s(2)?,
            count: s(3)?,
            per_unit: s(4)?,
            own_yj: s(5)?,
            own_name: s(6)?,
            own_unit: s(7)?,
            unit_price: s(8)?,
            subtotal: s(9)?,
            expiry: s(10)?,
            lot: s(11)?,
            oroshi: s(12)?,
            receipt: s(13)?,
            line: s(14)?,
            primary: PrimaryCols {
                yj: s(15)?,
                name: s(16)?,
                form: s(17)?,
                quantity_per_pack: s(18)?,
                unit: s(19)?,
                inner_quantity: s(20)?,
                total_quantity: s(21)?,
            },
            barcode: BarcodeCols {
                inner_quantity: s(22)?,
                unit_code: s(23)?,
                total_quantity: s(24)?,
            },
            canonical: CanonicalCols {
                yj: s(25)?,
                name: s(26)?,
                form: s(27)?,
                quantity_per_pack: s(28)?,
                unit: s(29)?,
                inner_quantity: s(30)?,
                total_quantity: s(31)?,
                sub_unit_code: s(32)?,
            },
        })
    }

    fn into_detail(self, source: Source, units: &UnitMap) -> (String, Detail) {
        let inner = self.resolve(JoinedField::InnerQuantity);
        let total = self.resolve(JoinedField::TotalQuantity);
        let form = self.resolve(JoinedField::Form);
        let qpp = self.resolve(JoinedField::QuantityPerPack);
        let sub_unit = self.resolve(JoinedField::SubUnitCode);
        let unit = units.resolve(&self.resolve(JoinedField::Unit));

        let per_unit = if self.per_unit.trim().is_empty() {
            inner.as_str()
        } else {
            self.per_unit.as_str()
        };
        let quantity = derived_quantity(per_unit, &self.count);

        let pkg = Packaging {
            form: &form,
            quantity_per_pack: &qpp,
            unit: &unit,
            inner_quantity: &inner,
            total_quantity: &total,
            sub_unit_code: &sub_unit,
        };
        let key = pkg.grouping_key();
        let packaging = pkg.display(units);

        let detail = Detail {
            yj: self.resolve(JoinedField::Yj),
            product_name: self.resolve(JoinedField::Name),
            kind: source.label(&self.kind),
            quantity: quantity.to_string(),
            unit,
            packaging,
            jan_code: self.jan,
            date: self.date,
            count: self.count,
            unit_price: self.unit_price,
            subtotal: self.subtotal,
            expiry_date: self.expiry,
            lot_number: self.lot,
            oroshi_code: self.oroshi,
            receipt_number: self.receipt,
            line_number: self.line,
        };
        (key, detail)
    }
}

fn source_query(source: Source, where_sql: &str) -> String {
    format!(
        "
        SELECT
          t.jan, t.date, t.kind, t.count, t.per_unit, t.own_yj, t.own_name, t.own_unit,
          t.unit_price, t.subtotal, t.expiry, t.lot, t.oroshi, t.receipt, t.line,
          p.jc{yj:03}, p.jc{name:03}, p.jc{form:03}, p.jc{qpp:03}, p.jc{unit:03},
          p.jc{inner:03}, p.jc{total:03},
          b.ja{b_inner:03}, b.ja{b_unit:03}, b.ja{b_total:03},
          m.yj_code, m.product_name, m.packaging_form, m.quantity_per_pack,
          m.packaging_unit, m.inner_quantity, m.total_quantity, m.sub_unit_code
        FROM ({inner_sql}) t
        LEFT JOIN jcshms p ON p.jc000 = t.jan
        LEFT JOIN jancode b ON b.ja001 = t.jan
        LEFT JOIN ma0 m ON m.jan_code = t.jan
        {where_sql}
        ORDER BY t.date
        ",
        yj = catalog::JC_YJ_CODE,
        name = catalog::JC_PRODUCT_NAME,
        form = catalog::JC_PACKAGING_FORM,
        qpp = catalog::JC_QUANTITY_PER_PACK,
        unit = catalog::JC_PACKAGING_UNIT,
        inner = catalog::JC_INNER_QUANTITY,
        total = catalog::JC_TOTAL_QUANTITY,
        b_inner = catalog::JA_INNER_QUANTITY,
        b_unit = catalog::JA_UNIT_CODE,
        b_total = catalog::JA_TOTAL_QUANTITY,
        inner_sql = source.select_sql(),
    )
}

fn fetch_source(
    conn: &Connection,
    source: Source,
    units: &UnitMap,
    clause: &filter::WhereClause,
) -> anyhow::Result<Vec<(String, Detail)>> {
    let sql = source_query(source, &clause.sql);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(clause.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        match JoinedRow::from_row(row) {
            Ok(joined) => out.push(joined.into_detail(source, units)),
            Err(e) => tracing::warn!("aggregate {}: skipping row: {}", source.tag(), e),
        }
    }
    Ok(out)
}

/// Groups by classification code, then packaging key; each leaf list is
/// sorted by date (stable). A group's name is the first non-empty product
/// name seen in merge order.
pub fn group(rows: Vec<(String, Detail)>) -> AggregateResult {
    let mut out = AggregateResult::new();
    for (key, detail) in rows {
        let entry = out.entry(detail.yj.clone()).or_default();
        if entry.product_name.is_empty() {
            entry.product_name = detail.product_name.clone();
        }
        entry.groups.entry(key).or_default().push(detail);
    }
    for group in out.values_mut() {
        for list in group.groups.values_mut() {
            list.sort_by(|a, b| a.date.cmp(&b.date));
        }
    }
    out
}

/// Runs the report for `from..=to` (any date format; non-digits are dropped).
/// A failing source aborts the whole report. Fields resolve as primary
/// catalog, barcode catalog, canonical store, then the row's own value.
pub fn aggregate(
    conn: &Connection,
    units: &UnitMap,
    from: &str,
    to: &str,
    filters: &AggregateFilters,
) -> anyhow::Result<AggregateResult> {
    let from = crate::text::normalize_date(from);
    let to = crate::text::normalize_date(to);
    let clause = filter::build_where(&from, &to, filters);

    let mut rows = Vec::new();
    for source in Source::ALL {
        let fetched = fetch_source(conn, source, units, &clause)
            .with_context(|| format!("aggregate {} query", source.tag()))?;
        rows.extend(fetched);
    }
    tracing::info!("aggregate {}..={}: {} rows", from, to, rows.len());
    Ok(group(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        JA_INNER_QUANTITY, JA_UNIT_CODE, JC_DOYAKU, JC_INNER_QUANTITY, JC_PACKAGING_FORM,
        JC_PACKAGING_UNIT, JC_PRODUCT_NAME, JC_QUANTITY_PER_PACK, JC_TOTAL_QUANTITY, JC_YJ_CODE,
    };
    use crate::test_support::{TestDb, insert_barcode, insert_primary};

    fn detail(yj: &str, date: &str) -> Detail {
        Detail {
            yj: yj.into(),
            product_name: String::new(),
            jan_code: String::new(),
            date: date.into(),
            kind: String::new(),
            quantity: String::new(),
            unit: String::new(),
            packaging: String::new(),
            count: String::new(),
            unit_price: String::new(),
            subtotal: String::new(),
            expiry_date: String::new(),
            lot_number: String::new(),
            oroshi_code: String::new(),
            receipt_number: String::new(),
            line_number: String::new(),
        }
    }

    #[test]
    fn leaf_groups_are_date_ascending() {
        let rows = vec![
            ("k".to_string(), detail("YJ1", "20250601")),
            ("k".to_string(), detail("YJ1", "20250603")),
            ("k".to_string(), detail("YJ1", "20250602")),
        ];
        let result = group(rows);
        let dates = result["YJ1"].groups["k"]
            .iter()
            .map(|d| d.date.as_str())
            .collect::<Vec<_>>();
        assert_eq!(dates, vec!["20250601", "20250602", "20250603"]);
    }

    #[test]
    fn group_name_is_first_non_empty() {
        let mut a = detail("YJ1", "20250601");
        let mut b = detail("YJ1", "20250602");
        b.product_name = "後".into();
        let mut c = detail("YJ1", "20250603");
        c.product_name = "最後".into();
        a.product_name.clear();
        let result = group(vec![("x".into(), a), ("y".into(), b), ("x".into(), c)]);
        assert_eq!(result["YJ1"].product_name, "後");
        assert_eq!(result["YJ1"].groups.len(), 2);
    }

    #[test]
    fn fallback_chain_prefers_primary_then_barcode_then_store_then_row() {
        let row = JoinedRow {
            own_yj: "OWN".into(),
            own_name: "自前".into(),
            primary: PrimaryCols { name: " ".into(), ..PrimaryCols::default() },
            barcode: BarcodeCols {
                inner_quantity: "6".into(),
                unit_code: "7".into(),
                ..BarcodeCols::default()
            },
            canonical: CanonicalCols {
                yj: "STORE".into(),
                inner_quantity: "9".into(),
                sub_unit_code: "8".into(),
                ..CanonicalCols::default()
            },
            ..JoinedRow::default()
        };
        assert_eq!(row.resolve(JoinedField::Yj), "STORE");
        assert_eq!(row.resolve(JoinedField::Name), "自前");
        assert_eq!(row.resolve(JoinedField::InnerQuantity), "6");
        assert_eq!(row.resolve(JoinedField::SubUnitCode), "7");
        assert_eq!(row.resolve(JoinedField::Form), "");
    }

    #[test]
    fn empty_range_is_an_empty_object() {
        let db = TestDb::new();
        let conn = db.connect();
        let result = aggregate(
            &conn,
            &UnitMap::default(),
            "2025-01-01",
            "2025-01-31",
            &AggregateFilters::default(),
        )
        .unwrap();
        assert!(result.is_empty());
        assert_eq!(serde_json::to_string(&result).unwrap(), "{}");
    }

    fn seed(conn: &Connection) {
        insert_primary(
            conn,
            "J1",
            &[
                (JC_YJ_CODE, "YJ1"),
                (JC_PRODUCT_NAME, "ロキソニン錠60mg"),
                (JC_PACKAGING_FORM, "PTP"),
                (JC_QUANTITY_PER_PACK, "100"),
                (JC_PACKAGING_UNIT, "錠"),
                (JC_INNER_QUANTITY, "10"),
                (JC_TOTAL_QUANTITY, "10"),
                (JC_DOYAKU, "0"),
            ],
        );
        insert_barcode(conn, "J1", &[(JA_INNER_QUANTITY, "99"), (JA_UNIT_CODE, "7")]);
        conn.execute_batch(
            "
            INSERT INTO dat_records
                (date, flag, receipt_number, line_number, jan_code, product_name, quantity)
            VALUES ('20250603', '1', 'R1', '01', 'J1', 'DAT名', '00002'),
                   ('20250601', '2', 'R2', '01', 'J1', 'DAT名', '00001');
            INSERT INTO usage_records
                (date, yj_code, jan_code, product_name, amount, unit_code, unit_name)
            VALUES ('20250602', 'YJ1', 'J1', '処方名', '15', '1', '錠'),
                   ('20250602', 'YJ9', 'J9', '院内製剤', '3', '2', 'mL');
            INSERT INTO inventory_records
                (date, jan_code, yj_code, product_name, pack_quantity, stock_count)
            VALUES ('20250630', 'J1', 'YJ1', '棚卸名', '10', '4');
            INSERT INTO movement_records
                (jan_code, date, kind, barcode_quantity, receipt_number, line_number)
            VALUES ('J1', '20250615', 2, '3', 'M1', 1);
            INSERT INTO dat_records (date, flag, receipt_number, line_number, jan_code, quantity)
            VALUES ('20250701', '1', 'R3', '01', 'J1', '00009');
            ",
        )
        .unwrap();
    }

    #[test]
    fn merges_all_sources_into_one_packaging_group() {
        let db = TestDb::new();
        let conn = db.connect();
        seed(&conn);
        let units = UnitMap::from_pairs([("7", "箱")]);

        let result =
            aggregate(&conn, &units, "2025-06-01", "2025-06-30", &AggregateFilters::default())
                .unwrap();
        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["YJ1", "YJ9"]);

        let yj1 = &result["YJ1"];
        assert_eq!(yj1.product_name, "ロキソニン錠60mg");
        let list = &yj1.groups["PTP10錠"];
        let summary = list
            .iter()
            .map(|d| (d.date.as_str(), d.kind.as_str(), d.quantity.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("20250601", "返品", "10"),
                ("20250602", "処方", "15"),
                ("20250603", "納品", "20"),
                ("20250615", "入庫", "30"),
                ("20250630", "棚卸", "40"),
            ]
        );
        assert_eq!(list[0].packaging, "PTP100錠(10錠×10箱)");

        // catalog-less usage row falls back to what the row recorded
        let yj9 = &result["YJ9"];
        assert_eq!(yj9.product_name, "院内製剤");
        let only = yj9.groups.values().next().unwrap();
        assert_eq!(only[0].unit, "mL");
        assert_eq!(only[0].quantity, "3");
    }

    #[test]
    fn filters_restrict_rows() {
        let db = TestDb::new();
        let conn = db.connect();
        seed(&conn);
        let units = UnitMap::default();

        let by_name = AggregateFilters {
            name: Some("院内".into()),
            ..AggregateFilters::default()
        };
        let result = aggregate(&conn, &units, "20250601", "20250630", &by_name).unwrap();
        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["YJ9"]);

        let poison = AggregateFilters {
            categories: vec![ControlCategory::Poison],
            ..AggregateFilters::default()
        };
        assert!(aggregate(&conn, &units, "20250601", "20250630", &poison).unwrap().is_empty());
    }

    #[test]
    fn overflowing_stock_quantity_reports_zero() {
        let db = TestDb::new();
        let conn = db.connect();
        conn.execute_batch(
            "
            INSERT INTO inventory_records
                (date, jan_code, yj_code, product_name, pack_quantity, stock_count)
            VALUES ('20250630', 'J8', 'YJ8', '大量在庫', '9999999999', '9999999999'),
                   ('20250630', 'J7', 'YJ7', '通常在庫', '10', '3');
            ",
        )
        .unwrap();

        let result = aggregate(
            &conn,
            &UnitMap::default(),
            "20250601",
            "20250630",
            &AggregateFilters::default(),
        )
        .unwrap();
        let quantity = |yj: &str| {
            let list = result[yj].groups.values().next().unwrap();
            list[0].quantity.clone()
        };
        assert_eq!(quantity("YJ8"), "0");
        assert_eq!(quantity("YJ7"), "30");
    }

    #[test]
    fn broken_source_aborts_with_its_tag() {
        let db = TestDb::new();
        let conn = db.connect();
        conn.execute_batch("DROP TABLE inventory_records;").unwrap();
        let err = aggregate(
            &conn,
            &UnitMap::default(),
            "20250601",
            "20250630",
            &AggregateFilters::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "aggregate INVENTORY query");
    }
}
