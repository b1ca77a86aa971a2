use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rusqlite::Connection;

use crate::catalog::CatalogKind;
use crate::sequence::NAMESPACES;

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub source_dir: PathBuf,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceFiles {
    pub primary_catalog: PathBuf,
    pub barcode_catalog: PathBuf,
    pub units: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>, source_dir: Option<&str>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let source_dir = source_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("SOU"));
        let db_path = data_dir.join("yamato.db");

        Self {
            data_dir,
            source_dir,
            db_path,
        }
    }

    pub fn source_files(&self) -> SourceFiles {
        SourceFiles {
            primary_catalog: self.source_dir.join("JCSHMS.CSV"),
            barcode_catalog: self.source_dir.join("JANCODE.CSV"),
            units: self.source_dir.join("TANI.CSV"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}

/// Opens a connection with the pragmas every caller relies on.
pub fn connect(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open sqlite at {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))
        .context("set busy timeout")?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        .context("set connection pragmas")?;
    Ok(conn)
}

fn catalog_ddl(kind: CatalogKind) -> String {
    let columns = (0..kind.column_count())
        .map(|i| {
            let name = kind.column_name(i);
            if i == kind.key_index() {
                format!("{name} TEXT PRIMARY KEY")
            } else {
                format!("{name} TEXT NOT NULL DEFAULT ''")
            }
        })
        .collect::<Vec<_>>()
        .join(",\n  ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {columns}\n);",
        kind.table()
    )
}

fn canonical_ddl() -> String {
    let catalog_columns = [CatalogKind::Primary, CatalogKind::Barcode]
        .into_iter()
        .flat_map(|kind| (0..kind.column_count()).map(move |i| kind.column_name(i)))
        .map(|name| format!(",\n  {name} TEXT NOT NULL DEFAULT ''"))
        .collect::<String>();
    format!(
        "CREATE TABLE IF NOT EXISTS ma0 (
  jan_code TEXT PRIMARY KEY,
  yj_code TEXT NOT NULL DEFAULT '',
  product_name TEXT NOT NULL DEFAULT '',
  spec_text TEXT NOT NULL DEFAULT '',
  generic_name TEXT NOT NULL DEFAULT '',
  maker_name TEXT NOT NULL DEFAULT '',
  packaging_form TEXT NOT NULL DEFAULT '',
  quantity_per_pack TEXT NOT NULL DEFAULT '',
  packaging_unit TEXT NOT NULL DEFAULT '',
  inner_quantity TEXT NOT NULL DEFAULT '',
  total_quantity TEXT NOT NULL DEFAULT '',
  sub_unit_code TEXT NOT NULL DEFAULT '',
  dispensing_unit_code TEXT NOT NULL DEFAULT '',
  unit_price TEXT NOT NULL DEFAULT '',
  doyaku TEXT NOT NULL DEFAULT '',
  gekiyaku TEXT NOT NULL DEFAULT '',
  mayaku TEXT NOT NULL DEFAULT '',
  kouseishinyaku TEXT NOT NULL DEFAULT '',
  kakuseizai TEXT NOT NULL DEFAULT '',
  kakuseizai_genryou TEXT NOT NULL DEFAULT ''{catalog_columns}
);"
    )
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(&catalog_ddl(CatalogKind::Primary))
        .context("create primary catalog table")?;
    conn.execute_batch(&catalog_ddl(CatalogKind::Barcode))
        .context("create barcode catalog table")?;
    conn.execute_batch(&canonical_ddl())
        .context("create canonical store table")?;

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_jcshms_yj ON jcshms(jc009);

        CREATE TABLE IF NOT EXISTS code_sequences (
            namespace TEXT PRIMARY KEY,
            last_no INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ma0_yj ON ma0(yj_code);

        CREATE TABLE IF NOT EXISTS ma2 (
            product_code TEXT PRIMARY KEY,
            source_code TEXT NOT NULL UNIQUE,
            classification_code TEXT NOT NULL UNIQUE,
            product_name TEXT NOT NULL DEFAULT '',
            packaging_form TEXT NOT NULL DEFAULT '',
            packaging_unit_code TEXT NOT NULL DEFAULT '',
            total_quantity INTEGER NOT NULL DEFAULT 0,
            barcode_quantity INTEGER NOT NULL DEFAULT 0,
            barcode_unit_code TEXT NOT NULL DEFAULT '',
            barcode_total_quantity INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS dat_records (
            oroshi_code TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL,
            flag TEXT NOT NULL DEFAULT '',
            receipt_number TEXT NOT NULL,
            line_number TEXT NOT NULL,
            jan_code TEXT NOT NULL,
            product_name TEXT NOT NULL DEFAULT '',
            quantity TEXT NOT NULL DEFAULT '',
            unit_price TEXT NOT NULL DEFAULT '',
            subtotal TEXT NOT NULL DEFAULT '',
            package_price TEXT NOT NULL DEFAULT '',
            expiry_date TEXT NOT NULL DEFAULT '',
            lot_number TEXT NOT NULL DEFAULT '',
            organized INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (date, receipt_number, line_number, jan_code)
        );
        CREATE INDEX IF NOT EXISTS idx_dat_records_date ON dat_records(date);

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            yj_code TEXT NOT NULL DEFAULT '',
            jan_code TEXT NOT NULL,
            product_name TEXT NOT NULL DEFAULT '',
            amount TEXT NOT NULL DEFAULT '',
            unit_code TEXT NOT NULL DEFAULT '',
            unit_name TEXT NOT NULL DEFAULT '',
            organized INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_date ON usage_records(date);

        CREATE TABLE IF NOT EXISTS inventory_records (
            date TEXT NOT NULL,
            jan_code TEXT NOT NULL,
            yj_code TEXT NOT NULL DEFAULT '',
            product_name TEXT NOT NULL DEFAULT '',
            pack_unit_code TEXT NOT NULL DEFAULT '',
            pack_quantity TEXT NOT NULL DEFAULT '',
            stock_count TEXT NOT NULL DEFAULT '',
            stock_quantity TEXT NOT NULL DEFAULT '',
            barcode_unit_code TEXT NOT NULL DEFAULT '',
            organized INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (date, jan_code)
        );

        CREATE TABLE IF NOT EXISTS movement_records (
            jan_code TEXT NOT NULL,
            date TEXT NOT NULL,
            kind INTEGER NOT NULL,
            barcode_quantity TEXT NOT NULL DEFAULT '',
            barcode_unit TEXT NOT NULL DEFAULT '',
            quantity TEXT NOT NULL DEFAULT '',
            unit TEXT NOT NULL DEFAULT '',
            packaging TEXT NOT NULL DEFAULT '',
            unit_price TEXT NOT NULL DEFAULT '',
            subtotal TEXT NOT NULL DEFAULT '',
            expiry_date TEXT NOT NULL DEFAULT '',
            lot_number TEXT NOT NULL DEFAULT '',
            oroshi_code TEXT NOT NULL DEFAULT '',
            receipt_number TEXT NOT NULL DEFAULT '',
            line_number INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (date, receipt_number, line_number, jan_code)
        );
        CREATE INDEX IF NOT EXISTS idx_movement_records_date ON movement_records(date);

        CREATE TABLE IF NOT EXISTS clients (
            client_code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            oroshi_code TEXT NOT NULL DEFAULT ''
        );
        ",
    )
    .context("create record tables")?;

    for namespace in NAMESPACES {
        conn.execute(
            "INSERT OR IGNORE INTO code_sequences (namespace, last_no) VALUES (?1, 0)",
            [namespace],
        )
        .with_context(|| format!("seed sequence namespace {namespace}"))?;
    }
    Ok(())
}

pub fn table_count(conn: &Connection, table: &str) -> anyhow::Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let n: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .with_context(|| format!("count rows in {table}"))?;
    Ok(n)
}
