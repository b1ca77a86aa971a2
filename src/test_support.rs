use std::path::Path;

use rusqlite::{Connection, params_from_iter};
use tempfile::TempDir;

use crate::catalog::CatalogKind;

/// A migrated SQLite file in a temp dir. Dropped with the test.
pub struct TestDb {
    dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let db = Self { dir };
        let conn = db.connect();
        crate::storage::init_schema(&conn).expect("init schema");
        db
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("yamato.db")
    }

    pub fn connect(&self) -> Connection {
        crate::storage::connect(&self.path()).expect("open test db")
    }
}

fn insert_catalog_row(conn: &Connection, kind: CatalogKind, code: &str, cells: &[(usize, &str)]) {
    let mut columns = vec![String::new(); kind.column_count()];
    columns[kind.key_index()] = code.to_string();
    for (idx, value) in cells {
        columns[*idx] = value.to_string();
    }
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("INSERT OR REPLACE INTO {} VALUES ({placeholders})", kind.table()),
        params_from_iter(columns.iter()),
    )
    .expect("insert catalog row");
}

pub fn insert_primary(conn: &Connection, code: &str, cells: &[(usize, &str)]) {
    insert_catalog_row(conn, CatalogKind::Primary, code, cells);
}

pub fn insert_barcode(conn: &Connection, code: &str, cells: &[(usize, &str)]) {
    insert_catalog_row(conn, CatalogKind::Barcode, code, cells);
}

/// Shift-JIS bytes for test fixtures.
pub fn sjis(text: &str) -> Vec<u8> {
    let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode(text);
    bytes.into_owned()
}
