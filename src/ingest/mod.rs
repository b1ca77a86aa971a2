pub mod dat;
pub mod inventory;
pub mod movement;
pub mod usage;

use rusqlite::Connection;

use crate::catalog::{self, CatalogKind};

/// 1 when the code is present in the primary catalog, else 0.
pub(crate) fn organized_flag(conn: &Connection, code: &str) -> i64 {
    match catalog::contains(conn, CatalogKind::Primary, code) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            tracing::warn!("organized flag for {:?}: {:#}", code, e);
            0
        }
    }
}
