use std::path::Path;

use anyhow::Context;
use rusqlite::Connection;

use crate::catalog::{self, CatalogKind};
use crate::cli::LoadArgs;
use crate::sequence;
use crate::storage::{self, StoragePaths, file_present_nonempty};

pub async fn run(opts: LoadArgs) -> anyhow::Result<()> {
    tracing::info!("yamato-backend load");
    tracing::info!("data_dir={}", opts.data_dir);

    let paths = StoragePaths::new(&opts.data_dir, opts.source_dir.as_deref());
    paths
        .ensure_dirs()
        .context("create backend data directory")?;
    tracing::info!("source_dir={}", paths.source_dir.display());

    tokio::task::spawn_blocking(move || load_blocking(&paths))
        .await
        .context("load task panicked")?
}

fn load_blocking(paths: &StoragePaths) -> anyhow::Result<()> {
    tracing::info!("Step 1/3: open SQLite + apply schema");
    let mut conn = open_and_migrate(&paths.db_path)?;

    tracing::info!("Step 2/3: refresh product catalogs");
    refresh_catalogs(&mut conn, paths)?;

    tracing::info!("Step 3/3: table counts");
    let tables = [
        "jcshms",
        "jancode",
        "ma0",
        "ma2",
        "dat_records",
        "usage_records",
        "inventory_records",
    ];
    for table in tables {
        tracing::info!("{}: {} rows", table, storage::table_count(&conn, table)?);
    }
    Ok(())
}

/// Opens the database, applies the schema and checks every sequence
/// namespace is configured.
pub fn open_and_migrate(db_path: &Path) -> anyhow::Result<Connection> {
    let conn = storage::connect(db_path)?;
    storage::init_schema(&conn).context("apply schema")?;
    sequence::verify_namespaces(&conn).context("verify sequence namespaces")?;
    tracing::info!("SQLite ready: {}", db_path.display());
    Ok(conn)
}

/// Replaces both catalog tables from the source directory. A missing file
/// leaves the existing table untouched.
pub fn refresh_catalogs(conn: &mut Connection, paths: &StoragePaths) -> anyhow::Result<()> {
    let sources = paths.source_files();
    let files = [
        (CatalogKind::Primary, sources.primary_catalog),
        (CatalogKind::Barcode, sources.barcode_catalog),
    ];
    for (kind, path) in files {
        if !file_present_nonempty(&path) {
            tracing::warn!(
                "{} not found or empty; keeping current {} rows",
                path.display(),
                kind.table()
            );
            continue;
        }
        let t0 = std::time::Instant::now();
        let n = catalog::load_csv(conn, kind, &path)
            .with_context(|| format!("load {}", path.display()))?;
        tracing::info!(
            "Loaded {} rows into {} in {:.1}s",
            n,
            kind.table(),
            t0.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sjis;

    #[test]
    fn refresh_skips_missing_files_and_loads_present_ones() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = StoragePaths::new(dir.path(), None);
        std::fs::create_dir_all(&paths.source_dir).unwrap();

        let mut conn = open_and_migrate(&paths.db_path).unwrap();
        refresh_catalogs(&mut conn, &paths).unwrap();
        assert_eq!(storage::table_count(&conn, "jcshms").unwrap(), 0);

        std::fs::write(
            paths.source_files().barcode_catalog,
            sjis("header,code\nx,4987000000011,y\nx,4987000000028\n"),
        )
        .unwrap();
        refresh_catalogs(&mut conn, &paths).unwrap();
        assert_eq!(storage::table_count(&conn, "jancode").unwrap(), 2);
        assert_eq!(storage::table_count(&conn, "jcshms").unwrap(), 0);
    }

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("yamato.db");
        drop(open_and_migrate(&db).unwrap());
        let conn = open_and_migrate(&db).unwrap();
        let n = storage::table_count(&conn, "code_sequences").unwrap();
        assert_eq!(n, sequence::NAMESPACES.len() as i64);
    }
}
