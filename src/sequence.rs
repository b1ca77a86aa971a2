use anyhow::{Context, bail};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

pub const PRODUCT: &str = "product";
pub const CLASSIFICATION: &str = "classification";
pub const CLIENT: &str = "client";

pub const NAMESPACES: [&str; 3] = [PRODUCT, CLASSIFICATION, CLIENT];

/// Issues the next code for `namespace`, e.g. `classification00000042`.
/// A missing counter row is an error and is never created here.
pub fn next_sequence(conn: &mut Connection, namespace: &str) -> anyhow::Result<String> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .with_context(|| format!("begin sequence tx for {namespace}"))?;

    let last: Option<i64> = tx
        .query_row(
            "SELECT last_no FROM code_sequences WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("select last_no for {namespace}"))?;
    let Some(last) = last else {
        bail!("sequence namespace {namespace:?} is not configured");
    };

    let next = last + 1;
    tx.execute(
        "UPDATE code_sequences SET last_no = ?1 WHERE namespace = ?2",
        params![next, namespace],
    )
    .with_context(|| format!("update last_no for {namespace}"))?;
    tx.commit()
        .with_context(|| format!("commit sequence tx for {namespace}"))?;

    let code = format!("{namespace}{next:08}");
    tracing::debug!("sequence {} issued {}", namespace, code);
    Ok(code)
}

/// Fails if any required namespace has no counter row.
pub fn verify_namespaces(conn: &Connection) -> anyhow::Result<()> {
    let mut stmt = conn
        .prepare("SELECT 1 FROM code_sequences WHERE namespace = ?1")
        .context("prepare namespace check")?;
    for namespace in NAMESPACES {
        let present = stmt
            .query_row([namespace], |_| Ok(()))
            .optional()
            .with_context(|| format!("check namespace {namespace}"))?
            .is_some();
        if !present {
            bail!("sequence namespace {namespace:?} is missing from code_sequences");
        }
    }
    Ok(())
}
