use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use crate::canonical::{self, CanonicalRecord};
use crate::catalog::{self, CatalogKind, CatalogRecord};
use crate::fallback::{self, FallbackRecord, PackagingAttributes};
use crate::text::parse_count;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record: CanonicalRecord,
    pub was_created: bool,
}

enum Policy<'a> {
    /// Never write a record for a code no catalog knows.
    Strict,
    /// Store the code with the caller's display name when no catalog knows it.
    Lenient { fallback_name: &'a str },
}

// Lookup order is cache, canonical store, then both catalogs. The one mutex is
// held for the whole lookup, store round trips included. Races with other
// processes are absorbed by insert-if-absent.
#[derive(Debug, Default)]
pub struct Resolver {
    cache: Mutex<HashMap<String, CanonicalRecord>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CanonicalRecord>> {
        // The map holds only fully built records, so a poisoned lock is still usable.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves `code` without creating anything for codes absent from both catalogs.
    pub fn resolve_strict(
        &self,
        conn: &mut Connection,
        code: &str,
    ) -> anyhow::Result<Option<Resolution>> {
        let mut cache = self.lock();
        resolve_locked(&mut cache, conn, code, Policy::Strict)
    }

    /// Resolves `code`, always producing a record. Used by every ingestion path.
    pub fn resolve_or_fallback(
        &self,
        conn: &mut Connection,
        code: &str,
        fallback_name: &str,
    ) -> anyhow::Result<Resolution> {
        let mut cache = self.lock();
        let policy = Policy::Lenient { fallback_name };
        resolve_locked(&mut cache, conn, code, policy)?
            .ok_or_else(|| anyhow::anyhow!("lenient resolution of {code:?} produced no record"))
    }

    /// Registers a fallback for `code` (minting codes if needed) and then
    /// overwrites its descriptive attributes. An empty `code` always gets a
    /// freshly minted product code.
    pub fn upsert_fallback(
        &self,
        conn: &mut Connection,
        code: &str,
        name: &str,
        packaging: &PackagingAttributes,
    ) -> anyhow::Result<FallbackRecord> {
        let _cache = self.lock();
        let code = if code.is_empty() {
            crate::sequence::next_sequence(conn, crate::sequence::PRODUCT)?
        } else {
            code.to_string()
        };
        let mut rec = fallback::register(conn, &code, name, packaging)?;
        fallback::update_attributes(conn, &rec.product_code, name, packaging)?;
        rec.product_name = name.to_string();
        rec.packaging = packaging.clone();
        Ok(rec)
    }

    #[cfg(test)]
    pub fn cached(&self, code: &str) -> Option<CanonicalRecord> {
        self.lock().get(code).cloned()
    }
}

fn resolve_locked(
    cache: &mut HashMap<String, CanonicalRecord>,
    conn: &mut Connection,
    code: &str,
    policy: Policy<'_>,
) -> anyhow::Result<Option<Resolution>> {
    if let Some(hit) = cache.get(code).cloned() {
        tracing::debug!("resolve {:?}: cache hit", code);
        return finish(cache, conn, hit, false).map(Some);
    }

    if let Some(stored) = canonical::get(conn, code)? {
        tracing::debug!("resolve {:?}: found in canonical store", code);
        return finish(cache, conn, stored, false).map(Some);
    }

    let primary = lookup_best_effort(conn, CatalogKind::Primary, code);
    let barcode = lookup_best_effort(conn, CatalogKind::Barcode, code);

    let mut built = match canonical::from_catalogs(code, primary.as_ref(), barcode.as_ref()) {
        Some(rec) => rec,
        None => match policy {
            Policy::Strict => {
                tracing::debug!("resolve {:?}: no catalog match, nothing written", code);
                return Ok(None);
            }
            Policy::Lenient { fallback_name } => CanonicalRecord {
                jan_code: code.to_string(),
                product_name: fallback_name.to_string(),
                ..CanonicalRecord::default()
            },
        },
    };

    // Mint before writing, so a failed mint leaves no half-built row behind.
    if built.yj_code.is_empty() {
        built.yj_code = register_classification(conn, &built)?;
    }

    let was_created = canonical::insert_if_absent(conn, &built)?;
    if was_created {
        tracing::info!("canonical record created for {:?} yj={:?}", code, built.yj_code);
    }
    // A lost race leaves the winner's row in place; return that one.
    let stored = canonical::get(conn, code)?.unwrap_or(built);
    finish(cache, conn, stored, was_created).map(Some)
}

fn lookup_best_effort(conn: &Connection, kind: CatalogKind, code: &str) -> Option<CatalogRecord> {
    match catalog::lookup(conn, kind, code) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!("catalog lookup failed, treating as no match: {:#}", e);
            None
        }
    }
}

fn finish(
    cache: &mut HashMap<String, CanonicalRecord>,
    conn: &mut Connection,
    mut record: CanonicalRecord,
    was_created: bool,
) -> anyhow::Result<Resolution> {
    if record.yj_code.is_empty() {
        backfill_classification(conn, &mut record)?;
    }
    cache.insert(record.jan_code.clone(), record.clone());
    Ok(Resolution {
        record,
        was_created,
    })
}

fn register_classification(
    conn: &mut Connection,
    record: &CanonicalRecord,
) -> anyhow::Result<String> {
    let packaging = PackagingAttributes {
        form: record.packaging_form.clone(),
        unit_code: record.packaging_unit.clone(),
        total_quantity: parse_count(&record.quantity_per_pack),
        barcode_quantity: parse_count(&record.inner_quantity),
        barcode_unit_code: record.sub_unit_code.clone(),
        barcode_total_quantity: parse_count(&record.total_quantity),
    };
    let registered =
        fallback::register(conn, &record.jan_code, &record.product_name, &packaging)?;
    Ok(registered.classification_code)
}

fn backfill_classification(
    conn: &mut Connection,
    record: &mut CanonicalRecord,
) -> anyhow::Result<()> {
    let classification = register_classification(conn, record)?;
    canonical::backfill_classification(conn, &record.jan_code, &classification)?;
    tracing::info!("classification backfilled for {:?}: {}", record.jan_code, classification);
    record.yj_code = classification;
    Ok(())
}
