use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::aggregate::{self, AggregateFilters, ControlCategory};
use crate::canonical::{self, CanonicalRecord};
use crate::catalog;
use crate::cli::ServeArgs;
use crate::fallback::{self, PackagingAttributes};
use crate::ingest::{dat, inventory, movement, usage};
use crate::load;
use crate::resolver::Resolver;
use crate::storage::{self, StoragePaths};
use crate::units::UnitMap;

const DAT_FIELD: &str = "datFileInput[]";
const USAGE_FIELD: &str = "usageFileInput[]";
const INVENTORY_FIELD: &str = "inventoryFile";

#[derive(Clone)]
struct AppState {
    db_path: PathBuf,
    resolver: Arc<Resolver>,
    units: Arc<UnitMap>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    tracing::info!("yamato-backend serve");
    let paths = StoragePaths::new(&opts.data_dir, opts.source_dir.as_deref());
    paths
        .ensure_dirs()
        .context("create backend data directory")?;

    let skip_catalog_load = opts.skip_catalog_load;
    let startup_paths = paths.clone();
    let units = tokio::task::spawn_blocking(move || -> anyhow::Result<UnitMap> {
        tracing::info!("Step 1/3: open SQLite + apply schema");
        let mut conn = load::open_and_migrate(&startup_paths.db_path)?;

        if skip_catalog_load {
            tracing::info!("Step 2/3: catalog refresh skipped");
        } else {
            tracing::info!("Step 2/3: refresh product catalogs");
            load::refresh_catalogs(&mut conn, &startup_paths)?;
        }

        tracing::info!("Step 3/3: load unit names");
        Ok(UnitMap::load_or_empty(&startup_paths.source_files().units))
    })
    .await
    .context("startup task panicked")??;

    let state = AppState {
        db_path: paths.db_path.clone(),
        resolver: Arc::new(Resolver::new()),
        units: Arc::new(units),
    };
    let app = router(state, opts.max_upload_bytes);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/aggregate", get(api_aggregate))
        .route("/uploadDat", post(api_upload_dat))
        .route("/uploadUsage", post(api_upload_usage))
        .route("/uploadInventory", post(api_upload_inventory))
        .route("/api/inout", get(api_list_clients).post(api_save_client))
        .route("/api/inout/search", get(api_product_search))
        .route("/api/inout/save", post(api_save_movements))
        .route("/api/ma2", get(api_list_fallbacks))
        .route("/api/ma2/upsert", post(api_upsert_fallback))
        .route("/api/tani", get(api_units))
        .route("/api/productName", get(api_product_name))
        .route("/api/ma0", get(api_canonical_record))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs `f` on a blocking thread with its own connection.
async fn with_conn<T, F>(st: &AppState, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
{
    let db_path = st.db_path.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = storage::connect(&db_path)?;
        f(&mut conn)
    })
    .await
    .context("request task panicked")?
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!("request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, msg.into()).into_response()
}

fn json_or_500<T: Serialize>(r: anyhow::Result<T>) -> Response {
    match r {
        Ok(v) => Json(v).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AggregateParams {
    from: Option<String>,
    to: Option<String>,
    filter: Option<String>,
    kouseishinyaku: Option<String>,
    #[serde(flatten)]
    flags: BTreeMap<String, String>,
}

impl AggregateParams {
    fn filters(&self) -> AggregateFilters {
        let categories = ControlCategory::ALL
            .into_iter()
            .filter(|c| self.flags.get(c.param()).map(String::as_str) == Some("1"))
            .collect();
        let filters = AggregateFilters {
            name: self.filter.clone(),
            categories,
            psychotropic: Vec::new(),
        };
        match self.kouseishinyaku.as_deref() {
            Some(raw) => filters.with_psychotropic_list(raw),
            None => filters,
        }
    }
}

async fn api_aggregate(
    State(st): State<AppState>,
    Query(p): Query<AggregateParams>,
) -> impl IntoResponse {
    let (Some(from), Some(to)) = (p.from.clone(), p.to.clone()) else {
        return bad_request("from and to are required");
    };
    if from.trim().is_empty() || to.trim().is_empty() {
        return bad_request("from and to are required");
    }
    let filters = p.filters();
    let units = st.units.clone();
    json_or_500(
        with_conn(&st, move |conn| {
            aggregate::aggregate(conn, &units, &from, &to, &filters)
        })
        .await,
    )
}

/// Reads every file posted under `field`. Other fields are ignored.
async fn read_files(mut multipart: Multipart, field: &str) -> Result<Vec<Vec<u8>>, Response> {
    let mut files = Vec::new();
    loop {
        let next = match multipart.next_field().await {
            Ok(next) => next,
            Err(e) => return Err(bad_request(format!("read multipart form: {e}"))),
        };
        let Some(part) = next else { break };
        if part.name() != Some(field) {
            continue;
        }
        let file_name = part.file_name().unwrap_or("").to_string();
        match part.bytes().await {
            Ok(bytes) => {
                tracing::info!("received {} ({} bytes) under {}", file_name, bytes.len(), field);
                files.push(bytes.to_vec());
            }
            Err(e) => return Err(bad_request(format!("read {field} upload: {e}"))),
        }
    }
    Ok(files)
}

async fn api_upload_dat(State(st): State<AppState>, multipart: Multipart) -> impl IntoResponse {
    let files = match read_files(multipart, DAT_FIELD).await {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let records = files.iter().flat_map(|f| dat::parse(f)).collect::<Vec<_>>();
    let resolver = st.resolver.clone();
    json_or_500(with_conn(&st, move |conn| dat::ingest(conn, &resolver, records)).await)
}

async fn api_upload_usage(State(st): State<AppState>, multipart: Multipart) -> impl IntoResponse {
    let files = match read_files(multipart, USAGE_FIELD).await {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let mut records = Vec::new();
    for file in &files {
        match usage::parse(file) {
            Ok(rows) => records.extend(rows),
            Err(e) => return bad_request(format!("{e:#}")),
        }
    }
    let (resolver, units) = (st.resolver.clone(), st.units.clone());
    json_or_500(with_conn(&st, move |conn| usage::ingest(conn, &resolver, &units, records)).await)
}

async fn api_upload_inventory(
    State(st): State<AppState>,
    multipart: Multipart,
) -> impl IntoResponse {
    let files = match read_files(multipart, INVENTORY_FIELD).await {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let Some(file) = files.into_iter().next() else {
        return bad_request(format!("missing {INVENTORY_FIELD} upload"));
    };
    let records = match inventory::parse(&file, &st.units) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("{e:#}")),
    };
    let resolver = st.resolver.clone();
    json_or_500(with_conn(&st, move |conn| inventory::ingest(conn, &resolver, records)).await)
}

async fn api_list_clients(State(st): State<AppState>) -> impl IntoResponse {
    json_or_500(with_conn(&st, |conn| movement::list_clients(conn)).await)
}

#[derive(Debug, Deserialize)]
struct NewClient {
    name: String,
    #[serde(rename = "oroshicode", default)]
    oroshi_code: String,
}

async fn api_save_client(
    State(st): State<AppState>,
    Json(body): Json<NewClient>,
) -> impl IntoResponse {
    if body.name.trim().is_empty() {
        return bad_request("name is required");
    }
    json_or_500(
        with_conn(&st, move |conn| {
            movement::save_client(conn, body.name.trim(), &body.oroshi_code)
        })
        .await,
    )
}

#[derive(Debug, Deserialize)]
struct ProductSearchParams {
    #[serde(default)]
    name: String,
    #[serde(default)]
    spec: String,
}

async fn api_product_search(
    State(st): State<AppState>,
    Query(p): Query<ProductSearchParams>,
) -> impl IntoResponse {
    json_or_500(with_conn(&st, move |conn| catalog::search_products(conn, &p.name, &p.spec)).await)
}

async fn api_save_movements(
    State(st): State<AppState>,
    Json(records): Json<Vec<movement::MovementRecord>>,
) -> impl IntoResponse {
    let resolver = st.resolver.clone();
    json_or_500(with_conn(&st, move |conn| movement::ingest(conn, &resolver, records)).await)
}

async fn api_list_fallbacks(State(st): State<AppState>) -> impl IntoResponse {
    json_or_500(with_conn(&st, |conn| fallback::list(conn)).await)
}

/// Fallback registration form. Unit fields may carry names or codes.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FallbackUpsert {
    jan_code: String,
    product_name: String,
    form: String,
    unit_code: String,
    total_quantity: i64,
    barcode_quantity: i64,
    barcode_unit_code: String,
    barcode_total_quantity: i64,
}

async fn api_upsert_fallback(
    State(st): State<AppState>,
    Json(body): Json<FallbackUpsert>,
) -> impl IntoResponse {
    let packaging = PackagingAttributes {
        form: body.form,
        unit_code: st.units.to_code(&body.unit_code),
        total_quantity: body.total_quantity,
        barcode_quantity: body.barcode_quantity,
        barcode_unit_code: st.units.to_code(&body.barcode_unit_code),
        barcode_total_quantity: body.barcode_total_quantity,
    };
    let code = body.jan_code.trim().to_string();
    let name = body.product_name;
    let resolver = st.resolver.clone();
    json_or_500(
        with_conn(&st, move |conn| {
            resolver.upsert_fallback(conn, &code, &name, &packaging)
        })
        .await,
    )
}

async fn api_units(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.units.as_map().clone())
}

#[derive(Debug, Deserialize)]
struct ProductNameParams {
    yj: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProductNameResponse {
    product_name: String,
}

async fn api_product_name(
    State(st): State<AppState>,
    Query(p): Query<ProductNameParams>,
) -> impl IntoResponse {
    let Some(yj) = p.yj.filter(|s| !s.trim().is_empty()) else {
        return bad_request("yj is required");
    };
    json_or_500(
        with_conn(&st, move |conn| {
            let product_name = canonical::product_name_for_classification(conn, yj.trim())?;
            Ok(ProductNameResponse { product_name })
        })
        .await,
    )
}

#[derive(Debug, Deserialize)]
struct CanonicalParams {
    jan: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalLookup {
    #[serde(flatten)]
    record: CanonicalRecord,
    was_created: bool,
}

/// Catalog-backed lookup. Codes no catalog knows are a 404 and nothing is stored.
async fn api_canonical_record(
    State(st): State<AppState>,
    Query(p): Query<CanonicalParams>,
) -> impl IntoResponse {
    let Some(jan) = p.jan.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) else {
        return bad_request("jan is required");
    };
    let resolver = st.resolver.clone();
    match with_conn(&st, move |conn| resolver.resolve_strict(conn, &jan)).await {
        Ok(Some(found)) => Json(CanonicalLookup {
            record: found.record,
            was_created: found.was_created,
        })
        .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "code not found in any catalog").into_response(),
        Err(e) => internal_error(e),
    }
}
