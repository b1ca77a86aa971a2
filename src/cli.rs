use clap::{Parser, Subcommand};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "yamato-backend")]
#[command(about = "Pharmacy distribution records backend (SQLite)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database schema and refresh both product catalogs from CSV.
    Load(LoadArgs),
    /// Serve the HTTP API (refreshes catalogs first unless told not to).
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct LoadArgs {
    /// Backend data directory (holds the SQLite database).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Directory with JCSHMS.CSV, JANCODE.CSV and TANI.CSV (default: <data-dir>/SOU).
    #[arg(long)]
    pub source_dir: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Backend data directory (holds the SQLite database).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Directory with JCSHMS.CSV, JANCODE.CSV and TANI.CSV (default: <data-dir>/SOU).
    #[arg(long)]
    pub source_dir: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Upper bound on a single multipart upload body, in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Serve against the catalogs already in the database.
    #[arg(long)]
    pub skip_catalog_load: bool,
}
