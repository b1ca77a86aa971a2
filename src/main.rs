mod aggregate;
mod canonical;
mod catalog;
mod cli;
mod fallback;
mod ingest;
mod load;
mod resolver;
mod sequence;
mod server;
mod storage;
mod text;
mod units;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Load(cmd) => load::run(cmd).await.context("load failed"),
        cli::Command::Serve(cmd) => server::run(cmd).await.context("serve failed"),
    }
}
