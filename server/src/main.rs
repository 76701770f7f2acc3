use anyhow::Result;
use axum::Router;
use clap::{Parser, ValueEnum};
use server::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};
use visearch_core::engine::EngineOptions;
use visearch_core::{IterStrategy, Residency, Scoring};

#[derive(Clone, Copy, ValueEnum)]
enum ResidencyArg { InMemory, OnDemand }

#[derive(Clone, Copy, ValueEnum)]
enum ScoringArg { Tfidf, Burstiness }

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg { Online, Precomputed }

#[derive(Parser)]
struct Args {
    /// Directory holding <name>/<version>/ engine indexes
    #[arg(long, default_value = "./engines")]
    data_dir: PathBuf,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Indexer executable used by index_start
    #[arg(long, default_value = "indexer")]
    indexer_bin: PathBuf,
    #[arg(long, value_enum, default_value_t = ResidencyArg::InMemory)]
    residency: ResidencyArg,
    #[arg(long, value_enum, default_value_t = ScoringArg::Tfidf)]
    scoring: ScoringArg,
    #[arg(long, value_enum, default_value_t = StrategyArg::Online)]
    strategy: StrategyArg,
    /// Do not load engines on their first query
    #[arg(long, default_value_t = false)]
    no_auto_load: bool,
    /// Engines to load at startup, as name/version
    #[arg(long)]
    preload: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    let options = EngineOptions {
        residency: match args.residency { ResidencyArg::InMemory => Residency::InMemory, ResidencyArg::OnDemand => Residency::OnDemand },
        scoring: match args.scoring { ScoringArg::Tfidf => Scoring::Tfidf, ScoringArg::Burstiness => Scoring::Burstiness },
        strategy: match args.strategy { StrategyArg::Online => IterStrategy::Online, StrategyArg::Precomputed => IterStrategy::Precomputed },
    };
    let config = ServerConfig {
        data_dir: args.data_dir.clone(),
        indexer_bin: args.indexer_bin.clone(),
        options,
        admin_token: std::env::var("ADMIN_TOKEN").ok(),
        auto_load: !args.no_auto_load,
    };
    let (app, state): (Router, _) = server::build_app_with_state(config)?;
    for id in &args.preload {
        match id.split_once('/') {
            Some((name, version)) => { state.manager.load(name, version)?; }
            None => anyhow::bail!("--preload expects name/version, got {id}"),
        }
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, data_dir = %args.data_dir.display(), "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
