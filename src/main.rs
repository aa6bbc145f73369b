mod config;
mod dump;
mod totext;
mod util;
mod wikis;

use config::{Command, DownloadConfig, LogFormat};
use dump::Pipeline;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use wikis::WikiSet;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339());

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel `token` on the first Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Interrupted, stopping after the current chunk");
                token.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

async fn download(config: DownloadConfig) -> color_eyre::Result<()> {
    // A bad list aborts before anything touches the network
    let wikis = match &config.lang {
        Some(path) => WikiSet::from_file(path)?,
        None => {
            let client = dump::http_client(config.timeout())?;
            WikiSet::discover(&client, &config.dumps_url, config.timeout()).await?
        }
    };
    if wikis.is_empty() {
        tracing::warn!("No wikis selected");
    }
    tracing::info!(
        wikis = wikis.len(),
        strategy = ?config.strategy(),
        out = ?config.out,
        "Starting download"
    );

    let cancel_token = CancellationToken::new();
    cancel_on_interrupt(cancel_token.clone());

    let pipeline = Pipeline::from_config(&config, cancel_token)?;
    let (ledger, summary) = pipeline.run(&wikis).await?;

    if ledger.is_empty() {
        tracing::info!("All dumps downloaded");
    } else {
        tracing::warn!(
            missing = ledger.missing_count(),
            failed = summary.failed,
            listing_failed = summary.listing_failed,
            "Some dumps are missing, see {}",
            pipeline.missing_path().display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let config = config::config();
    init_tracing(config.log_format);

    match config.command {
        Command::Download(download_config) => download(download_config).await?,
        Command::ToText(totext_config) => {
            totext::run(&totext_config).await?;
        }
    }

    Ok(())
}
