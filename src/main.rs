use anyhow::Result;
use clap::Parser;
use loopwire::cli::{App, Cli, Commands, Config};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "loopwire=debug" } else { "loopwire=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::SettingsPath = cli.command {
        println!("{}", Config::default_config_file()?.display());
        return Ok(());
    }

    let app = App::new()?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        })
    };

    let result = match cli.command {
        Commands::Health => app.handle_health(&cancel).await,
        Commands::Config { max_age_secs, json } => {
            app.handle_config(max_age_secs, json, &cancel).await
        }
        Commands::Request {
            kind,
            body,
            timeout_ms,
        } => {
            app.handle_request(kind, body, timeout_ms.map(Duration::from_millis), &cancel)
                .await
        }
        Commands::SettingsPath => Ok(()),
    };

    app.shutdown().await;
    interrupt.abort();
    result
}
