use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ytclip::{server, utils, Cli, ClipPipeline, ClipRequest, Commands, Config, S3Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load()?;

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            server::serve(config).await?;
        }
        Commands::Extract { url, start, end } => {
            extract(config, &url, &start, &end, cli.quiet).await?;
        }
        Commands::Doctor => {
            let missing = utils::check_dependencies(&config.pipeline).await;
            if missing.is_empty() {
                println!("All external tools found.");
            } else {
                eprintln!("⚠️  Missing tools:");
                for dep in &missing {
                    eprintln!("   • {}", dep);
                }
                std::process::exit(1);
            }
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                println!("Configuration is read from config.yaml and the environment.");
                println!("Run `ytclip config --show` to see the effective values.");
            }
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise info for this crate, debug with `--verbose`. JSON with `LOG_FORMAT=json`.
fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "ytclip=debug,tower_http=debug"
    } else {
        "ytclip=info,tower_http=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // stdout is reserved for command output
    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn extract(config: Config, url: &str, start: &str, end: &str, quiet: bool) -> Result<()> {
    if !ytclip::extractors::is_valid_youtube_url(url) {
        anyhow::bail!("{}", ytclip::ValidationError::InvalidUrl);
    }
    let request = ClipRequest::parse(url, start, end)?;

    let publisher = S3Publisher::new(&config.storage).await?;
    let pipeline = ClipPipeline::from_config(&config, Arc::new(publisher))?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    progress.enable_steady_tick(Duration::from_millis(120));
    progress.set_message(format!(
        "Clipping {}s from {}...",
        request.duration_seconds(),
        request.source_url
    ));

    let result = pipeline.run(&request, &cancel).await;
    progress.finish_and_clear();

    let outcome = result?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
