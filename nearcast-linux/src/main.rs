// Nearcast Linux node: advertise, browse, and share locations/images with peers on the LAN.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nearcast_core::Keypair;
use nearcast_linux::cli::{self, Cli, Command};
use nearcast_linux::{config, SharingService};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nearcast=info")),
        )
        .init();

    let args = Cli::parse();
    let mut cfg = config::load(args.config.as_deref()).context("loading config")?;
    args.apply(&mut cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let keypair = Arc::new(Keypair::generate());
        let service = SharingService::start(cfg, keypair)
            .await
            .context("starting sharing service")?;
        println!("you are {}", service.local_peer());
        println!("{}", cli::HELP);

        tokio::select! {
            r = command_loop(&service) => r?,
            r = shutdown_signal() => r?,
        }
        service.shutdown();
        Ok::<_, anyhow::Error>(())
    })
}

/// Read commands from stdin until `quit` or EOF.
async fn command_loop(service: &SharingService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match line.parse::<Command>() {
            Ok(c) => c,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match cmd {
            Command::Peers => println!("{}", cli::render_peers(&service.view())),
            Command::View => println!("{}", cli::render_view(&service.view())),
            Command::Connect(target) => match cli::resolve_peer(&service.view(), &target) {
                Some(id) => match service.connect(id).await {
                    Ok(peer) => println!("inviting {peer}"),
                    Err(e) => println!("{e}"),
                },
                None => println!("no discovered peer `{target}`"),
            },
            Command::Location(text) => match service.share_location(&text).await {
                Ok(report) => println!("shared with {} peer(s)", report.delivered.len()),
                Err(e) => println!("{e}"),
            },
            Command::Image(path) => {
                let bytes = match tokio::fs::read(&path).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot read image");
                        println!("cannot read {}: {e}", path.display());
                        continue;
                    }
                };
                match service.share_image(&bytes).await {
                    Ok(report) => println!(
                        "sent {} bytes to {} peer(s)",
                        bytes.len(),
                        report.delivered.len()
                    ),
                    Err(e) => println!("{e}"),
                }
            }
            Command::Refresh => {
                service.refresh().await;
                println!("rediscovering");
            }
            Command::Help => println!("{}", cli::HELP),
            Command::Quit => break,
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
