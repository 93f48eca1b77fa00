use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use fusion_sync_rs::config::{ApiArgs, Cli, Command, ServeArgs};
use fusion_sync_rs::provider::FusionClient;
use fusion_sync_rs::state::{SyncConfig, SyncController};
use fusion_sync_rs::{export, logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    // Fail before doing anything else if the credential is missing.
    cli.api.require_token()?;

    match cli.command.clone().unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(&cli.api, args).await,
        Command::Export(args) => {
            let reports = export::run_export(&cli.api, &args).await?;
            let total: usize = reports.iter().map(|r| r.written).sum();
            println!("Exported {} records from {} resource(s)", total, reports.len());
            Ok(())
        }
    }
}

async fn serve(api: &ApiArgs, args: ServeArgs) -> Result<()> {
    let rules = api.initial_rules()?;
    let settings = api.collector_settings()?;
    let client = FusionClient::new(api.client_settings(&args.resource)?)
        .context("failed to build API client")?;

    println!("fusion-sync-rs configuration:");
    println!("  endpoint     : {}", client.endpoint());
    println!("  page_size    : {}", settings.page_size);
    println!("  max_items    : {}", settings.max_items);
    println!("  strategy     : {:?}", settings.strategy);
    println!(
        "  rules        : {}",
        api.rules
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<built-in>".to_string())
    );
    println!(
        "  refresh      : {}",
        args.refresh_secs
            .map(|s| format!("every {s}s"))
            .unwrap_or_else(|| "<manual>".to_string())
    );
    println!("  bind         : {}", args.bind);

    let sync = SyncController::new(
        SyncConfig {
            source: Arc::new(client),
            settings,
            rules_path: api.rules.clone(),
            policy: args.partial_policy,
        },
        rules,
    );

    if args.sync_on_start {
        sync.trigger().await;
    }
    if let Some(secs) = args.refresh_secs {
        sync.spawn_refresh(Duration::from_secs(secs.max(1)));
    }

    let server_sync = sync.clone();
    let bind = args.bind.clone();
    let ui_dir = args.ui_dir.clone();
    let server = tokio::spawn(async move { server::spawn_server(&bind, server_sync, ui_dir).await });
    println!("UI server starting at http://{} (Ctrl+C to stop)", args.bind);

    tokio::select! {
        res = server => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            if sync.cancel().await
                && tokio::time::timeout(Duration::from_secs(5), sync.wait_idle()).await.is_err()
            {
                warn!("in-flight run did not stop in time");
            }
        }
    }
    Ok(())
}
