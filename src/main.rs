#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Command};
use tether::agent::ChildAgent;
use tether::audit::{AUDIT_KEY_ENV, verify_audit_log};
use tether::config::{Config, write_template};
use tether::deck::{CALLBACK_KEY_ENV, Deck};
use tether::security::{CallbackSigner, generate_secret_key};
use tether::transport::StdioTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            initial_command,
        } => {
            let config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::load_or_default()?,
            };
            let code = run_bridge(config, initial_command.as_deref()).await?;
            std::process::exit(code);
        }
        Command::InitConfig { path } => {
            write_template(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Command::VerifyAudit { path, key } => {
            let key_hex = match key {
                Some(key) => key,
                None => std::env::var(AUDIT_KEY_ENV)
                    .with_context(|| format!("--key not given and {AUDIT_KEY_ENV} unset"))?,
            };
            let key = hex::decode(key_hex.trim()).context("audit key is not valid hex")?;
            let (valid, errors) = verify_audit_log(&path, &key);
            if valid {
                println!("{}: valid", path.display());
                Ok(())
            } else {
                for error in &errors {
                    eprintln!("{error}");
                }
                anyhow::bail!("{}: {} integrity error(s)", path.display(), errors.len());
            }
        }
        Command::SignKey => {
            println!("{}", generate_secret_key());
            Ok(())
        }
    }
}

async fn run_bridge(config: Config, initial_command: Option<&str>) -> Result<i32> {
    let signer = Arc::new(CallbackSigner::resolve(
        config.security.callback_secret.as_deref(),
        CALLBACK_KEY_ENV,
    )?);

    let (event_tx, event_rx) = mpsc::channel(64);
    let (action_tx, action_rx) = mpsc::channel(64);

    let agent = ChildAgent::spawn(&config.agent, initial_command, event_tx, None)
        .await
        .context("failed to start wrapped agent")?;

    let transport = Arc::new(StdioTransport::new(
        Arc::clone(&signer),
        action_tx,
        config.transport.operator_id,
    ));
    {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.listen().await });
    }

    let deck = Arc::new(Deck::new(config, signer, transport, agent)?);

    let code = tokio::select! {
        code = deck.run(event_rx, action_rx) => code,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            deck.shutdown().await;
            130
        }
    };
    Ok(code)
}
