use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_autosave::{
    config::Config,
    host::{HostCommand, HostSession, HELP},
    AutosaveController, SessionKey,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quiz_autosave=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        "Configuration loaded for environment: {:?}",
        std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string())
    );

    let mut args = std::env::args().skip(1);
    let exam_id = args
        .next()
        .or_else(|| std::env::var("EXAM_ID").ok())
        .unwrap_or_else(|| "demo-exam".to_string());
    let user_id = args
        .next()
        .or_else(|| std::env::var("USER_ID").ok())
        .unwrap_or_else(|| "demo-user".to_string());

    let controller = AutosaveController::from_config(&config, SessionKey::new(exam_id, user_id))?;
    let recovered = controller.pending_changes().await?;
    if !recovered.is_empty() {
        println!("restored {} unsaved change(s) from backup", recovered.len());
    }
    println!("{}", HELP);

    let mut session = HostSession::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match HostCommand::parse(&line) {
                    Ok(command) => {
                        if !session.apply(&controller, command).await {
                            break;
                        }
                    }
                    Err(e) => println!("{} ({})", e, HELP),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, flushing");
                break;
            }
        }
    }

    // the equivalent of an unload prompt: report work that could not be flushed
    let _ = controller.pending_changes().await;
    let had_unsaved = controller.has_unsaved_changes();
    let saved = controller.shutdown().await;
    if had_unsaved && !saved {
        eprintln!(
            "warning: unsaved changes could not be sent; they remain in the local backup \
             and will be restored on next start"
        );
    }

    Ok(())
}
