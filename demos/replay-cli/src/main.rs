//! Submit a prompt and print the streamed transcript.
//!
//! Run with: cargo run -p replay-cli -- "your prompt here"
//!
//! The server base URL comes from `RELAY_URL` (default
//! http://localhost:3000).

use std::io::Write as _;

use agent_relay_client::{ClientConfig, RelayClient, SubmitOptions};
use agent_relay_core::{Role, RunStatus, StoreUpdate};
use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the transcript stays clean on stdout.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    anyhow::ensure!(!prompt.is_empty(), "usage: replay-cli <prompt>");
    let base_url =
        std::env::var("RELAY_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let client = RelayClient::new(&ClientConfig::new(base_url));
    let mut updates = client.store().subscribe();

    let mut session = client
        .submit(&prompt, None, &SubmitOptions::default())
        .await
        .context("submission failed")?;
    client.store().set_displayed(Some(session.clone()));
    eprintln!("session {session}");

    let mut printed = 0usize;
    loop {
        match updates.recv().await {
            Ok(StoreUpdate::Transcript { .. }) => {
                if let Some((_, draft)) = client.store().transcript(&session) {
                    if draft.len() > printed {
                        print!("{}", &draft[printed..]);
                        std::io::stdout().flush().ok();
                        printed = draft.len();
                    } else if draft.is_empty() {
                        printed = 0;
                    }
                }
            }
            Ok(StoreUpdate::Status {
                status: RunStatus::Idle,
                ..
            }) => break,
            Ok(StoreUpdate::Displayed {
                session_id: Some(id),
            }) => {
                // The session was rekeyed mid-stream; follow it.
                session = id;
            }
            Ok(StoreUpdate::Disconnected { .. }) => {
                anyhow::bail!("stream lost past the retry budget");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "renderer lagged; re-reading transcript");
                printed = 0;
            }
            Err(RecvError::Closed) => break,
        }
    }

    println!();
    let (messages, _) = client.store().transcript(&session).unwrap_or_default();
    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("[{role}] {}", message.content);
    }
    if client.store().terminated_abnormally(&session) {
        tracing::warn!("run ended with a non-zero exit code");
    }
    Ok(())
}
