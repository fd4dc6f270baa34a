mod cli;
mod config;
mod output;

use std::path::Path;
use std::process;

use anyhow::{Context, Result, bail};
use clap::Parser;
use danmaku::{
    ConnectionState, CredentialStore, Credentials, SessionClient, StreamUrlResolver, http,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{cli::Args, config::AppConfig, output::OutputManager};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let output = OutputManager::new(!args.no_color, args.json);

    if let Err(e) = run(args, &output).await {
        error!("Application error: {:#}", e);
        eprintln!("{}", output.error(&format!("{e:#}")));
        process::exit(1);
    }
}

async fn run(args: Args, output: &OutputManager) -> Result<()> {
    init_logging(args.verbose, args.quiet);

    let config = AppConfig::load(args.config.as_deref())?;
    let credentials = load_credentials(&args, &config).await?;

    if !args.no_stream_url {
        let resolver = StreamUrlResolver::new(http::build_client(&config.client)?, &config.client);
        match resolver.resolve(args.room_id).await {
            Some(url) => println!("{}", output.status(&format!("* stream: {url}"))),
            None => println!("{}", output.status("* stream URL unavailable (room offline?)")),
        }
    }

    let client = SessionClient::new(config.client.clone())?;
    let mut chats = client.chat_events();
    let mut states = client.subscribe_state();

    client
        .connect(args.room_id, credentials)
        .await
        .with_context(|| format!("failed to join room {}", args.room_id))?;
    println!("{}", output.state_line(&states.borrow_and_update()));

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = !args.read_only;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut failure = None;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, leaving room");
                break;
            }

            Some(chat) = chats.recv() => {
                println!("{}", output.chat_line(&chat));
            }

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                println!("{}", output.state_line(&state));
                if let ConnectionState::Disconnected { reason } = state {
                    failure = reason;
                    break;
                }
            }

            line = input.next_line(), if input_open => match line {
                Ok(Some(line)) => send_line(&client, line.trim(), output),
                Ok(None) => {
                    debug!("stdin closed, continuing read-only");
                    input_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin, continuing read-only");
                    input_open = false;
                }
            }
        }
    }

    client.disconnect().await;

    if let Some(reason) = failure {
        bail!("session ended: {reason}");
    }
    Ok(())
}

fn send_line(client: &SessionClient, text: &str, output: &OutputManager) {
    if text.is_empty() {
        return;
    }
    match client.send_chat_message(text) {
        Ok(receipt) => {
            tokio::spawn(async move {
                if let Err(e) = receipt.await {
                    warn!(error = %e, "Message was not sent");
                }
            });
        }
        Err(e) => eprintln!("{}", output.error(&e.to_string())),
    }
}

async fn load_credentials(args: &Args, config: &AppConfig) -> Result<Credentials> {
    let path = config.credentials_path(args.credentials.as_deref())?;
    let store = CredentialStore::new(path.clone());

    if let Some(cookies) = &args.cookies {
        let credentials = Credentials::from_cookie_str(cookies);
        if args.save_cookies {
            store
                .save(&credentials)
                .await
                .with_context(|| format!("failed writing {}", path.display()))?;
            info!(path = %path.display(), "Saved credentials");
        }
        return Ok(credentials);
    }

    let credentials = store
        .load_or_create()
        .await
        .with_context(|| format!("failed loading {}", path.display()))?;
    if !credentials.is_authenticated() {
        bail!(login_hint(&path));
    }
    Ok(credentials)
}

fn login_hint(path: &Path) -> String {
    format!(
        "not logged in. Log in at https://live.bilibili.com in a browser, then copy the \
         SESSDATA, bili_jct, buvid3 and DedeUserID cookies into {} (or pass --cookies)",
        path.display()
    )
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}
