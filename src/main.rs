//! Notification Client CLI
//!
//! ## Usage
//!
//! ```bash
//! # Follow live notifications for a customer
//! notification-client --identity u1 --token $TOKEN
//!
//! # Shop notifications with a config file
//! notification-client --config notify.toml --identity 42 --kind shop watch
//!
//! # One-shot REST operations
//! notification-client --identity u1 list
//! notification-client --identity u1 mark-read 17
//! notification-client --identity u1 delete-all
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use notification_client::{
    Anonymous, ClientConfig, CredentialProvider, HttpNotificationApi, Identity, IdentityKind,
    NotificationApi, NotificationClient, NotificationRecord, NotificationState, StaticToken,
};

#[derive(Parser, Debug)]
#[command(name = "notification-client")]
#[command(about = "Real-time notification client for customers and shops")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker WebSocket URL
    #[arg(long, env = "NOTIFY_WS_URL")]
    ws_url: Option<String>,

    /// Notification REST API base URL
    #[arg(long, env = "NOTIFY_API_URL")]
    api_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "NOTIFY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// User or shop id to follow
    #[arg(long, env = "NOTIFY_IDENTITY")]
    identity: Option<String>,

    /// Whether the id is a customer or a shop
    #[arg(long, value_enum, default_value = "customer")]
    kind: KindArg,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Customer,
    Shop,
}

impl From<KindArg> for IdentityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Customer => IdentityKind::Customer,
            KindArg::Shop => IdentityKind::Shop,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach and print state changes until Ctrl-C (default)
    Watch,
    /// Print the current list
    List,
    /// Mark one notification as read
    MarkRead { id: String },
    /// Mark every notification as read
    MarkAllRead,
    /// Delete one notification
    Delete { id: String },
    /// Delete every notification
    DeleteAll,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("notification_client={},warn", level)));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    // Load config
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    // Apply CLI overrides
    if let Some(url) = &args.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(url) = &args.api_url {
        config.api_url = url.clone();
    }
    config.validate()?;

    let Some(id) = args.identity.clone() else {
        bail!("An identity is required (--identity or NOTIFY_IDENTITY)");
    };
    let identity = Identity::new(id, args.kind.into());

    let credentials: Arc<dyn CredentialProvider> = match &args.token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => {
            warn!("No token given; requests are unauthenticated");
            Arc::new(Anonymous)
        }
    };

    let api = HttpNotificationApi::new(
        config.api_url.clone(),
        Arc::clone(&credentials),
        config.request_timeout(),
    )?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(config, credentials, identity).await?,
        Command::List => {
            let records = api.list(&identity).await?;
            for record in &records {
                print_record(record);
            }
            println!("{} notification(s)", records.len());
        }
        Command::MarkRead { id } => {
            api.mark_read(&identity, &id).await?;
            println!("Marked {} as read", id);
        }
        Command::MarkAllRead => {
            api.mark_all_read(&identity).await?;
            println!("Marked all as read");
        }
        Command::Delete { id } => {
            api.delete(&identity, &id).await?;
            println!("Deleted {}", id);
        }
        Command::DeleteAll => {
            api.delete_all(&identity).await?;
            println!("Deleted all");
        }
    }

    Ok(())
}

async fn watch(
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    identity: Identity,
) -> anyhow::Result<()> {
    info!(
        identity = %identity,
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        "Starting notification watch"
    );

    let client = NotificationClient::from_config(config, credentials)?;
    let mut attachment = client.attach(Some(identity));
    let mut state = attachment.state();
    let mut last = NotificationState::default();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                report(&last, &current);
                last = current;
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    attachment.detach();
    Ok(())
}

fn report(previous: &NotificationState, current: &NotificationState) {
    if previous.connected != current.connected {
        println!(
            "[{}]",
            if current.connected { "connected" } else { "disconnected" }
        );
    }
    for record in &current.records {
        if previous.get(&record.id).is_none() {
            print_record(record);
        }
    }
    if previous.records != current.records {
        println!(
            "-- {} notification(s), {} unread",
            current.records.len(),
            current.unread_count()
        );
    }
}

fn print_record(record: &NotificationRecord) {
    println!(
        "{} {} [{}] {}: {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        if record.is_read { " " } else { "*" },
        record.id,
        record.payload.title,
        record.payload.message
    );
}
