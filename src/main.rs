//! Command line client for relay-based group chat. Manages the persisted
//! relay list and identity, and runs an interactive chat session on a group.

mod config;
mod connection;
mod error;
mod event;
mod filter;
mod ledger;
mod people;
mod prefs;
mod registry;
mod subscription;
#[cfg(test)]
mod test_relay;

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use error::ChatError;
use event::Keys;
use registry::{normalize_relay_url, Notification, RelayRegistry, ROOT_GROUP};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaychat",
    author,
    version,
    about = "Group chat over Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` and create `STATE_ROOT`.
    Init,
    /// List persisted relays and their groups.
    Relays,
    /// Manage persisted relays.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Manage groups on persisted relays.
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
    /// Manage the identity used to sign messages.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Forget every relay and the identity.
    Reset,
    /// Follow a group and post each line read from stdin.
    Chat {
        /// Relay to chat on; defaults to the first persisted relay.
        #[arg(long)]
        relay: Option<String>,
        /// Group to chat in; defaults to the relay's first group.
        #[arg(long)]
        group: Option<String>,
    },
}

/// Operations available under `relaychat relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Connect to a relay, join its root group and persist it.
    Add { url: String },
    /// Drop a relay from the persisted list.
    Remove { url: String },
}

/// Operations available under `relaychat group`.
#[derive(Subcommand)]
enum GroupAction {
    /// Join a group on a persisted relay.
    Add { relay: String, group: String },
}

/// Operations available under `relaychat key`.
#[derive(Subcommand)]
enum KeyAction {
    /// Store a hex secret key as the identity.
    Import { secret: String },
    /// Print the public key of the current identity.
    Show,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    init_tracing(&cfg.log_level);
    match cli.command {
        Commands::Init => {
            fs::create_dir_all(&cfg.state_root)
                .with_context(|| format!("creating {}", cfg.state_root.display()))?;
        }
        Commands::Relays => {
            for record in prefs::load_relays(&cfg.state_root)? {
                println!("{}", record.url);
                for group in record.groups {
                    println!("  {group}");
                }
            }
        }
        Commands::Relay { action } => handle_relay(action, &cfg).await?,
        Commands::Group { action } => handle_group(action, &cfg).await?,
        Commands::Key { action } => handle_key(action, &cfg)?,
        Commands::Reset => {
            let registry = RelayRegistry::new(cfg.registry_options());
            registry.remove_all_relays().await?;
        }
        Commands::Chat { relay, group } => chat(&cfg, relay, group).await?,
    }
    Ok(())
}

/// Install the global log subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn handle_relay(action: RelayAction, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => {
            let registry = RelayRegistry::new(cfg.registry_options());
            let url = registry.add_relay(&url).await?;
            let joined = registry.add_group(&url, ROOT_GROUP).await;
            registry.shutdown().await;
            joined?;
            println!("{url}");
        }
        RelayAction::Remove { url } => {
            let registry = RelayRegistry::new(cfg.registry_options());
            registry.remove_relay(&url).await?;
        }
    }
    Ok(())
}

async fn handle_group(action: GroupAction, cfg: &Settings) -> anyhow::Result<()> {
    let GroupAction::Add { relay, group } = action;
    let url = normalize_relay_url(&relay);
    let record = prefs::load_relays(&cfg.state_root)?
        .into_iter()
        .find(|r| normalize_relay_url(&r.url) == url)
        .ok_or(ChatError::RelayNotFound(url))?;
    let registry = RelayRegistry::new(cfg.registry_options());
    let joined = async {
        registry.restore(&record).await?;
        registry.add_group(&record.url, &group).await
    }
    .await;
    registry.shutdown().await;
    joined?;
    Ok(())
}

fn handle_key(action: KeyAction, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        KeyAction::Import { secret } => {
            let registry = RelayRegistry::new(cfg.registry_options());
            let keys = registry.import_identity(&secret)?;
            println!("{}", keys.public_key_hex());
        }
        KeyAction::Show => match configured_identity(cfg)? {
            Some(keys) => println!("{}", keys.public_key_hex()),
            None => bail!(ChatError::NoIdentity),
        },
    }
    Ok(())
}

/// `SECRET_KEY` if set, otherwise the persisted identity.
fn configured_identity(cfg: &Settings) -> anyhow::Result<Option<Keys>> {
    let secret = match &cfg.secret_key {
        Some(secret) => Some(secret.clone()),
        None => prefs::load_identity(&cfg.state_root)?,
    };
    secret
        .map(|s| Keys::from_hex(&s).context("invalid secret key"))
        .transpose()
}

async fn chat(cfg: &Settings, relay: Option<String>, group: Option<String>) -> anyhow::Result<()> {
    let registry = RelayRegistry::new(cfg.registry_options());
    let mut notices = registry.subscribe();
    if let Some(keys) = configured_identity(cfg)? {
        registry.set_identity(Some(keys));
    }
    let restored = registry.load_persisted().await?;
    if restored == 0 {
        for url in &cfg.bootstrap_relays {
            match registry.add_relay(url).await {
                Ok(url) => {
                    if let Err(e) = registry.add_group(&url, ROOT_GROUP).await {
                        warn!(relay = %url, error = %e, "bootstrap group failed");
                    }
                }
                Err(e) => warn!(relay = %url, error = %e, "bootstrap relay failed"),
            }
        }
    }

    let session = async {
        let url = match relay {
            Some(url) => normalize_relay_url(&url),
            None => registry
                .relay_urls()
                .into_iter()
                .next()
                .context("no relays configured; run `relaychat relay add URL` first")?,
        };
        let group = match group {
            Some(group) => group,
            None => registry
                .group_ids(&url)?
                .into_iter()
                .next()
                .unwrap_or_else(|| ROOT_GROUP.to_string()),
        };
        registry.select(&url, &group)?;
        let (url, group) = registry.selected().ok_or(ChatError::NoSelection)?;
        info!(relay = %url, group = %group, "chatting");

        let mut header = String::new();
        let mut printed = HashSet::new();
        print_header(&registry, &url, &group, &mut header)?;
        print_new(&registry, &url, &group, &mut printed)?;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = registry.publish_chat(&line) {
                        eprintln!("error: {e}");
                    }
                }
                notice = notices.recv() => {
                    let view = View { url: &url, group: &group };
                    if !view.on_notice(&registry, notice, &mut header, &mut printed)? {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        anyhow::Ok(())
    }
    .await;
    registry.shutdown().await;
    session
}

/// The group a chat session is following.
struct View<'a> {
    url: &'a str,
    group: &'a str,
}

impl View<'_> {
    /// Refresh the transcript for one notification. Returns `false` once no
    /// more notifications can arrive.
    fn on_notice(
        &self,
        registry: &Arc<RelayRegistry>,
        notice: Result<Notification, RecvError>,
        header: &mut String,
        printed: &mut HashSet<String>,
    ) -> anyhow::Result<bool> {
        match notice {
            Ok(Notification::GroupMessagesChanged { relay_url, group_id })
                if relay_url == self.url && group_id == self.group =>
            {
                print_new(registry, self.url, self.group, printed)?;
            }
            Ok(Notification::MenuChanged) => {
                print_header(registry, self.url, self.group, header)?;
            }
            Ok(Notification::Error { message }) => eprintln!("error: {message}"),
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "missed notifications");
                print_header(registry, self.url, self.group, header)?;
                print_new(registry, self.url, self.group, printed)?;
            }
            Err(RecvError::Closed) => return Ok(false),
        }
        Ok(true)
    }
}

/// Print the group's name and announced sub-groups whenever they change.
fn print_header(
    registry: &Arc<RelayRegistry>,
    url: &str,
    group: &str,
    shown: &mut String,
) -> anyhow::Result<()> {
    let menu = registry.menu();
    let Some(item) = menu
        .iter()
        .find(|m| !m.is_root && m.relay_url == url && m.group_id == group)
    else {
        return Ok(());
    };
    let subgroups = registry.with_ledger(url, group, |l| l.subgroups().join(" "))?;
    let header = if subgroups.is_empty() {
        format!("# {}", item.group_name)
    } else {
        format!("# {} ({subgroups})", item.group_name)
    };
    if *shown != header {
        println!("{header}");
        *shown = header;
    }
    Ok(())
}

/// Print messages of the group not shown yet, oldest first.
fn print_new(
    registry: &Arc<RelayRegistry>,
    url: &str,
    group: &str,
    printed: &mut HashSet<String>,
) -> anyhow::Result<()> {
    for message in registry.messages(url, group)? {
        if printed.insert(message.id.clone()) {
            println!("[ {} ] {}", registry.display_name(&message.pubkey), message.content);
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let state_root = base_dir.join("relaychat-data");
    let mut content = String::new();
    content.push_str(&format!("STATE_ROOT={}\n", display_path(&state_root)));
    content.push_str("TOR_SOCKS=\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("SECRET_KEY=\n");
    content.push_str("CONNECT_TIMEOUT_SECS=10\n");
    content.push_str("METADATA_TIMEOUT_SECS=5\n");
    content.push_str("# Comma separated; quote the value if it contains spaces.\n");
    content.push_str("BOOTSTRAP_RELAYS=\n");
    content.push_str("LOG_LEVEL=info\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
