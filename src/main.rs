//! Command line interface for cross-posting notes to Nostr relays. Supports
//! initialization, publishing, quota inspection, relay management, and running
//! the handoff worker.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crosspost::{
    bridge::{self, BridgeHost},
    config::{csv_strings, Settings},
    fallback::{BridgeStrategy, DirectStrategy, FallbackChain, HandoffStrategy},
    handoff::{HandoffChannel, HandoffWorker},
    quota::{QuotaGate, Tier},
    relay::test_connection,
    settings::PublishSettingsStore,
    signer::LocalSigner,
    store::{FileStore, SharedStore},
    ContentItem, MultiRelayPublisher, Orchestrator,
};
use tracing::info;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "crosspost",
    author,
    version,
    about = "Publish one signed note to many Nostr relays",
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
    /// Initialize the store at `STORE_ROOT` and persist default settings.
    Init,
    /// Sign and publish one text note to the configured relays.
    Publish {
        #[arg(long)]
        text: String,
        /// Original author handle, used for attribution.
        #[arg(long)]
        author: Option<String>,
        /// Source URL, appended after the attribution line.
        #[arg(long)]
        url: Option<String>,
    },
    /// Show today's quota, optionally switching tier first.
    Quota {
        #[arg(long)]
        set_tier: Option<Tier>,
    },
    /// Manage the relay list.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Execute publish requests handed off through the store.
    Worker,
}

/// Operations available under `crosspost relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the list.
    Remove { url: String },
    /// Replace the whole list with comma-separated URLs.
    Set { urls: String },
    /// Print the configured relays.
    List,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let file_store = FileStore::new(cfg.store_root.clone());
    file_store.init()?;
    let store: SharedStore = Arc::new(file_store);
    let settings = PublishSettingsStore::new(store.clone(), cfg.allow_insecure_relays);
    match cli.command {
        Commands::Init => {
            let current = settings.get()?;
            info!(root = %cfg.store_root.display(), relays = current.relays.len(), "store initialized");
        }
        Commands::Publish { text, author, url } => {
            let item = ContentItem {
                text,
                author_handle: author,
                source_url: url,
            };
            let outcome = publish(&cfg, store, settings, &item).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.overall_success {
                bail!("no relay accepted the event");
            }
        }
        Commands::Quota { set_tier } => {
            let quota = QuotaGate::new(store);
            if let Some(tier) = set_tier {
                quota.set_tier(tier)?;
            }
            println!("{}", serde_json::to_string_pretty(&quota.info()?)?);
        }
        Commands::Relay { action } => handle_relay(action, &cfg, &settings).await?,
        Commands::Worker => {
            let worker = HandoffWorker::new(store, MultiRelayPublisher::new(cfg.link_options()));
            info!(poll = ?cfg.timeouts.handoff_poll, "handoff worker started");
            worker
                .run(cfg.timeouts.handoff_poll, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
    }
    Ok(())
}

/// Wire the orchestrator for this process and publish `item` once.
async fn publish(
    cfg: &Settings,
    store: SharedStore,
    settings: PublishSettingsStore,
    item: &ContentItem,
) -> anyhow::Result<crosspost::PublishOutcome> {
    let secret = cfg
        .secret_key
        .as_deref()
        .context("SECRET_KEY is not set")?;
    let signer = LocalSigner::from_secret_hex(secret).context("parsing SECRET_KEY")?;
    let publisher = MultiRelayPublisher::new(cfg.link_options());

    // The in-process host stands in for the network context.
    let (bridge, port) = bridge::channel(16);
    let host = tokio::spawn(BridgeHost::new(publisher.clone()).serve(port));

    let chain = FallbackChain::new()
        .with_layer(BridgeStrategy(bridge), cfg.timeouts.bridge)
        .with_layer(DirectStrategy(publisher), cfg.timeouts.bridge)
        .with_layer(
            HandoffStrategy(HandoffChannel::new(store.clone(), cfg.timeouts.handoff_poll)),
            cfg.timeouts.handoff,
        );
    let orchestrator = Orchestrator::new(QuotaGate::new(store), settings, Arc::new(signer), chain)
        .verify_signatures(cfg.verify_sig);
    let res = orchestrator.publish(item).await;
    host.abort();
    Ok(res?)
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
    let store_root = base_dir.join("crosspost-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("CONNECT_TIMEOUT_MS=10000\n");
    content.push_str("ACK_TIMEOUT_MS=5000\n");
    content.push_str("BRIDGE_TIMEOUT_MS=30000\n");
    content.push_str("HANDOFF_TIMEOUT_MS=30000\n");
    content.push_str("HANDOFF_POLL_MS=500\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("ALLOW_INSECURE_RELAYS=0\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("SECRET_KEY=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

async fn handle_relay(
    action: RelayAction,
    cfg: &Settings,
    settings: &PublishSettingsStore,
) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => add_relay(cfg, settings, &url).await?,
        RelayAction::Remove { url } => remove_relay(settings, &url)?,
        RelayAction::Set { urls } => {
            let saved = settings.set_relays(csv_strings(urls))?;
            info!(relays = saved.relays.len(), "relay list replaced");
        }
        RelayAction::List => {
            for relay in settings.get()?.relays.targets() {
                println!("{relay}");
            }
        }
    }
    Ok(())
}

async fn add_relay(cfg: &Settings, settings: &PublishSettingsStore, url: &str) -> anyhow::Result<()> {
    let target = settings.parse_relay(url)?;
    let mut current = settings.get()?;
    if current.relays.contains(&target) {
        bail!("relay already configured: {target}");
    }
    test_connection(&target, &cfg.link_options()).await?;
    current.relays.insert(target);
    settings.set(&current)?;
    Ok(())
}

fn remove_relay(settings: &PublishSettingsStore, url: &str) -> anyhow::Result<()> {
    let target = settings.parse_relay(url)?;
    let mut current = settings.get()?;
    if !current.relays.remove(&target) {
        bail!("relay not configured: {target}");
    }
    settings.set(&current)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn clear_env() {
        for v in [
            "STORE_ROOT",
            "CONNECT_TIMEOUT_MS",
            "ACK_TIMEOUT_MS",
            "BRIDGE_TIMEOUT_MS",
            "HANDOFF_TIMEOUT_MS",
            "HANDOFF_POLL_MS",
            "TOR_SOCKS",
            "VERIFY_SIG",
            "ALLOW_INSECURE_RELAYS",
            "SECRET_KEY",
        ] {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nACK_TIMEOUT_MS=300\nBRIDGE_TIMEOUT_MS=3000\nHANDOFF_TIMEOUT_MS=200\nHANDOFF_POLL_MS=20\nVERIFY_SIG=1\nALLOW_INSECURE_RELAYS=1\nSECRET_KEY={SECRET}\n",
            dir.path().to_str().unwrap(),
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    /// Relay that acks every event with `accept` and `reason`.
    async fn spawn_relay(accept: bool, reason: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        task::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                task::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let TMsg::Text(txt) = msg else { continue };
                        let frame: serde_json::Value = serde_json::from_str(&txt).unwrap();
                        let ack = serde_json::json!(["OK", frame[1]["id"], accept, reason]);
                        let _ = ws.send(TMsg::Text(ack.to_string())).await;
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn open_store(dir: &TempDir) -> SharedStore {
        Arc::new(FileStore::new(dir.path().to_path_buf()))
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected_root = dir.path().join("crosspost-data");
        assert!(data.contains(&format!("STORE_ROOT={}", expected_root.to_string_lossy())));
        assert!(data.contains("ACK_TIMEOUT_MS=5000"));
        assert!(expected_root.join("kv").exists());
    }

    #[tokio::test]
    async fn publish_reaches_relays_and_counts_quota() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        let ok = spawn_relay(true, "").await;
        let blocked = spawn_relay(false, "blocked").await;
        run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Set {
                    urls: format!("{ok},{blocked}"),
                },
            },
        })
        .await
        .unwrap();

        run(Cli {
            env: env_file.clone(),
            command: Commands::Publish {
                text: "Hello world".into(),
                author: Some("alice".into()),
                url: None,
            },
        })
        .await
        .unwrap();

        let quota = QuotaGate::new(open_store(&dir));
        assert_eq!(quota.used_today().unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_without_secret_fails() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, format!("STORE_ROOT={}\n", dir.path().display())).unwrap();
        let err = run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Publish {
                text: "hi".into(),
                author: None,
                url: None,
            },
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("SECRET_KEY"));
    }

    #[tokio::test]
    async fn quota_set_tier_persists() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        run(Cli {
            env: env_file,
            command: Commands::Quota {
                set_tier: Some(Tier::Premium),
            },
        })
        .await
        .unwrap();
        let quota = QuotaGate::new(open_store(&dir));
        assert_eq!(quota.current_tier().unwrap(), Tier::Premium);
    }

    #[tokio::test]
    async fn relay_add_validates_and_persists() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = task::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(msg) = ws.next().await {
                if matches!(msg.unwrap(), TMsg::Close(_)) {
                    break;
                }
            }
        });

        let url = format!("ws://{addr}");
        run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Add { url: url.clone() },
            },
        })
        .await
        .unwrap();
        server.await.unwrap();

        let settings = PublishSettingsStore::new(open_store(&dir), true);
        let target = settings.parse_relay(&url).unwrap();
        assert!(settings.get().unwrap().relays.contains(&target));

        // Adding it twice is refused before any connection attempt.
        assert!(run(Cli {
            env: env_file,
            command: Commands::Relay {
                action: RelayAction::Add { url },
            },
        })
        .await
        .is_err());
    }

    #[tokio::test]
    async fn relay_add_unreachable_is_not_persisted() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        assert!(run(Cli {
            env: env_file,
            command: Commands::Relay {
                action: RelayAction::Add { url: url.clone() },
            },
        })
        .await
        .is_err());
        let settings = PublishSettingsStore::new(open_store(&dir), true);
        let target = settings.parse_relay(&url).unwrap();
        assert!(!settings.get().unwrap().relays.contains(&target));
    }

    #[tokio::test]
    async fn relay_remove_updates_list() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        let store = open_store(&dir);
        let settings = PublishSettingsStore::new(store.clone(), true);
        settings.set_relays(["wss://one.example", "wss://two.example"]).unwrap();

        run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Remove {
                    url: "wss://one.example".into(),
                },
            },
        })
        .await
        .unwrap();

        let relays = settings.get().unwrap().relays;
        assert_eq!(relays.len(), 1);
        assert_eq!(relays.targets()[0].url(), "wss://two.example");
        assert!(store.get("publish_settings").unwrap().is_some());

        assert!(run(Cli {
            env: env_file,
            command: Commands::Relay {
                action: RelayAction::Remove {
                    url: "wss://one.example".into(),
                },
            },
        })
        .await
        .is_err());
    }
}
