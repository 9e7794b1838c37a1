//! # Article Dashboard
//!
//! Offline-first article and profile editing. Writes made without
//! connectivity are queued in SQLite and replayed against the remote store
//! when the connection comes back.

pub mod articles;
pub mod cache;
pub mod config;
pub mod db;
pub mod sync;

use articles::{ArticleFeed, ArticleStatus, FeedError, LoadOutcome};
use cache::ArticleCache;
use clap::{Parser, Subcommand};
use config::{AppConfig, ConfigError};
use db::{Database, DbError};
use serde_json::{json, Value};
use std::sync::Arc;
use sync::{
    ConnectivityEvent, DrainOutcome, Fields, HttpRemoteStore, LogNotifier, Mutation,
    OfflineSync, RemoteError, RemoteStore, SyncManagerError, WriteError, WriteOutcome,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub db: Arc<Database>,
    pub sync: OfflineSync,
    pub feed: ArticleFeed,
    pub cache: ArticleCache,
}

impl AppState {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        initially_online: bool,
    ) -> Result<Self, AppError> {
        let sync = OfflineSync::new(
            db.clone(),
            remote.clone(),
            Arc::new(LogNotifier),
            initially_online,
        )?;
        let cache = ArticleCache::new();
        let feed = ArticleFeed::new(remote, cache.clone());

        Ok(Self {
            db,
            sync,
            feed,
            cache,
        })
    }

    /// Submit a write and mirror it in the loaded feed
    ///
    /// Once the write is applied or queued it counts as saved; a feed that
    /// cannot reflect it is only logged.
    async fn write(&self, mutation: Mutation) -> Result<(), AppError> {
        match self.sync.submit(mutation.clone()).await {
            Ok(WriteOutcome::Applied(ack)) => {
                println!("Saved {} {}", ack.action, ack.entity_id);
            }
            Ok(WriteOutcome::Queued(item)) => {
                println!("Saved as pending change #{}", item.id);
            }
            Err(WriteError::Deferred { item, source }) => {
                println!("Network error ({}), saved as pending change #{}", source, item.id);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.feed.apply_local(&mutation).await {
            log::warn!(
                "Saved {} {} but could not show it in the feed: {}",
                mutation.action(),
                mutation.entity_id(),
                e
            );
        }
        Ok(())
    }

    async fn execute(
        &self,
        command: Command,
        events: &mpsc::Sender<ConnectivityEvent>,
    ) -> Result<(), AppError> {
        match command {
            Command::Online => send_event(events, ConnectivityEvent::Online).await,
            Command::Offline => send_event(events, ConnectivityEvent::Offline).await,
            Command::Status => {
                let status = self.sync.status()?;
                let stats = self.sync.queue_stats()?;
                let cache = self.cache.stats().await;
                println!(
                    "{}",
                    pretty(&json!({ "sync": status, "queue": stats, "cache": cache }))
                );
            }
            Command::Create { title } => {
                self.write(Mutation::create_article(text_field("title", title.join(" "))))
                    .await?;
            }
            Command::Update { id, title } => {
                self.write(Mutation::UpdateArticle {
                    id,
                    changes: text_field("title", title.join(" ")),
                })
                .await?;
            }
            Command::Delete { id } => self.write(Mutation::DeleteArticle { id }).await?,
            Command::Profile { uid, display_name } => {
                self.write(Mutation::UpdateProfile {
                    uid,
                    changes: text_field("displayName", display_name.join(" ")),
                })
                .await?;
            }
            Command::Show { id } => match self.feed.article(&id).await {
                Some(article) => println!("{}", pretty(&json!(article))),
                None => println!("Article {} is not loaded or cached", id),
            },
            Command::Articles { search } => {
                self.feed.set_search(search.join(" ")).await;
                if self.sync.is_online() {
                    self.feed.load_first_page().await?;
                }
                self.print_feed().await;
            }
            Command::More => {
                match self.feed.load_more().await? {
                    LoadOutcome::Exhausted => println!("No more articles"),
                    LoadOutcome::Busy => println!("Already loading"),
                    _ => {}
                }
                self.print_feed().await;
            }
            Command::Filter { status } => {
                self.feed.set_status_filter(status).await;
                self.print_feed().await;
            }
            Command::Drain => match self.sync.drain_until_settled().await? {
                DrainOutcome::Completed(report) => println!(
                    "Replayed {}, dropped {}, errors: {:?}",
                    report.succeeded, report.dropped, report.errors
                ),
                DrainOutcome::Skipped => println!("A sync is already running"),
                DrainOutcome::Offline => println!("Offline, nothing replayed"),
            },
            Command::Failed => {
                for failed in self.sync.failed_mutations()? {
                    println!(
                        "#{} {} {} ({})",
                        failed.id, failed.action, failed.payload, failed.error_message
                    );
                }
            }
            Command::Retry { id } => {
                let item = self.sync.retry_failed(id)?;
                println!("Re-queued as pending change #{}", item.id);
            }
            Command::Dismiss { id } => {
                self.sync.dismiss_failed(id)?;
                println!("Dismissed #{}", id);
            }
            Command::Quit => {}
        }
        Ok(())
    }

    async fn print_feed(&self) {
        let snapshot = self.feed.snapshot().await;
        for article in self.feed.visible().await {
            println!("{:>12}  [{}] {}", article.id, article.status.as_str(), article.title);
        }
        println!(
            "{} of {} loaded articles shown{}",
            snapshot.visible,
            snapshot.loaded,
            if snapshot.exhausted { "" } else { " (more available)" }
        );
    }
}

async fn send_event(events: &mpsc::Sender<ConnectivityEvent>, event: ConnectivityEvent) {
    if let Err(e) = events.send(event).await {
        log::error!("Connectivity monitor is gone: {}", e);
    }
}

fn text_field(name: &str, value: String) -> Fields {
    let mut fields = Fields::new();
    fields.insert(name.to_string(), Value::String(value));
    fields
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// ============================================================================
// Commands
// ============================================================================

/// One line typed into the shell
#[derive(Debug, Parser)]
#[command(no_binary_name = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Simulate the connection coming back
    Online,
    /// Simulate losing the connection
    Offline,
    /// Sync status, queue counts and cache statistics
    Status,
    /// Create an article
    Create {
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        title: Vec<String>,
    },
    /// Rename an article
    Update {
        id: String,
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        title: Vec<String>,
    },
    /// Delete an article
    Delete { id: String },
    /// Change a profile's display name
    Profile {
        uid: String,
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        display_name: Vec<String>,
    },
    /// Show one article, from the feed or the cache
    Show { id: String },
    /// Load the feed, optionally searching
    Articles {
        #[arg(num_args = 0..)]
        search: Vec<String>,
    },
    /// Load the next page
    More,
    /// Filter the feed by status (no status clears the filter)
    Filter {
        #[arg(value_parser = parse_status)]
        status: Option<ArticleStatus>,
    },
    /// Replay pending changes now
    #[command(visible_alias = "sync")]
    Drain,
    /// List changes that failed permanently
    Failed,
    /// Queue a failed change again
    Retry { id: i64 },
    /// Forget a failed change
    Dismiss { id: i64 },
    /// Leave the shell
    #[command(visible_alias = "exit")]
    Quit,
}

fn parse_status(s: &str) -> Result<ArticleStatus, String> {
    ArticleStatus::parse(s).ok_or_else(|| format!("expected draft, published or archived, got {}", s))
}

// ============================================================================
// Entry Point
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncManagerError),

    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

async fn serve(config: AppConfig) -> Result<(), AppError> {
    log::info!("Database path: {:?}", config.database_path);
    let db = Arc::new(Database::new(config.database_path.clone())?);
    log::info!("Database initialized successfully");

    let remote = Arc::new(HttpRemoteStore::try_new(&config.api_url, config.http_timeout)?);
    if let Some(token) = &config.api_token {
        remote.set_token(token.clone()).await;
    }
    log::info!("Remote store: {}", config.api_url);

    let state = AppState::new(db, remote, config.start_online)?;

    let (events, events_rx) = mpsc::channel(16);
    state.sync.start(events_rx)?;

    println!("Article dashboard ready. Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match ShellLine::try_parse_from(line.split_whitespace()) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                // Help output arrives here too
                println!("{}", e.render());
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }

        if let Err(e) = state.execute(command, &events).await {
            log::warn!("Command failed: {}", e);
            println!("Error: {}", e);
        }
    }

    if let Err(e) = state.sync.stop() {
        log::debug!("Connectivity monitor already stopped: {}", e);
    }
    log::info!("Shutting down with {} pending changes", state.sync.pending_count()?);
    Ok(())
}

pub fn run() {
    // Load .env file for API settings
    dotenvy::dotenv().ok();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        log::error!("Article dashboard stopped: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
