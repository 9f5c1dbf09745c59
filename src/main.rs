//! ao3-opds server entry point.

use ao3_opds::{
    auth::AuthService,
    config::{AccountCommand, Cli, Command, Config, UserCommand},
    db::{CollectionKind, Database},
    remote::{Ao3Client, RemoteSite},
    server,
    sync::{Dispatcher, FetchModes, Job, JobBuffer, JobQueue, JobRunner, Priority, SyncEngine},
};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Account { action }) => cmd_account(action, &config).await,
        Some(Command::Sync {
            username,
            kind,
            force,
        }) => cmd_sync(&config, &username, kind, force).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ao3_opds=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(&config.database.path)?)
}

fn sync_engine(config: &Config, db: Database) -> anyhow::Result<SyncEngine> {
    let remote: Arc<dyn RemoteSite> = Arc::new(Ao3Client::new(&config.remote)?);
    Ok(SyncEngine::new(db, remote, config))
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    // Write default config
    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    let _db = open_database(&config)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to configure your server.");
    println!("Then run: ao3-opds user add <username> --password <password> --role admin");
    println!("And: ao3-opds account set <username> --ao3-username <name>");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let auth = AuthService::new(
        db,
        config.auth.session_days,
        config.auth.registration_enabled(),
    );

    match action {
        UserCommand::Add {
            username,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&username, &password, &role)?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username, user.role, user.id
            );
        }

        UserCommand::Del { username } => {
            if auth.delete_user(&username)? {
                println!("Deleted user: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<20} {:<10} {:<36} LAST LOGIN", "USERNAME", "ROLE", "ID");
                println!("{}", "-".repeat(80));
                for user in users {
                    let last_login = user
                        .last_login
                        .map(format_timestamp)
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<20} {:<10} {:<36} {}",
                        user.username, user.role, user.id, last_login
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }
    }

    Ok(())
}

/// AO3 account management commands.
async fn cmd_account(action: AccountCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;

    match action {
        AccountCommand::Set {
            username,
            ao3_username,
            ao3_password,
        } => {
            let user = db
                .get_user_by_username(&username)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", username))?;
            let password = match ao3_password {
                Some(p) => p,
                None => prompt_password("AO3 password: ")?,
            };

            let engine = sync_engine(config, db)?;
            let update = engine
                .credentials()
                .set_credentials(&user.id, &ao3_username, &password)
                .await?;
            println!(
                "Stored AO3 account {} for {}{}",
                update.account.username,
                username,
                if update.username_changed {
                    " (username changed, every list will be listed again)"
                } else {
                    ""
                }
            );
        }

        AccountCommand::Del { username } => {
            let user = db
                .get_user_by_username(&username)?
                .ok_or_else(|| anyhow::anyhow!("User not found: {}", username))?;
            match db.get_account_by_user(&user.id)? {
                Some(account) => {
                    sync_engine(config, db)?
                        .credentials()
                        .delete_credentials(&account)?;
                    println!("Deleted AO3 account {} of {}", account.username, username);
                }
                None => println!("No AO3 account for: {}", username),
            }
        }
    }

    Ok(())
}

/// One-shot sync of a user's lists.
async fn cmd_sync(
    config: &Config,
    username: &str,
    kind: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    init_tracing();

    let db = open_database(config)?;
    let user = db
        .get_user_by_username(username)?
        .ok_or_else(|| anyhow::anyhow!("User not found: {}", username))?;
    let account = db
        .get_account_by_user(&user.id)?
        .ok_or_else(|| anyhow::anyhow!("No AO3 account for: {}", username))?;

    let engine = sync_engine(config, db)?;
    let modes = if force {
        FetchModes::force()
    } else {
        engine.default_modes()
    };

    match kind {
        Some(kind) => {
            let kind: CollectionKind = kind.parse()?;
            let outcome = engine.refresh_collection(&account, kind, modes).await?;
            println!(
                "{}: {} kept, {} removed, {} fetched",
                kind.title(),
                outcome.confirmed,
                outcome.removed,
                outcome.dispatched
            );
        }
        None => {
            let buffer = JobBuffer::new();
            engine
                .sync_account(&user.id, modes, &buffer, Priority::High)
                .await?;
            let report = engine.drain(&buffer).await;
            println!(
                "Synced {}: {} jobs completed, {} failed",
                account.username, report.completed, report.failed
            );
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    init_tracing();

    let db = open_database(&config)?;
    let remote: Arc<dyn RemoteSite> = Arc::new(Ao3Client::new(&config.remote)?);

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        refresh_mode = ?config.sync.refresh_mode,
        "Starting ao3-opds server"
    );

    let (queue, receiver) = JobQueue::new();
    let state = server::AppState::new(config.clone(), db.clone(), remote, Arc::clone(&queue));

    let runner: Arc<dyn JobRunner> = state.engine.clone();
    queue.spawn(
        receiver,
        runner,
        config.sync.workers,
        config.sync.job_attempts,
        config.sync.retry_delay(),
    );

    // Periodic refresh of every account
    if config.sync.interval_seconds > 0 {
        let queue = Arc::clone(&queue);
        let modes = state.engine.default_modes();
        let interval = Duration::from_secs(config.sync.interval_seconds);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                tracing::debug!("Running scheduled account sync");

                match db.cleanup_expired_sessions() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Expired login sessions removed"),
                    Err(e) => tracing::warn!(error = %e, "Session cleanup failed"),
                }

                let accounts = match db.list_accounts() {
                    Ok(accounts) => accounts,
                    Err(e) => {
                        tracing::warn!(error = %e, "Scheduled sync failed");
                        continue;
                    }
                };
                for account in accounts {
                    let job = Job::SyncAccount {
                        user_id: account.user_id,
                        modes,
                    };
                    if let Err(e) = queue.dispatch(job, Priority::Low) {
                        tracing::warn!(error = %e, "Failed to queue account sync");
                    }
                }
            }
        });
    }

    // Create router
    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
