mod hooks;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use feedback_session::optimistic::{Entity, VoteState};
use feedback_session::protocol::FeedbackItem;
use feedback_session::storage::default_state_dir;
use feedback_session::transport::TransportGuard;
use feedback_session::{
    ApiClient, ApiError, AuthSession, EntityCache, EntityId, EventBus, EventKind, MonitorConfig,
    MutationCoordinator, Reconciled, SessionMonitor, StorageAdapter,
};
use hooks::{Notices, format_remaining};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "feedback", version, about = "feedback board client")]
struct Cli {
    /// Server base URL [env: FEEDBACK_API_URL] (default: http://127.0.0.1:8000).
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Directory holding the stored session [env: FEEDBACK_STATE_DIR].
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Seconds before expiry to warn.
    #[arg(long, global = true, default_value_t = 300)]
    warning_secs: u64,

    /// Seconds before expiry to attempt a refresh.
    #[arg(long, global = true, default_value_t = 120)]
    refresh_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account (prompts for a password).
    Register { email: String },
    /// Log in and store the session (prompts for a password).
    Login { email: String },
    /// Forget the stored session.
    Logout,
    /// Show the account the stored session belongs to.
    Whoami,
    /// Show session state and time left.
    Status,
    /// List feedback, most upvoted first.
    List {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List your own feedback.
    Mine {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Post a new feedback entry.
    Submit { text: String },
    /// Replace the text of one of your entries.
    Edit { id: i64, text: String },
    /// Delete one of your entries.
    Delete { id: i64 },
    /// Toggle your upvote on an entry.
    Upvote {
        id: i64,
        /// Toggle this many times back to back without waiting for the server.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=50))]
        repeat: u32,
    },
    /// Watch the stored session until it expires.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedback=info,feedback_session=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api_url = resolve_api_url(cli.api_url.clone());
    let result = run(cli, &api_url).await;
    if let Err(e) = &result
        && is_transient(e)
    {
        eprintln!(
            "  \x1b[1;33mThe server at {api_url} did not respond properly. Try again.\x1b[0m"
        );
    }
    result
}

async fn run(cli: Cli, api_url: &str) -> Result<()> {
    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => default_state_dir().context("failed to determine state directory")?,
    };

    let config = MonitorConfig {
        warning_window: Duration::from_secs(cli.warning_secs),
        refresh_window: Duration::from_secs(cli.refresh_secs),
    };
    let session = assemble(api_url, StorageAdapter::open(&state_dir), config)?;
    tracing::debug!(api_url, state_dir = %state_dir.display(), "session assembled");

    match cli.command {
        Command::Register { email } => {
            let password = prompt_new_password()?;
            let user = session.register(&email, &password).await?;
            println!("Registered {} (id {}).", user.email, user.id);
            println!("Run `feedback login {}` to start a session.", user.email);
            Ok(())
        }
        Command::Login { email } => {
            let password = Zeroizing::new(
                rpassword::prompt_password("Password: ").context("failed to read password")?,
            );
            session.login(&email, &password).await?;
            println!("Logged in as {email}.");
            if let Some(left) = session.monitor().time_left() {
                println!("Session expires in {}.", format_remaining(left));
            }
            Ok(())
        }
        Command::Logout => {
            session.logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Whoami => {
            require_session(&session)?;
            let user = session.api().me().await?;
            println!("{} (id {}, joined {})", user.email, user.id, user.created_at);
            Ok(())
        }
        Command::Status => {
            cmd_status(&session);
            Ok(())
        }
        Command::List { skip, limit } => {
            session.restore();
            let items = session.api().list_feedback(skip, limit).await?;
            print_items(&items);
            Ok(())
        }
        Command::Mine { skip, limit } => {
            require_session(&session)?;
            let items = session.api().my_feedback(skip, limit).await?;
            print_items(&items);
            Ok(())
        }
        Command::Submit { text } => {
            require_session(&session)?;
            let item = session.api().create_feedback(&text).await?;
            println!("Posted entry {}.", item.id);
            Ok(())
        }
        Command::Edit { id, text } => {
            require_session(&session)?;
            let item = session
                .api()
                .update_feedback(&EntityId::from(id), &text)
                .await?;
            println!("Updated entry {}.", item.id);
            Ok(())
        }
        Command::Delete { id } => {
            require_session(&session)?;
            session.api().delete_feedback(&EntityId::from(id)).await?;
            println!("Deleted entry {id}.");
            Ok(())
        }
        Command::Upvote { id, repeat } => {
            require_session(&session)?;
            cmd_upvote(&session, EntityId::from(id), repeat).await
        }
        Command::Watch => {
            require_session(&session)?;
            cmd_watch(&session).await
        }
    }
}

/// Wire the collaborators together. Nothing here is global; every part is
/// handed to the ones that need it.
fn assemble(api_url: &str, storage: StorageAdapter, config: MonitorConfig) -> Result<AuthSession> {
    let storage = Arc::new(storage);
    let bus = Arc::new(EventBus::new());
    let monitor = Arc::new(SessionMonitor::new(
        config,
        Arc::clone(&bus),
        Arc::new(Notices),
    ));
    let transport = TransportGuard::new(api_url, Arc::clone(&storage), Arc::clone(&bus))
        .context("failed to build HTTP client")?;
    let api = Arc::new(ApiClient::new(transport));
    Ok(AuthSession::new(storage, bus, monitor, api))
}

fn resolve_api_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("FEEDBACK_API_URL").ok())
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| feedback_session::DEFAULT_API_URL.to_string())
}

fn require_session(session: &AuthSession) -> Result<()> {
    if !session.restore() {
        bail!("not logged in; run `feedback login <email>` first");
    }
    Ok(())
}

fn cmd_status(session: &AuthSession) {
    if !session.storage().is_durable() {
        eprintln!("  \x1b[1;33mSession storage is in-memory only; it will not persist.\x1b[0m");
    }
    if !session.restore() {
        println!("Not logged in.");
        return;
    }
    let subject = session
        .credential()
        .and_then(|c| c.claims().ok())
        .and_then(|claims| claims.subject)
        .unwrap_or_else(|| "unknown".to_string());
    println!("Logged in as {subject}");
    println!("State:     {}", session.state());
    match session.monitor().time_left() {
        Some(left) => println!("Time left: {}", format_remaining(left)),
        None => println!("Time left: none"),
    }
}

async fn cmd_upvote(session: &AuthSession, id: EntityId, repeat: u32) -> Result<()> {
    let item = session.api().feedback(&id).await?;
    let cache = EntityCache::new();
    cache.upsert(Entity::from(&item));
    let coordinator = MutationCoordinator::new(Arc::clone(session.api()), cache);

    let mut pending = Vec::with_capacity(repeat as usize);
    for _ in 0..repeat {
        let toggle = coordinator.toggle(&id)?;
        println!(
            "#{} sent       {}",
            toggle.generation(),
            describe(toggle.optimistic())
        );
        pending.push(toggle);
    }

    let mut failure = None;
    for toggle in pending {
        let generation = toggle.generation();
        match toggle.settled().await {
            Ok(Reconciled::Committed(votes)) => {
                println!("#{generation} committed  {}", describe(votes));
            }
            Ok(Reconciled::Superseded) => println!("#{generation} superseded"),
            Err(e) => {
                eprintln!("#{generation} rolled back: {e}");
                failure = Some(e);
            }
        }
    }

    if let Some(entity) = coordinator.cache().get(&id) {
        println!("Entry {id}: {}", describe(entity.votes()));
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn cmd_watch(session: &AuthSession) -> Result<()> {
    let expired = Arc::new(Notify::new());
    let notify = Arc::clone(&expired);
    let subscription = session
        .bus()
        .subscribe(EventKind::EXPIRED, move || notify.notify_one());

    match session.monitor().time_left() {
        Some(left) => println!(
            "Watching session, {} left. Ctrl-C to stop.",
            format_remaining(left)
        ),
        None => println!("Watching session. Ctrl-C to stop."),
    }

    let outcome = tokio::select! {
        _ = expired.notified() => {
            eprintln!("  \x1b[1;31mSession expired. Log in again.\x1b[0m");
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            println!("Stopped watching.");
            Ok(())
        }
    };
    subscription.unsubscribe();
    outcome
}

fn print_items(items: &[FeedbackItem]) {
    if items.is_empty() {
        println!("No feedback yet.");
    }
    for item in items {
        let mark = if item.has_upvoted { "*" } else { " " };
        println!("{:>5}  {:>4}{mark} {}", item.id, item.upvotes, item.text);
    }
}

fn describe(votes: VoteState) -> String {
    let noun = if votes.vote_count == 1 { "vote" } else { "votes" };
    if votes.viewer_has_voted {
        format!("{} {noun} (including yours)", votes.vote_count)
    } else {
        format!("{} {noun}", votes.vote_count)
    }
}

/// Prompt for a new password with confirmation.
fn prompt_new_password() -> Result<Zeroizing<String>> {
    loop {
        let first = Zeroizing::new(
            rpassword::prompt_password("Password: ").context("failed to read password")?,
        );
        if first.chars().count() < feedback_session::protocol::MIN_PASSWORD_LEN {
            eprintln!(
                "  \x1b[1;31mPassword must be at least {} characters.\x1b[0m",
                feedback_session::protocol::MIN_PASSWORD_LEN
            );
            continue;
        }
        let second = Zeroizing::new(
            rpassword::prompt_password("Confirm password: ").context("failed to read password")?,
        );
        if *first != *second {
            eprintln!("  \x1b[1;31mPasswords do not match. Try again.\x1b[0m");
            continue;
        }
        return Ok(first);
    }
}

/// Whether the failure came from an unreachable or failing server.
fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ApiError>().is_some_and(ApiError::is_transient))
}
