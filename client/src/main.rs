use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    future::Future,
    io::{stderr, stdin, IsTerminal},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    config::{Config, Overrides},
    coordinator::{OperationContext, OperationCoordinator, OperationKind, Outcome},
    engine::SyncEngine,
    store::RcloneStore,
    sync::outcome,
};
use kdam::term;
use log::{debug, info, warn};
use tokio::{pin, select, signal, spawn, time::timeout};
use tokio_util::sync::CancellationToken;

mod ui;

use ui::Ui;

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);
const SHUTDOWN_POLLS: u32 = 40;

#[derive(Parser, Debug)]
#[command(version, about = "Share database files through an object-storage bucket", long_about = None)]
struct Args {
    /// Configuration file (default: dbsync.toml here or in a parent directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Owner name recorded in locks and metadata
    #[arg(long, global = true)]
    user: Option<String>,

    /// Host name recorded in locks and metadata
    #[arg(long, global = true)]
    host: Option<String>,

    /// Suppress decorative output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Never prompt; every confirmation is answered "no"
    #[arg(long, global = true)]
    no_input: bool,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Status of every database, or the status code of one
    Status { database: Option<String> },
    /// Lock, upload, record the upload and unlock
    Upload {
        database: String,
        #[arg(long)]
        force: bool,
    },
    /// Replace the local copy with the remote one
    Download {
        database: String,
        #[arg(long)]
        force: bool,
    },
    /// Lock a database while you update it
    Lock {
        database: String,
        #[arg(long)]
        force: bool,
    },
    /// Release your lock; with --force, anyone's
    Unlock {
        database: String,
        #[arg(long)]
        force: bool,
    },
    /// Rebuild metadata from the local files
    RegenerateMetadata,
    /// Forget local anchors and cached hashes
    Reset,
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if !verbose {
        let path = config.log_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("could not open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

/// Runs one operation through the coordinator while `ui` renders it.
/// Ctrl-C cancels it and waits, bounded, for its cleanup.
async fn run_operation<F, Fut>(
    engine: Arc<SyncEngine>,
    ui: Ui,
    database: &str,
    kind: OperationKind,
    action: F,
) -> Result<bool>
where
    F: FnOnce(Arc<SyncEngine>, OperationContext) -> Fut,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    let (coordinator, updates) = OperationCoordinator::new();
    let handle = coordinator.start(database, kind, |ctx| action(engine, ctx))?;
    let presenter = spawn(ui.present(updates));

    let wait = handle.wait();
    pin!(wait);
    let result = select! {
        result = &mut wait => result,
        _ = signal::ctrl_c() => {
            warn!("interrupted, cancelling {kind} of {database}");
            ui.message("Cancelling…");
            if coordinator.shutdown(SHUTDOWN_POLL, SHUTDOWN_POLLS).await {
                wait.await
            } else {
                Outcome::Failed("operation did not stop in time".to_string())
            }
        }
    };

    // Finished is sent just before the task ends; give the renderer a moment.
    match timeout(Duration::from_secs(1), presenter).await {
        Ok(Ok(_)) => {}
        _ => debug!("presenter did not finish"),
    }
    Ok(result == Outcome::Completed)
}

async fn interruptible<T>(
    token: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    select! {
        result = work => result,
        _ = signal::ctrl_c() => {
            token.cancel();
            bail!("interrupted")
        }
    }
}

async fn run(args: Args, ui: Ui) -> Result<bool> {
    let flags = Overrides {
        config: args.config,
        user: args.user,
        host: args.host,
        ..Default::default()
    };
    let config = Config::load(flags.or(Overrides::from_env()))
        .context("could not load configuration")?;
    init_logging(&config, args.verbose)?;
    info!(
        "dbsync {} as {} (locks in {}, metadata in {})",
        env!("CARGO_PKG_VERSION"),
        config.identity,
        config.lock_dir(),
        config.version_dir()
    );

    let store = RcloneStore::new(config.rclone_binary.clone(), config.transfer.clone());
    store.ensure_available().await.with_context(|| {
        format!(
            "`{}` is required; install it and make sure it is on PATH",
            config.rclone_binary
        )
    })?;
    let engine = Arc::new(SyncEngine::new(Arc::new(store), &config));
    let token = CancellationToken::new();

    match args.command {
        Command::Status { database: None } => {
            let infos = interruptible(&token, async {
                Ok(engine.refresh(&HashSet::new(), &token).await?)
            })
            .await?;
            ui.print_table(&infos);
            Ok(true)
        }
        Command::Status {
            database: Some(database),
        } => {
            let info = interruptible(&token, async {
                Ok(engine.status_of(&database, false, &token).await?)
            })
            .await?;
            ui.print_status(&info);
            Ok(true)
        }
        Command::Upload { database, force } => {
            run_operation(engine, ui, &database, OperationKind::Upload, move |e, ctx| async move {
                outcome(e.upload(&ctx, force).await)
            })
            .await
        }
        Command::Download { database, force } => {
            run_operation(engine, ui, &database, OperationKind::Download, move |e, ctx| async move {
                outcome(e.download(&ctx, force).await)
            })
            .await
        }
        Command::Lock { database, force } => {
            run_operation(engine, ui, &database, OperationKind::Lock, move |e, ctx| async move {
                outcome(e.lock_for_update(&ctx, force).await)
            })
            .await
        }
        Command::Unlock { database, force } => {
            run_operation(engine, ui, &database, OperationKind::Unlock, move |e, ctx| async move {
                outcome(e.unlock(&ctx, force).await)
            })
            .await
        }
        Command::RegenerateMetadata => {
            if !ui
                .ask("Rebuild the remote metadata of every local database from the local files?")
                .await
            {
                bail!("aborted");
            }
            let written = interruptible(&token, async {
                Ok(engine.regenerate_metadata(&token).await?)
            })
            .await?;
            ui.message(format!("regenerated metadata for {written} database(s)"));
            Ok(true)
        }
        Command::Reset => {
            engine.reset().await?;
            ui.message(format!(
                "removed local state in {}",
                engine.state_dir().display()
            ));
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let is_tty = stderr().is_terminal();
    term::init(is_tty);
    let args = Args::parse();
    let interactive = !args.no_input && stdin().is_terminal();
    let ui = Ui::new(is_tty, args.quiet, interactive);

    match run(args, ui).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
