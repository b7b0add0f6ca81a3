use std::{
    fmt::Display,
    io::{self, Write},
    thread,
};

use common::{
    coordinator::{OperationUpdate, Outcome},
    progress::{phase_percent, scaled_percent, TransferProgress},
    status::{DatabaseStatus, DatabaseStatusInfo},
};
use kdam::{term::Colorizer, tqdm, BarExt, Column, RichProgress, Spinner};
use log::debug;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

#[derive(Clone, Copy, Debug)]
pub struct Ui {
    tty: bool,
    quiet: bool,
    interactive: bool,
}

fn new_bar() -> RichProgress {
    RichProgress::new(
        tqdm!(total = 100, unit = "%"),
        vec![
            Column::Spinner(Spinner::new(
                &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"],
                80.0,
                1.0,
            )),
            Column::Text("[bold blue]?".to_owned()),
            Column::Animation,
            Column::Percentage(0),
            Column::Text("•".to_owned()),
            Column::Text(String::new()),
        ],
    )
}

fn set_label(bar: &mut RichProgress, label: &str) {
    bar.columns.truncate(5);
    bar.columns.push(Column::Text(label.colorize("green")));
    let _ = bar.refresh();
}

fn status_colour(status: DatabaseStatus) -> &'static str {
    use DatabaseStatus::*;
    match status {
        UpToDate => "green",
        LocalNewer | NewLocal | LockedByYou | Uploading => "cyan",
        RemoteNewer | RemoteOnly => "yellow",
        LockedByOther | UploadCancelled | StaleMeta | NoMetadata => "magenta",
        ErrorReadLocal | ErrorStatLocal | Unknown => "red",
    }
}

fn describe_transfer(progress: &TransferProgress) -> String {
    let mut line = match progress.percent() {
        Some(p) => format!("{p}%"),
        None => format!("{} bytes", progress.bytes),
    };
    if progress.speed > 0.0 {
        line.push_str(&format!(" at {:.2} MiB/s", progress.speed_mib()));
    }
    if let Some(eta) = progress.eta {
        line.push_str(&format!(", {}s left", eta.as_secs()));
    }
    line
}

impl Ui {
    pub fn new(tty: bool, quiet: bool, interactive: bool) -> Self {
        Self {
            tty,
            quiet,
            interactive,
        }
    }

    pub fn message(&self, text: impl Display) {
        if !self.quiet {
            eprintln!("{text}");
        }
    }

    /// Asks a yes/no question on the terminal. Without a terminal the answer
    /// is always no.
    pub async fn ask(&self, question: &str) -> bool {
        if !self.interactive {
            self.message(format!("{question} [y/N] no (not interactive)"));
            return false;
        }
        eprint!("{question} [y/N] ");
        let _ = io::stderr().flush();

        // A plain thread: a pending read must not keep the runtime alive.
        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            let mut line = String::new();
            let _ = tx.send(io::stdin().read_line(&mut line).map(|_| line));
        });
        match rx.await {
            Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }

    pub async fn present(
        self,
        mut updates: mpsc::UnboundedReceiver<OperationUpdate>,
    ) -> Option<Outcome> {
        let mut bar: Option<RichProgress> = None;
        let mut reported: Option<u8> = None;
        while let Some(update) = updates.recv().await {
            match update {
                OperationUpdate::Phase { database, label } => {
                    if self.quiet {
                        continue;
                    }
                    if self.tty {
                        let bar = bar.get_or_insert_with(new_bar);
                        set_label(bar, &format!("{database}: {label}"));
                        if let Some(p) = phase_percent(&label) {
                            let _ = bar.update_to(p as usize);
                        }
                    } else {
                        eprintln!("{database}: {label}");
                    }
                }
                OperationUpdate::Progress { progress, .. } => {
                    if self.quiet {
                        continue;
                    }
                    if let Some(bar) = bar.as_mut() {
                        if let Some(p) = scaled_percent(&progress) {
                            let _ = bar.update_to(p as usize);
                        }
                    } else if !self.tty {
                        // One line per tenth is plenty for a log.
                        let tenth = progress.percent().map(|p| p / 10);
                        if tenth != reported {
                            reported = tenth;
                            eprintln!("  {}", describe_transfer(&progress));
                        }
                    }
                }
                OperationUpdate::Confirm {
                    message, mut reply, ..
                } => {
                    if let Some(bar) = bar.as_mut() {
                        let _ = bar.clear();
                    }
                    let answer = select! {
                        answer = self.ask(&message) => Some(answer),
                        _ = reply.closed() => None,
                    };
                    match answer {
                        Some(answer) => {
                            let _ = reply.send(answer);
                        }
                        None => debug!("question withdrawn: {message}"),
                    }
                }
                OperationUpdate::Finished {
                    database,
                    kind,
                    outcome,
                } => {
                    if let Some(mut bar) = bar.take() {
                        let _ = bar.clear();
                    }
                    match &outcome {
                        Outcome::Completed => self.message(
                            format!("{kind} of {database} completed").colorize("bold green"),
                        ),
                        Outcome::Cancelled => {
                            self.message(format!("{kind} of {database} cancelled").colorize("yellow"))
                        }
                        Outcome::Failed(e) => {
                            eprintln!("{}", format!("{kind} of {database} failed: {e}").colorize("bold red"))
                        }
                    }
                    return Some(outcome);
                }
            }
        }
        None
    }

    pub fn print_table(&self, infos: &[DatabaseStatusInfo]) {
        if infos.is_empty() {
            self.message("no databases found");
            return;
        }
        let width = infos.iter().map(|i| i.name().len()).max().unwrap_or(0);
        let mut out = io::stdout().lock();
        for info in infos {
            let code = format!("{:<16}", info.status.code());
            let code = if self.tty {
                code.colorize(status_colour(info.status))
            } else {
                code
            };
            let _ = writeln!(out, "{:<width$}  {code}  {}", info.name(), info.detail);
        }
    }

    /// A single database: only the code when quiet, for scripts.
    pub fn print_status(&self, info: &DatabaseStatusInfo) {
        if self.quiet {
            println!("{}", info.status.code());
        } else {
            println!("{}: {} ({})", info.name(), info.status.code(), info.detail);
        }
    }
}
