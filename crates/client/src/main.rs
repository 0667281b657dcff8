//! Terminal counting client.
//!
//! Reads one command per line from stdin. The operator id is asked for on
//! the same input when a write needs one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};

use stockcount_client::{
    ClientConfig, ClientError, CountingApp, ErrorKind, OperatorPrompt, ScanOutcome, SyncOutcome,
    SyncWorker,
};
use stockcount_core::OperatorId;
use stockcount_infra::{BackendStore, InMemoryBackend, RestBackend, SqliteStore};
use stockcount_observability::LogFormat;

const DEFAULT_FORMAT: &str = "CODE_128";
const PREVIEW_LIMIT: usize = 10;

const HELP: &str = "commands:
  scan <code> [FORMAT]   camera read (default CODE_128)
  manual <code>          typed entry
  sync                   submit pending counts now
  status                 counts, queue and connectivity
  refresh                reload stock and history
  export <dir>           write count records and report CSVs
  import <path>          upsert stock from csv/xlsx/xls
  reset <code>           delete all count records
  clear-stock <code>     delete all stock
  quit";

/// Lines from stdin, shared by the command loop and the operator prompt.
type Lines = Arc<Mutex<mpsc::Receiver<String>>>;

struct StdinPrompt {
    lines: Lines,
}

#[async_trait::async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn request_operator(&self, last_known: Option<&OperatorId>) -> Option<String> {
        match last_known {
            Some(last) => println!("Employee ID (last: {last}):"),
            None => println!("Employee ID:"),
        }
        self.lines.lock().await.recv().await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("STOCKCOUNT_LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse().ok())
        .unwrap_or(LogFormat::Pretty);
    stockcount_observability::init_with(format);

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let data_dir = config.resolve_data_dir()?;

    let backend: Arc<dyn BackendStore> = match (&config.backend_url, &config.backend_key) {
        (Some(url), Some(key)) => Arc::new(RestBackend::new(url.clone(), key)?),
        (Some(_), None) => anyhow::bail!("STOCKCOUNT_BACKEND_KEY is required with a backend URL"),
        _ => {
            tracing::warn!("STOCKCOUNT_BACKEND_URL not set; using in-memory backend");
            Arc::new(InMemoryBackend::new())
        }
    };
    let store = Arc::new(SqliteStore::in_dir(&data_dir));
    tracing::info!(path = %store.path().display(), "local storage");

    let lines = spawn_stdin_reader();
    let prompt = Arc::new(StdinPrompt {
        lines: lines.clone(),
    });

    let app = CountingApp::new(config.clone(), backend, store.clone(), prompt)?;
    let startup = app.start().await?;
    if startup.queue_reset {
        println!("warning: unreadable pending queue was reset");
    }
    println!(
        "ready: {} pending restored, push {}",
        startup.restored_pending,
        if startup.push { "on" } else { "off" }
    );

    let worker = SyncWorker::spawn(app.engine(), config.sync_interval);
    println!("{HELP}");

    loop {
        let Some(line) = lines.lock().await.recv().await else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        let result = match command {
            "quit" | "exit" => break,
            "help" => {
                println!("{HELP}");
                Ok(())
            }
            "scan" => match args.first() {
                Some(code) => {
                    let format = args.get(1).copied().unwrap_or(DEFAULT_FORMAT);
                    app.scan(code, format, Utc::now()).await.map(report_scan)
                }
                None => usage("scan <code> [FORMAT]"),
            },
            "manual" => match args.first() {
                Some(code) => app.manual_entry(code, Utc::now()).await.map(report_scan),
                None => usage("manual <code>"),
            },
            "sync" => app.sync_now().await.map(|outcome| match outcome {
                SyncOutcome::Idle => println!("nothing to sync"),
                SyncOutcome::AlreadyRunning => println!("sync already running"),
                SyncOutcome::Synced(report) => println!(
                    "synced {} ({} already counted elsewhere)",
                    report.submitted,
                    report.duplicates.len()
                ),
            }),
            "status" => {
                print_status(&app).await;
                Ok(())
            }
            "refresh" => app.refresh().await.map(|r| {
                println!("stock {}, counted {}", r.stock, r.counted);
            }),
            "export" => match args.first() {
                Some(dir) => export(&app, Path::new(dir)),
                None => usage("export <dir>"),
            },
            "import" => match args.first() {
                Some(path) => app
                    .import_stock(&PathBuf::from(path), None, |p| {
                        println!("imported {}/{}", p.done, p.total);
                    })
                    .await
                    .map(|n| println!("{n} stock items upserted")),
                None => usage("import <path>"),
            },
            "reset" => match args.first() {
                Some(code) => app
                    .reset_history(code)
                    .await
                    .map(|n| println!("{n} count records deleted")),
                None => usage("reset <code>"),
            },
            "clear-stock" => match args.first() {
                Some(code) => app
                    .clear_stock(code)
                    .await
                    .map(|n| println!("{n} stock items deleted")),
                None => usage("clear-stock <code>"),
            },
            other => {
                println!("unknown command {other:?}; try help");
                Ok(())
            }
        };

        if let Err(err) = result {
            report_error(&err);
        }
    }

    if let Some(n) = app.unsynced_warning().await {
        println!("warning: {n} counts not yet synced; attempting a final sync");
    }
    worker.shutdown();
    worker.join().await;
    if let Err(err) = app.sync_now().await {
        tracing::warn!(error = %err, "final sync failed; counts remain queued");
    }
    app.stop();
    store.close().await;
    Ok(())
}

fn spawn_stdin_reader() -> Lines {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, "stdin read failed");
                    break;
                }
            }
        }
    });
    Arc::new(Mutex::new(rx))
}

fn report_scan(outcome: ScanOutcome) {
    match outcome {
        ScanOutcome::Recorded {
            event,
            queued,
            persist_error,
        } => {
            println!("✓ {} {} ({} pending)", event.serial, event.name, queued);
            if let Some(err) = persist_error {
                println!("warning: {err}");
            }
        }
        ScanOutcome::Ignored => {}
    }
}

fn report_error(err: &ClientError) {
    match err.kind() {
        ErrorKind::Validation => println!("✗ {err}"),
        ErrorKind::TransientBackend => println!("offline: {err}"),
        ErrorKind::TerminalSync => println!("warning: {err}; counts remain queued"),
        ErrorKind::SessionGap => println!("an employee id is required"),
        ErrorKind::StorageCorruption | ErrorKind::Administrative => println!("error: {err}"),
    }
}

fn usage(text: &str) -> Result<(), ClientError> {
    println!("usage: {text}");
    Ok(())
}

async fn print_status(app: &CountingApp) {
    let status = app.status(Utc::now()).await;
    let counts = status.counts;
    println!(
        "counted {} ({} pending) | remaining {} | queue {} | {:?}{}",
        counts.counted,
        counts.pending,
        counts.remaining,
        status.pending,
        status.sync.connectivity,
        if status.sync.syncing { " | syncing" } else { "" }
    );
    if let Some(at) = status.sync.last_sync {
        println!("last sync {}", app.timestamp_style().format(at));
    }
    match (&status.operator, status.session_fresh) {
        (Some(op), true) => println!("operator {op}"),
        (Some(op), false) => println!("operator {op} (expired)"),
        (None, _) => println!("no operator"),
    }
    for (masked, name) in app.remaining_preview(PREVIEW_LIMIT) {
        println!("  {masked}  {name}");
    }
}

fn export(app: &CountingApp, dir: &Path) -> Result<(), ClientError> {
    let now = Utc::now();
    let counts = app.export_counts(dir, now)?;
    let report = app.export_report(dir, now)?;
    println!("wrote {} and {}", counts.display(), report.display());
    Ok(())
}
