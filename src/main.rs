mod mail_reader;
mod settings;
mod web_services;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use mail_reader::attachment_store::AttachmentStore;
use mail_reader::cursor::CursorStore;
use mail_reader::fetch::days_ago;
use mail_reader::imap::{AccessMode, Credentials, ImapConnector};
use mail_reader::{SyncMode, SyncRequest};
use settings::Config;

#[derive(Debug, Parser)]
#[command(about = "Fetch mail over IMAP and keep its attachments on disk")]
struct Cli {
    /// YAML settings file
    #[arg(long, default_value = "settings.yaml")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve,
    /// Run a single sync from the command line
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    email: String,
    /// Only fetch messages above the folder's stored UID watermark
    #[arg(long)]
    incremental: bool,
    #[arg(long)]
    since_days: Option<i64>,
    #[arg(long)]
    folder: Option<String>,
    /// Open the folder read-write (fetched messages become seen)
    #[arg(long)]
    read_write: bool,
}

fn setup_logger(level: LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message,
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

async fn sync_once(config: Config, args: SyncArgs) -> Result<()> {
    let SyncArgs {
        email,
        incremental,
        since_days,
        folder,
        read_write,
    } = args;

    let mode = if incremental {
        SyncMode::Incremental
    } else {
        SyncMode::Window {
            since: days_ago(since_days.unwrap_or(config.sync.since_days))?,
        }
    };
    let secret = rpassword::prompt_password(format!("Password for {}: ", email))?;
    let request = SyncRequest {
        credentials: Credentials { address: email, secret },
        folder: folder.unwrap_or_else(|| config.imap.folder.clone()),
        mode,
        access: if read_write {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        },
        include_payload: false,
    };

    let connector = ImapConnector::new(config.imap.server.clone(), config.imap.port);
    let store = AttachmentStore::new(
        &config.storage.attachments_dir,
        config.storage.store_mode,
        config.storage.retry_policy,
    )?;
    let cursors = CursorStore::new(&config.storage.cursor_file);

    let report = mail_reader::sync(&connector, &store, &cursors, &request).await?;
    mail_reader::display::display_report(&report);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logger(cli.log_level)?;
    let config = settings::load_settings(&cli.config)?;

    match cli.command {
        Command::Serve => web_services::entrypoint(config).await,
        Command::Sync(args) => sync_once(config, args).await,
    }
}
