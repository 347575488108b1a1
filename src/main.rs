// Entrypoint for the CLI application.
// - Parses arguments, loads the configuration and builds the pipeline from
//   it; nothing below `main` reads global state.
// - Pipeline failures map to their own exit codes, anything else is 1.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use puush::api::{ApiClient, Credentials, RetryingUploader};
use puush::capture::{CaptureMode, Capturer, CommandCapturer, FileCapturer};
use puush::config::{store_api_key, Config};
use puush::error::{exit_code_of, PipelineError};
use puush::history::HistoryStore;
use puush::pipeline::Pipeline;
use puush::retry::CancelToken;
use puush::ui;

#[derive(Parser)]
#[command(name = "puush")]
#[command(version)]
#[command(about = "Take a screenshot, upload it and copy the link")]
struct Args {
    /// Config file (default: <config dir>/puush/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Do not copy the URL to the clipboard
    #[arg(long, global = true)]
    no_copy: bool,

    /// More logging, repeat for debug output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Capture the full screen (the default)
    Full,
    /// Select an area to capture
    Area,
    /// Capture the focused window
    Window,
    /// Upload an existing image
    File { path: PathBuf },
    /// Show recent uploads
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Log in with e-mail and password and store the API key
    Login,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_target(false)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::print_error(&format!("{:#}", e));
            ExitCode::from(exit_code_of(&e).clamp(1, 255) as u8)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    let history = HistoryStore::new(&config.history_file);

    let mode = match args.command.unwrap_or(Command::Full) {
        Command::Full => CaptureMode::Full,
        Command::Area => CaptureMode::Area,
        Command::Window => CaptureMode::Window,
        Command::File { path } => {
            return upload(FileCapturer::new(path), &config, &history, !args.no_copy)
        }
        Command::History { limit } => {
            let records = history
                .recent(limit)
                .with_context(|| format!("Failed to read {}", history.path().display()))?;
            ui::print_history(&records);
            return Ok(());
        }
        Command::Login => return login(&config, &config_path),
    };

    let capturer =
        CommandCapturer::new(config.capture_tool.clone(), mode, &config.screenshot_dir)
            .keep_output(config.keep_screenshots);
    upload(capturer, &config, &history, !args.no_copy)
}

fn upload<C: Capturer>(
    capturer: C,
    config: &Config,
    history: &HistoryStore,
    copy: bool,
) -> Result<()> {
    let credentials = Credentials::new(config.api_key.clone().unwrap_or_default())
        .map_err(PipelineError::from)
        .context("Run `puush login` or set PUUSH_API_KEY")?;
    let client = ApiClient::new(&config.api_url, config.timeout())?;
    let uploader = RetryingUploader::new(client, config.retry.clone());

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let spinner = ui::Spinner::new();
    let report = {
        let mut pipeline = Pipeline::new(capturer, uploader, history, credentials)
            .on_transition(|state| spinner.show(state));
        pipeline.run(&cancel)
    };
    spinner.finish();
    let report = match report {
        Ok(report) => report,
        Err(failure) => {
            if let Some(url) = failure.uploaded_url() {
                // The upload went through; still hand the link over.
                deliver_url(url, config, copy);
            }
            return Err(failure.into());
        }
    };

    info!(
        "uploaded {} after {} retr{}",
        report.upload.url(),
        report.upload.retries(),
        if report.upload.retries() == 1 { "y" } else { "ies" }
    );
    deliver_url(report.upload.url(), config, copy);
    Ok(())
}

fn deliver_url(url: &str, config: &Config, copy: bool) {
    if copy && config.copy_url {
        ui::copy_to_clipboard(url);
    }
    ui::print_url(url);
}

/// First Ctrl-C cancels the token so the pipeline stops at its next check
/// and exits with 130; a second one exits right away.
fn cancel_on_ctrl_c(token: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Ctrl-C will not cancel uploads: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Ctrl-C will not cancel uploads: {}", e);
                    return;
                }
                warn!("cancelling, press Ctrl-C again to quit now");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        });
    if let Err(e) = spawned {
        warn!("Ctrl-C will not cancel uploads: {}", e);
    }
}

fn login(config: &Config, config_path: &Path) -> Result<()> {
    let (email, password) = ui::prompt_login()?;
    let client = ApiClient::new(&config.api_url, config.timeout())?;
    let account = client.login(&email, &password)?;

    // Only the key is written; the rest of the file stays as the user left it.
    store_api_key(config_path, &account.api_key)?;
    println!(
        "Logged in{}. API key saved to {}",
        if account.premium { " (premium)" } else { "" },
        config_path.display()
    );
    Ok(())
}
