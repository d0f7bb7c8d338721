pub mod analysis_types;
pub mod backends;
pub mod camera_toolkit;
mod cli;
pub mod keyring;
mod llm_types;
pub mod managers;
pub mod normalizer;
pub mod report;
pub mod session_state;
pub mod settings;

pub use cli::{CliArgs, Command, KeyAction};

use anyhow::{bail, Context};
use clap::Parser;
use env_filter::Builder as EnvFilterBuilder;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::analysis_types::AnalysisResult;
use crate::backends::remote::store_verified_key;
use crate::backends::RemoteScoringBackend;
use crate::camera_toolkit::device::UnavailableCamera;
use crate::camera_toolkit::{default_camera, CameraDevice};
use crate::keyring::{CredentialStore, KeyringCredentialStore, MemoryCredentialStore};
use crate::managers::session::{AnalyzeOutcome, SessionController};
use crate::session_state::SessionPhase;
use crate::settings::{load_settings, AppSettings};

type Input = Lines<BufReader<Stdin>>;

/// Console directives from RUST_LOG, validated with env_filter. Falls back to
/// info (debug with `--debug`) when unset or invalid.
fn build_console_filter(debug: bool) -> (String, Option<String>) {
    let fallback = if debug { "debug" } else { "info" };

    match std::env::var("RUST_LOG") {
        Ok(spec) if !spec.trim().is_empty() => {
            match EnvFilterBuilder::new().try_parse(&spec) {
                Ok(_) => (spec, None),
                Err(err) => (
                    fallback.to_string(),
                    Some(format!(
                        "Ignoring invalid RUST_LOG value '{}': {}. Falling back to {}-level console logging",
                        spec, err, fallback
                    )),
                ),
            }
        }
        _ => (fallback.to_string(), None),
    }
}

fn init_logging(debug: bool) {
    let (spec, warning) = build_console_filter(debug);
    let _ = env_logger::Builder::new()
        .parse_filters(&spec)
        .format_timestamp_millis()
        .try_init();
    if let Some(warning) = warning {
        log::warn!("{}", warning);
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.debug);

    let mut settings = load_settings();
    args.apply_to(&mut settings);
    log::debug!("Effective settings: {:?}", settings);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(dispatch(args, settings))
}

async fn dispatch(args: CliArgs, settings: AppSettings) -> anyhow::Result<()> {
    match &args.command {
        Command::Grade { path } => grade_file(path, &args, settings).await,
        Command::Capture => capture_loop(&args, settings).await,
        Command::Key { action } => manage_key(action, &args, &settings).await,
    }
}

/// A `--api-key` value is used for this run only; otherwise the keychain.
fn credential_store(args: &CliArgs) -> Box<dyn CredentialStore> {
    match args.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Box::new(MemoryCredentialStore::with_value(key)),
        _ => Box::new(KeyringCredentialStore::new()),
    }
}

/* ---------- grade --------------------------------------------------------- */

async fn grade_file(path: &Path, args: &CliArgs, settings: AppSettings) -> anyhow::Result<()> {
    let controller = SessionController::new(UnavailableCamera, credential_store(args), settings);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    controller
        .import_from_path(path)
        .await
        .with_context(|| format!("Failed to import {}", path.display()))?;

    let outcome = analyze_and_present(&controller, &mut input, args.json).await;
    controller.close();
    outcome
}

/* ---------- capture ------------------------------------------------------- */

const CAPTURE_HELP: &str = "Enter: take photo   r: retake   a: analyze   q: quit";

async fn capture_loop(args: &CliArgs, settings: AppSettings) -> anyhow::Result<()> {
    let device = default_camera(settings.camera_index);
    let controller = SessionController::new(device, credential_store(args), settings);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    controller
        .start_live_capture()
        .context("Could not start the camera")?;
    println!("Camera ready. {}", CAPTURE_HELP);

    while let Some(line) = input.next_line().await? {
        match line.trim() {
            "" => match controller.capture_frame() {
                Ok(still) => println!(
                    "Captured photo at {} ({} KB). Press a to analyze or r to retake.",
                    still.captured_at().with_timezone(&chrono::Local).format("%H:%M:%S"),
                    still.len() / 1024
                ),
                Err(e) => {
                    eprintln!("Could not take photo: {}", e);
                    if controller.snapshot().phase == SessionPhase::Failed {
                        println!("Press r to reopen the camera or q to quit.");
                    }
                }
            },
            "r" => match controller.restart_capture() {
                Ok(()) => println!("Camera ready. {}", CAPTURE_HELP),
                Err(e) => eprintln!("Could not retake: {}", e),
            },
            "a" => {
                if let Err(e) = analyze_and_present(&controller, &mut input, args.json).await {
                    eprintln!("Analysis failed: {:#}", e);
                    if controller.snapshot().phase == SessionPhase::Failed
                        && controller.retry().is_ok()
                    {
                        println!("Press a to try again or r to retake.");
                    }
                } else {
                    println!("Press r for a new photo or q to quit.");
                }
            }
            "q" => break,
            other => println!("Unknown command '{}'. {}", other, CAPTURE_HELP),
        }
    }

    controller.close();
    Ok(())
}

/* ---------- shared analysis flow ------------------------------------------ */

async fn analyze_and_present<D, S>(
    controller: &SessionController<D, S>,
    input: &mut Input,
    json: bool,
) -> anyhow::Result<()>
where
    D: CameraDevice,
    S: CredentialStore,
{
    loop {
        match controller.analyze().await? {
            AnalyzeOutcome::Presented(result) => return print_result(&result, json),
            AnalyzeOutcome::CredentialRequired => {
                let key = prompt(input, "An API key is required. Enter your API key: ").await?;
                if key.is_empty() {
                    bail!("No API key entered");
                }
                if let Err(e) = controller.set_credential(&key).await {
                    eprintln!("{}", e);
                }
            }
            AnalyzeOutcome::Discarded => bail!("Analysis was cancelled"),
        }
    }
}

fn print_result(result: &AnalysisResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", report::render(result));
    }
    Ok(())
}

async fn prompt(input: &mut Input, message: &str) -> anyhow::Result<String> {
    print!("{}", message);
    std::io::stdout().flush()?;
    let line = input.next_line().await?.unwrap_or_default();
    Ok(line.trim().to_string())
}

/* ---------- key ----------------------------------------------------------- */

async fn manage_key(action: &KeyAction, args: &CliArgs, settings: &AppSettings) -> anyhow::Result<()> {
    let keychain = KeyringCredentialStore::new();

    match action {
        KeyAction::Set { value } => {
            let key = match value {
                Some(value) => value.trim().to_string(),
                None => {
                    let mut input = BufReader::new(tokio::io::stdin()).lines();
                    prompt(&mut input, "Enter your API key: ").await?
                }
            };
            if key.is_empty() {
                bail!("API key must not be empty");
            }
            store_verified_key(&keychain, &key, settings).await?;
            println!(
                "API key stored ({})",
                keychain.hint().unwrap_or_else(|| "not readable back".to_string())
            );
        }
        KeyAction::Status => match keychain.hint() {
            Some(hint) => println!("API key stored: {}", hint),
            None => println!("No API key stored"),
        },
        KeyAction::Clear => {
            keychain.delete()?;
            println!("API key removed");
        }
        KeyAction::Check => {
            let key = credential_store(args)
                .get()
                .context("No API key stored; run `mathgrade key set` first")?;
            let backend = RemoteScoringBackend::from_settings(Some(key), settings);
            if backend.probe().await {
                println!("API key accepted by {}", settings.effective_base_url());
            } else {
                bail!(
                    "API key was rejected or {} is unreachable",
                    settings.effective_base_url()
                );
            }
        }
    }
    Ok(())
}
