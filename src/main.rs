use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use eyre::{bail, eyre, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use rtsp_timelapse::darkness::{self, evening_date_for};
use rtsp_timelapse::session::export_session;
use rtsp_timelapse::{
    AppConfig, CaptureEngine, FfmpegSource, HistoryStore, Scheduler, SessionRunner, SessionSpec,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Unattended timelapse capture from an RTSP camera.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, default_value = "timelapse.json")]
    config: PathBuf,
    /// JSON file holding past sessions
    #[arg(long, default_value = "history.json")]
    history: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture inside the configured daily window until it closes
    Run,
    /// Run the date scheduler and capture on every scheduled night
    Schedule,
    /// Print the darkness window for a night
    Tonight {
        /// Evening date (YYYY-MM-DD); defaults to the current night
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Connect to the camera and grab one frame
    TestConnection,
    /// Turn one night's snapshots into a video
    Export {
        /// Session date as YYYYMMDD
        date: String,
    },
    /// Validate the configuration and print a summary
    CheckConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)
        .wrap_err_with(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Tonight { date } => tonight(&config, date),
        Command::TestConnection => test_connection(&config),
        Command::Export { date } => export(&config, &date),
        Command::Run => run(&config),
        Command::Schedule => schedule(config, &cli.config, &cli.history),
    }
}

fn engine_for(config: &AppConfig) -> CaptureEngine {
    let source = FfmpegSource::new(config.camera_endpoint(), &config.capture.ffmpeg_path);
    CaptureEngine::new(Arc::new(source), config.capture_settings())
}

fn check_config(config: &AppConfig) -> Result<()> {
    println!("{}", config.summary());
    config.validate()?;
    println!("Configuration OK");
    Ok(())
}

fn tonight(config: &AppConfig, date: Option<NaiveDate>) -> Result<()> {
    let astro = &config.astro_schedule;
    if !astro.has_location() {
        bail!("Set astro_schedule.latitude and longitude first");
    }

    let evening = date.unwrap_or_else(|| evening_date_for(Local::now().naive_local()));
    match darkness::compute_window(
        astro.latitude,
        astro.longitude,
        evening,
        astro.twilight_type,
        astro.start_offset_minutes,
        astro.end_offset_minutes,
    ) {
        Some(window) => println!(
            "{} ({} twilight): {} ({})",
            window.date,
            window.twilight_class,
            window.time_range_label(),
            window.duration_label()
        ),
        None => println!(
            "{}: no {} darkness at this location",
            evening, astro.twilight_type
        ),
    }
    Ok(())
}

fn test_connection(config: &AppConfig) -> Result<()> {
    config.validate()?;
    info!("Testing {}", config.camera_endpoint().sanitized_url());
    let message = engine_for(config).test_connection()?;
    println!("{message}");
    Ok(())
}

fn export(config: &AppConfig, date: &str) -> Result<()> {
    if rtsp_timelapse::window::parse_date_key(date).is_none() {
        bail!("`{date}` is not a YYYYMMDD date");
    }

    let outcome = export_session(
        &config.capture.output_folder,
        date,
        &config.export,
        &config.capture.ffmpeg_path,
        &mut |progress| {
            info!(
                "{} ({:.0}%){}",
                progress.status,
                progress.percent,
                progress
                    .stats
                    .map(|stats| format!(", {stats}"))
                    .unwrap_or_default()
            )
        },
    )?;
    println!("{}", outcome.message);
    Ok(())
}

fn run(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let window = config.schedule_window()?;

    let engine = engine_for(config);
    if !engine.start_capture(SessionSpec::new(window)) {
        bail!("Capture engine is already running");
    }

    while engine.is_running() {
        std::thread::sleep(Duration::from_secs(1));
    }

    let stats = engine.stats();
    info!(
        "Session finished: {} frames, {} failures",
        stats.frame_count, stats.failed_frame_count
    );
    match stats.last_error {
        Some(err) if engine.last_session_failed() => Err(eyre!(err)),
        _ => Ok(()),
    }
}

fn schedule(config: AppConfig, config_path: &Path, history_path: &Path) -> Result<()> {
    config.validate()?;

    let astro = Arc::new(RwLock::new(config.astro_schedule.clone()));
    let history = Arc::new(Mutex::new(HistoryStore::open(history_path)));
    let engine = Arc::new(engine_for(&config));
    let runner = Arc::new(
        SessionRunner::new(
            engine,
            config.schedule.folder_rollover_hour,
            astro.clone(),
            history,
        )
        .with_export(config.export.clone(), &config.capture.ffmpeg_path),
    );

    let scheduler = Scheduler::new(astro.clone(), runner);
    if let Some(window) = scheduler.tonight_window() {
        info!(
            "Tonight's darkness: {} ({})",
            window.time_range_label(),
            window.duration_label()
        );
    }
    scheduler.start()?;

    // Pick up edits to the schedule section on the same cadence the scheduler polls
    loop {
        std::thread::sleep(rtsp_timelapse::scheduler::CHECK_INTERVAL);
        if !scheduler.is_running() {
            bail!("Scheduler stopped unexpectedly");
        }

        match AppConfig::load_validated(config_path) {
            Ok(reloaded) => {
                let mut current = astro.write();
                if *current != reloaded.astro_schedule {
                    info!("Schedule changed on disk, reloading");
                    *current = reloaded.astro_schedule;
                }
            }
            Err(err) => warn!("Keeping the current schedule: {:#}", eyre!(err)),
        }
    }
}
