use std::{error::Error, process, sync::Arc, time::Duration, time::Instant};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use tapedeck::{
    command::Command,
    config::Config,
    engine::{rodio::RodioEngine, Engine},
    http::{self, Fetch},
    player::Player,
    prefetch::PrefetchManager,
    state::LoopMode,
    track::Playlist,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// How often the engine reports the play position.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Playlist file
    ///
    /// TOML file with one `[[track]]` table per track, each with a `title`
    /// and a `filename`.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    playlist: String,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<String>,

    /// URL that track filenames are resolved against
    #[arg(short, long, value_hint = ValueHint::Url)]
    base_url: Option<Url>,

    /// Initial volume, from 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Loop mode: none, one or all
    #[arg(short, long = "loop", value_name = "MODE")]
    loop_mode: Option<LoopMode>,

    /// Start playing the first track right away
    #[arg(long, default_value_t = false)]
    autoplay: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
        logger.filter_module("tapedeck", level);
    }

    logger.init();
}

/// Builds the configuration from the optional file and command line
/// overrides.
fn load_config(args: &Args) -> tapedeck::error::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(base_url) = &args.base_url {
        config.set_base_url(base_url.clone())?;
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if let Some(loop_mode) = args.loop_mode {
        config.loop_mode = loop_mode;
    }

    config.normalize()?;
    Ok(config)
}

fn format_time(time: Duration) -> String {
    let secs = time.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn print_status<E: Engine>(player: &Player<E>) {
    let state = player.state();
    let index = state.current_track();
    let transport = if state.is_loading() {
        "loading"
    } else if state.is_playing() {
        "playing"
    } else {
        "paused"
    };

    println!(
        "[{index}/{}] {} {transport}",
        player.playlist().last_index(),
        player.current()
    );
    println!(
        "  {} / {}, buffered {}, volume {:.0}%, loop {}",
        format_time(state.current_time()),
        state.duration().map_or_else(|| "?".to_owned(), format_time),
        state.buffered(),
        state.volume() * 100.0,
        state.loop_mode(),
    );
    if let Some(error) = state.error() {
        println!("  error: {error} (type `retry` to try again)");
    }
    let in_memory = player.prefetcher().arena().len();
    if in_memory > 0 {
        println!("  {in_memory} prefetched tracks in memory");
    }
    for (index, prefetch) in player.prefetcher().snapshot() {
        match prefetch.failure() {
            Some(failure) => println!("  prefetch {index}: {} ({failure})", prefetch.phase()),
            None => println!(
                "  prefetch {index}: {} {}",
                prefetch.phase(),
                prefetch.progress()
            ),
        }
    }
}

fn print_playlist<E: Engine>(player: &Player<E>) {
    let current = player.state().current_track();
    for (index, track) in player.playlist().iter().enumerate() {
        let marker = if index == current { '>' } else { ' ' };
        println!("{marker} {index}: {track}");
    }
}

/// Executes one command. Returns `false` when the user asked to quit.
fn execute<E: Engine>(player: &mut Player<E>, command: Command) -> tapedeck::error::Result<bool> {
    debug!("executing {command}");
    match command {
        Command::Play(index) => player.play_track(index)?,
        Command::Pause => player.pause(),
        Command::Toggle => player.toggle_play()?,
        Command::Select(index) => player.select_track(index)?,
        Command::Click(index) => player.handle_track_click(index)?,
        Command::Seek(percent) => player.seek(percent)?,
        Command::Volume(volume) => player.set_volume(volume),
        Command::Loop(mode) => player.set_loop(mode),
        Command::Next => {
            if !player.next()? {
                info!("already at the last track");
            }
        }
        Command::Previous => {
            if !player.previous()? {
                info!("already at the first track");
            }
        }
        Command::Prefetch(index) => {
            drop(player.prefetch_track(index)?);
        }
        Command::Cancel(index) => {
            if !player.prefetcher().cancel(index) {
                info!("track {index} is not downloading");
            }
        }
        Command::Retry => player.retry()?,
        Command::Status => print_status(player),
        Command::List => print_playlist(player),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// Sleeps until `deadline`, or forever without one.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error when the configuration or playlist cannot be loaded,
/// the audio device cannot be opened, or standard input fails.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    let playlist = Playlist::from_file(&args.playlist)?;
    info!(
        "loaded {} tracks from {}, resolved against {}",
        playlist.len(),
        args.playlist,
        config.base_url
    );

    let client = http::Client::new(&config)?;
    let unlimited = client.unlimited.clone();
    let fetcher: Arc<dyn Fetch> = Arc::new(client);

    let (prefetch_tx, mut prefetch_rx) = tokio::sync::mpsc::unbounded_channel();
    let prefetch = PrefetchManager::new(
        playlist.clone(),
        config.base_url.clone(),
        fetcher,
        Some(prefetch_tx),
    );

    let (engine_tx, mut engine_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = RodioEngine::new(prefetch.arena().clone(), unlimited, engine_tx)?;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut player = Player::new(&config, playlist, engine, prefetch).with_events(event_tx);

    if args.autoplay {
        player.play_track(None)?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let result = loop {
        let click_deadline = player.click_deadline();

        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                break Ok(());
            }

            Some(event) = engine_rx.recv() => player.handle_engine_event(event),

            Some(event) = prefetch_rx.recv() => player.handle_prefetch_event(event),

            Some(event) = event_rx.recv() => info!("{event}"),

            () = until(click_deadline) => {
                if let Err(e) = player.poll_clicks() {
                    warn!("{e}");
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = player.tick() {
                    warn!("{e}");
                }
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<Command>().and_then(|command| execute(&mut player, command)) {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => error!("{e}"),
                    }
                }
                Ok(None) => {
                    info!("end of input, shutting down");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            },
        }
    };

    let revoked = player.teardown();
    debug!("revoked prefetched tracks {revoked:?}");

    result
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
