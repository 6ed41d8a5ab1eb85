//! murmur: audio scheduler driven by line commands on stdin.
//!
//! Each stdin line is an intent (`music`, `wake`, `say hello`, ...). Lines
//! are read on a plain OS thread, the same way a blocking capture loop
//! would feed the scheduler.

use anyhow::Context;
use clap::{Parser, Subcommand};
use murmur::assistant::{Assistant, Intent};
use murmur::audio::{AudioOutput, AudioSink, CpalOutput, SilentOutput};
use murmur::config::OutputBackend;
use murmur::reminder::{ReminderManager, ReminderTicker};
use murmur::speech::{ChannelReplies, CommandSynthesizer, Synthesizer};
use murmur::{MurmurConfig, Scheduler, SchedulerEvent, SchedulerHandle};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
commands:
  music | pause | resume | stop | next | prev | up | down
  wake | skip | say <text> | chat <text>
  remind HH:MM <text> | reminders | forget <id or number>
  status | help | quit";

/// Priority-preemptive audio scheduler.
#[derive(Parser, Debug)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write a daily-rotated log file into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Keep time without opening an output device.
    #[arg(long)]
    silent: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and read commands from stdin (default).
    Run,

    /// List available output devices.
    Devices,

    /// Write the default configuration to the config path.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(MurmurConfig::default_config_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = load_config(&config_path)?;
            run(config, cli.silent).await
        }
        Command::Devices => {
            for name in CpalOutput::list_output_devices()? {
                println!("{name}");
            }
            Ok(())
        }
        Command::InitConfig => {
            MurmurConfig::default().save_to_file(&config_path)?;
            println!("wrote {}", config_path.display());
            Ok(())
        }
    }
}

fn init_tracing(
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("murmur=info"))
    };
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "murmur.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    Ok(guard)
}

fn load_config(path: &Path) -> anyhow::Result<MurmurConfig> {
    if path.exists() {
        info!(path = %path.display(), "loading config");
        Ok(MurmurConfig::from_file(path)?)
    } else {
        info!(path = %path.display(), "no config file, using defaults");
        Ok(MurmurConfig::default())
    }
}

async fn run(config: MurmurConfig, silent: bool) -> anyhow::Result<()> {
    println!("murmur v{}", env!("CARGO_PKG_VERSION"));

    let output: Arc<dyn AudioOutput> = if silent || config.audio.backend == OutputBackend::Silent {
        Arc::new(SilentOutput::new())
    } else {
        Arc::new(CpalOutput::new(&config.audio).context("cannot open output device")?)
    };
    let sink = match AudioSink::from_config(Arc::clone(&output), &config.playlist, &config.audio) {
        Ok(sink) => sink,
        Err(e) => {
            warn!("starting without music: {e}");
            AudioSink::new(
                output,
                Vec::new(),
                config.playlist.loop_playlist,
                config.audio.initial_volume_db,
            )?
        }
    };

    let (scheduler, handle) = Scheduler::new(&config, sink);
    let scheduler_loop = scheduler.run();
    let printer = tokio::spawn(print_events(handle.subscribe()));

    let synth: Option<Arc<dyn Synthesizer>> = CommandSynthesizer::from_config(&config.speech)
        .map(|s| Arc::new(s) as Arc<dyn Synthesizer>);
    if synth.is_none() {
        warn!("no synth_command configured, speech is disabled");
    }

    let reminders = Arc::new(Mutex::new(ReminderManager::new(config.reminders.repeat_daily)));
    let stop = CancellationToken::new();
    let ticker = synth.as_ref().map(|synth| {
        ReminderTicker::new(&config, Arc::clone(&reminders), handle.clone(), Arc::clone(synth))
            .spawn(stop.clone())
    });

    let assistant = Assistant::new(&config, handle.clone(), synth, reminders);
    let input_done = stop.clone();
    std::thread::Builder::new()
        .name("murmur-stdin".into())
        .spawn(move || {
            read_commands(assistant);
            input_done.cancel();
        })
        .context("cannot spawn stdin thread")?;

    println!("{HELP}");
    tokio::select! {
        () = stop.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("cannot listen for ctrl-c: {e}");
            }
            stop.cancel();
        }
    }

    info!("shutting down");
    if let Err(e) = handle.shutdown() {
        warn!("{e}");
    }
    scheduler_loop.await.context("scheduler loop panicked")?;
    if let Some(ticker) = ticker {
        let _ = ticker.await;
    }
    printer.abort();
    Ok(())
}

/// Blocking producer: one intent per stdin line until EOF or `quit`.
fn read_commands(mut assistant: Assistant) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));

        let intent = match word {
            "quit" | "exit" => break,
            "help" => {
                println!("{HELP}");
                continue;
            }
            "status" => {
                print_status(assistant.scheduler());
                continue;
            }
            "reminders" => {
                for (i, r) in assistant.reminders().iter().enumerate() {
                    println!("{}. {r}", i + 1);
                }
                Intent::ListReminders
            }
            "music" | "play" => Intent::PlayMusic,
            "pause" => Intent::PauseMusic,
            "resume" => Intent::ResumeMusic,
            "stop" => Intent::StopMusic,
            "next" => Intent::NextTrack,
            "prev" => Intent::PrevTrack,
            "up" => Intent::VolumeUp,
            "down" => Intent::VolumeDown,
            "wake" => Intent::Wake,
            "skip" => Intent::Skip,
            "say" if !rest.is_empty() => Intent::Say(rest.to_owned()),
            "chat" if !rest.is_empty() => Intent::Chat(Box::new(reply_from_text(rest))),
            "remind" => match rest.split_once(char::is_whitespace) {
                Some((at, text)) => Intent::AddReminder {
                    at: at.to_owned(),
                    text: text.trim().to_owned(),
                },
                None => {
                    println!("usage: remind HH:MM <text>");
                    continue;
                }
            },
            "forget" if !rest.is_empty() => Intent::RemoveReminder(rest.to_owned()),
            _ => {
                println!("unknown command: {line} (try `help`)");
                continue;
            }
        };

        if let Err(e) = assistant.dispatch(intent) {
            println!("error: {e}");
        }
    }
}

/// Reply stream yielding `text` one sentence at a time.
fn reply_from_text(text: &str) -> ChannelReplies {
    let sentences: Vec<String> = text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    let (tx, replies) = ChannelReplies::new(sentences.len());
    for sentence in sentences {
        if tx.blocking_send(Ok(sentence)).is_err() {
            break;
        }
    }
    replies
}

fn print_status(handle: &SchedulerHandle) {
    match handle.blocking_snapshot() {
        Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("error: {e}"),
        },
        Err(e) => println!("error: {e}"),
    }
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<SchedulerEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(SchedulerEvent::Reply { text, complete, .. }) => {
                let marker = if complete { "" } else { " [interrupted]" };
                println!("murmur: {text}{marker}");
            }
            Ok(SchedulerEvent::Music(murmur::audio::SinkEvent::TrackStarted { name, .. })) => {
                println!("now playing: {name}");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
