use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meetroom_client::error::FailureKind;
use meetroom_client::session::{RecordingToggle, Severity};
use meetroom_client::{MeetConfig, Session, SessionDeps, SessionHandle, SessionStatus};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "meetroom", version, about = "Meeting room client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and control it with commands on stdin
    Join {
        room_code: String,
        /// Origin the app is served from (overrides APP_ORIGIN)
        #[arg(long)]
        origin: Option<Url>,
        /// Signaling server port (overrides SIGNALING_PORT)
        #[arg(long)]
        signaling_port: Option<u16>,
        /// Directory of .ivf cameras and .wav microphones (overrides MEDIA_DIR)
        #[arg(long)]
        media_dir: Option<PathBuf>,
    },
}

const HELP: &str = "commands: mic, cam, share, rec, save, discard, devices, \
video <id>, audio <id>, code, status, reconnect, leave";

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Join {
            room_code,
            origin,
            signaling_port,
            media_dir,
        } => {
            let mut config = MeetConfig::from_env().context("reading configuration")?;
            if let Some(origin) = origin {
                config.app_origin = origin.to_string();
            }
            if let Some(port) = signaling_port {
                config.signaling_port = port;
            }
            if let Some(dir) = media_dir {
                config.media_dir = dir;
            }
            join(config, room_code).await
        }
    }
}

async fn join(config: MeetConfig, room: String) -> anyhow::Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let handle = loop {
        let deps = SessionDeps::from_config(&config)?;
        match Session::start(config.clone(), room.clone(), deps).await {
            Ok(handle) => break handle,
            Err(e) => {
                println!("{e}");
                let hint = match e.kind() {
                    FailureKind::Permission => "Check that the media files are readable.",
                    FailureKind::Hardware => "Put .ivf and .wav files in the media directory.",
                    FailureKind::Network => "Check that the meeting server is running.",
                    FailureKind::Timeout => "The meeting server did not answer in time.",
                    FailureKind::Other => "",
                };
                if !hint.is_empty() {
                    println!("{hint}");
                }
                println!("Retry? [y/N]");
                let answer = input.next_line().await?.unwrap_or_default();
                if !answer.trim().eq_ignore_ascii_case("y") {
                    return Err(e.into());
                }
            }
        }
    };

    println!("Joined room {}. {}", handle.room_code(), HELP);
    spawn_printer(&handle);
    let result = command_loop(&handle, &mut input).await;
    handle.leave().await?;
    println!("Left room {}.", handle.room_code());
    result
}

/// Prints notices and peer changes as they happen.
fn spawn_printer(handle: &SessionHandle) {
    let mut notices = handle.notices();
    tokio::spawn(async move {
        loop {
            let notice = match notices.recv().await {
                Ok(notice) => notice,
                Err(RecvError::Lagged(missed)) => {
                    println!("[warning] {missed} notice(s) skipped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let tag = match notice.severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Error => "error",
            };
            println!("[{tag}] {}", notice.message);
        }
    });

    let mut view = handle.view();
    tokio::spawn(async move {
        let mut last = view.borrow().peers.clone();
        while view.changed().await.is_ok() {
            let current = view.borrow_and_update().peers.clone();
            for peer in &current {
                let before = last.iter().find(|p| p.id == peer.id);
                if before.map(|p| (p.state, p.has_video)) != Some((peer.state, peer.has_video)) {
                    let video = if peer.has_video { ", video" } else { "" };
                    println!("peer {}: {}{}", peer.id, peer.state, video);
                }
            }
            for gone in last.iter().filter(|p| !current.iter().any(|c| c.id == p.id)) {
                println!("peer {} left", gone.id);
            }
            last = current;
        }
    });
}

async fn command_loop(handle: &SessionHandle, input: &mut Input) -> anyhow::Result<()> {
    while let Some(line) = input.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let arg = words.next();

        let outcome = match (command, arg) {
            ("mic", _) => handle
                .toggle_audio()
                .await
                .map(|on| format!("microphone {}", on_off(on))),
            ("cam", _) => handle
                .toggle_video()
                .await
                .map(|on| format!("camera {}", on_off(on))),
            ("share", _) => handle
                .toggle_screen_share()
                .await
                .map(|on| format!("screen sharing {}", on_off(on))),
            ("rec", _) => handle.toggle_recording().await.map(|toggle| match toggle {
                RecordingToggle::Started => "recording...".to_string(),
                RecordingToggle::Stopped(artifact) => format!(
                    "recorded {:.0}s ({} bytes); save or discard",
                    artifact.duration.as_secs_f32(),
                    artifact.size
                ),
            }),
            ("save", _) => handle.download_recording().await.map(|path| match path {
                Some(path) => format!("saved {}", path.display()),
                None => "nothing to save".to_string(),
            }),
            ("discard", _) => handle
                .discard_recording()
                .await
                .map(|released| {
                    let message = if released { "discarded" } else { "nothing to discard" };
                    message.to_string()
                }),
            ("devices", _) => handle.devices().await.map(|list| {
                let mark = |id: &str, selected: &Option<String>| {
                    if selected.as_deref() == Some(id) { "*" } else { " " }
                };
                let mut out = String::from("cameras:");
                for d in &list.cameras {
                    let m = mark(&d.device_id, &list.selected_camera);
                    out.push_str(&format!("\n {m} {} ({})", d.device_id, d.label));
                }
                out.push_str("\nmicrophones:");
                for d in &list.microphones {
                    let m = mark(&d.device_id, &list.selected_microphone);
                    out.push_str(&format!("\n {m} {} ({})", d.device_id, d.label));
                }
                out
            }),
            ("video", Some(id)) => handle
                .switch_video_device(id)
                .await
                .map(|()| format!("camera switched to {id}")),
            ("audio", Some(id)) => handle
                .switch_audio_device(id)
                .await
                .map(|()| format!("microphone switched to {id}")),
            ("code", _) => Ok(handle.room_code().clone()),
            ("status", _) => Ok(describe(handle)),
            ("reconnect", _) => handle.reconnect().await.map(|()| "reconnected".to_string()),
            ("leave" | "quit" | "exit", _) => break,
            ("help", _) => Ok(HELP.to_string()),
            _ => Ok(format!("unknown command {line:?}; {HELP}")),
        };

        match outcome {
            Ok(message) => println!("{message}"),
            Err(e) => println!("error: {e}"),
        }
        if handle.snapshot().status == SessionStatus::Ended {
            break;
        }
    }
    Ok(())
}

fn describe(handle: &SessionHandle) -> String {
    let view = handle.snapshot();
    let mut out = format!(
        "room {} ({:?}), {} participant(s)\nmic {}, camera {}, sharing {}, recorder {:?}",
        view.room,
        view.status,
        view.participants(),
        on_off(view.media.audio_enabled),
        on_off(view.media.video_enabled),
        on_off(view.media.screen_sharing),
        view.recorder,
    );
    out.push_str(&format!("\nlevel {}", *handle.audio_level().borrow()));
    for peer in &view.peers {
        out.push_str(&format!(
            "\n  {} {}{}",
            peer.id,
            peer.state,
            if peer.is_connected { " (connected)" } else { "" }
        ));
    }
    out
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}
