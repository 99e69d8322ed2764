//! Interactive push-to-talk conversation in the terminal.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use chuzzi_core::config::Config;
use chuzzi_core::conversation_store::JsonConversationStore;
use chuzzi_live::{GeminiLiveTransport, RomanScriptTransform, TextTransform};
use chuzzi_media::{AudioCaptureBridge, AudioPlaybackScheduler};
use chuzzi_session::{ConversationLog, SessionManager, SessionOptions, SessionUpdate};

use crate::{devices, format_message};

pub struct ChatOptions {
    pub no_transform: bool,
}

const HELP: &str = "Enter: talk / stop talking   r: reconnect   clear: forget history   q: quit";

pub async fn run(config: &Config, options: ChatOptions) -> anyhow::Result<()> {
    let Some(api_key) = config.api_key() else {
        anyhow::bail!(
            "No Gemini API key configured. Set GEMINI_API_KEY or live.api_key in {}",
            Config::config_path().display()
        );
    };

    let audio = config.audio();
    let (mic, speaker) = devices::open(&audio)?;

    let transport = Arc::new(GeminiLiveTransport::new(
        Some(api_key.clone()),
        config.live_base_url().as_deref(),
    ));

    let mut session_options = SessionOptions::from_config(config)?;
    if config.transform_enabled() && !options.no_transform {
        let transform: Arc<dyn TextTransform> = Arc::new(RomanScriptTransform::new(
            api_key,
            config.transform_model(),
            None,
        ));
        session_options.transform = Some(transform);
    }

    let mut log = if config.history_enabled() {
        ConversationLog::new(Some(Arc::new(JsonConversationStore::new(
            config.history_path(),
        ))))
    } else {
        ConversationLog::in_memory()
    };
    if let Err(e) = log.load().await {
        warn!(error = %e, "Could not restore history");
        println!("! {e}");
    }

    let (manager, handle, mut updates) = SessionManager::new(
        transport,
        AudioCaptureBridge::new(mic, audio.input_sample_rate),
        AudioPlaybackScheduler::new(speaker),
        log,
        session_options,
    );
    for message in manager.history() {
        println!("{}", format_message(message));
    }
    let task = manager.spawn();

    println!("{HELP}");
    handle.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut recording = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match line.trim() {
                    "" if recording => handle.stop_recording()?,
                    "" => handle.start_recording()?,
                    "r" => handle.start()?,
                    "clear" => handle.clear_history()?,
                    "q" | "quit" | "exit" => break,
                    _ => println!("{HELP}"),
                }
            }
            update = updates.recv() => {
                let Some(update) = update else {
                    break;
                };
                if let SessionUpdate::Recording(on) = update {
                    recording = on;
                }
                render(&update);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Leaving chat");
    handle.shutdown()?;
    task.await?;
    Ok(())
}

fn render(update: &SessionUpdate) {
    let mut out = std::io::stdout();
    match update {
        SessionUpdate::Status(status) => {
            let _ = writeln!(out, "\r\x1b[2K[{status}]");
        }
        SessionUpdate::Recording(true) => {
            let _ = writeln!(out, "\r\x1b[2K* recording, press Enter to stop");
        }
        SessionUpdate::Recording(false) => {
            let _ = writeln!(out, "\r\x1b[2K- microphone off");
        }
        SessionUpdate::Responding(_) => {}
        SessionUpdate::UserPartial(text) if !text.is_empty() => {
            let _ = write!(out, "\r\x1b[2K  you: {text}");
        }
        SessionUpdate::ModelPartial(text) if !text.is_empty() => {
            let _ = write!(out, "\r\x1b[2K  gemini: {text}");
        }
        SessionUpdate::UserPartial(_) | SessionUpdate::ModelPartial(_) => {
            let _ = write!(out, "\r\x1b[2K");
        }
        SessionUpdate::Message(message) => {
            let _ = writeln!(out, "\r\x1b[2K{}", format_message(message));
        }
        SessionUpdate::HistoryCleared => {
            let _ = writeln!(out, "\r\x1b[2KHistory cleared");
        }
        SessionUpdate::Error(message) => {
            let _ = writeln!(out, "\r\x1b[2K! {message}");
        }
    }
    let _ = out.flush();
}
