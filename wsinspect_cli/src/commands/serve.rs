//! Serve command: listener, control API and live console

use crate::config::Config;
use crate::inspector::{
    adapter, shutdown_session, start_server, start_session, AppState, InspectorStore, LogEntry,
    MessageFormat, StoreEvent,
};
use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wsinspect_common::{Direction, MessageBody};
use wsinspect_listener::Listener;

/// Serve options
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub address: Option<String>,
    pub control_port: Option<u16>,
    pub no_start: bool,
    pub format: Option<MessageFormat>,
    pub quiet: bool,
}

/// Handle serve command
pub async fn run(opts: ServeOptions) -> Result<()> {
    let config = Config::load()?.with_overrides(opts.address, opts.control_port, opts.format);

    cliclack::intro(style(" wsinspect ").on_cyan().black().to_string())?;

    let store = Arc::new(InspectorStore::new());
    let (events, rx) = mpsc::unbounded_channel();
    let consumer = adapter::spawn(store.clone(), rx);
    let listener = Arc::new(Listener::new(events.clone()));

    let state = AppState {
        store: store.clone(),
        listener: listener.clone(),
        events,
        default_address: Arc::new(config.address.clone()),
        format: config.format,
    };
    let api = start_server(config.control_port, state).await?;
    cliclack::log::info(format!(
        "Control API on {}",
        style(format!("http://127.0.0.1:{}", config.control_port)).cyan()
    ))?;

    let printer = (!opts.quiet).then(|| spawn_printer(store.subscribe(), config.format));

    if opts.no_start {
        cliclack::log::info("Listener not started, use POST /api/server/start")?;
    } else {
        match start_session(&store, &listener, &config.address).await {
            Ok(address) => cliclack::log::success(format!(
                "Listening on {}",
                style(format!("ws://{}", address)).green().bold()
            ))?,
            Err(e) => cliclack::log::error(format!("Failed to start listener: {}", e))?,
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    if let Err(e) = shutdown_session(&store, &listener).await {
        cliclack::log::warning(format!("Failed to stop listener: {}", e))?;
    }

    api.abort();
    consumer.abort();
    if let Some(printer) = printer {
        printer.abort();
    }

    cliclack::outro("Stopped")?;
    Ok(())
}

/// Print captured log entries and session changes as they happen
fn spawn_printer(mut rx: broadcast::Receiver<StoreEvent>, format: MessageFormat) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    println!("  {}", style(format!("... {} events skipped", skipped)).dim());
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                StoreEvent::Ingested { entry, logged: true } => {
                    println!("{}", describe_entry(&entry, format));
                }
                StoreEvent::Ingested { logged: false, .. } => {}
                StoreEvent::Session(session) => {
                    println!("  {} {}", style("server").dim(), style(session).yellow());
                }
                StoreEvent::CaptureChanged { active } => {
                    let label = if active { "resumed" } else { "paused" };
                    println!("  {} {}", style("capture").dim(), style(label).yellow());
                }
                StoreEvent::LogCleared => {
                    println!("  {}", style("log cleared").dim());
                }
            }
        }
    })
}

/// One console line for a log entry
fn describe_entry(entry: &LogEntry, format: MessageFormat) -> String {
    let time = entry.time().format("%H:%M:%S%.3f");
    let client = entry.client();
    let prefix = format!("{} #{}", style(time).dim(), style(client.identifier).cyan());

    match entry {
        LogEntry::Connect(event) => format!(
            "{} {} {} /{}",
            prefix,
            style("connected").green(),
            client.address,
            event.path
        ),
        LogEntry::Disconnect(event) => match (event.close_code(), event.close_reason()) {
            (Some(code), Some(reason)) if !reason.is_empty() => format!(
                "{} {} {} {}",
                prefix,
                style("disconnected").red(),
                code,
                reason
            ),
            (Some(code), _) => format!("{} {} {}", prefix, style("disconnected").red(), code),
            (None, _) => format!("{} {} abnormally", prefix, style("disconnected").red()),
        },
        LogEntry::Message(event) => {
            let arrow = match event.direction {
                Direction::FromClient => "<-",
                Direction::ToClient => "->",
            };
            let payload = match &event.body {
                MessageBody::Ping(data) | MessageBody::Pong(data) if data.is_empty() => {
                    String::new()
                }
                body => format.render_or_placeholder(body),
            };
            format!(
                "{} {} {} {}",
                prefix,
                arrow,
                style(event.body.label()).magenta(),
                payload
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsinspect_common::{ClientHandle, CloseFrame, ConnectEvent, DisconnectEvent, MessageEvent};

    fn client() -> ClientHandle {
        ClientHandle::new(7, "127.0.0.1:9001")
    }

    #[test]
    fn test_describe_entries() {
        console::set_colors_enabled(false);

        let connect = describe_entry(
            &LogEntry::Connect(ConnectEvent::new(client(), "chat")),
            MessageFormat::Plain,
        );
        assert!(connect.ends_with("#7 connected 127.0.0.1:9001 /chat"));

        let message = describe_entry(
            &LogEntry::Message(MessageEvent::binary(client(), Direction::ToClient, vec![0xab])),
            MessageFormat::Hexadecimal,
        );
        assert!(message.ends_with("#7 -> BINARY ab"));

        let closed = describe_entry(
            &LogEntry::Disconnect(DisconnectEvent::new(
                client(),
                Some(CloseFrame {
                    code: 1000,
                    reason: "bye".into(),
                }),
            )),
            MessageFormat::Plain,
        );
        assert!(closed.ends_with("disconnected 1000 bye"));

        let abnormal = describe_entry(
            &LogEntry::Disconnect(DisconnectEvent::new(client(), None)),
            MessageFormat::Plain,
        );
        assert!(abnormal.ends_with("disconnected abnormally"));
    }
}
