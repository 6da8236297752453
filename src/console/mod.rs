//! Line-oriented console client.
//!
//! Reads commands from stdin and prints call events as they arrive. Both
//! streams are driven from one `select!` loop; commands go to the call
//! core through its `CallHandle`.

mod command;
mod render;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::call::{CallHandle, Peer, PeerId, UiEvent};
use crate::platform::Device;

pub use command::{ConsoleCommand, HELP};
pub use render::event_line;

/// Console state between commands.
struct Console {
    call: CallHandle,
    /// Last list shown, for `call <n>`.
    shown_peers: Vec<Peer>,
    /// Last camera list shown, for `switch <n>`.
    shown_cameras: Vec<Device>,
}

/// Run until `quit`, end of input, or the call core stops.
pub async fn run(call: CallHandle, mut events: mpsc::UnboundedReceiver<UiEvent>) -> Result<()> {
    let mut console = Console {
        call,
        shown_peers: Vec::new(),
        shown_cameras: Vec::new(),
    };
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    println!("Type 'help' for commands.");

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else {
                    break;
                };
                let line = line.context("Failed to read input")?;
                match ConsoleCommand::parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = console.execute(cmd).await {
                            println!("! {:#}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::error!("Call service stopped");
                    break;
                };
                println!("{}", event_line(&event));
            }
        }
    }

    if let Err(e) = console.call.hang_up().await {
        tracing::debug!("Hang-up on exit: {}", e);
    }
    Ok(())
}

impl Console {
    async fn execute(&mut self, cmd: ConsoleCommand) -> Result<()> {
        match cmd {
            ConsoleCommand::List => {
                self.shown_peers = self.call.roster().await?;
                println!("{}", render::roster(&self.shown_peers));
            }
            ConsoleCommand::Search(term) => {
                self.shown_peers = self.call.search(term).await?;
                println!("{}", render::roster(&self.shown_peers));
            }
            ConsoleCommand::Call(target) => {
                let roster = self.call.roster().await?;
                let id = resolve_peer(&self.shown_peers, &roster, &target)?;
                self.call.call(id).await?;
            }
            ConsoleCommand::Accept => self.call.accept().await?,
            ConsoleCommand::Decline => self.call.decline().await?,
            ConsoleCommand::HangUp => self.call.hang_up().await?,
            ConsoleCommand::Cameras => {
                self.shown_cameras = self.call.list_cameras().await?;
                self.print_cameras().await?;
            }
            ConsoleCommand::Microphones => {
                let mics = self.call.list_microphones().await?;
                let active = self
                    .call
                    .outbound_device(crate::platform::TrackKind::Audio)
                    .await?;
                println!("{}", render::devices(&mics, active.as_deref()));
            }
            ConsoleCommand::Refresh => {
                self.shown_cameras = self.call.refresh_devices().await?;
                self.print_cameras().await?;
            }
            ConsoleCommand::Switch(target) => {
                let device_id = resolve_camera(&self.shown_cameras, &target);
                self.call.switch_camera(device_id).await?;
            }
            ConsoleCommand::Video(on) => {
                self.call.set_video_enabled(on).await?;
            }
            ConsoleCommand::Mic(on) => {
                self.call.set_audio_enabled(on).await?;
            }
            ConsoleCommand::Preview(true) => self.call.start_preview().await?,
            ConsoleCommand::Preview(false) => self.call.stop_preview().await?,
            ConsoleCommand::Status => println!("{}", render::status(&self.call.snapshot())),
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    async fn print_cameras(&self) -> Result<()> {
        let active = self
            .call
            .outbound_device(crate::platform::TrackKind::Video)
            .await?;
        println!("{}", render::devices(&self.shown_cameras, active.as_deref()));
        Ok(())
    }
}

/// `n` (from the last list), an exact id, an exact handle, or a handle
/// fragment matching exactly one peer.
fn resolve_peer(shown: &[Peer], roster: &[Peer], target: &str) -> Result<PeerId> {
    if let Ok(n) = target.parse::<usize>() {
        let list = if shown.is_empty() { roster } else { shown };
        return match n.checked_sub(1).and_then(|i| list.get(i)) {
            Some(peer) => Ok(peer.id.clone()),
            None => bail!("no entry {} (try 'list')", n),
        };
    }
    if let Some(peer) = roster.iter().find(|p| p.id.as_str() == target) {
        return Ok(peer.id.clone());
    }
    let needle = target.to_lowercase();
    if let Some(peer) = roster.iter().find(|p| p.handle.to_lowercase() == needle) {
        return Ok(peer.id.clone());
    }
    let matches: Vec<&Peer> = roster
        .iter()
        .filter(|p| p.handle.to_lowercase().contains(&needle))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => bail!("nobody online matches '{}'", target),
        _ => bail!("'{}' matches {} people, be more specific", target, matches.len()),
    }
}

fn resolve_camera(shown: &[Device], target: &str) -> String {
    target
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| shown.get(i))
        .map(|d| d.id.clone())
        .unwrap_or_else(|| target.to_string())
}
