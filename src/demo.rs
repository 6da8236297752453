//! In-process demo: two participants on an in-memory relay with the
//! synthetic provider, driven through a full call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::call::{self, CallHandle, CallState, DeviceManager, PeerId, Role, UiEvent};
use crate::config::Config;
use crate::console::event_line;
use crate::platform::synthetic::{SyntheticPlatform, SyntheticTransportFactory};
use crate::platform::TrackKind;
use crate::signaling::relay::MemoryRelay;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a demo run.
#[derive(Debug, Default)]
pub struct DemoResult {
    pub connected: bool,
    pub caller: Option<String>,
    pub switched_to: Option<String>,
    pub ended_cleanly: bool,
}

struct Participant {
    name: &'static str,
    id: PeerId,
    call: CallHandle,
    printer: JoinHandle<()>,
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.printer.abort();
    }
}

fn join(relay: &MemoryRelay, name: &'static str, config: &Config, auto_accept: bool) -> Participant {
    let platform = Arc::new(SyntheticPlatform::from_camera_labels(&config.synthetic_cameras));
    let devices = Arc::new(DeviceManager::new(platform, None, false));
    let (endpoint, gateway_events) = relay.join_as(name);
    let id = endpoint.id().clone();
    let (call, events) = call::spawn(
        config.call_config(),
        devices,
        Arc::new(SyntheticTransportFactory::new()),
        Arc::new(endpoint),
        gateway_events,
    );
    let printer = tokio::spawn(print_events(name, events, auto_accept.then(|| call.clone())));
    Participant {
        name,
        id,
        call,
        printer,
    }
}

/// Print one participant's events; answer incoming calls if given a handle.
async fn print_events(
    name: &'static str,
    mut events: mpsc::UnboundedReceiver<UiEvent>,
    answer_with: Option<CallHandle>,
) {
    while let Some(event) = events.recv().await {
        println!("[{}] {}", name, event_line(&event));
        if let (UiEvent::IncomingCall(_), Some(call)) = (&event, &answer_with) {
            if let Err(e) = call.accept().await {
                println!("[{}] ! accept failed: {}", name, e);
            }
        }
    }
}

async fn wait_state(p: &Participant, state: CallState) -> Result<()> {
    tokio::time::timeout(STEP_TIMEOUT, p.call.wait_for(|s| s.state == state))
        .await
        .with_context(|| format!("{} never reached {}", p.name, state))??;
    Ok(())
}

async fn wait_for_peer(p: &Participant, other: &PeerId) -> Result<()> {
    for _ in 0..100 {
        if p.call.roster().await?.iter().any(|peer| &peer.id == other) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("{} never saw {} come online", p.name, other)
}

/// Run the demo. With `glare`, both sides dial each other at once.
pub async fn run(config: &Config, glare: bool) -> Result<DemoResult> {
    let mut result = DemoResult::default();
    let relay = MemoryRelay::new();
    let alice = join(&relay, "alice", config, false);
    let bob = join(&relay, "bob", config, !glare);

    println!();
    if glare {
        println!("=== Demo (simultaneous calls) ===");
    } else {
        println!("=== Demo (alice calls bob) ===");
    }
    println!("alice: {}", alice.id);
    println!("bob:   {}", bob.id);

    wait_for_peer(&alice, &bob.id).await?;
    wait_for_peer(&bob, &alice.id).await?;

    if glare {
        let (a, b) = tokio::join!(alice.call.call(bob.id.clone()), bob.call.call(alice.id.clone()));
        a?;
        b?;
    } else {
        alice.call.call(bob.id.clone()).await?;
    }

    wait_state(&alice, CallState::Active).await?;
    wait_state(&bob, CallState::Active).await?;
    result.connected = true;
    result.caller = [&alice, &bob]
        .iter()
        .find(|p| p.call.snapshot().role == Some(Role::Caller))
        .map(|p| p.name.to_string());
    println!("connected=true");
    println!("caller={}", result.caller.as_deref().unwrap_or("?"));

    // Live camera switch on the caller side.
    let cameras = alice.call.list_cameras().await?;
    let current = alice.call.outbound_device(TrackKind::Video).await?;
    if let Some(other) = cameras.iter().find(|d| Some(&d.id) != current.as_ref()) {
        alice.call.switch_camera(other.id.clone()).await?;
        result.switched_to = alice.call.outbound_device(TrackKind::Video).await?;
        println!(
            "switched_camera={}",
            result.switched_to.as_deref().unwrap_or("?")
        );
    }

    bob.call.set_audio_enabled(false).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    alice.call.hang_up().await?;
    tokio::time::timeout(STEP_TIMEOUT, bob.call.wait_for(|s| s.state.is_idle()))
        .await
        .context("bob never left the call")??;
    result.ended_cleanly = alice.call.snapshot().state.is_idle();
    println!("ended_cleanly={}", result.ended_cleanly);

    // Let the printers catch up before the participants go away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_runs_to_completion() {
        let result = run(&Config::default(), false).await.unwrap();
        assert!(result.connected);
        assert_eq!(result.caller.as_deref(), Some("alice"));
        assert_eq!(result.switched_to.as_deref(), Some("cam-back-camera"));
        assert!(result.ended_cleanly);
    }

    #[tokio::test]
    async fn test_glare_demo_picks_one_caller() {
        let result = run(&Config::default(), true).await.unwrap();
        assert!(result.connected);
        assert_eq!(result.caller.as_deref(), Some("alice"));
    }
}
