//! `termtalk host`

use std::sync::Arc;

use anyhow::{Context, Result};
use termtalk_server::{DisconnectReason, FileRegistry, Host, HostConfig, HostEvent};

use crate::ui::{self, StdinLines};
use crate::HostArgs;

pub async fn run(
    mut config: HostConfig,
    args: &HostArgs,
    registry: Arc<FileRegistry>,
    stdin: &mut StdinLines,
) -> Result<()> {
    if let Some(bind) = &args.bind {
        config = config.with_bind_address(bind.clone());
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(ttl) = args.ttl {
        config = config.with_ttl_secs(ttl);
    }

    if !is_loopback(&config.bind_address) {
        ui::warn(format!(
            "Binding to {} exposes the room to the network.",
            config.bind_address
        ));
    }

    let ttl = config.ttl_secs;
    let (host, mut events) = Host::start(config, registry)
        .await
        .context("failed to start hosting")?;

    ui::success(format!("Room created! Room ID: {}", host.room_id()));
    ui::info(format!(
        "Listening on {} (expires in {ttl}s)",
        host.local_addr()
    ));
    ui::info("Peers join with the Room ID, not your address. Type to broadcast, Ctrl-C to close.");

    loop {
        tokio::select! {
            _ = host.closed() => {
                ui::warn("Room expired.");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                ui::warn("Closing room...");
                break;
            }
            event = events.recv() => match event {
                Some(event) => show(event),
                None => break,
            },
            line = stdin.next_line() => match line? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match host.broadcast(text) {
                        Ok(0) => ui::warn("No peers connected yet."),
                        Ok(_) => {}
                        Err(e) => ui::error(format!("Not sent: {e}")),
                    }
                }
                None => {
                    ui::info("Input closed; waiting for the room to expire.");
                    host.closed().await;
                    break;
                }
            },
        }
    }

    host.shutdown().await;
    Ok(())
}

fn show(event: HostEvent) {
    match event {
        HostEvent::PeerJoined { peer, fingerprint } => {
            ui::success(format!("{peer} joined (fingerprint {fingerprint})"));
        }
        HostEvent::Message { peer, text } => ui::message(peer, &text),
        HostEvent::PeerLeft { peer, reason } => match reason {
            DisconnectReason::PeerClosed => ui::info(format!("{peer} left")),
            reason => ui::warn(format!("{peer} dropped: {reason}")),
        },
    }
}

fn is_loopback(address: &str) -> bool {
    address == "localhost"
        || address
            .parse::<std::net::IpAddr>()
            .map_or(false, |ip| ip.is_loopback())
}
