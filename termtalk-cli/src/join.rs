//! `termtalk join`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use termtalk_core::RoomId;
use termtalk_server::{FileRegistry, RegistryStore};
use termtalk_transport::{
    SecureSession, SessionConfig, Socks5Dialer, TcpDialer, TransportError,
};

use crate::ui::{self, StdinLines};
use crate::JoinArgs;

pub async fn run(
    args: &JoinArgs,
    session_config: SessionConfig,
    registry: Arc<FileRegistry>,
    stdin: &mut StdinLines,
) -> Result<()> {
    let room = match &args.room {
        Some(room) => room.clone(),
        None => ui::prompt(stdin, "Enter Room ID to join:")
            .await?
            .context("no room id given")?,
    };
    let room: RoomId = room
        .parse()
        .with_context(|| format!("'{room}' is not a room id"))?;

    let addr = match &args.host {
        Some(host) => host.clone(),
        None => match registry.get(&room).context("failed to read the room registry")? {
            Some(entry) => entry.dial_address(),
            None => {
                ui::warn(format!("Room {room} not found or expired in the local registry."));
                ui::prompt(stdin, "Enter the host address (host:port):")
                    .await?
                    .filter(|addr| !addr.is_empty())
                    .context("no host address given")?
            }
        },
    };

    let connect_timeout = Duration::from_secs(args.connect_timeout);
    let connected = if args.tor {
        let dialer = Socks5Dialer::tor(args.tor_port, connect_timeout);
        ui::info(format!("Connecting to {addr} through Tor at {}...", dialer.proxy()));
        SecureSession::connect(&dialer, &addr, &session_config).await
    } else {
        ui::info(format!("Connecting to {addr}..."));
        SecureSession::connect(&TcpDialer::new(connect_timeout), &addr, &session_config).await
    };
    let mut session = connected.context(if args.tor {
        "failed to join the room through Tor (is the Tor daemon running?)"
    } else {
        "failed to join the room"
    })?;

    ui::success("Secure session established.");
    ui::info(format!(
        "Fingerprint: {} (compare with the host out of band)",
        session.fingerprint()
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                ui::warn("Disconnecting...");
                break;
            }
            inbound = session.recv() => match inbound {
                Ok(message) => ui::message("host", message.as_str()),
                Err(TransportError::PeerDisconnected) => {
                    ui::warn("The host closed the connection.");
                    return Ok(());
                }
                Err(e) => {
                    ui::error(format!("Session ended: {e}"));
                    return Ok(());
                }
            },
            line = stdin.next_line() => match line? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    session.send_text(text).await.context("failed to send")?;
                }
                None => break,
            },
        }
    }

    if let Err(e) = session.close().await {
        tracing::debug!(error = %e, "close failed");
    }
    Ok(())
}
