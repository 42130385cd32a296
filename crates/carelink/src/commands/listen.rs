//! `carelink listen`: stream realtime events to stdout as JSON lines.

use carelink_api::{ConnectionManager, ConnectionState, EventKind, ServerEvent};
use carelink_config::Config;
use strum::IntoEnumIterator;
use tracing::{info, warn};

use crate::cli::ListenArgs;
use crate::error::CliError;

pub async fn handle(args: ListenArgs, cfg: &Config) -> Result<(), CliError> {
    let credentials = cfg.credential_store();
    if credentials.token().is_none() {
        return Err(CliError::NoSession);
    }

    let manager = ConnectionManager::with_websocket(cfg.realtime_config()?, credentials);
    for kind in EventKind::iter() {
        manager.on(kind, print_event);
    }

    let mut state = manager.state();
    manager.connect();

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let outcome = loop {
        tokio::select! {
            _ = &mut interrupt => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => {
                        info!("connected");
                        for room in &args.rooms {
                            manager.join_room(room.clone());
                        }
                    }
                    ConnectionState::Reconnecting { attempt } => info!(attempt, "reconnecting"),
                    ConnectionState::Disconnected => break Err(CliError::RealtimeUnavailable),
                    ConnectionState::Connecting => {}
                }
            }
        }
    };

    manager.disconnect();
    outcome
}

fn print_event(event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(event = %event.kind(), error = %e, "could not render event"),
    }
}
