//! Command handlers
//!
//! Discovery datagrams are answered inline by the dispatch loop; stream
//! commands are run by the worker that owns the sending connection.

use crate::audit::AuditLogger;
use crate::error::Result;
use crate::protocol::{
    DiscoveryCommand, Keyword, StreamCommand, close_dialog_frame, encode_frame, split_command,
};
use crate::queue::{Command, CommandType};
use crate::registry::{ConnectionStatus, SlotHandle};
use crate::station::{PeerContext, Station};
use crate::test_log::records_payload;
use bytes::Bytes;
use kestrel_core::{MacAddress, Sequence, TestRecord};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records sent per TEST_DATA___/DIAG_DATA___ frame.
const RECORDS_PER_FRAME: usize = 256;

/// Result of handling one discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryAction {
    /// Send this frame back to the requester
    Reply(Bytes),
    /// Tear down the stream connection of this peer
    Disconnect(MacAddress),
    Ignore,
}

fn discovery_reply(keyword: Keyword, payload: &str) -> DiscoveryAction {
    match encode_frame(keyword, payload.as_bytes()) {
        Ok(frame) => DiscoveryAction::Reply(frame),
        Err(e) => {
            warn!("Cannot frame {} reply: {}", keyword.as_str(), e);
            DiscoveryAction::Ignore
        }
    }
}

async fn board_info(station: &Station) -> DiscoveryAction {
    let board = station.board_state().await;
    let payload = format!(
        "{}|{}|{}",
        station.config().station_name(),
        station.tcp_port(),
        board.summary()
    );
    discovery_reply(Keyword::BoardInfo, &payload)
}

/// Handle a datagram received on the discovery socket.
///
/// Line 1 is the command code, line 2 the sender's MAC address, further lines
/// depend on the command.
pub async fn handle_discovery(
    station: &Station,
    peer: SocketAddr,
    datagram: &[u8],
) -> DiscoveryAction {
    let (code, rest) = match split_command(datagram) {
        Ok(parts) => parts,
        Err(e) => {
            debug!("Ignoring malformed datagram from {}: {}", peer, e);
            return DiscoveryAction::Ignore;
        }
    };
    let command = match DiscoveryCommand::try_from(code) {
        Ok(command) => command,
        Err(_) => {
            debug!("Unrecognised discovery code {} from {}", code, peer);
            return DiscoveryAction::Ignore;
        }
    };

    let text = String::from_utf8_lossy(rest);
    let mut lines = text.lines();
    let mac = match lines.next().map(|line| line.parse::<MacAddress>()) {
        Some(Ok(mac)) => mac,
        _ => {
            warn!("{:?} from {} without a valid MAC address", command, peer);
            if station.audit_enabled() {
                AuditLogger::protocol_violation(peer, "discovery datagram without MAC address");
            }
            return DiscoveryAction::Ignore;
        }
    };
    station.record_address(peer.ip(), mac).await;

    let action = match command {
        DiscoveryCommand::InitialBroadcast => board_info(station).await,
        DiscoveryCommand::DefaultBroadcast => {
            let serial = station.board_state().await.serial_number;
            let listed = !serial.is_empty()
                && lines
                    .next()
                    .is_some_and(|known| known.split(',').any(|s| s.trim() == serial));
            if listed {
                board_info(station).await
            } else {
                DiscoveryAction::Ignore
            }
        }
        DiscoveryCommand::UserAuthentication => {
            authenticate(station, peer, lines.next().unwrap_or_default().trim())
        }
        DiscoveryCommand::Disconnect => {
            let mac = station.mac_for(peer.ip()).await.unwrap_or(mac);
            DiscoveryAction::Disconnect(mac)
        }
    };

    debug!("{:?} from {} ({}) -> {:?}", command, peer, mac, action);
    if station.audit_enabled() && command != DiscoveryCommand::UserAuthentication {
        AuditLogger::discovery_request(
            peer,
            &format!("{:?}", command),
            matches!(action, DiscoveryAction::Reply(_)),
        );
    }
    action
}

fn authenticate(station: &Station, peer: SocketAddr, user_id: &str) -> DiscoveryAction {
    let granted = if user_id.is_empty() {
        None
    } else {
        match station.store.user_access_level(user_id) {
            Ok(level) => level,
            Err(e) => {
                warn!("Access level lookup for {:?} failed: {}", user_id, e);
                None
            }
        }
    };

    let level = granted.map(|level| level.to_string());
    if station.audit_enabled() {
        AuditLogger::authentication_attempt(peer, user_id, level.as_deref());
    }
    let payload = format!("{}|{}", user_id, level.as_deref().unwrap_or("DENIED"));
    discovery_reply(Keyword::AuthLevel, &payload)
}

/// Run one dequeued stream command.
pub(crate) async fn handle_stream(station: &Arc<Station>, command: Command) -> Result<()> {
    let handle = SlotHandle {
        thread: command.thread_slot,
        connection: command.connection_slot,
    };
    let Some(peer) = station.peer(handle, command.socket).await else {
        debug!("{} left slot {} before its command ran", command.socket, handle);
        return Ok(());
    };

    let (code, argument) = match split_command(&command.payload) {
        Ok(parts) => parts,
        Err(e) => {
            debug!("Ignoring malformed command from {}: {}", peer.identifier, e);
            return Ok(());
        }
    };
    let Ok(stream_command) = StreamCommand::try_from(code) else {
        debug!("Unrecognised command code {} from {}", code, peer.identifier);
        return Ok(());
    };
    if stream_command.is_loopback() && command.kind == CommandType::Stream {
        warn!("{} sent station-only command {}", peer.identifier, code);
        if station.audit_enabled() {
            AuditLogger::protocol_violation(peer.identifier, "station-only command from network");
        }
        return Ok(());
    }
    let argument = String::from_utf8_lossy(argument);

    match stream_command {
        StreamCommand::GetFile => get_file(station, &peer, argument.trim()).await,
        StreamCommand::GetTestData => {
            station
                .update_status(peer.handle, peer.socket, |status| {
                    status.insert(ConnectionStatus::TEST_VIEW)
                })
                .await;
            station.set_cursors(peer.handle, peer.socket, 0, 0).await;
            push_records(station, &peer).await
        }
        StreamCommand::GetTestUpdateData => push_records(station, &peer).await,
        StreamCommand::GetLastTestUpdateData => push_last_records(station, &peer).await,
        StreamCommand::QuestionResponse => {
            station.answer_question(&peer, &argument).await;
            Ok(())
        }
        StreamCommand::RepairLockBoard => {
            let outcome = station.repair_lock.request(peer.identifier).await;
            peer.reply(Keyword::RepairLock, outcome.reply().as_bytes());
            Ok(())
        }
        StreamCommand::RepairUnlockBoard => {
            let outcome = station.repair_lock.release(peer.identifier).await;
            peer.reply(Keyword::RepairLock, outcome.reply().as_bytes());
            // Fan-outs held back by the lock can go out now.
            station.signal_all();
            Ok(())
        }
        StreamCommand::ReleaseQuestionHold => {
            station.remove_question_hold(peer.handle).await;
            Ok(())
        }
        StreamCommand::CloseDialog => close_dialog(station, &peer, argument.trim()).await,
        StreamCommand::PushTestUpdate => {
            if peer.status.contains(ConnectionStatus::TEST_VIEW) {
                push_records(station, &peer).await
            } else {
                Ok(())
            }
        }
    }
}

async fn close_dialog(station: &Station, peer: &PeerContext, argument: &str) -> Result<()> {
    let closed = argument.parse::<u64>().ok();
    // A newer question already on this peer's screen must stay open.
    if let Some(pending) = station.pending_question_id().await
        && Some(pending) != closed
        && peer.status.contains(ConnectionStatus::QUESTION_PAUSED)
    {
        debug!(
            "Skipping close of question {:?} for {}: question {} is showing",
            closed, peer.identifier, pending
        );
        return Ok(());
    }
    peer.send(close_dialog_frame());
    Ok(())
}

fn send_records(peer: &PeerContext, keyword: Keyword, first_index: usize, records: &[TestRecord]) {
    for (i, chunk) in records.chunks(RECORDS_PER_FRAME).enumerate() {
        let payload = records_payload(first_index + i * RECORDS_PER_FRAME, chunk);
        peer.reply(keyword, payload.as_bytes());
    }
}

/// Send everything past the peer's cursors and advance them.
async fn push_records(station: &Station, peer: &PeerContext) -> Result<()> {
    let Some((test_cursor, diagnostic_cursor)) = station.cursors(peer.handle, peer.socket).await
    else {
        return Ok(());
    };

    let (test, diagnostic, test_len, diagnostic_len) = {
        let log = station.test_log.read().await;
        (
            log.since(Sequence::Test, test_cursor).to_vec(),
            log.since(Sequence::Diagnostic, diagnostic_cursor).to_vec(),
            log.len(Sequence::Test),
            log.len(Sequence::Diagnostic),
        )
    };

    send_records(peer, Keyword::TestData, test_len - test.len(), &test);
    send_records(peer, Keyword::DiagnosticData, diagnostic_len - diagnostic.len(), &diagnostic);
    station
        .set_cursors(peer.handle, peer.socket, test_len, diagnostic_len)
        .await;

    if !test.is_empty() || !diagnostic.is_empty() {
        debug!(
            "Pushed {} test and {} diagnostic records to {}",
            test.len(),
            diagnostic.len(),
            peer.identifier
        );
    }
    Ok(())
}

/// Re-send the newest record of each sequence.
async fn push_last_records(station: &Station, peer: &PeerContext) -> Result<()> {
    let (test, diagnostic) = {
        let log = station.test_log.read().await;
        let last = |sequence| {
            log.last(sequence)
                .cloned()
                .map(|record| (log.len(sequence) - 1, record))
        };
        (last(Sequence::Test), last(Sequence::Diagnostic))
    };

    if let Some((index, record)) = test {
        send_records(peer, Keyword::TestData, index, &[record]);
    }
    if let Some((index, record)) = diagnostic {
        send_records(peer, Keyword::DiagnosticData, index, &[record]);
    }
    Ok(())
}

/// Why a get-file path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDenial {
    Traversal,
    Symlink,
    OutsideRoot,
    Unavailable,
}

impl PathDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathDenial::Traversal => "path traversal",
            PathDenial::Symlink => "symlinks are not allowed",
            PathDenial::OutsideRoot => "outside log directory",
            PathDenial::Unavailable => "access denied",
        }
    }
}

/// Resolve a requested file name inside `root`.
///
/// Rejects `..` components, symlinks and anything whose canonical path ends up
/// outside the canonical root.
pub fn resolve_log_path(root: &Path, name: &str) -> std::result::Result<PathBuf, PathDenial> {
    let name = name.replace('\\', "/");
    if name.split('/').any(|part| part == "..") {
        return Err(PathDenial::Traversal);
    }

    let path = root.join(name.trim_start_matches('/'));

    match std::fs::symlink_metadata(&path) {
        Ok(metadata) if metadata.file_type().is_symlink() => return Err(PathDenial::Symlink),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => return Err(PathDenial::Unavailable),
    }

    let canonical_root = root.canonicalize().map_err(|_| PathDenial::Unavailable)?;
    if let Ok(canonical) = path.canonicalize()
        && !canonical.starts_with(&canonical_root)
    {
        return Err(PathDenial::OutsideRoot);
    }

    Ok(path)
}

async fn list_log_dir(root: &Path) -> std::io::Result<String> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names.join("\n"))
}

fn deny_file(station: &Station, peer: &PeerContext, name: &str, reason: &str) {
    warn!("File request {:?} from {} denied: {}", name, peer.identifier, reason);
    if station.audit_enabled() {
        AuditLogger::file_denied(peer.identifier, name, reason);
    }
    peer.reply(Keyword::Error, reason.as_bytes());
}

async fn get_file(station: &Station, peer: &PeerContext, name: &str) -> Result<()> {
    let log_dir = &station.config.log_dir;

    if name.is_empty() {
        match list_log_dir(log_dir).await {
            Ok(listing) => peer.reply(Keyword::FileList, listing.as_bytes()),
            Err(e) => {
                warn!("Cannot list {}: {}", log_dir.display(), e);
                peer.reply(Keyword::Error, b"log directory unavailable")
            }
        };
        return Ok(());
    }

    let path = match resolve_log_path(log_dir, name) {
        Ok(path) => path,
        Err(denial) => {
            if station.audit_enabled() && denial != PathDenial::Unavailable {
                AuditLogger::path_traversal_attempt(peer.identifier, name, denial.as_str());
            }
            deny_file(station, peer, name, denial.as_str());
            return Ok(());
        }
    };

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => {
            deny_file(station, peer, name, "not a regular file");
            return Ok(());
        }
        Err(_) => {
            deny_file(station, peer, name, "file not found");
            return Ok(());
        }
    };
    if metadata.len() > station.config.max_file_size_bytes {
        deny_file(station, peer, name, "file too large");
        return Ok(());
    }

    let contents = tokio::fs::read(&path).await?;
    info!("Sending {} ({} bytes) to {}", name, contents.len(), peer.identifier);
    if station.audit_enabled() {
        AuditLogger::file_request(peer.identifier, name, metadata.len());
    }
    peer.reply(Keyword::FileData, &contents);
    Ok(())
}
