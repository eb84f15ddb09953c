//! Station integration tests
//!
//! Clients are simulated by acquiring connection slots directly and reading
//! their outbound channels, so several peers can be driven from one process
//! without real sockets.

use bytes::Bytes;
use kestrel_core::{BoardState, MacAddress, MemoryStore, QuestionKind};
use kestrel_station::{
    ConnectionStatus, Keyword, SlotHandle, Station, StationConfig, StationError,
};
use kestrel_station::queue::SocketId;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct FakePeer {
    handle: SlotHandle,
    socket: SocketId,
    rx: mpsc::Receiver<Bytes>,
}

impl FakePeer {
    async fn connect(station: &Arc<Station>, ip: &str) -> Self {
        let ip: IpAddr = ip.parse().unwrap();
        let socket = station.next_socket_id();
        let (tx, rx) = station.outbound_channel();
        let acquired = station
            .acquire_connection(ip, socket, None, Some(tx))
            .await
            .expect("free slot");
        Self {
            handle: acquired.handle,
            socket,
            rx,
        }
    }

    async fn send(&self, station: &Station, command: &str) -> usize {
        station
            .ingest(self.handle, self.socket, format!("{command}\n\n\n").as_bytes())
            .await
            .unwrap()
    }

    async fn recv(&mut self) -> (Keyword, String) {
        let frame = timeout(WAIT, self.rx.recv())
            .await
            .expect("frame before timeout")
            .expect("writer channel open");
        decode(&frame)
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(frame)) = timeout(QUIET, self.rx.recv()).await {
            panic!("unexpected frame {:?}", decode(&frame));
        }
    }
}

fn decode(frame: &[u8]) -> (Keyword, String) {
    let len = usize::from_str_radix(std::str::from_utf8(&frame[..5]).unwrap(), 16).unwrap();
    assert_eq!(len, frame.len() - 5, "length field counts keyword + payload");
    let keyword = Keyword::parse(&frame[5..17]).expect("known keyword");
    (keyword, String::from_utf8_lossy(&frame[17..]).into_owned())
}

fn test_station(config: StationConfig) -> Arc<Station> {
    Station::new(config, Arc::new(MemoryStore::new()))
}

fn quiet_config() -> StationConfig {
    let mut config = StationConfig::default();
    config.station_name = Some("bench-1".to_string());
    config.logging.audit_enabled = false;
    config
}

async fn wait_for_cursor(station: &Station, handle: SlotHandle, expected: usize) {
    for _ in 0..100 {
        if station.connection(handle).await.map(|c| c.test_cursor) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("test cursor never reached {expected}");
}

#[tokio::test]
async fn update_requests_stream_new_records_to_each_client() {
    let station = test_station(quiet_config());
    station
        .begin_run(BoardState::new("SN-0001", "FG-10"))
        .await
        .unwrap();

    let mut a = FakePeer::connect(&station, "10.0.0.1").await;
    let mut b = FakePeer::connect(&station, "10.0.0.2").await;
    assert_ne!(a.handle, b.handle);

    for step in ["POST", "MEMORY", "FANS"] {
        station.append_test(step, "PASS").await.unwrap();
    }

    for peer in [&mut a, &mut b] {
        assert_eq!(station.connection(peer.handle).await.unwrap().test_cursor, 0);
        assert_eq!(peer.send(&station, "12").await, 1);

        let (keyword, payload) = peer.recv().await;
        assert_eq!(keyword, Keyword::TestData);
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "0");
        assert!(lines[1].starts_with("POST"));
        assert!(lines[3].starts_with("FANS"));
        assert!(lines[3].trim_end().ends_with("PASS"));

        wait_for_cursor(&station, peer.handle, 3).await;
    }

    // Nothing new: a second update sends nothing.
    a.send(&station, "12").await;
    a.assert_quiet().await;

    station.shutdown().await;
}

#[tokio::test]
async fn test_view_clients_get_appended_records_pushed() {
    let station = test_station(quiet_config());
    station
        .begin_run(BoardState::new("SN-0002", "FG-10"))
        .await
        .unwrap();
    station.append_test("POST", "PASS").await.unwrap();

    let mut viewer = FakePeer::connect(&station, "10.0.0.1").await;
    let mut idle = FakePeer::connect(&station, "10.0.0.2").await;

    viewer.send(&station, "11").await;
    let (keyword, payload) = viewer.recv().await;
    assert_eq!(keyword, Keyword::TestData);
    assert!(payload.starts_with("0\nPOST"));
    wait_for_cursor(&station, viewer.handle, 1).await;
    assert!(
        station
            .connection(viewer.handle)
            .await
            .unwrap()
            .status
            .contains(ConnectionStatus::TEST_VIEW)
    );

    station.append_test("MEMORY", "PASS").await.unwrap();
    let (keyword, payload) = viewer.recv().await;
    assert_eq!(keyword, Keyword::TestData);
    assert!(payload.starts_with("1\nMEMORY"));

    station.append_diagnostic("dimm0 4096 MB", "INFO").await.unwrap();
    let (keyword, payload) = viewer.recv().await;
    assert_eq!(keyword, Keyword::DiagnosticData);
    assert!(payload.starts_with("0\ndimm0"));

    idle.assert_quiet().await;
    station.shutdown().await;
}

#[tokio::test]
async fn last_update_resends_newest_record() {
    let station = test_station(quiet_config());
    station
        .begin_run(BoardState::new("SN-0003", "FG-10"))
        .await
        .unwrap();
    station.append_test("POST", "PASS").await.unwrap();
    station.append_test("MEMORY", "FAIL").await.unwrap();

    let mut peer = FakePeer::connect(&station, "10.0.0.1").await;
    peer.send(&station, "13").await;
    let (keyword, payload) = peer.recv().await;
    assert_eq!(keyword, Keyword::TestData);
    assert!(payload.starts_with("1\nMEMORY"));
    assert!(payload.trim_end().ends_with("FAIL"));

    station.shutdown().await;
}

#[tokio::test]
async fn answering_closes_the_dialog_everywhere_else() {
    let station = test_station(quiet_config());
    let mut a = FakePeer::connect(&station, "10.0.0.1").await;
    let mut b = FakePeer::connect(&station, "10.0.0.2").await;

    let ticket = station
        .post_question("Is the fan spinning?", QuestionKind::YesNo)
        .await
        .unwrap();
    let question_id = ticket.id();

    for peer in [&mut a, &mut b] {
        let (keyword, payload) = peer.recv().await;
        assert_eq!(keyword, Keyword::MessageBoxOpen);
        assert_eq!(payload, "YESNO\nIs the fan spinning?|YES|NO");
    }

    a.send(&station, "14\nno").await;
    assert_eq!(ticket.answer().await.as_deref(), Some("NO"));

    let frame = timeout(WAIT, b.rx.recv()).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"0000cMSGBOX_CLOSE");
    a.assert_quiet().await;

    assert_eq!(station.pending_question_id().await, None);
    assert!(
        station
            .post_question("Reseat DIMM", QuestionKind::RetryFail)
            .await
            .unwrap()
            .id()
            > question_id
    );

    station.shutdown().await;
}

#[tokio::test]
async fn invalid_binary_answer_re_offers_the_question() {
    let station = test_station(quiet_config());
    let mut a = FakePeer::connect(&station, "10.0.0.1").await;

    let _ticket = station
        .post_question("Continue?", QuestionKind::YesNo)
        .await
        .unwrap();
    assert_eq!(a.recv().await.0, Keyword::MessageBoxOpen);

    a.send(&station, "14\nMAYBE").await;
    let (keyword, _) = a.recv().await;
    assert_eq!(keyword, Keyword::MessageBoxOpen);
    assert!(station.pending_question_id().await.is_some());

    station.shutdown().await;
}

#[tokio::test]
async fn question_is_delivered_once_per_connection() {
    let station = test_station(quiet_config());
    station
        .begin_run(BoardState::new("SN-0004", "FG-10"))
        .await
        .unwrap();
    station.append_test("POST", "PASS").await.unwrap();

    let mut a = FakePeer::connect(&station, "10.0.0.1").await;
    let _ticket = station
        .post_question("Operator name?", QuestionKind::FreeText)
        .await
        .unwrap();
    assert_eq!(a.recv().await.0, Keyword::MessageBoxOpen);

    // Already showing the question, so ordinary commands run and the
    // question is not sent again.
    a.send(&station, "12").await;
    assert_eq!(a.recv().await.0, Keyword::TestData);
    a.assert_quiet().await;

    // Releasing the hold makes it eligible again.
    a.send(&station, "17").await;
    let (keyword, payload) = a.recv().await;
    assert_eq!(keyword, Keyword::MessageBoxOpen);
    assert_eq!(payload, "TEXT\nOperator name?");

    station.shutdown().await;
}

#[tokio::test]
async fn late_joiner_is_offered_the_pending_question() {
    let station = test_station(quiet_config());
    let mut a = FakePeer::connect(&station, "10.0.0.1").await;

    let _ticket = station
        .post_question("Is the fan spinning?", QuestionKind::YesNo)
        .await
        .unwrap();
    assert_eq!(a.recv().await.0, Keyword::MessageBoxOpen);
    a.assert_quiet().await;

    // Same thread-slot as `a`, whose worker is idle by now.
    let mut b = FakePeer::connect(&station, "10.0.0.2").await;
    assert_eq!(b.handle.thread, a.handle.thread);
    let (keyword, payload) = b.recv().await;
    assert_eq!(keyword, Keyword::MessageBoxOpen);
    assert_eq!(payload, "YESNO\nIs the fan spinning?|YES|NO");
    a.assert_quiet().await;

    station.shutdown().await;
}

#[tokio::test]
async fn repair_lock_holds_back_questions_and_gated_commands() {
    // One connection per thread-slot: a gated command blocks its whole queue.
    let mut config = quiet_config();
    config.pool.max_connections = 4;
    config.pool.connections_per_thread = 1;
    let station = test_station(config);
    station
        .begin_run(BoardState::new("SN-0005", "FG-10"))
        .await
        .unwrap();
    station.append_test("POST", "PASS").await.unwrap();

    let mut holder = FakePeer::connect(&station, "10.0.0.1").await;
    let mut other = FakePeer::connect(&station, "10.0.0.2").await;

    holder.send(&station, "15").await;
    assert_eq!(
        holder.recv().await,
        (Keyword::RepairLock, "LOCKED".to_string())
    );
    other.send(&station, "15").await;
    assert_eq!(
        other.recv().await,
        (Keyword::RepairLock, "ALREADY LOCKED".to_string())
    );

    let _ticket = station
        .post_question("Probe TP14?", QuestionKind::YesNo)
        .await
        .unwrap();
    assert_eq!(holder.recv().await.0, Keyword::MessageBoxOpen);

    // Not shown the question yet, so its update request waits.
    other.send(&station, "12").await;
    other.assert_quiet().await;

    holder.send(&station, "16").await;
    assert_eq!(
        holder.recv().await,
        (Keyword::RepairLock, "UNLOCKED".to_string())
    );

    assert_eq!(other.recv().await.0, Keyword::MessageBoxOpen);
    assert_eq!(other.recv().await.0, Keyword::TestData);

    station.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unrenewed_repair_lock_expires() {
    let mut config = quiet_config();
    config.repair_lock.tick_interval_ms = 1_000;
    config.repair_lock.expiry_ticks = 5;
    let station = test_station(config);

    let mut holder = FakePeer::connect(&station, "10.0.0.1").await;
    let mut other = FakePeer::connect(&station, "10.0.0.2").await;

    holder.send(&station, "15").await;
    assert_eq!(holder.recv().await.1, "LOCKED");
    other.send(&station, "15").await;
    assert_eq!(other.recv().await.1, "ALREADY LOCKED");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(station.repair_lock().holder().await, None);

    other.send(&station, "15").await;
    assert_eq!(other.recv().await.1, "LOCKED");
    assert_eq!(
        station.repair_lock().holder().await,
        Some("10.0.0.2".parse().unwrap())
    );

    station.shutdown().await;
}

#[tokio::test]
async fn reconnect_reuses_slot_and_retires_old_socket() {
    let station = test_station(quiet_config());
    let ip: IpAddr = "10.0.0.7".parse().unwrap();

    let first = station.next_socket_id();
    let (tx, _rx) = station.outbound_channel();
    let acquired = station
        .acquire_connection(ip, first, None, Some(tx))
        .await
        .unwrap();
    assert!(acquired.claimed);

    let second = station.next_socket_id();
    let (tx, _rx2) = station.outbound_channel();
    let again = station
        .acquire_connection(ip, second, None, Some(tx))
        .await
        .unwrap();
    assert_eq!(again.handle, acquired.handle);
    assert!(!again.claimed);
    assert_eq!(again.displaced, Some(first));
    assert_eq!(station.occupied_slots().await, vec![acquired.handle]);

    assert!(station.ingest(acquired.handle, first, b"12\n\n\n").await.is_err());
    assert!(!station.remove_listener(acquired.handle, first).await);
    assert!(station.remove_listener(acquired.handle, second).await);
    assert!(!station.remove_listener(acquired.handle, second).await);
    assert!(station.occupied_slots().await.is_empty());

    station.shutdown().await;
}

#[tokio::test]
async fn framing_survives_split_reads_and_overflow() {
    let mut config = quiet_config();
    config.framing.max_frame_bytes = 64;
    let station = test_station(config);
    let peer = FakePeer::connect(&station, "10.0.0.1").await;

    assert_eq!(station.ingest(peer.handle, peer.socket, b"12\n").await.unwrap(), 0);
    assert_eq!(station.ingest(peer.handle, peer.socket, b"\n\n13\n\n\n").await.unwrap(), 2);

    let err = station
        .ingest(peer.handle, peer.socket, &[b'x'; 100])
        .await
        .unwrap_err();
    assert!(matches!(err, StationError::FrameOverflow { len: 100, limit: 64 }));
    assert_eq!(station.ingest(peer.handle, peer.socket, b"12\n\n\n").await.unwrap(), 1);

    station.shutdown().await;
}

#[tokio::test]
async fn station_only_commands_from_clients_are_ignored() {
    let station = test_station(quiet_config());
    let mut peer = FakePeer::connect(&station, "10.0.0.1").await;

    peer.send(&station, "90\n1").await;
    peer.send(&station, "91").await;
    peer.assert_quiet().await;

    station.shutdown().await;
}

#[tokio::test]
async fn full_registry_refuses_new_peers() {
    let mut config = quiet_config();
    config.pool.max_connections = 2;
    config.pool.connections_per_thread = 1;
    let station = test_station(config);

    let _a = FakePeer::connect(&station, "10.0.0.1").await;
    let _b = FakePeer::connect(&station, "10.0.0.2").await;
    let (tx, _rx) = station.outbound_channel();
    let refused = station
        .acquire_connection("10.0.0.3".parse().unwrap(), station.next_socket_id(), None, Some(tx))
        .await;
    assert!(refused.is_none());

    station.shutdown().await;
    let (tx, _rx) = station.outbound_channel();
    assert!(
        station
            .acquire_connection("10.0.0.4".parse().unwrap(), station.next_socket_id(), None, Some(tx))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn disconnect_notice_reaches_peer_whose_mac_was_learned_later() {
    let station = test_station(quiet_config());
    let ip: IpAddr = "10.0.0.9".parse().unwrap();
    let mac: MacAddress = "02:00:00:00:00:09".parse().unwrap();

    let socket = station.next_socket_id();
    let (tx, _rx) = station.outbound_channel();
    let acquired = station
        .acquire_connection(ip, socket, None, Some(tx))
        .await
        .unwrap();
    assert_eq!(station.connection(acquired.handle).await.unwrap().physical_address, None);

    station.record_address(ip, mac).await;
    assert_eq!(
        station.connection(acquired.handle).await.unwrap().physical_address,
        Some(mac)
    );

    assert_eq!(station.disconnect_physical_address(mac).await, Some(socket));
    assert!(station.occupied_slots().await.is_empty());

    station.shutdown().await;
}

#[tokio::test]
async fn stalled_reader_does_not_block_its_thread_slot() {
    let mut config = quiet_config();
    config.pool.outbound_channel_size = 1;
    let station = test_station(config);
    station
        .begin_run(BoardState::new("SN-0006", "FG-10"))
        .await
        .unwrap();
    station.append_test("POST", "PASS").await.unwrap();

    // Never reads its channel.
    let stalled = FakePeer::connect(&station, "10.0.0.1").await;
    let mut b = FakePeer::connect(&station, "10.0.0.2").await;
    assert_eq!(stalled.handle.thread, b.handle.thread);

    for _ in 0..4 {
        stalled.send(&station, "13").await;
    }
    b.send(&station, "12").await;
    let (keyword, payload) = b.recv().await;
    assert_eq!(keyword, Keyword::TestData);
    assert!(payload.starts_with("0\nPOST"));

    timeout(WAIT, station.shutdown())
        .await
        .expect("shutdown with a stalled reader attached");
    drop(stalled);
}
