//! Shared station state and the operations the dispatch loop, the workers and
//! the test-execution logic call on it.
//!
//! Locks are never nested: the registry, question, log, board and repair-lock
//! locks are each taken and released on their own.

use crate::address_table::AddressTable;
use crate::audit::AuditLogger;
use crate::config::StationConfig;
use crate::error::{Result, StationError};
use crate::framing::CommandCodec;
use crate::protocol::{Keyword, StreamCommand, encode_frame, question_payload};
use crate::queue::{CommandType, SocketId};
use crate::question::{AnswerOutcome, QuestionBoard, QuestionTicket};
use crate::registry::{Acquired, ConnectionStatus, Registry, SlotHandle};
use crate::repair_lock::RepairLock;
use crate::test_log::TestLog;
use crate::worker::WorkerStats;
use bytes::Bytes;
use kestrel_core::{BoardState, MacAddress, QuestionKind, Sequence, TestRecord, TestStore};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read-only view of one connection slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: SlotHandle,
    pub identifier: Option<IpAddr>,
    pub physical_address: Option<MacAddress>,
    pub socket: Option<SocketId>,
    pub test_cursor: usize,
    pub diagnostic_cursor: usize,
    pub status: ConnectionStatus,
}

/// What a handler needs to talk back to the peer that sent a command.
#[derive(Debug, Clone)]
pub(crate) struct PeerContext {
    pub handle: SlotHandle,
    pub socket: SocketId,
    pub identifier: IpAddr,
    pub status: ConnectionStatus,
    pub outbound: Option<mpsc::Sender<Bytes>>,
}

impl PeerContext {
    /// Queue a frame for the peer's writer. Never waits; a full channel
    /// drops the frame.
    pub fn send(&self, frame: Bytes) -> bool {
        match &self.outbound {
            Some(tx) => deliver(tx, frame, self.identifier, self.socket),
            None => {
                debug!("No writer attached for {}, dropping frame", self.identifier);
                false
            }
        }
    }

    pub fn reply(&self, keyword: Keyword, payload: &[u8]) -> bool {
        match encode_frame(keyword, payload) {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!("Cannot frame {} reply for {}: {}", keyword.as_str(), self.identifier, e);
                encode_frame(Keyword::Error, e.to_string().as_bytes())
                    .is_ok_and(|frame| self.send(frame))
            }
        }
    }
}

/// Non-blocking hand-off to a connection writer. Returns whether the frame
/// was queued.
pub(crate) fn deliver(
    tx: &mpsc::Sender<Bytes>,
    frame: Bytes,
    identifier: IpAddr,
    socket: SocketId,
) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                "Send to {} ({}) failed: outbound queue full, frame dropped",
                identifier, socket
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!(
                "Send to {} ({}) failed: connection writer closed",
                identifier, socket
            );
            false
        }
    }
}

pub struct Station {
    pub(crate) config: StationConfig,
    pub(crate) registry: Mutex<Registry>,
    /// One per thread-slot; wakes that slot's worker
    pub(crate) signals: Vec<Notify>,
    /// One per thread-slot; set while a repair-lock retry timer is pending
    pub(crate) retry_armed: Vec<AtomicBool>,
    pub(crate) worker_stats: Vec<WorkerStats>,
    pub(crate) questions: Mutex<QuestionBoard>,
    pub(crate) repair_lock: RepairLock,
    pub(crate) test_log: RwLock<TestLog>,
    pub(crate) addresses: Mutex<AddressTable>,
    pub(crate) board: RwLock<BoardState>,
    pub(crate) store: Arc<dyn TestStore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    next_socket: AtomicU64,
    tcp_port: AtomicU16,
    codec: CommandCodec,
}

impl Station {
    pub fn new(config: StationConfig, store: Arc<dyn TestStore>) -> Arc<Self> {
        let threads = config.pool.thread_slots();
        let registry = Registry::new(
            threads,
            config.pool.connections_per_thread,
            config.pool.queue_capacity,
            config.pool.queue_grow_on_demand,
        );

        Arc::new(Self {
            registry: Mutex::new(registry),
            signals: (0..threads).map(|_| Notify::new()).collect(),
            retry_armed: (0..threads).map(|_| AtomicBool::new(false)).collect(),
            worker_stats: (0..threads).map(WorkerStats::new).collect(),
            questions: Mutex::new(QuestionBoard::new()),
            repair_lock: RepairLock::new(
                config.repair_lock.clone(),
                config.logging.audit_enabled,
            ),
            test_log: RwLock::new(TestLog::new()),
            addresses: Mutex::new(AddressTable::new(config.pool.max_connections * 2)),
            board: RwLock::new(BoardState::default()),
            store,
            workers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            next_socket: AtomicU64::new(1),
            tcp_port: AtomicU16::new(0),
            codec: CommandCodec::new(&config.framing),
            config,
        })
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn audit_enabled(&self) -> bool {
        self.config.logging.audit_enabled
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// TCP port announced in discovery replies.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::SeqCst)
    }

    pub fn set_tcp_port(&self, port: u16) {
        self.tcp_port.store(port, Ordering::SeqCst);
    }

    pub fn next_socket_id(&self) -> SocketId {
        SocketId(self.next_socket.fetch_add(1, Ordering::SeqCst))
    }

    /// Channel between the workers and one connection's writer.
    pub fn outbound_channel(&self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(self.config.pool.outbound_channel_size.max(1))
    }

    pub fn repair_lock(&self) -> &RepairLock {
        &self.repair_lock
    }

    pub(crate) fn signal(&self, thread: usize) {
        if let Some(signal) = self.signals.get(thread) {
            signal.notify_one();
        }
    }

    pub(crate) fn signal_all(&self) {
        for signal in &self.signals {
            signal.notify_one();
        }
    }

    // ----- registry -------------------------------------------------------

    /// Find or claim the slot for a peer and attach its writer.
    ///
    /// Starts the thread-slot's worker the first time one of its slots is
    /// claimed and waits for it to report ready. `None` when every slot is
    /// taken or the station is stopping.
    pub async fn acquire_connection(
        self: &Arc<Self>,
        identifier: IpAddr,
        socket: SocketId,
        physical_address: Option<MacAddress>,
        outbound: Option<mpsc::Sender<Bytes>>,
    ) -> Option<Acquired> {
        if self.is_shutting_down() {
            return None;
        }

        let acquired = {
            let mut registry = self.registry.lock().await;
            let acquired = registry.acquire(identifier, socket, physical_address)?;
            if let Some(slot) = registry.slot_mut(acquired.handle)
                && let Some(tx) = outbound
            {
                slot.outbound = Some(tx);
                slot.status.insert(ConnectionStatus::ENABLED);
            }
            if acquired.start_worker
                && let Some(thread) = registry.thread_mut(acquired.handle.thread)
            {
                thread.worker_started = true;
            }
            acquired
        };

        if acquired.start_worker {
            self.start_worker(acquired.handle.thread).await;
        }
        // An idle worker would otherwise not offer the pending question to
        // this peer until it sends a command.
        if self.pending_question_id().await.is_some() {
            self.signal(acquired.handle.thread);
        }

        debug!(
            "{} from {} assigned slot {} (claimed: {})",
            socket, identifier, acquired.handle, acquired.claimed
        );
        Some(acquired)
    }

    async fn start_worker(self: &Arc<Self>, thread: usize) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(self).run_worker(thread, ready_tx));
        self.workers.lock().await.push(handle);
        if ready_rx.await.is_err() {
            warn!("Worker {} exited before reporting ready", thread);
        }
    }

    /// Append bytes read from `socket` to its slot and queue every command
    /// they complete.
    ///
    /// Returns the number of commands queued. A framing overflow is returned
    /// as an error after any complete commands have been queued; the
    /// connection stays usable.
    pub async fn ingest(&self, handle: SlotHandle, socket: SocketId, data: &[u8]) -> Result<usize> {
        let mut codec = self.codec.clone();
        let (queued, overflow) = {
            let mut registry = self.registry.lock().await;
            let thread = registry
                .thread_mut(handle.thread)
                .ok_or_else(|| StationError::Station(format!("No thread-slot {}", handle.thread)))?;
            let slot = thread
                .connections
                .get_mut(handle.connection)
                .filter(|slot| slot.owns(socket))
                .ok_or_else(|| {
                    StationError::Station(format!("{} no longer owns slot {}", socket, handle))
                })?;

            let feed = slot.accumulator.feed(&mut codec, data);
            let physical_address = slot.physical_address;
            let mut queued = 0;
            for frame in feed.frames {
                match thread.queue.push(
                    frame,
                    handle.connection,
                    CommandType::Stream,
                    handle.thread,
                    socket,
                    physical_address,
                ) {
                    Ok(()) => queued += 1,
                    Err(StationError::EmptyPayload) => {
                        debug!("Ignoring empty command from {}", socket);
                    }
                    Err(e) => warn!("Dropping command from {}: {}", socket, e),
                }
            }
            (queued, feed.overflow)
        };

        if queued > 0 {
            self.signal(handle.thread);
        }
        match overflow {
            Some(e) => Err(e),
            None => Ok(queued),
        }
    }

    /// Clear the slot `socket` occupies and wake its worker.
    pub async fn remove_listener(&self, handle: SlotHandle, socket: SocketId) -> bool {
        let released = self.registry.lock().await.release(handle, socket);
        if released {
            debug!("Slot {} released by {}", handle, socket);
            self.signal(handle.thread);
        }
        released
    }

    /// Make the pending question eligible for this connection again.
    pub async fn remove_question_hold(&self, handle: SlotHandle) {
        if let Some(slot) = self.registry.lock().await.slot_mut(handle) {
            slot.status.remove(ConnectionStatus::QUESTION_PAUSED);
        }
        self.signal(handle.thread);
    }

    /// Tear down whatever connection the peer with `mac` holds. Returns the
    /// socket that was detached so the caller can close it.
    pub async fn disconnect_physical_address(&self, mac: MacAddress) -> Option<SocketId> {
        let (handle, socket) = {
            let mut registry = self.registry.lock().await;
            let handle = registry.slot_for_physical_address(mac)?;
            let socket = registry.slot(handle)?.socket?;
            registry.release(handle, socket);
            (handle, socket)
        };
        info!("Disconnect notice from {} closed {}", mac, socket);
        self.signal(handle.thread);
        Some(socket)
    }

    pub async fn slot_for_socket(&self, socket: SocketId) -> Option<SlotHandle> {
        self.registry.lock().await.slot_for_socket(socket)
    }

    pub async fn connection(&self, handle: SlotHandle) -> Option<ConnectionInfo> {
        let registry = self.registry.lock().await;
        let slot = registry.slot(handle)?;
        Some(ConnectionInfo {
            handle,
            identifier: slot.identifier,
            physical_address: slot.physical_address,
            socket: slot.socket,
            test_cursor: slot.test_cursor,
            diagnostic_cursor: slot.diagnostic_cursor,
            status: slot.status,
        })
    }

    pub async fn occupied_slots(&self) -> Vec<SlotHandle> {
        self.registry.lock().await.occupied_slots()
    }

    /// One line per occupied slot.
    pub async fn snapshot(&self) -> Vec<String> {
        self.registry.lock().await.snapshot()
    }

    pub(crate) async fn peer(&self, handle: SlotHandle, socket: SocketId) -> Option<PeerContext> {
        let registry = self.registry.lock().await;
        let slot = registry.slot(handle).filter(|slot| slot.owns(socket))?;
        Some(PeerContext {
            handle,
            socket,
            identifier: slot.identifier?,
            status: slot.status,
            outbound: slot.outbound.clone(),
        })
    }

    pub(crate) async fn update_status(
        &self,
        handle: SlotHandle,
        socket: SocketId,
        update: impl FnOnce(&mut ConnectionStatus),
    ) {
        let mut registry = self.registry.lock().await;
        if let Some(slot) = registry.slot_mut(handle).filter(|slot| slot.owns(socket)) {
            update(&mut slot.status);
        }
    }

    pub(crate) async fn cursors(&self, handle: SlotHandle, socket: SocketId) -> Option<(usize, usize)> {
        let registry = self.registry.lock().await;
        let slot = registry.slot(handle).filter(|slot| slot.owns(socket))?;
        Some((slot.test_cursor, slot.diagnostic_cursor))
    }

    pub(crate) async fn set_cursors(&self, handle: SlotHandle, socket: SocketId, test: usize, diagnostic: usize) {
        let mut registry = self.registry.lock().await;
        if let Some(slot) = registry.slot_mut(handle).filter(|slot| slot.owns(socket)) {
            slot.test_cursor = test;
            slot.diagnostic_cursor = diagnostic;
        }
    }

    async fn rewind_all_cursors(&self) {
        let mut registry = self.registry.lock().await;
        for handle in registry.occupied_slots() {
            if let Some(slot) = registry.slot_mut(handle) {
                slot.test_cursor = 0;
                slot.diagnostic_cursor = 0;
            }
        }
    }

    /// Queue a station-generated command for every occupied slot matching
    /// `filter`, skipping `except`.
    async fn push_loopback(
        &self,
        payload: Bytes,
        except: Option<SlotHandle>,
        filter: impl Fn(ConnectionStatus) -> bool,
    ) -> usize {
        let mut pushed = 0;
        let mut touched = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            for handle in registry.occupied_slots() {
                if Some(handle) == except {
                    continue;
                }
                let Some(slot) = registry.slot(handle) else {
                    continue;
                };
                if !filter(slot.status) {
                    continue;
                }
                let (Some(socket), physical_address) = (slot.socket, slot.physical_address) else {
                    continue;
                };
                let Some(thread) = registry.thread_mut(handle.thread) else {
                    continue;
                };
                match thread.queue.push(
                    payload.clone(),
                    handle.connection,
                    CommandType::Loopback,
                    handle.thread,
                    socket,
                    physical_address,
                ) {
                    Ok(()) => {
                        pushed += 1;
                        if !touched.contains(&handle.thread) {
                            touched.push(handle.thread);
                        }
                    }
                    Err(e) => warn!("Could not queue loopback command for {}: {}", handle, e),
                }
            }
        }
        for thread in touched {
            self.signal(thread);
        }
        pushed
    }

    async fn fan_out_close(&self, except: Option<SlotHandle>, question_id: u64) -> usize {
        let payload = Bytes::from(format!("{}\n{}", StreamCommand::CloseDialog as u16, question_id));
        self.push_loopback(payload, except, |_| true).await
    }

    async fn push_test_update(&self) -> usize {
        let payload = Bytes::from((StreamCommand::PushTestUpdate as u16).to_string());
        self.push_loopback(payload, None, |status| {
            status.contains(ConnectionStatus::ENABLED) && status.contains(ConnectionStatus::TEST_VIEW)
        })
        .await
    }

    // ----- discovery address table ---------------------------------------

    /// Remember which MAC a discovery datagram came from, and tag any
    /// connection from that IP that was accepted before the MAC was known.
    pub async fn record_address(&self, ip: IpAddr, mac: MacAddress) -> bool {
        let recorded = self.addresses.lock().await.record(ip, mac);
        let tagged = self.registry.lock().await.backfill_physical_address(ip, mac);
        for handle in tagged {
            debug!("Slot {} from {} now known as {}", handle, ip, mac);
        }
        recorded
    }

    pub async fn mac_for(&self, ip: IpAddr) -> Option<MacAddress> {
        self.addresses.lock().await.mac_for(ip)
    }

    // ----- questions -----------------------------------------------------

    pub async fn pending_question_id(&self) -> Option<u64> {
        self.questions.lock().await.pending().map(|q| q.id)
    }

    /// Post a question to every attached operator.
    pub async fn post_question(&self, text: &str, kind: QuestionKind) -> Result<QuestionTicket> {
        // Reject up front anything the fan-out could not frame.
        encode_frame(Keyword::MessageBoxOpen, question_payload(text, kind).as_bytes())?;

        let ticket = self.questions.lock().await.post(text, kind)?;
        {
            let mut registry = self.registry.lock().await;
            for handle in registry.occupied_slots() {
                if let Some(slot) = registry.slot_mut(handle) {
                    slot.status.remove(ConnectionStatus::QUESTION_PAUSED);
                }
            }
        }

        info!("Question {} posted ({}): {}", ticket.id(), kind.tag(), text);
        if self.audit_enabled() {
            AuditLogger::question_posted(ticket.id(), kind.tag(), text);
        }
        self.signal_all();
        Ok(ticket)
    }

    /// Apply an answer received from `peer`.
    pub(crate) async fn answer_question(&self, peer: &PeerContext, raw: &str) -> AnswerOutcome {
        let outcome = self.questions.lock().await.answer(raw);
        match &outcome {
            AnswerOutcome::NoQuestion => {
                debug!("Answer from {} with no question pending", peer.identifier);
            }
            AnswerOutcome::Rejected => {
                warn!("Rejected answer {:?} from {}", raw, peer.identifier);
                self.update_status(peer.handle, peer.socket, |status| {
                    status.remove(ConnectionStatus::QUESTION_PAUSED)
                })
                .await;
                self.signal(peer.handle.thread);
            }
            AnswerOutcome::Deferred => {
                debug!("{} deferred the pending question", peer.identifier);
                self.update_status(peer.handle, peer.socket, |status| {
                    status.insert(ConnectionStatus::QUESTION_PAUSED)
                })
                .await;
            }
            AnswerOutcome::Accepted { question, answer } => {
                info!(
                    "Question {} answered {:?} by {}",
                    question.id, answer, peer.identifier
                );
                if self.audit_enabled() {
                    AuditLogger::question_answered(question.id, peer.identifier, answer);
                }
                self.fan_out_close(Some(peer.handle), question.id).await;
            }
        }
        outcome
    }

    /// Withdraw the pending question. Returns false when none was pending.
    pub async fn close_question(&self) -> bool {
        let Some(question) = self.questions.lock().await.close() else {
            return false;
        };
        info!("Question {} closed", question.id);
        if self.audit_enabled() {
            AuditLogger::question_closed(question.id);
        }
        self.fan_out_close(None, question.id).await;
        true
    }

    // ----- test execution ------------------------------------------------

    /// Start a new run for `board`, discarding the previous run's records.
    pub async fn begin_run(&self, board: BoardState) -> Result<()> {
        self.store.clear_temp_rows(&board.serial_number)?;
        self.test_log.write().await.reset();
        info!("Run started for {}", board.serial_number);
        *self.board.write().await = board;
        self.rewind_all_cursors().await;
        Ok(())
    }

    /// Reload the cached records of an interrupted run. Returns how many
    /// records were restored.
    pub async fn resume_run(&self, serial: &str) -> Result<usize> {
        let test = self.store.cached_rows(serial, Sequence::Test)?;
        let diagnostic = self.store.cached_rows(serial, Sequence::Diagnostic)?;
        let restored = test.len() + diagnostic.len();

        {
            let mut log = self.test_log.write().await;
            log.reset();
            for record in test {
                log.append(Sequence::Test, record);
            }
            for record in diagnostic {
                log.append(Sequence::Diagnostic, record);
            }
        }
        {
            let mut board = self.board.write().await;
            if board.serial_number != serial {
                *board = BoardState::new(serial, "");
            }
        }

        info!("Resumed run for {} with {} cached records", serial, restored);
        self.rewind_all_cursors().await;
        self.push_test_update().await;
        Ok(restored)
    }

    pub async fn append_test(&self, line: &str, status: &str) -> Result<usize> {
        self.append(Sequence::Test, line, status).await
    }

    pub async fn append_diagnostic(&self, line: &str, status: &str) -> Result<usize> {
        self.append(Sequence::Diagnostic, line, status).await
    }

    async fn append(&self, sequence: Sequence, line: &str, status: &str) -> Result<usize> {
        let record = TestRecord::new(line, status);
        let serial = self.board.read().await.serial_number.clone();
        self.store.insert_temp_row(&serial, sequence, &record)?;
        let len = self.test_log.write().await.append(sequence, record);
        self.push_test_update().await;
        Ok(len)
    }

    pub async fn update_board(&self, update: impl FnOnce(&mut BoardState)) {
        update(&mut *self.board.write().await);
    }

    pub async fn board_state(&self) -> BoardState {
        self.board.read().await.clone()
    }

    pub async fn record_count(&self, sequence: Sequence) -> usize {
        self.test_log.read().await.len(sequence)
    }

    /// Record the outcome, commit the printout and drop the temporary rows.
    pub async fn finish_run(&self, passed: bool) -> Result<String> {
        let board = {
            let mut board = self.board.write().await;
            board.passed = passed;
            board.percent_complete = 100;
            board.clone()
        };
        let printout = self.test_log.read().await.printout(&board.summary());
        self.store.commit_printout(&board.serial_number, &printout)?;
        self.store.clear_temp_rows(&board.serial_number)?;
        info!(
            "Run finished for {}: {}",
            board.serial_number,
            if passed { "PASS" } else { "FAIL" }
        );
        Ok(printout)
    }

    /// Stop every worker. Slots are cleared first so each worker's emptiness
    /// check lets it exit.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Station shutting down");

        self.questions.lock().await.close();
        self.registry.lock().await.clear_all();
        self.signal_all();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        self.repair_lock.shutdown().await;
        debug!("All workers stopped");
    }
}
