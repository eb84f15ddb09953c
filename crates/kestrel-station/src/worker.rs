// Worker loop
//
// One task per thread-slot. It sleeps on the slot's Notify, drains the slot's
// command queue when woken and then offers any pending question to the
// connections it serves.
//
// States: idle -> (signaled) -> draining -> (queue empty or gated) -> idle.
// The task stops once the station is shutting down and none of its slots is
// occupied.

use crate::error::Result;
use crate::handlers;
use crate::protocol::{Keyword, StreamCommand, encode_frame, question_payload, split_command};
use crate::queue::{Command, CommandType};
use crate::registry::{ConnectionSlot, ConnectionStatus};
use crate::station::{Station, deliver};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Per thread-slot worker counters
#[derive(Debug)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub commands_processed: AtomicU64,
    /// Commands dropped because their slot was vacated or re-assigned
    pub commands_discarded: AtomicU64,
    pub questions_delivered: AtomicU64,
    pub total_processing_time_us: AtomicU64,
    pub errors: AtomicU64,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            commands_processed: AtomicU64::new(0),
            commands_discarded: AtomicU64::new(0),
            questions_delivered: AtomicU64::new(0),
            total_processing_time_us: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// Whether `command` has to wait behind the pending question.
///
/// Answers, hold releases and station-generated commands always run; anything
/// else waits while its connection can still receive the question and has not
/// yet been given (or deferred) it.
fn is_gated(command: &Command, slot: &ConnectionSlot) -> bool {
    if command.kind == CommandType::Loopback {
        return false;
    }
    let bypasses = split_command(&command.payload)
        .ok()
        .and_then(|(code, _)| StreamCommand::try_from(code).ok())
        .is_some_and(|c| c.bypasses_question_gate());

    !bypasses && slot.is_enabled() && !slot.status.contains(ConnectionStatus::QUESTION_PAUSED)
}

impl Station {
    pub(crate) async fn run_worker(self: Arc<Self>, thread: usize, ready: oneshot::Sender<()>) {
        info!("Worker {} starting", thread);
        let _ = ready.send(());

        loop {
            self.signals[thread].notified().await;

            if self.is_shutting_down() && self.registry.lock().await.is_group_empty(thread) {
                break;
            }

            self.drain(thread).await;

            if let Err(e) = self.fan_out_question(thread).await {
                error!("Worker {}: question fan-out failed: {}", thread, e);
                self.worker_stats[thread].errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!("Worker {} shutting down", thread);
    }

    async fn drain(self: &Arc<Self>, thread: usize) {
        let stats = &self.worker_stats[thread];

        loop {
            let question_pending = self.pending_question_id().await.is_some();

            let command = {
                let mut registry = self.registry.lock().await;
                let Some(group) = registry.thread_mut(thread) else {
                    return;
                };
                let Some(front) = group.queue.peek_front() else {
                    return;
                };

                let connection = front.connection_slot;
                let socket = front.socket;
                let Some(slot) = group
                    .connections
                    .get(connection)
                    .filter(|slot| slot.owns(socket))
                else {
                    group.queue.pop_front();
                    stats.commands_discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Worker {}: discarded command for vacated slot {}/{} ({})",
                        thread, thread, connection, socket
                    );
                    continue;
                };

                if question_pending && is_gated(front, slot) {
                    debug!(
                        "Worker {}: slot {}/{} waiting on pending question",
                        thread, thread, connection
                    );
                    return;
                }

                let Some(command) = group.queue.pop_front() else {
                    return;
                };
                let slot = &mut group.connections[connection];
                if slot.status.contains(ConnectionStatus::NOT_STARTED) {
                    slot.status.remove(ConnectionStatus::NOT_STARTED);
                    slot.status.insert(ConnectionStatus::STARTED);
                }
                command
            };

            let start = Instant::now();
            if let Err(e) = handlers::handle_stream(self, command).await {
                warn!("Worker {}: error handling command: {}", thread, e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            stats.commands_processed.fetch_add(1, Ordering::Relaxed);
            stats
                .total_processing_time_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
    }

    /// Offer the pending question to this group's connections that have not
    /// seen it.
    async fn fan_out_question(self: &Arc<Self>, thread: usize) -> Result<()> {
        let Some(question) = self.questions.lock().await.pending().cloned() else {
            return Ok(());
        };
        let holder = self.repair_lock.holder().await;
        let frame = encode_frame(
            Keyword::MessageBoxOpen,
            question_payload(&question.text, question.kind).as_bytes(),
        )?;

        let mut targets = Vec::new();
        let mut blocked = false;
        {
            let mut registry = self.registry.lock().await;
            let Some(group) = registry.thread_mut(thread) else {
                return Ok(());
            };
            for (connection, slot) in group.connections.iter_mut().enumerate() {
                if !slot.is_enabled() || slot.status.contains(ConnectionStatus::QUESTION_PAUSED) {
                    continue;
                }
                if let Some(holder) = holder
                    && slot.identifier != Some(holder)
                {
                    blocked = true;
                    continue;
                }
                let (Some(identifier), Some(socket), Some(tx)) =
                    (slot.identifier, slot.socket, slot.outbound.clone())
                else {
                    continue;
                };
                slot.status.insert(ConnectionStatus::QUESTION_PAUSED);
                targets.push((connection, identifier, socket, tx));
            }
        }

        for (connection, identifier, socket, tx) in &targets {
            if !deliver(tx, frame.clone(), *identifier, *socket) {
                debug!("Question {} not delivered to {}", question.id, identifier);
                continue;
            }
            self.worker_stats[thread]
                .questions_delivered
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                "Question {} delivered to {} on slot {}/{}",
                question.id, identifier, thread, connection
            );
        }

        if blocked {
            self.arm_repair_retry(thread);
        }
        if !targets.is_empty() {
            // Commands gated behind the question may run now.
            self.signal(thread);
        }
        Ok(())
    }

    /// Wake the worker again after one repair tick. At most one retry is
    /// pending per thread-slot.
    fn arm_repair_retry(self: &Arc<Self>, thread: usize) {
        if self.retry_armed[thread].swap(true, Ordering::SeqCst) {
            return;
        }
        let station = Arc::clone(self);
        let delay = self.config.repair_lock.tick_interval();
        debug!("Worker {}: fan-out blocked by repair lock, retrying in {:?}", thread, delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            station.retry_armed[thread].store(false, Ordering::SeqCst);
            station.signal(thread);
        });
    }

    pub fn worker_stats(&self, thread: usize) -> Option<&WorkerStats> {
        self.worker_stats.get(thread)
    }
}
