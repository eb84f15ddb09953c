//! Connection registry
//!
//! A fixed grid of thread-slots × connection slots. Each thread-slot owns one
//! command queue and is served by one worker; a peer is pinned to one
//! connection slot for as long as it stays connected.

use crate::framing::FrameAccumulator;
use crate::queue::{CommandQueue, SocketId};
use bytes::Bytes;
use kestrel_core::MacAddress;
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Status bits of a connection slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus(u8);

impl ConnectionStatus {
    /// Claimed, no command handled yet
    pub const NOT_STARTED: Self = Self(0b0_0001);
    /// At least one command handled
    pub const STARTED: Self = Self(0b0_0010);
    /// Has a writer attached and may receive fan-outs
    pub const ENABLED: Self = Self(0b0_0100);
    /// Watching the live test view; gets pushed updates
    pub const TEST_VIEW: Self = Self(0b0_1000);
    /// Already has (or deferred) the pending question
    pub const QUESTION_PAUSED: Self = Self(0b1_0000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::NOT_STARTED, "not-started"),
            (Self::STARTED, "started"),
            (Self::ENABLED, "enabled"),
            (Self::TEST_VIEW, "test-view"),
            (Self::QUESTION_PAUSED, "question-paused"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(","))
    }
}

/// Position of a connection slot in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pub thread: usize,
    pub connection: usize,
}

impl std::fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.thread, self.connection)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionSlot {
    pub identifier: Option<IpAddr>,
    pub physical_address: Option<MacAddress>,
    pub socket: Option<SocketId>,
    pub accumulator: FrameAccumulator,
    pub test_cursor: usize,
    pub diagnostic_cursor: usize,
    pub status: ConnectionStatus,
    pub outbound: Option<mpsc::Sender<Bytes>>,
}

impl ConnectionSlot {
    pub fn is_occupied(&self) -> bool {
        self.identifier.is_some()
    }

    /// Eligible for question fan-out and data pushes.
    pub fn is_enabled(&self) -> bool {
        self.is_occupied() && self.status.contains(ConnectionStatus::ENABLED)
    }

    /// Whether a command stamped with `socket` still belongs to this slot.
    pub fn owns(&self, socket: SocketId) -> bool {
        self.is_occupied() && self.socket == Some(socket)
    }

    pub fn clear(&mut self) {
        *self = ConnectionSlot::default();
    }
}

#[derive(Debug)]
pub struct ThreadSlot {
    pub connections: Vec<ConnectionSlot>,
    pub queue: CommandQueue,
    pub worker_started: bool,
}

impl ThreadSlot {
    fn new(connections_per_thread: usize, queue_capacity: usize, grow_on_demand: bool) -> Self {
        Self {
            connections: (0..connections_per_thread)
                .map(|_| ConnectionSlot::default())
                .collect(),
            queue: CommandQueue::new(queue_capacity, grow_on_demand),
            worker_started: false,
        }
    }

    pub fn occupied(&self) -> usize {
        self.connections.iter().filter(|c| c.is_occupied()).count()
    }
}

/// Outcome of `Registry::acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub handle: SlotHandle,
    /// The slot was newly claimed rather than reused
    pub claimed: bool,
    /// A different socket previously attached to this slot; the caller closes it
    pub displaced: Option<SocketId>,
    /// The thread-slot's worker has not been started yet
    pub start_worker: bool,
}

#[derive(Debug)]
pub struct Registry {
    threads: Vec<ThreadSlot>,
}

impl Registry {
    pub fn new(
        thread_slots: usize,
        connections_per_thread: usize,
        queue_capacity: usize,
        grow_on_demand: bool,
    ) -> Self {
        Self {
            threads: (0..thread_slots)
                .map(|_| ThreadSlot::new(connections_per_thread, queue_capacity, grow_on_demand))
                .collect(),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, thread: usize) -> Option<&ThreadSlot> {
        self.threads.get(thread)
    }

    pub fn thread_mut(&mut self, thread: usize) -> Option<&mut ThreadSlot> {
        self.threads.get_mut(thread)
    }

    pub fn slot(&self, handle: SlotHandle) -> Option<&ConnectionSlot> {
        self.threads.get(handle.thread)?.connections.get(handle.connection)
    }

    pub fn slot_mut(&mut self, handle: SlotHandle) -> Option<&mut ConnectionSlot> {
        self.threads
            .get_mut(handle.thread)?
            .connections
            .get_mut(handle.connection)
    }

    /// Find or claim the slot for a peer.
    ///
    /// Scans thread-slots in creation order, then their connection slots:
    /// 1. matching identifier (and physical address, when both sides know it),
    /// 2. matching socket,
    /// 3. the first free slot.
    ///
    /// Returns `None` when every slot is taken.
    pub fn acquire(
        &mut self,
        identifier: IpAddr,
        socket: SocketId,
        physical_address: Option<MacAddress>,
    ) -> Option<Acquired> {
        let by_identifier = self.find(|slot| {
            slot.identifier == Some(identifier)
                && match (slot.physical_address, physical_address) {
                    (Some(known), Some(seen)) => known == seen,
                    _ => true,
                }
        });

        if let Some(handle) = by_identifier.or_else(|| self.find(|slot| slot.socket == Some(socket)))
        {
            let start_worker = !self.threads[handle.thread].worker_started;
            let slot = &mut self.threads[handle.thread].connections[handle.connection];
            if slot.physical_address.is_none() {
                slot.physical_address = physical_address;
            }
            let displaced = slot.socket.filter(|previous| *previous != socket);
            if displaced.is_some() {
                // A new stream starts a new partial frame.
                slot.accumulator.clear();
                slot.outbound = None;
                slot.status.remove(ConnectionStatus::ENABLED);
            }
            slot.identifier = Some(identifier);
            slot.socket = Some(socket);
            return Some(Acquired {
                handle,
                claimed: false,
                displaced,
                start_worker,
            });
        }

        let handle = self.find(|slot| !slot.is_occupied())?;
        let start_worker = !self.threads[handle.thread].worker_started;
        let slot = &mut self.threads[handle.thread].connections[handle.connection];
        slot.clear();
        slot.identifier = Some(identifier);
        slot.physical_address = physical_address;
        slot.socket = Some(socket);
        slot.status = ConnectionStatus::NOT_STARTED;
        Some(Acquired {
            handle,
            claimed: true,
            displaced: None,
            start_worker,
        })
    }

    /// Clear a slot if `socket` still owns it. Returns whether anything changed.
    pub fn release(&mut self, handle: SlotHandle, socket: SocketId) -> bool {
        let Some(thread) = self.threads.get_mut(handle.thread) else {
            return false;
        };
        let Some(slot) = thread.connections.get_mut(handle.connection) else {
            return false;
        };
        if slot.socket != Some(socket) {
            return false;
        }
        slot.clear();
        thread.queue.purge_connection(handle.connection);
        true
    }

    pub fn slot_for_socket(&self, socket: SocketId) -> Option<SlotHandle> {
        self.find(|slot| slot.socket == Some(socket))
    }

    /// Fill in the MAC of occupied slots from `identifier` that have none.
    pub fn backfill_physical_address(&mut self, identifier: IpAddr, mac: MacAddress) -> Vec<SlotHandle> {
        let handles: Vec<SlotHandle> = self
            .handles()
            .filter(|h| {
                let slot = &self.threads[h.thread].connections[h.connection];
                slot.is_occupied()
                    && slot.identifier == Some(identifier)
                    && slot.physical_address.is_none()
            })
            .collect();
        for handle in &handles {
            self.threads[handle.thread].connections[handle.connection].physical_address = Some(mac);
        }
        handles
    }

    pub fn slot_for_physical_address(&self, mac: MacAddress) -> Option<SlotHandle> {
        self.find(|slot| slot.is_occupied() && slot.physical_address == Some(mac))
    }

    /// Every occupied slot, in scan order.
    pub fn occupied_slots(&self) -> Vec<SlotHandle> {
        self.handles()
            .filter(|h| self.threads[h.thread].connections[h.connection].is_occupied())
            .collect()
    }

    pub fn is_group_empty(&self, thread: usize) -> bool {
        self.threads
            .get(thread)
            .map(|t| t.occupied() == 0)
            .unwrap_or(true)
    }

    /// Zero every identifier. Used at shutdown so each worker's emptiness
    /// check falls through.
    pub fn clear_all(&mut self) {
        for thread in &mut self.threads {
            for slot in &mut thread.connections {
                slot.clear();
            }
        }
    }

    /// One line per occupied slot, for diagnostics.
    pub fn snapshot(&self) -> Vec<String> {
        self.occupied_slots()
            .into_iter()
            .filter_map(|h| {
                let slot = self.slot(h)?;
                Some(format!(
                    "{} id={} mac={} {} test={} diag={} {}",
                    h,
                    slot.identifier.map(|i| i.to_string()).unwrap_or_default(),
                    slot.physical_address
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    slot.socket.map(|s| s.to_string()).unwrap_or_default(),
                    slot.test_cursor,
                    slot.diagnostic_cursor,
                    slot.status
                ))
            })
            .collect()
    }

    fn handles(&self) -> impl Iterator<Item = SlotHandle> + '_ {
        self.threads.iter().enumerate().flat_map(|(t, thread)| {
            (0..thread.connections.len()).map(move |c| SlotHandle {
                thread: t,
                connection: c,
            })
        })
    }

    fn find(&self, pred: impl Fn(&ConnectionSlot) -> bool) -> Option<SlotHandle> {
        self.handles()
            .find(|h| pred(&self.threads[h.thread].connections[h.connection]))
    }
}
