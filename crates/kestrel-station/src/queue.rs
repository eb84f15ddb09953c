//! Per-thread-slot command queue.
//!
//! A FIFO ring with an explicit capacity policy: a full queue either rejects
//! the push or, when created with `grow_on_demand`, doubles its capacity.

use crate::error::{Result, StationError};
use bytes::Bytes;
use kestrel_core::MacAddress;
use std::collections::VecDeque;
use tracing::{debug, error};

/// Handle the dispatch loop assigns to every accepted TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Where a queued command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Framed from the connection's TCP stream
    Stream,
    /// Generated by the station to fan data out through the queue
    Loopback,
}

/// One framed command waiting for its worker.
#[derive(Debug, Clone)]
pub struct Command {
    pub thread_slot: usize,
    pub connection_slot: usize,
    pub socket: SocketId,
    pub physical_address: Option<MacAddress>,
    pub kind: CommandType,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<Command>,
    capacity: usize,
    grow_on_demand: bool,
}

impl CommandQueue {
    pub fn new(capacity: usize, grow_on_demand: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            grow_on_demand,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a command.
    ///
    /// Fails with `EmptyPayload` for zero-length payloads and with `QueueFull`
    /// when the queue is full and may not grow; the queue is unchanged in both
    /// cases.
    pub fn push(
        &mut self,
        payload: Bytes,
        connection_slot: usize,
        kind: CommandType,
        thread_slot: usize,
        socket: SocketId,
        physical_address: Option<MacAddress>,
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(StationError::EmptyPayload);
        }

        if self.is_full() {
            if !self.grow_on_demand {
                return Err(StationError::QueueFull(self.capacity));
            }
            let by = self.capacity;
            self.grow(by);
        }

        self.items.push_back(Command {
            thread_slot,
            connection_slot,
            socket,
            physical_address,
            kind,
            payload,
        });
        Ok(())
    }

    /// Front command without dequeuing it.
    pub fn peek_front(&self) -> Option<&Command> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<Command> {
        self.items.pop_front()
    }

    /// Raise the capacity by `by` slots.
    ///
    /// The queue is foundational to every worker, so an allocation failure here
    /// halts the process instead of leaving a half-grown queue behind.
    pub fn grow(&mut self, by: usize) {
        let additional = (self.capacity + by).saturating_sub(self.items.len());
        if let Err(e) = self.items.try_reserve_exact(additional) {
            error!(
                "Command queue allocation failed growing {} -> {}: {}",
                self.capacity,
                self.capacity + by,
                e
            );
            std::process::abort();
        }
        debug!("Command queue grew {} -> {}", self.capacity, self.capacity + by);
        self.capacity += by;
    }

    /// Drop every queued command addressed to `connection_slot`.
    pub fn purge_connection(&mut self, connection_slot: usize) -> usize {
        let before = self.items.len();
        self.items.retain(|c| c.connection_slot != connection_slot);
        before - self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_n(queue: &mut CommandQueue, n: usize) -> Result<()> {
        for i in 0..n {
            queue.push(
                Bytes::from(format!("cmd-{i}")),
                i % 4,
                CommandType::Stream,
                0,
                SocketId(i as u64),
                None,
            )?;
        }
        Ok(())
    }

    #[test]
    fn fixed_queue_rejects_overflow_and_keeps_contents() -> Result<()> {
        let mut queue = CommandQueue::new(3, false);
        push_n(&mut queue, 3)?;
        assert!(queue.is_full());

        let result = queue.push(
            Bytes::from_static(b"overflow"),
            0,
            CommandType::Stream,
            0,
            SocketId(99),
            None,
        );
        assert!(matches!(result, Err(StationError::QueueFull(3))));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.capacity(), 3);

        let payloads: Vec<Bytes> = std::iter::from_fn(|| queue.pop_front())
            .map(|c| c.payload)
            .collect();
        assert_eq!(payloads, vec!["cmd-0", "cmd-1", "cmd-2"]);
        Ok(())
    }

    #[test]
    fn growable_queue_doubles() -> Result<()> {
        let mut queue = CommandQueue::new(2, true);
        push_n(&mut queue, 2)?;
        assert!(queue.is_full());

        push_n(&mut queue, 1)?;
        assert_eq!(queue.capacity(), 4);
        assert!(!queue.is_full());

        push_n(&mut queue, 2)?;
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.len(), 5);
        Ok(())
    }

    #[test]
    fn growable_queue_is_full_only_at_capacity() -> Result<()> {
        let mut queue = CommandQueue::new(1, true);
        for _ in 0..40 {
            push_n(&mut queue, 1)?;
            assert_eq!(queue.is_full(), queue.len() == queue.capacity());
            assert!(queue.capacity().is_power_of_two());
        }
        assert_eq!(queue.capacity(), 64);
        Ok(())
    }

    #[test]
    fn empty_payload_is_an_error() {
        let mut queue = CommandQueue::new(4, true);
        let result = queue.push(Bytes::new(), 0, CommandType::Stream, 0, SocketId(1), None);
        assert!(matches!(result, Err(StationError::EmptyPayload)));
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_does_not_mutate_and_pop_on_empty_is_none() -> Result<()> {
        let mut queue = CommandQueue::new(4, false);
        assert!(queue.pop_front().is_none());
        assert!(queue.peek_front().is_none());

        push_n(&mut queue, 2)?;
        let first = queue.peek_front().map(|c| c.payload.clone());
        assert_eq!(queue.peek_front().map(|c| c.payload.clone()), first);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_front().map(|c| c.payload), first);
        assert_eq!(queue.len(), 1);
        Ok(())
    }

    #[test]
    fn purge_drops_only_that_connection() -> Result<()> {
        let mut queue = CommandQueue::new(8, false);
        push_n(&mut queue, 8)?;
        assert_eq!(queue.purge_connection(1), 2);
        assert_eq!(queue.len(), 6);
        assert!(std::iter::from_fn(|| queue.pop_front()).all(|c| c.connection_slot != 1));
        Ok(())
    }
}
