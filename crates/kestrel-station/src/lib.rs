//! Kestrel test-station controller
//!
//! Runs next to a board under test. Operator and repair clients find the
//! station over UDP discovery, then hold a TCP connection over which they
//! stream test results, fetch log files, answer operator questions and take
//! the repair lock.

pub mod address_table;
pub mod audit;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod protocol;
pub mod question;
pub mod queue;
pub mod registry;
pub mod repair_lock;
pub mod station;
pub mod test_log;
pub mod worker;

pub use client::{CommandWriter, DiscoveredStation, Frame, FrameReader, StationClient, discover};
pub use config::{
    FramingConfig, LogFormat, LoggingConfig, PoolConfig, RepairLockConfig, StationConfig,
    load_config, validate_config, write_config,
};
pub use dispatch::Dispatcher;
pub use error::{Result, StationError};
pub use protocol::{DiscoveryCommand, Keyword, StreamCommand};
pub use question::{AnswerOutcome, QuestionTicket};
pub use registry::{ConnectionStatus, SlotHandle};
pub use repair_lock::{LockOutcome, RepairLock, UnlockOutcome};
pub use station::{ConnectionInfo, Station};
pub use worker::WorkerStats;
