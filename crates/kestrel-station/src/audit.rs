use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tracing::{Level, event};

/// Station audit events
///
/// Serialized as one JSON object per event so they can be shipped to a log
/// collector alongside the regular tracing output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        discovery_addr: String,
        tcp_port: u16,
        thread_slots: usize,
        connections_per_thread: usize,
    },

    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    ConnectionAccepted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        socket: u64,
        thread_slot: usize,
        connection_slot: usize,
    },

    ConnectionClosed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        socket: u64,
        reason: String,
    },

    /// Every slot was taken
    ConnectionRefused {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        reason: String,
    },

    DiscoveryRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        command: String,
        replied: bool,
    },

    AuthenticationAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        user_id: String,
        granted: Option<String>,
    },

    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    FileRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        file_size: u64,
    },

    FileDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
        violation_type: String,
    },

    QuestionPosted {
        #[serde(flatten)]
        common: CommonFields,
        question_id: u64,
        kind: String,
        text: String,
    },

    QuestionAnswered {
        #[serde(flatten)]
        common: CommonFields,
        question_id: u64,
        client_addr: String,
        answer: String,
    },

    QuestionClosed {
        #[serde(flatten)]
        common: CommonFields,
        question_id: u64,
    },

    RepairLockAcquired {
        #[serde(flatten)]
        common: CommonFields,
        holder: String,
        renewed: bool,
    },

    RepairLockDenied {
        #[serde(flatten)]
        common: CommonFields,
        requester: String,
        holder: String,
    },

    RepairLockReleased {
        #[serde(flatten)]
        common: CommonFields,
        holder: String,
    },

    RepairLockExpired {
        #[serde(flatten)]
        common: CommonFields,
        holder: String,
        ticks: u32,
    },

    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
    },

    ConfigurationError {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
        error: String,
    },
}

/// Fields shared by every audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Ties related events together (e.g. a question and its answer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "kestrel-station".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: String) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(correlation_id);
        fields
    }
}

impl AuditEvent {
    /// Emit this event through tracing at its severity.
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ConnectionAccepted { common, .. }
            | AuditEvent::ConnectionClosed { common, .. }
            | AuditEvent::ConnectionRefused { common, .. }
            | AuditEvent::DiscoveryRequest { common, .. }
            | AuditEvent::AuthenticationAttempt { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::FileRequest { common, .. }
            | AuditEvent::FileDenied { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::QuestionPosted { common, .. }
            | AuditEvent::QuestionAnswered { common, .. }
            | AuditEvent::QuestionClosed { common, .. }
            | AuditEvent::RepairLockAcquired { common, .. }
            | AuditEvent::RepairLockDenied { common, .. }
            | AuditEvent::RepairLockReleased { common, .. }
            | AuditEvent::RepairLockExpired { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. }
            | AuditEvent::ConfigurationError { common, .. } => common,
        }
    }
}

fn question_correlation(question_id: u64) -> String {
    format!("question-{question_id}")
}

/// Convenience constructors that build and log an event in one call.
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(
        discovery_addr: SocketAddr,
        tcp_port: u16,
        thread_slots: usize,
        connections_per_thread: usize,
    ) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            discovery_addr: discovery_addr.to_string(),
            tcp_port,
            thread_slots,
            connections_per_thread,
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn connection_accepted(
        client_addr: SocketAddr,
        socket: u64,
        thread_slot: usize,
        connection_slot: usize,
    ) {
        AuditEvent::ConnectionAccepted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            socket,
            thread_slot,
            connection_slot,
        }
        .log();
    }

    pub fn connection_closed(client_addr: SocketAddr, socket: u64, reason: &str) {
        AuditEvent::ConnectionClosed {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            socket,
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn connection_refused(client_addr: SocketAddr, reason: &str) {
        AuditEvent::ConnectionRefused {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn discovery_request(client_addr: SocketAddr, command: &str, replied: bool) {
        AuditEvent::DiscoveryRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            command: command.to_string(),
            replied,
        }
        .log();
    }

    pub fn authentication_attempt(client_addr: SocketAddr, user_id: &str, granted: Option<&str>) {
        AuditEvent::AuthenticationAttempt {
            common: CommonFields::new(if granted.is_some() { "info" } else { "warn" }),
            client_addr: client_addr.to_string(),
            user_id: user_id.to_string(),
            granted: granted.map(str::to_string),
        }
        .log();
    }

    pub fn protocol_violation(client_addr: impl std::fmt::Display, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }

    pub fn file_request(client: IpAddr, filename: &str, file_size: u64) {
        AuditEvent::FileRequest {
            common: CommonFields::new("info"),
            client_addr: client.to_string(),
            filename: filename.to_string(),
            file_size,
        }
        .log();
    }

    pub fn file_denied(client: IpAddr, filename: &str, reason: &str) {
        AuditEvent::FileDenied {
            common: CommonFields::new("warn"),
            client_addr: client.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn path_traversal_attempt(client: IpAddr, requested_path: &str, violation_type: &str) {
        AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("error"),
            client_addr: client.to_string(),
            requested_path: requested_path.to_string(),
            violation_type: violation_type.to_string(),
        }
        .log();
    }

    pub fn question_posted(question_id: u64, kind: &str, text: &str) {
        AuditEvent::QuestionPosted {
            common: CommonFields::with_correlation("info", question_correlation(question_id)),
            question_id,
            kind: kind.to_string(),
            text: text.to_string(),
        }
        .log();
    }

    pub fn question_answered(question_id: u64, client: IpAddr, answer: &str) {
        AuditEvent::QuestionAnswered {
            common: CommonFields::with_correlation("info", question_correlation(question_id)),
            question_id,
            client_addr: client.to_string(),
            answer: answer.to_string(),
        }
        .log();
    }

    pub fn question_closed(question_id: u64) {
        AuditEvent::QuestionClosed {
            common: CommonFields::with_correlation("info", question_correlation(question_id)),
            question_id,
        }
        .log();
    }

    pub fn repair_lock_acquired(holder: IpAddr, renewed: bool) {
        AuditEvent::RepairLockAcquired {
            common: CommonFields::new("info"),
            holder: holder.to_string(),
            renewed,
        }
        .log();
    }

    pub fn repair_lock_denied(requester: IpAddr, holder: IpAddr) {
        AuditEvent::RepairLockDenied {
            common: CommonFields::new("warn"),
            requester: requester.to_string(),
            holder: holder.to_string(),
        }
        .log();
    }

    pub fn repair_lock_released(holder: IpAddr) {
        AuditEvent::RepairLockReleased {
            common: CommonFields::new("info"),
            holder: holder.to_string(),
        }
        .log();
    }

    pub fn repair_lock_expired(holder: IpAddr, ticks: u32) {
        AuditEvent::RepairLockExpired {
            common: CommonFields::new("warn"),
            holder: holder.to_string(),
            ticks,
        }
        .log();
    }

    pub fn configuration_loaded(config_file: &Path) {
        AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            config_file: config_file.display().to_string(),
        }
        .log();
    }

    pub fn configuration_error(config_file: &Path, error: &str) {
        AuditEvent::ConfigurationError {
            common: CommonFields::new("error"),
            config_file: config_file.display().to_string(),
            error: error.to_string(),
        }
        .log();
    }
}
