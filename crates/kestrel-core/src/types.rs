use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Width of the data column of a test record line.
pub const RECORD_DATA_WIDTH: usize = 70;
/// Width of the status suffix of a test record line.
pub const RECORD_STATUS_WIDTH: usize = 10;

/// MAC address representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn to_string_colon(&self) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_colon())
    }
}

impl std::str::FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().replace([':', '-'], "");
        if s.len() != 12 {
            anyhow::bail!("Invalid MAC address length");
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }

        Ok(MacAddress(bytes))
    }
}

/// Snapshot of the board under test.
///
/// Owned by the test-execution logic; the network side only reads it for
/// discovery replies and the printout header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardState {
    pub serial_number: String,
    pub finished_good: String,
    pub attempt: u32,
    pub passed: bool,
    /// 0-100
    pub percent_complete: u8,
}

impl BoardState {
    pub fn new(serial_number: impl Into<String>, finished_good: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            finished_good: finished_good.into(),
            attempt: 1,
            passed: false,
            percent_complete: 0,
        }
    }

    /// Pipe-delimited summary used by discovery replies.
    pub fn summary(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.serial_number,
            self.finished_good,
            self.attempt,
            if self.passed { "PASS" } else { "FAIL" },
            self.percent_complete.min(100)
        )
    }
}

/// Which of the two record sequences a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sequence {
    Test,
    Diagnostic,
}

/// One fixed-width line of test output: a data column and a status suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    data: String,
    status: String,
    pub recorded_at: DateTime<Utc>,
}

impl TestRecord {
    /// Build a record, padding or truncating both columns to their fixed widths.
    pub fn new(data: &str, status: &str) -> Self {
        Self {
            data: fixed_width(data, RECORD_DATA_WIDTH),
            status: fixed_width(status, RECORD_STATUS_WIDTH),
            recorded_at: Utc::now(),
        }
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// The full printout line (data followed by status).
    pub fn line(&self) -> String {
        format!("{}{}", self.data, self.status)
    }
}

fn fixed_width(s: &str, width: usize) -> String {
    // Newlines would break the line-oriented wire format.
    let cleaned: String = s
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(width)
        .collect();
    format!("{:<width$}", cleaned, width = width)
}

/// Kind of interactive question the test process can ask an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    FreeText,
    YesNo,
    RetryFail,
}

impl QuestionKind {
    /// Literal answers accepted for binary-outcome kinds.
    pub fn valid_answers(&self) -> &'static [&'static str] {
        match self {
            QuestionKind::FreeText => &[],
            QuestionKind::YesNo => &["YES", "NO"],
            QuestionKind::RetryFail => &["RETRY", "FAIL"],
        }
    }

    pub fn is_binary(&self) -> bool {
        !matches!(self, QuestionKind::FreeText)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            QuestionKind::FreeText => "TEXT",
            QuestionKind::YesNo => "YESNO",
            QuestionKind::RetryFail => "RETRYFAIL",
        }
    }
}

/// Access level granted to a station user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Viewer,
    Operator,
    Technician,
    Admin,
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessLevel::Viewer => write!(f, "VIEWER"),
            AccessLevel::Operator => write!(f, "OPERATOR"),
            AccessLevel::Technician => write!(f, "TECHNICIAN"),
            AccessLevel::Admin => write!(f, "ADMIN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_parses_both_separators() {
        let colon: MacAddress = "00:1a:2b:3c:4d:5e".parse().unwrap();
        let dash: MacAddress = "00-1A-2B-3C-4D-5E".parse().unwrap();
        assert_eq!(colon, dash);
        assert_eq!(colon.to_string(), "00:1a:2b:3c:4d:5e");
        assert!("00:1a:2b".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_record_is_fixed_width() {
        let record = TestRecord::new("Memory walk 0x0000-0xFFFF", "PASS");
        assert_eq!(record.data().len(), RECORD_DATA_WIDTH);
        assert_eq!(record.status().len(), RECORD_STATUS_WIDTH);
        assert_eq!(record.line().len(), RECORD_DATA_WIDTH + RECORD_STATUS_WIDTH);

        let long = "x".repeat(200);
        let record = TestRecord::new(&long, "FAILED-BADLY-LONG");
        assert_eq!(record.data().len(), RECORD_DATA_WIDTH);
        assert_eq!(record.status(), "FAILED-BAD");
    }

    #[test]
    fn test_record_strips_newlines() {
        let record = TestRecord::new("line one\nline two", "OK");
        assert!(!record.line().contains('\n'));
    }

    #[test]
    fn question_kind_answers() {
        assert_eq!(QuestionKind::YesNo.valid_answers(), &["YES", "NO"]);
        assert!(QuestionKind::RetryFail.is_binary());
        assert!(!QuestionKind::FreeText.is_binary());
    }

    #[test]
    fn board_summary_clamps_percent() {
        let mut board = BoardState::new("SN100", "FG-7");
        board.percent_complete = 250;
        assert_eq!(board.summary(), "SN100|FG-7|1|FAIL|100");
    }
}
