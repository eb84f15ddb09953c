use kestrel_core::{Sequence, TestRecord};

/// The two process-wide record sequences of the current run.
#[derive(Debug, Default)]
pub struct TestLog {
    test: Vec<TestRecord>,
    diagnostic: Vec<TestRecord>,
}

impl TestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new run with empty sequences.
    pub fn reset(&mut self) {
        self.test.clear();
        self.diagnostic.clear();
    }

    pub fn append(&mut self, sequence: Sequence, record: TestRecord) -> usize {
        let seq = self.sequence_mut(sequence);
        seq.push(record);
        seq.len()
    }

    pub fn len(&self, sequence: Sequence) -> usize {
        self.sequence(sequence).len()
    }

    /// Records at and after `cursor`.
    pub fn since(&self, sequence: Sequence, cursor: usize) -> &[TestRecord] {
        let seq = self.sequence(sequence);
        &seq[cursor.min(seq.len())..]
    }

    pub fn last(&self, sequence: Sequence) -> Option<&TestRecord> {
        self.sequence(sequence).last()
    }

    /// Full printout of both sequences.
    pub fn printout(&self, header: &str) -> String {
        let mut out = String::new();
        out.push_str(header);
        out.push('\n');
        for record in &self.test {
            out.push_str(&record.line());
            out.push('\n');
        }
        if !self.diagnostic.is_empty() {
            out.push_str("-- diagnostics --\n");
            for record in &self.diagnostic {
                out.push_str(&record.line());
                out.push('\n');
            }
        }
        out
    }

    fn sequence(&self, sequence: Sequence) -> &Vec<TestRecord> {
        match sequence {
            Sequence::Test => &self.test,
            Sequence::Diagnostic => &self.diagnostic,
        }
    }

    fn sequence_mut(&mut self, sequence: Sequence) -> &mut Vec<TestRecord> {
        match sequence {
            Sequence::Test => &mut self.test,
            Sequence::Diagnostic => &mut self.diagnostic,
        }
    }
}

/// Wire payload for a batch of records: the index of the first record, then
/// one fixed-width line per record.
pub fn records_payload(first_index: usize, records: &[TestRecord]) -> String {
    let mut payload = first_index.to_string();
    for record in records {
        payload.push('\n');
        payload.push_str(&record.line());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_clamps_cursor() {
        let mut log = TestLog::new();
        log.append(Sequence::Test, TestRecord::new("one", "PASS"));
        log.append(Sequence::Test, TestRecord::new("two", "PASS"));
        assert_eq!(log.since(Sequence::Test, 0).len(), 2);
        assert_eq!(log.since(Sequence::Test, 1).len(), 1);
        assert!(log.since(Sequence::Test, 9).is_empty());
        assert!(log.since(Sequence::Diagnostic, 0).is_empty());
    }

    #[test]
    fn reset_empties_both_sequences() {
        let mut log = TestLog::new();
        log.append(Sequence::Test, TestRecord::new("one", "PASS"));
        log.append(Sequence::Diagnostic, TestRecord::new("dimm0", "INFO"));
        log.reset();
        assert_eq!(log.len(Sequence::Test), 0);
        assert_eq!(log.len(Sequence::Diagnostic), 0);
        assert!(log.last(Sequence::Test).is_none());
    }

    #[test]
    fn payload_starts_with_index() {
        let records = vec![TestRecord::new("a", "PASS"), TestRecord::new("b", "FAIL")];
        let payload = records_payload(4, &records);
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "4");
        assert!(lines[2].ends_with("FAIL      "));
    }

    #[test]
    fn printout_includes_diagnostics_section() {
        let mut log = TestLog::new();
        log.append(Sequence::Test, TestRecord::new("cpu", "PASS"));
        log.append(Sequence::Diagnostic, TestRecord::new("pci 00:1f.3", "INFO"));
        let printout = log.printout("SN1|FG|1|PASS|100");
        assert!(printout.starts_with("SN1|FG|1|PASS|100\n"));
        assert!(printout.contains("-- diagnostics --"));
    }
}
