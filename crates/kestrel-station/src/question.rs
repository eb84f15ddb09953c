//! The shared pending-question slot.
//!
//! At most one question is outstanding. The test process posts it and awaits a
//! [`QuestionTicket`]; the first connection to give an acceptable answer
//! resolves the ticket and clears the slot for everyone.

use crate::error::{Result, StationError};
use kestrel_core::QuestionKind;
use tokio::sync::oneshot;

/// Free-text answer that postpones the question for that connection only.
pub const DEFER_ANSWER: &str = "DEFER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuestion {
    pub id: u64,
    pub text: String,
    pub kind: QuestionKind,
}

/// What an answer did to the pending question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Nothing was pending
    NoQuestion,
    /// Not one of the kind's literal answers; the question stays pending
    Rejected,
    /// The responder postponed the question; it stays pending for everyone else
    Deferred,
    /// First valid answer; the question is cleared
    Accepted { question: PendingQuestion, answer: String },
}

/// Handle returned to the poster of a question.
#[derive(Debug)]
pub struct QuestionTicket {
    id: u64,
    rx: oneshot::Receiver<Option<String>>,
}

impl QuestionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the answer. `None` when the question was closed unanswered.
    pub async fn answer(self) -> Option<String> {
        self.rx.await.ok().flatten()
    }
}

#[derive(Debug, Default)]
pub struct QuestionBoard {
    pending: Option<PendingQuestion>,
    responder: Option<oneshot::Sender<Option<String>>>,
    last_id: u64,
}

impl QuestionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<&PendingQuestion> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn post(&mut self, text: impl Into<String>, kind: QuestionKind) -> Result<QuestionTicket> {
        if self.pending.is_some() {
            return Err(StationError::QuestionPending);
        }

        self.last_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingQuestion {
            id: self.last_id,
            text: text.into(),
            kind,
        });
        self.responder = Some(tx);
        Ok(QuestionTicket {
            id: self.last_id,
            rx,
        })
    }

    /// Apply one connection's answer.
    pub fn answer(&mut self, raw: &str) -> AnswerOutcome {
        let Some(question) = self.pending.as_ref() else {
            return AnswerOutcome::NoQuestion;
        };
        let raw = raw.trim();

        let answer = if question.kind.is_binary() {
            match question
                .kind
                .valid_answers()
                .iter()
                .find(|valid| valid.eq_ignore_ascii_case(raw))
            {
                Some(valid) => valid.to_string(),
                None => return AnswerOutcome::Rejected,
            }
        } else if raw.eq_ignore_ascii_case(DEFER_ANSWER) {
            return AnswerOutcome::Deferred;
        } else if raw.is_empty() {
            return AnswerOutcome::Rejected;
        } else {
            raw.to_string()
        };

        let question = match self.pending.take() {
            Some(q) => q,
            None => return AnswerOutcome::NoQuestion,
        };
        if let Some(tx) = self.responder.take() {
            // The poster may have stopped waiting.
            let _ = tx.send(Some(answer.clone()));
        }
        AnswerOutcome::Accepted { question, answer }
    }

    /// Drop the pending question without an answer.
    pub fn close(&mut self) -> Option<PendingQuestion> {
        let question = self.pending.take()?;
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(None);
        }
        Some(question)
    }
}
