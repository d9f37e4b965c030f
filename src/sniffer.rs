//! Per-connection sniffing for hosts that deliver data in chunks
//!
//! Envoy hands a network filter whatever it has buffered so far instead of
//! blocking for more. The sniffer re-runs the matcher over each snapshot
//! until the chain can be decided, then remembers the verdict.

use std::io::ErrorKind;
use std::sync::Arc;

use crate::peek::{MatchOutcome, PeekMatcher, Snapshot};

/// Final decision for one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Matched { filter: usize },
    Unmatched,
}

/// What the host should do after handing over data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SniffStep {
    /// More bytes are needed before a decision
    Pending,
    Decided(Verdict),
}

/// Sniffing state for one downstream connection.
///
/// A miss is only final once the buffered bytes cover the chain's largest
/// threshold or the stream has ended. Clients that send a short greeting
/// and then wait for the server stay `Pending` until Envoy's idle timeout
/// when a pattern keeps the default `maxRead` of 4096, so give patterns a
/// `maxRead` no larger than the greeting they are meant to recognize.
pub struct ConnectionSniffer {
    matcher: Arc<PeekMatcher>,
    verdict: Option<Verdict>,
}

impl ConnectionSniffer {
    pub fn new(matcher: Arc<PeekMatcher>) -> Self {
        Self {
            matcher,
            verdict: None,
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn matcher(&self) -> &PeekMatcher {
        &self.matcher
    }

    /// Evaluate everything buffered so far.
    ///
    /// A snapshot covering the largest threshold is treated like a closed
    /// stream: the matcher will not ask for more.
    pub fn on_data(&mut self, buffered: &[u8], end_of_stream: bool) -> SniffStep {
        if let Some(verdict) = self.verdict {
            return SniffStep::Decided(verdict);
        }

        let complete = end_of_stream || buffered.len() >= self.matcher.chain().max_threshold();
        let mut snapshot = Snapshot::new(buffered, complete);

        let verdict = match self.matcher.match_source(&mut snapshot) {
            MatchOutcome::Matched { filter } => Verdict::Matched { filter },
            MatchOutcome::Unmatched => Verdict::Unmatched,
            MatchOutcome::Aborted(ErrorKind::WouldBlock) => return SniffStep::Pending,
            MatchOutcome::Aborted(_) => Verdict::Unmatched,
        };

        self.verdict = Some(verdict);
        SniffStep::Decided(verdict)
    }
}
