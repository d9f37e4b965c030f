//! Telemetry Module for the L4 peek filter
//!
//! Emits one structured JSON log line per sniffing decision. In Wasm these
//! end up in Envoy's log and can be collected from there.

use log::{info, warn};
use serde::Serialize;

use crate::peek::Filter;

/// Sniff event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SniffEventType {
    /// A filter matched the leading bytes
    Matched,
    /// No filter matched
    Unmatched,
    /// Unmatched connection was closed
    Rejected,
    /// Plugin configuration was refused
    ConfigRejected,
}

/// Sniff event for logging
#[derive(Debug, Clone, Serialize)]
pub struct SniffEvent {
    pub event_type: SniffEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<u32>,
    /// Index of the matching filter in the chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_index: Option<usize>,
    /// Kind of the matching filter ("prefix" or "pattern")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_kind: Option<&'static str>,
    /// Label of the matching filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Bytes the host had buffered when the decision was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_buffered: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SniffEvent {
    pub fn new(event_type: SniffEventType) -> Self {
        Self {
            event_type,
            context_id: None,
            filter_index: None,
            filter_kind: None,
            filter: None,
            bytes_buffered: None,
            reason: None,
        }
    }

    pub fn with_context_id(mut self, id: u32) -> Self {
        self.context_id = Some(id);
        self
    }

    pub fn with_filter(mut self, index: usize, filter: &Filter) -> Self {
        self.filter_index = Some(index);
        self.filter_kind = Some(filter.kind_name());
        self.filter = Some(filter.describe());
        self
    }

    pub fn with_bytes_buffered(mut self, bytes: usize) -> Self {
        self.bytes_buffered = Some(bytes);
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Log the event
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => match self.event_type {
                SniffEventType::Rejected | SniffEventType::ConfigRejected => {
                    warn!("[L4-PEEK] {}", json);
                }
                _ => {
                    info!("[L4-PEEK] {}", json);
                }
            },
            Err(e) => {
                warn!("Failed to serialize sniff event: {}", e);
            }
        }
    }
}

pub fn sniff_matched(index: usize, filter: &Filter) -> SniffEvent {
    SniffEvent::new(SniffEventType::Matched).with_filter(index, filter)
}

pub fn sniff_unmatched() -> SniffEvent {
    SniffEvent::new(SniffEventType::Unmatched)
}

pub fn sniff_rejected() -> SniffEvent {
    SniffEvent::new(SniffEventType::Rejected).with_reason("no filter matched")
}

pub fn config_rejected(reason: &str) -> SniffEvent {
    SniffEvent::new(SniffEventType::ConfigRejected).with_reason(reason)
}
