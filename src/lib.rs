//! L4 Peek Filter for Envoy Proxy
//!
//! This network filter sniffs the first bytes of each downstream
//! connection and checks them against an ordered list of signatures
//! (literal prefixes and regex patterns). The data stays buffered in Envoy
//! until a verdict exists, so upstream sees the connection untouched.
//!
//! A connection is held until its bytes cover the largest `maxRead` in the
//! chain or it closes. Keep `maxRead` small for protocols where the client
//! waits for the server after a short greeting.
//!
//! Targets: wasm32-wasi (Envoy proxy-wasm ABI)

pub mod config;
pub mod peek;
pub mod sniffer;
pub mod telemetry;

pub use config::{ConfigError, PeekConfig, PrefixPattern};
pub use peek::{FilterChain, MatchOutcome, PartialRead, PatternSpec, PeekMatcher};
pub use sniffer::{ConnectionSniffer, SniffStep, Verdict};

use log::{debug, info, warn};
use proxy_wasm::traits::{Context, RootContext, StreamContext};
use proxy_wasm::types::{Action, ContextType, LogLevel, PeerType};
use std::sync::Arc;

/// Filter-state property carrying the verdict
const VERDICT_PROPERTY: [&str; 2] = ["l4_peek", "matched"];

/// Root context for filter lifecycle management
struct PeekRootContext {
    config: PeekConfig,
    matcher: Arc<PeekMatcher>,
}

impl PeekRootContext {
    fn new() -> Self {
        Self {
            config: PeekConfig::default(),
            matcher: Arc::new(PeekMatcher::default()),
        }
    }

    /// Parse and compile the plugin configuration. A missing configuration
    /// yields an empty chain.
    fn configure(&mut self, config_bytes: Option<&[u8]>) -> Result<(), ConfigError> {
        let config = match config_bytes {
            Some(bytes) => PeekConfig::from_bytes(bytes)?,
            None => PeekConfig::default(),
        };
        let matcher = config.build_matcher()?;

        self.matcher = Arc::new(matcher);
        self.config = config;
        Ok(())
    }
}

impl Context for PeekRootContext {}

impl RootContext for PeekRootContext {
    fn on_configure(&mut self, _plugin_configuration_size: usize) -> bool {
        let config_bytes = self.get_plugin_configuration();

        if let Err(e) = self.configure(config_bytes.as_deref()) {
            telemetry::config_rejected(&e.to_string()).emit();
            return false;
        }

        info!(
            "L4 peek filter initialized with {} filters (largest read {} bytes)",
            self.matcher.chain().len(),
            self.matcher.chain().max_threshold()
        );

        true
    }

    fn create_stream_context(&self, context_id: u32) -> Option<Box<dyn StreamContext>> {
        Some(Box::new(PeekStreamContext::new(
            context_id,
            self.matcher.clone(),
            &self.config,
        )))
    }

    fn get_type(&self) -> Option<ContextType> {
        Some(ContextType::StreamContext)
    }
}

/// Stream context for per-connection sniffing
struct PeekStreamContext {
    context_id: u32,
    sniffer: ConnectionSniffer,
    close_on_mismatch: bool,
    log_matches: bool,
    /// Set once the verdict has been acted on
    reported: bool,
}

impl PeekStreamContext {
    fn new(context_id: u32, matcher: Arc<PeekMatcher>, config: &PeekConfig) -> Self {
        Self {
            context_id,
            sniffer: ConnectionSniffer::new(matcher),
            close_on_mismatch: config.close_on_mismatch,
            log_matches: config.log_matches,
            reported: false,
        }
    }

    fn report(&mut self, verdict: Verdict, bytes_buffered: usize) {
        self.reported = true;

        let event = match verdict {
            Verdict::Matched { filter } => {
                let matched = &self.sniffer.matcher().chain().filters()[filter];
                debug!(
                    "[context_id={}] Matched {} filter #{} ({})",
                    self.context_id,
                    matched.kind_name(),
                    filter,
                    matched.describe()
                );
                telemetry::sniff_matched(filter, matched)
            }
            Verdict::Unmatched if self.close_on_mismatch => telemetry::sniff_rejected(),
            Verdict::Unmatched => telemetry::sniff_unmatched(),
        };

        let matched: &[u8] = match verdict {
            Verdict::Matched { .. } => b"true",
            Verdict::Unmatched => b"false",
        };
        self.set_property(VERDICT_PROPERTY.to_vec(), Some(matched));

        if self.log_matches {
            event
                .with_context_id(self.context_id)
                .with_bytes_buffered(bytes_buffered)
                .emit();
        }
    }
}

impl Context for PeekStreamContext {}

impl StreamContext for PeekStreamContext {
    fn on_downstream_data(&mut self, data_size: usize, end_of_stream: bool) -> Action {
        if self.reported {
            return match self.sniffer.verdict() {
                Some(Verdict::Unmatched) if self.close_on_mismatch => Action::Pause,
                _ => Action::Continue,
            };
        }

        // Paused data stays in Envoy's buffer, so this is everything so far
        let buffered = self
            .get_downstream_data(0, data_size)
            .unwrap_or_default();

        match self.sniffer.on_data(&buffered, end_of_stream) {
            SniffStep::Pending => {
                debug!(
                    "[context_id={}] Waiting for more data, {} bytes buffered",
                    self.context_id,
                    buffered.len()
                );
                Action::Pause
            }
            SniffStep::Decided(verdict) => {
                self.report(verdict, buffered.len());

                if verdict == Verdict::Unmatched && self.close_on_mismatch {
                    warn!(
                        "[context_id={}] No filter matched, closing downstream",
                        self.context_id
                    );
                    self.close_downstream();
                    return Action::Pause;
                }
                Action::Continue
            }
        }
    }

    fn on_downstream_close(&mut self, _peer_type: PeerType) {
        if !self.reported {
            debug!(
                "[context_id={}] Downstream closed before a verdict",
                self.context_id
            );
        }
    }

    fn on_log(&mut self) {
        debug!(
            "[context_id={}] Connection complete, verdict: {:?}",
            self.context_id,
            self.sniffer.verdict()
        );
    }
}

// Register the filter with proxy-wasm runtime
proxy_wasm::main! {{
    proxy_wasm::set_log_level(LogLevel::Debug);
    proxy_wasm::set_root_context(|_| -> Box<dyn RootContext> {
        Box::new(PeekRootContext::new())
    });
}}
