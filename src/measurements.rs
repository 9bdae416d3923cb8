use crate::clock::Timestamp;
use crate::config::ProbeMode;
use crate::flow::FlowReport;
use crate::stats::{combined_mean, RunningMean};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Client-side counters for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeMeasurements {
    pub mode: ProbeMode,
    pub number_sent: u64,
    pub number_rxed: u64,
    pub number_dropped: u64,
    pub number_timeouts: u64,
    pub number_anomalies: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub last_acked_seq: u32,
    pub rtt: RunningMean,
    pub owd: RunningMean,
    pub min_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
    pub start_wall: Option<Timestamp>,
    pub total_duration: Duration,
    #[serde(skip)]
    pub start_time: Option<Instant>,
}

impl ProbeMeasurements {
    pub fn new(mode: ProbeMode) -> Self {
        Self {
            mode,
            number_sent: 0,
            number_rxed: 0,
            number_dropped: 0,
            number_timeouts: 0,
            number_anomalies: 0,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            last_acked_seq: 0,
            rtt: RunningMean::new(),
            owd: RunningMean::new(),
            min_rtt: None,
            max_rtt: None,
            start_wall: None,
            total_duration: Duration::ZERO,
            start_time: None,
        }
    }

    /// Fraction of sent probes that got no reply. Stream mode never counts replies.
    pub fn loss_rate(&self) -> Option<f64> {
        if self.number_sent == 0 || !self.mode.expects_reply() {
            return None;
        }
        Some(self.number_dropped as f64 / self.number_sent as f64)
    }

    pub fn send_rate_bps(&self) -> Option<f64> {
        let secs = self.total_duration.as_secs_f64();
        if secs > 0.0 {
            Some(self.total_bytes_sent as f64 * 8.0 / secs)
        } else {
            None
        }
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            wall_time: self.start_wall,
            duration_secs: self.total_duration.as_secs_f64(),
            mode: self.mode,
            number_sent: self.number_sent,
            number_rxed: self.number_rxed,
            number_dropped: self.number_dropped,
            number_timeouts: self.number_timeouts,
            number_anomalies: self.number_anomalies,
            total_bytes_sent: self.total_bytes_sent,
            total_bytes_received: self.total_bytes_received,
            avg_rtt: self.rtt.mean(),
            min_rtt: self.min_rtt,
            max_rtt: self.max_rtt,
            avg_owd: self.owd.mean(),
            loss_rate: self.loss_rate(),
            send_rate_bps: self.send_rate_bps(),
        }
    }
}

/// End-of-run client summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub wall_time: Option<Timestamp>,
    pub duration_secs: f64,
    pub mode: ProbeMode,
    pub number_sent: u64,
    pub number_rxed: u64,
    pub number_dropped: u64,
    pub number_timeouts: u64,
    pub number_anomalies: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub avg_rtt: Option<f64>,
    pub min_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
    pub avg_owd: Option<f64>,
    pub loss_rate: Option<f64>,
    pub send_rate_bps: Option<f64>,
}

/// Thread-safe client measurements collector
#[derive(Debug, Clone)]
pub struct ProbeCollector {
    inner: Arc<Mutex<ProbeMeasurements>>,
}

impl ProbeCollector {
    pub fn new(mode: ProbeMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProbeMeasurements::new(mode))),
        }
    }

    pub fn start(&self, at: Instant, wall: Timestamp) {
        let mut m = self.inner.lock();
        m.start_time = Some(at);
        m.start_wall = Some(wall);
    }

    pub fn record_sent(&self, bytes: u64) {
        let mut m = self.inner.lock();
        m.number_sent += 1;
        m.total_bytes_sent += bytes;
    }

    /// Records a matched reply; `rtt` and `owd` are in seconds.
    pub fn record_reply(&self, seq: u32, rtt: f64, owd: f64, bytes: u64) {
        let mut m = self.inner.lock();
        m.number_rxed += 1;
        m.total_bytes_received += bytes;
        m.last_acked_seq = seq;
        m.rtt.push(rtt);
        m.owd.push(owd);
        m.min_rtt = Some(m.min_rtt.map_or(rtt, |v| v.min(rtt)));
        m.max_rtt = Some(m.max_rtt.map_or(rtt, |v| v.max(rtt)));
    }

    /// A probe whose reply deadline passed.
    pub fn record_timeout(&self) {
        let mut m = self.inner.lock();
        m.number_timeouts += 1;
        m.number_dropped += 1;
    }

    /// A reply that arrived but did not match the outstanding probe.
    pub fn record_anomaly(&self) {
        self.inner.lock().number_anomalies += 1;
    }

    pub fn set_duration(&self, duration: Duration) {
        self.inner.lock().total_duration = duration;
    }

    pub fn get(&self) -> ProbeMeasurements {
        self.inner.lock().clone()
    }
}

/// Server-wide counters across all flows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMeasurements {
    pub number_iterations: u64,
    pub number_messages: u64,
    pub total_bytes_rxed: u64,
    pub replies_sent: u64,
    pub decode_errors: u64,
    pub rejected_flows: u64,
    pub unknown_codes: u64,
    pub mode: Option<u8>,
    pub first_rx: Option<Timestamp>,
    pub last_rx: Option<Timestamp>,
    pub total_duration: Duration,
}

impl ServerMeasurements {
    /// Summarizes the run together with the final per-flow reports.
    pub fn summary(&self, flows: Vec<FlowReport>, owd: &[RunningMean]) -> ServerSummary {
        let throughput_bps = match (self.first_rx, self.last_rx) {
            (Some(first), Some(last)) if last > first => {
                Some(self.total_bytes_rxed as f64 * 8.0 / last.seconds_since(first))
            }
            _ => None,
        };
        ServerSummary {
            duration_secs: self.total_duration.as_secs_f64(),
            mode: self.mode,
            number_iterations: self.number_iterations,
            number_messages: self.number_messages,
            total_bytes_rxed: self.total_bytes_rxed,
            replies_sent: self.replies_sent,
            decode_errors: self.decode_errors,
            rejected_flows: self.rejected_flows,
            unknown_codes: self.unknown_codes,
            avg_owd: combined_mean(owd),
            estimated_losses: flows.iter().map(|f| f.messages_lost).sum(),
            out_of_order: flows.iter().map(|f| f.out_of_order).sum(),
            throughput_bps,
            flows,
        }
    }
}

/// End-of-run server summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub duration_secs: f64,
    pub mode: Option<u8>,
    pub number_iterations: u64,
    pub number_messages: u64,
    pub total_bytes_rxed: u64,
    pub replies_sent: u64,
    pub decode_errors: u64,
    pub rejected_flows: u64,
    pub unknown_codes: u64,
    pub avg_owd: Option<f64>,
    pub estimated_losses: u64,
    pub out_of_order: u64,
    pub throughput_bps: Option<f64>,
    pub flows: Vec<FlowReport>,
}

/// Thread-safe server measurements collector
#[derive(Debug, Clone, Default)]
pub struct ServerCollector {
    inner: Arc<Mutex<ServerMeasurements>>,
}

impl ServerCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every datagram read from the socket, valid or not.
    pub fn record_datagram(&self, bytes: u64, at: Timestamp) {
        let mut m = self.inner.lock();
        m.number_iterations += 1;
        m.total_bytes_rxed += bytes;
        m.first_rx.get_or_insert(at);
        m.last_rx = Some(at);
    }

    pub fn record_message(&self, code: u8) {
        let mut m = self.inner.lock();
        m.number_messages += 1;
        m.mode = Some(code);
    }

    pub fn record_reply(&self) {
        self.inner.lock().replies_sent += 1;
    }

    pub fn record_decode_error(&self) {
        self.inner.lock().decode_errors += 1;
    }

    pub fn record_rejected(&self) {
        self.inner.lock().rejected_flows += 1;
    }

    pub fn record_unknown_code(&self) {
        self.inner.lock().unknown_codes += 1;
    }

    pub fn set_duration(&self, duration: Duration) {
        self.inner.lock().total_duration = duration;
    }

    pub fn get(&self) -> ServerMeasurements {
        self.inner.lock().clone()
    }
}
