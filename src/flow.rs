//! Per-flow receive statistics on the server.
//!
//! A flow is identified by the peer's socket address. Each arrival updates the
//! flow's sequence tracking, loss-burst histogram, one-way delay, jitter and
//! inter-arrival statistics in O(1).
//!
//! # Sequence Classification
//!
//! With `last` the highest sequence seen so far:
//!
//! - `seq == last + 1`: in order
//! - `seq > last + 1`: in order after a gap; the `seq - last - 1` missing
//!   probes count as lost and form one loss event of that length
//! - `seq <= last`: out of order (a repeat of `last` also counts as a duplicate)
//!
//! Late arrivals never reduce the loss count: a probe reported lost that shows
//! up afterwards is counted both as lost and as out of order.
//!
//! Flows live in the active table until removed by idle expiry or shutdown, at
//! which point they move to an append-only archive.

use crate::clock::Timestamp;
use crate::stats::RunningMean;
use crate::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Number of burst-length buckets; the last one collects bursts of this length or longer.
pub const BURST_BUCKETS: usize = 12;

/// Peer address identifying a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey(pub SocketAddr);

impl From<SocketAddr> for FlowKey {
    fn from(addr: SocketAddr) -> Self {
        FlowKey(addr)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Histogram of loss-event lengths.
///
/// Bucket `i` counts events of exactly `i + 1` lost probes; the final bucket
/// counts events of [`BURST_BUCKETS`] or more and keeps their exact total in
/// `overflow_lost` so the histogram always accounts for every lost probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstHistogram {
    buckets: [u64; BURST_BUCKETS],
    overflow_lost: u64,
}

impl BurstHistogram {
    pub fn record(&mut self, len: u64) {
        if len == 0 {
            return;
        }
        if len >= BURST_BUCKETS as u64 {
            self.buckets[BURST_BUCKETS - 1] += 1;
            self.overflow_lost += len;
        } else {
            self.buckets[(len - 1) as usize] += 1;
        }
    }

    /// Events of exactly `len` (or, for the last bucket, at least `len`) probes.
    pub fn count(&self, len: usize) -> u64 {
        if len == 0 || len > BURST_BUCKETS {
            return 0;
        }
        self.buckets[len - 1]
    }

    pub fn buckets(&self) -> &[u64; BURST_BUCKETS] {
        &self.buckets
    }

    /// Total loss events.
    pub fn events(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Total probes lost across all events.
    pub fn lost(&self) -> u64 {
        let exact: u64 = self.buckets[..BURST_BUCKETS - 1]
            .iter()
            .enumerate()
            .map(|(i, n)| (i as u64 + 1) * n)
            .sum();
        exact + self.overflow_lost
    }
}

/// How the most recent arrival was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Arrival {
    #[default]
    InOrder,
    Gap {
        lost: u64,
    },
    OutOfOrder,
    Duplicate,
}

/// Receive statistics for one peer.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: u64,
    pub key: FlowKey,
    /// Last `code` byte seen from this peer.
    pub mode: Option<u8>,
    pub time_started: Timestamp,
    pub first_arrival: Option<Timestamp>,
    pub last_arrival: Option<Timestamp>,

    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,

    pub last_seq: u32,
    pub largest_seq: u32,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub messages_lost: u64,
    /// Malformed datagrams received from this peer.
    pub errors: u64,
    /// Length of the most recent loss event.
    pub last_burst_len: u64,
    pub bursts: BurstHistogram,
    pub last_arrival_kind: Arrival,

    pub owd: RunningMean,
    pub positive_owd: u64,
    pub negative_owd: u64,
    last_owd: Option<f64>,
    pub jitter: RunningMean,
    pub inter_arrival: RunningMean,

    pub signal_quality: RunningMean,
    pub rssi: RunningMean,
}

impl Flow {
    pub fn new(id: u64, key: FlowKey, started: Timestamp) -> Self {
        Self {
            id,
            key,
            mode: None,
            time_started: started,
            first_arrival: None,
            last_arrival: None,
            messages_received: 0,
            bytes_received: 0,
            messages_sent: 0,
            bytes_sent: 0,
            last_seq: 0,
            largest_seq: 0,
            out_of_order: 0,
            duplicates: 0,
            messages_lost: 0,
            errors: 0,
            last_burst_len: 0,
            bursts: BurstHistogram::default(),
            last_arrival_kind: Arrival::InOrder,
            owd: RunningMean::new(),
            positive_owd: 0,
            negative_owd: 0,
            last_owd: None,
            jitter: RunningMean::new(),
            inter_arrival: RunningMean::new(),
            signal_quality: RunningMean::new(),
            rssi: RunningMean::new(),
        }
    }

    fn record_arrival(&mut self, seq: u32, send_ts: Timestamp, recv_ts: Timestamp, bytes: u64) {
        let last = u64::from(self.last_seq);
        let current = u64::from(seq);

        self.last_arrival_kind = if current == last + 1 {
            Arrival::InOrder
        } else if current > last + 1 {
            let lost = current - last - 1;
            self.messages_lost += lost;
            self.last_burst_len = lost;
            self.bursts.record(lost);
            Arrival::Gap { lost }
        } else if current == last && self.messages_received > 0 {
            self.out_of_order += 1;
            self.duplicates += 1;
            Arrival::Duplicate
        } else {
            self.out_of_order += 1;
            Arrival::OutOfOrder
        };

        if seq > self.last_seq {
            self.last_seq = seq;
        }
        self.largest_seq = self.largest_seq.max(seq);

        let owd = recv_ts.seconds_since(send_ts);
        self.owd.push(owd);
        if owd > 0.0 {
            self.positive_owd += 1;
        } else if owd < 0.0 {
            self.negative_owd += 1;
        }
        if let Some(prev) = self.last_owd {
            self.jitter.push((owd - prev).abs());
        }
        self.last_owd = Some(owd);

        if let Some(prev) = self.last_arrival {
            self.inter_arrival.push(recv_ts.seconds_since(prev));
        }
        self.first_arrival.get_or_insert(recv_ts);
        self.last_arrival = Some(recv_ts);

        self.messages_received += 1;
        self.bytes_received += bytes;
    }

    pub fn loss_events(&self) -> u64 {
        self.bursts.events()
    }

    /// Time between first and last arrival.
    pub fn duration(&self) -> Option<f64> {
        match (self.first_arrival, self.last_arrival) {
            (Some(first), Some(last)) => Some(last.seconds_since(first)),
            _ => None,
        }
    }

    /// Derived statistics for printing or serialization.
    pub fn report(&self, active: bool) -> FlowReport {
        let largest = f64::from(self.largest_seq);
        let per_probe = |n: u64| (self.largest_seq > 0).then(|| n as f64 / largest);
        let events = self.loss_events();
        let duration = self.duration();
        let throughput_bps = duration
            .filter(|d| *d > 0.0)
            .map(|d| self.bytes_received as f64 * 8.0 / d);

        FlowReport {
            flow_id: self.id,
            peer: self.key.to_string(),
            active,
            mode: self.mode,
            time_started: self.time_started,
            duration_secs: duration,
            messages_received: self.messages_received,
            bytes_received: self.bytes_received,
            messages_sent: self.messages_sent,
            bytes_sent: self.bytes_sent,
            largest_seq: self.largest_seq,
            messages_lost: self.messages_lost,
            loss_events: events,
            out_of_order: self.out_of_order,
            duplicates: self.duplicates,
            errors: self.errors,
            loss_rate: per_probe(self.messages_lost),
            loss_event_rate: per_probe(events),
            mean_burst_length: (events > 0).then(|| self.messages_lost as f64 / events as f64),
            burst_histogram: *self.bursts.buckets(),
            avg_owd: self.owd.mean(),
            positive_owd_samples: self.positive_owd,
            negative_owd_samples: self.negative_owd,
            avg_jitter: self.jitter.mean(),
            avg_inter_arrival: self.inter_arrival.mean(),
            throughput_bps,
            avg_signal_quality: self.signal_quality.mean(),
            avg_rssi: self.rssi.mean(),
        }
    }
}

/// Snapshot of a flow's derived statistics.
///
/// Ratios are `None` when their denominator is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowReport {
    pub flow_id: u64,
    pub peer: String,
    pub active: bool,
    pub mode: Option<u8>,
    pub time_started: Timestamp,
    pub duration_secs: Option<f64>,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub largest_seq: u32,
    pub messages_lost: u64,
    pub loss_events: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub errors: u64,
    pub loss_rate: Option<f64>,
    pub loss_event_rate: Option<f64>,
    pub mean_burst_length: Option<f64>,
    pub burst_histogram: [u64; BURST_BUCKETS],
    pub avg_owd: Option<f64>,
    pub positive_owd_samples: u64,
    pub negative_owd_samples: u64,
    pub avg_jitter: Option<f64>,
    pub avg_inter_arrival: Option<f64>,
    pub throughput_bps: Option<f64>,
    pub avg_signal_quality: Option<f64>,
    pub avg_rssi: Option<f64>,
}

/// Active and archived flows.
///
/// At most `max_flows` flows are active and at most `max_flows` are kept in the
/// archive; archiving beyond that evicts the oldest archived flow.
#[derive(Debug, Clone)]
pub struct FlowTable {
    active: HashMap<FlowKey, Flow>,
    // Most recently created first.
    order: VecDeque<FlowKey>,
    // Oldest first.
    archived: VecDeque<Flow>,
    max_flows: usize,
    next_id: u64,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            active: HashMap::new(),
            order: VecDeque::new(),
            archived: VecDeque::new(),
            max_flows,
            next_id: 1,
        }
    }

    /// Records one arrival, creating the flow on first contact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlowTableFull`] when `key` is new and the active table
    /// is already at capacity. Existing flows keep updating.
    pub fn observe(
        &mut self,
        key: FlowKey,
        seq: u32,
        send_ts: Timestamp,
        recv_ts: Timestamp,
        bytes: u64,
    ) -> Result<&Flow> {
        let flow = self.get_or_create(key, recv_ts)?;
        flow.record_arrival(seq, send_ts, recv_ts, bytes);
        Ok(&*flow)
    }

    fn get_or_create(&mut self, key: FlowKey, now: Timestamp) -> Result<&mut Flow> {
        let full = self.active.len() >= self.max_flows;
        match self.active.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                if full {
                    return Err(Error::FlowTableFull {
                        capacity: self.max_flows,
                    });
                }
                let id = self.next_id;
                self.next_id += 1;
                self.order.push_front(key);
                Ok(entry.insert(Flow::new(id, key, now)))
            }
        }
    }

    /// Counts a reply sent to an active flow. Returns `false` for unknown keys.
    pub fn record_sent(&mut self, key: &FlowKey, bytes: u64) -> bool {
        match self.active.get_mut(key) {
            Some(flow) => {
                flow.messages_sent += 1;
                flow.bytes_sent += bytes;
                true
            }
            None => false,
        }
    }

    /// Stores the heartbeat's mode and folds in its link-quality readings.
    pub fn annotate(&mut self, key: &FlowKey, code: u8, signal_quality: i32, rssi: i32) -> bool {
        match self.active.get_mut(key) {
            Some(flow) => {
                flow.mode = Some(code);
                flow.signal_quality.push(f64::from(signal_quality));
                flow.rssi.push(f64::from(rssi));
                true
            }
            None => false,
        }
    }

    /// Counts a malformed datagram against an active flow.
    pub fn record_error(&mut self, key: &FlowKey) -> bool {
        match self.active.get_mut(key) {
            Some(flow) => {
                flow.errors += 1;
                true
            }
            None => false,
        }
    }

    pub fn find_active(&self, key: &FlowKey) -> Option<&Flow> {
        self.active.get(key)
    }

    /// Active flows, most recently created first.
    pub fn active(&self) -> impl Iterator<Item = &Flow> {
        self.order.iter().filter_map(|k| self.active.get(k))
    }

    /// Archived flows, oldest first.
    pub fn archived(&self) -> &VecDeque<Flow> {
        &self.archived
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    /// Moves a flow to the archive. Archiving an unknown key is a no-op.
    pub fn archive(&mut self, key: &FlowKey) -> bool {
        match self.active.remove(key) {
            Some(flow) => {
                self.order.retain(|k| k != key);
                self.push_archived(flow);
                true
            }
            None => false,
        }
    }

    /// Archives every active flow, returning how many moved.
    pub fn archive_all(&mut self) -> usize {
        let mut moved = 0;
        // Oldest first so the archive stays in creation order.
        while let Some(key) = self.order.pop_back() {
            if let Some(flow) = self.active.remove(&key) {
                self.push_archived(flow);
                moved += 1;
            }
        }
        moved
    }

    fn push_archived(&mut self, flow: Flow) {
        if self.archived.len() >= self.max_flows {
            if let Some(evicted) = self.archived.pop_front() {
                debug!("Archive full, dropping flow {} ({})", evicted.id, evicted.key);
            }
        }
        self.archived.push_back(flow);
    }

    /// Archives flows with no arrival for at least `idle`, returning their keys.
    pub fn expire_idle(&mut self, now: Timestamp, idle: Duration) -> Vec<FlowKey> {
        let limit = idle.as_secs_f64();
        let expired: Vec<FlowKey> = self
            .order
            .iter()
            .rev()
            .filter(|k| {
                self.active.get(*k).map_or(false, |f| {
                    let last = f.last_arrival.unwrap_or(f.time_started);
                    now.seconds_since(last) >= limit
                })
            })
            .copied()
            .collect();
        for key in &expired {
            self.archive(key);
        }
        expired
    }

    /// Drops all archived flows, returning how many were removed.
    pub fn clear_archive(&mut self) -> usize {
        let n = self.archived.len();
        self.archived.clear();
        n
    }

    /// Report for the active flow with `key`, else its most recent archived flow.
    pub fn report(&self, key: &FlowKey) -> Option<FlowReport> {
        if let Some(flow) = self.active.get(key) {
            return Some(flow.report(true));
        }
        self.archived
            .iter()
            .rev()
            .find(|f| f.key == *key)
            .map(|f| f.report(false))
    }

    /// Reports for all flows: active ones first, then the archive.
    pub fn report_all(&self) -> Vec<FlowReport> {
        self.active()
            .map(|f| f.report(true))
            .chain(self.archived.iter().map(|f| f.report(false)))
            .collect()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FLOWS)
    }
}

/// Thread-safe flow table handle
#[derive(Debug, Clone)]
pub struct FlowCollector {
    inner: Arc<Mutex<FlowTable>>,
}

impl FlowCollector {
    pub fn new(max_flows: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlowTable::new(max_flows))),
        }
    }

    /// Records an arrival and returns a copy of the updated flow.
    pub fn observe(
        &self,
        key: FlowKey,
        seq: u32,
        send_ts: Timestamp,
        recv_ts: Timestamp,
        bytes: u64,
    ) -> Result<Flow> {
        let mut table = self.inner.lock();
        table.observe(key, seq, send_ts, recv_ts, bytes).cloned()
    }

    pub fn record_sent(&self, key: &FlowKey, bytes: u64) -> bool {
        self.inner.lock().record_sent(key, bytes)
    }

    pub fn annotate(&self, key: &FlowKey, code: u8, signal_quality: i32, rssi: i32) -> bool {
        self.inner.lock().annotate(key, code, signal_quality, rssi)
    }

    pub fn record_error(&self, key: &FlowKey) -> bool {
        self.inner.lock().record_error(key)
    }

    pub fn archive(&self, key: &FlowKey) -> bool {
        self.inner.lock().archive(key)
    }

    pub fn archive_all(&self) -> usize {
        self.inner.lock().archive_all()
    }

    pub fn expire_idle(&self, now: Timestamp, idle: Duration) -> Vec<FlowKey> {
        self.inner.lock().expire_idle(now, idle)
    }

    pub fn clear_archive(&self) -> usize {
        self.inner.lock().clear_archive()
    }

    pub fn report(&self, key: &FlowKey) -> Option<FlowReport> {
        self.inner.lock().report(key)
    }

    pub fn report_all(&self) -> Vec<FlowReport> {
        self.inner.lock().report_all()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active_count()
    }

    pub fn archived_count(&self) -> usize {
        self.inner.lock().archived_count()
    }

    /// Runs `f` with the table locked.
    pub fn with_table<R>(&self, f: impl FnOnce(&FlowTable) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl Default for FlowCollector {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FLOWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> FlowKey {
        FlowKey(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    /// Feeds `seqs` with 10 ms spacing and a constant 5 ms one-way delay.
    fn feed(table: &mut FlowTable, k: FlowKey, seqs: &[u32]) {
        for (i, &seq) in seqs.iter().enumerate() {
            let sent = ts(1_000 + 10 * i as u64);
            let recv = ts(1_005 + 10 * i as u64);
            table.observe(k, seq, sent, recv, 100).unwrap();
        }
    }

    #[test]
    fn test_reordered_sequence() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1, 2, 4, 5, 3]);
        let flow = table.find_active(&key(1)).unwrap();
        assert_eq!(flow.messages_received, 5);
        assert_eq!(flow.largest_seq, 5);
        assert_eq!(flow.messages_lost, 1);
        assert_eq!(flow.out_of_order, 1);
        assert_eq!(flow.loss_events(), 1);
        assert_eq!(flow.last_arrival_kind, Arrival::OutOfOrder);
    }

    #[test]
    fn test_single_gap() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1, 2, 3, 5, 6]);
        let flow = table.find_active(&key(1)).unwrap();
        assert_eq!(flow.messages_lost, 1);
        assert_eq!(flow.loss_events(), 1);
        assert_eq!(flow.bursts.count(1), 1);
        assert_eq!(flow.out_of_order, 0);
        assert_eq!(flow.largest_seq, 6);
    }

    #[test]
    fn test_burst_lengths_bucketed() {
        let mut table = FlowTable::new(4);
        // gaps of 2, 3 and 20
        feed(&mut table, key(1), &[1, 4, 8, 29]);
        let flow = table.find_active(&key(1)).unwrap();
        assert_eq!(flow.bursts.count(2), 1);
        assert_eq!(flow.bursts.count(3), 1);
        assert_eq!(flow.bursts.count(BURST_BUCKETS), 1);
        assert_eq!(flow.messages_lost, 25);
        assert_eq!(flow.bursts.lost(), flow.messages_lost);
        assert_eq!(flow.last_burst_len, 20);
    }

    #[test]
    fn test_duplicate_counts_as_out_of_order() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1, 2, 2]);
        let flow = table.find_active(&key(1)).unwrap();
        assert_eq!(flow.duplicates, 1);
        assert_eq!(flow.out_of_order, 1);
        assert_eq!(flow.messages_lost, 0);
    }

    #[test]
    fn test_delay_statistics() {
        let mut table = FlowTable::new(4);
        let k = key(1);
        table.observe(k, 1, ts(1_000), ts(1_010), 100).unwrap();
        table.observe(k, 2, ts(1_100), ts(1_104), 100).unwrap();
        table.observe(k, 3, ts(1_200), ts(1_190), 100).unwrap();

        let flow = table.find_active(&k).unwrap();
        let avg_owd = flow.owd.mean().unwrap();
        assert!((avg_owd - (0.010 + 0.004 - 0.010) / 3.0).abs() < 1e-9);
        assert_eq!(flow.positive_owd, 2);
        assert_eq!(flow.negative_owd, 1);
        // |0.004 - 0.010| and |-0.010 - 0.004|
        assert!((flow.jitter.mean().unwrap() - 0.010).abs() < 1e-9);
        assert!((flow.inter_arrival.mean().unwrap() - 0.090).abs() < 1e-9);
    }

    #[test]
    fn test_report_ratios() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1, 2, 3, 5, 6, 7, 8, 9, 10]);
        let report = table.report(&key(1)).unwrap();
        assert!(report.active);
        assert_eq!(report.messages_lost, 1);
        assert!((report.loss_rate.unwrap() - 0.1).abs() < 1e-12);
        assert!((report.loss_event_rate.unwrap() - 0.1).abs() < 1e-12);
        assert_eq!(report.mean_burst_length, Some(1.0));
        assert!((report.avg_owd.unwrap() - 0.005).abs() < 1e-9);
        assert!((report.avg_jitter.unwrap()).abs() < 1e-9);
        // 9 arrivals of 100 bytes over 80 ms
        assert!((report.throughput_bps.unwrap() - 900.0 * 8.0 / 0.080).abs() < 1e-3);
    }

    #[test]
    fn test_single_arrival_has_no_rates() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1]);
        let report = table.report(&key(1)).unwrap();
        assert!(report.throughput_bps.is_none());
        assert!(report.avg_jitter.is_none());
        assert!(report.mean_burst_length.is_none());
        assert_eq!(report.loss_rate, Some(0.0));
    }

    #[test]
    fn test_capacity_rejects_new_flows_only() {
        let mut table = FlowTable::new(2);
        feed(&mut table, key(1), &[1]);
        feed(&mut table, key(2), &[1]);
        let err = table.observe(key(3), 1, ts(0), ts(1), 10).unwrap_err();
        assert!(matches!(err, Error::FlowTableFull { capacity: 2 }));
        assert!(table.observe(key(1), 2, ts(0), ts(1), 10).is_ok());
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn test_archive_is_idempotent() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1, 2]);
        assert!(table.archive(&key(1)));
        assert!(!table.archive(&key(1)));
        assert!(!table.archive(&key(9)));
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.archived_count(), 1);

        let report = table.report(&key(1)).unwrap();
        assert!(!report.active);
        assert_eq!(report.messages_received, 2);
    }

    #[test]
    fn test_returning_peer_starts_new_flow() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1, 2]);
        table.archive(&key(1));
        feed(&mut table, key(1), &[1]);
        let active = table.find_active(&key(1)).unwrap();
        assert_eq!(active.messages_received, 1);
        assert_ne!(active.id, table.archived()[0].id);
    }

    #[test]
    fn test_archive_evicts_oldest_beyond_capacity() {
        let mut table = FlowTable::new(2);
        for port in 1..=3 {
            feed(&mut table, key(port), &[1]);
            assert!(table.archive(&key(port)));
        }
        assert_eq!(table.archived_count(), 2);
        let ports: Vec<u16> = table.archived().iter().map(|f| f.key.0.port()).collect();
        assert_eq!(ports, vec![2, 3]);
        assert!(table.report(&key(1)).is_none());
    }

    #[test]
    fn test_active_order_most_recent_first() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1]);
        feed(&mut table, key(2), &[1]);
        feed(&mut table, key(3), &[1]);
        let ports: Vec<u16> = table.active().map(|f| f.key.0.port()).collect();
        assert_eq!(ports, vec![3, 2, 1]);

        assert_eq!(table.archive_all(), 3);
        let archived: Vec<u16> = table.archived().iter().map(|f| f.key.0.port()).collect();
        assert_eq!(archived, vec![1, 2, 3]);
        assert_eq!(table.report_all().len(), 3);
    }

    #[test]
    fn test_expire_idle() {
        let mut table = FlowTable::new(4);
        table.observe(key(1), 1, ts(0), ts(1_000), 10).unwrap();
        table.observe(key(2), 1, ts(0), ts(50_000), 10).unwrap();

        let expired = table.expire_idle(ts(61_000), Duration::from_secs(60));
        assert_eq!(expired, vec![key(1)]);
        assert!(table.find_active(&key(2)).is_some());
        assert_eq!(table.archived_count(), 1);
        assert_eq!(table.clear_archive(), 1);
        assert_eq!(table.archived_count(), 0);
    }

    #[test]
    fn test_annotate_and_record_sent() {
        let mut table = FlowTable::new(4);
        feed(&mut table, key(1), &[1]);
        assert!(table.annotate(&key(1), 1, 40, -70));
        assert!(table.annotate(&key(1), 1, 60, -50));
        assert!(table.record_sent(&key(1), 12));
        assert!(!table.record_sent(&key(2), 12));

        let report = table.report(&key(1)).unwrap();
        assert_eq!(report.mode, Some(1));
        assert_eq!(report.avg_signal_quality, Some(50.0));
        assert_eq!(report.avg_rssi, Some(-60.0));
        assert_eq!(report.messages_sent, 1);
        assert_eq!(report.bytes_sent, 12);
    }

    #[test]
    fn test_record_error_only_for_active_flows() {
        let mut table = FlowTable::new(4);
        assert!(!table.record_error(&key(1)));
        feed(&mut table, key(1), &[1, 2]);
        assert!(table.record_error(&key(1)));
        assert_eq!(table.report(&key(1)).unwrap().errors, 1);
        assert_eq!(table.report(&key(1)).unwrap().messages_received, 2);
    }

    #[test]
    fn test_collector_shares_state() {
        let collector = FlowCollector::new(8);
        let clone = collector.clone();
        let flow = collector.observe(key(5), 1, ts(0), ts(2), 64).unwrap();
        assert_eq!(flow.messages_received, 1);
        assert_eq!(clone.active_count(), 1);
        assert_eq!(clone.archive_all(), 1);
        assert_eq!(collector.archived_count(), 1);
    }

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: every lost probe is accounted for by the burst histogram
            #[test]
            fn prop_histogram_accounts_for_losses(seqs in proptest::collection::vec(1u32..5_000, 1..300)) {
                let mut table = FlowTable::new(1);
                let k = key(1);
                let mut largest = 0u32;
                for (i, &seq) in seqs.iter().enumerate() {
                    let t = ts(i as u64);
                    let flow = table.observe(k, seq, t, t, 1).unwrap();
                    prop_assert!(flow.largest_seq >= largest);
                    largest = flow.largest_seq;
                }
                let flow = table.find_active(&k).unwrap();
                prop_assert_eq!(flow.bursts.lost(), flow.messages_lost);
                prop_assert_eq!(flow.messages_received, seqs.len() as u64);
                prop_assert!(flow.out_of_order <= flow.messages_received);
                prop_assert!(flow.duplicates <= flow.out_of_order);
            }
        }
    }
}
