use crate::clock::{local_time_string, Clock, Timestamp};
use crate::config::{Config, ProbeMode};
use crate::measurements::{ClientSummary, ProbeCollector, ProbeMeasurements};
use crate::packet::{Ack, Heartbeat, ACK_SIZE, MAX_DATAGRAM_SIZE};
use crate::pacing::{Pacer, PacingSchedule};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Progress event types reported while probing.
///
/// # Examples
///
/// ```no_run
/// use rudpping::{Client, Config, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5000).with_count(10);
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         match event {
///             ProgressEvent::Started { server } => println!("Probing {}", server),
///             ProgressEvent::Reply { sequence, rtt, .. } => {
///                 println!("seq {} rtt {:.3} ms", sequence, rtt * 1000.0);
///             }
///             ProgressEvent::Timeout { sequence } => println!("seq {} timed out", sequence),
///             ProgressEvent::Completed(summary) => println!("{} sent", summary.number_sent),
///             _ => {}
///         }
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Probing is starting.
    Started { server: SocketAddr },
    /// A heartbeat was sent.
    Sent { sequence: u32, bytes: usize },
    /// A matching reply arrived.
    ///
    /// `rtt` and `owd` are in seconds; `owd` may be negative when clocks disagree.
    Reply {
        sequence: u32,
        rtt: f64,
        owd: f64,
        bytes: usize,
    },
    /// No matching reply arrived before the deadline.
    Timeout { sequence: u32 },
    /// A reply arrived that did not match the outstanding probe.
    Anomaly { sequence: u32, reason: String },
    /// The run finished, normally or by cancellation.
    Completed(ClientSummary),
    /// Error occurred during the run.
    Error(String),
}

/// Callback trait for receiving progress updates while probing.
///
/// The trait is automatically implemented for any function or closure with the
/// correct signature.
///
/// # Examples
///
/// ```
/// use rudpping::ProgressCallback;
/// use rudpping::ProgressEvent;
///
/// struct MyCallback;
///
/// impl ProgressCallback for MyCallback {
///     fn on_progress(&self, event: ProgressEvent) {
///         // Custom handling
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    fn on_progress(&self, event: ProgressEvent);
}

/// Simple function-based callback
impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Where an outstanding probe stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Acked,
    TimedOut,
}

/// One sent probe awaiting its reply.
#[derive(Debug, Clone, Copy)]
pub struct ProbeAttempt {
    pub sequence: u32,
    pub sent_at: Instant,
    pub sent_wall: Timestamp,
    pub deadline: Instant,
    pub len: usize,
    pub state: AttemptState,
}

/// Paced UDP probe client.
///
/// Sends heartbeats at a fixed interval and, in echo and ack modes, waits for
/// each reply before pacing to the next send. At most one probe is outstanding.
///
/// # Examples
///
/// ```no_run
/// use rudpping::{Client, Config, ProbeMode};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5000)
///     .with_probe_mode(ProbeMode::Ack)
///     .with_interval(Duration::from_millis(20))
///     .with_count(500);
///
/// let client = Client::new(config)?;
/// let summary = client.run().await?;
/// println!("avg RTT {:?}, loss {:?}", summary.avg_rtt, summary.loss_rate);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    measurements: ProbeCollector,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
    clock: Clock,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration has no server address or an
    /// out-of-range message size.
    ///
    /// # Examples
    ///
    /// ```
    /// use rudpping::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5000);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        config.validate()?;

        Ok(Self {
            measurements: ProbeCollector::new(config.probe_mode),
            config,
            callback: None,
            cancellation_token: CancellationToken::new(),
            clock: Clock::new(),
        })
    }

    /// Attaches a progress callback.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Notify callback of progress event
    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling stops the run after the current probe; the summary is still
    /// produced.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rudpping::{Client, Config};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::client("127.0.0.1".to_string(), 5000);
    /// let client = Client::new(config)?;
    ///
    /// let cancel_token = client.cancellation_token().clone();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// client.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs the probe loop until the configured count is reached or the run is
    /// cancelled.
    ///
    /// The summary is printed (and emitted as [`ProgressEvent::Completed`]) on
    /// every exit path, including fatal errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be resolved, the socket cannot be
    /// created, a send or receive fails, or a mismatched reply arrives while
    /// `strict_sequence` is set.
    pub async fn run(&self) -> Result<ClientSummary> {
        let server_addr = self
            .config
            .server_addr
            .as_ref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;

        let target = resolve(server_addr, self.config.port).await?;
        let bind_addr: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        if let Err(e) = socket.set_broadcast(true) {
            debug!("Could not enable broadcast: {}", e);
        }

        info!(
            "Probing {} with {} byte messages every {:?}, mode {}",
            target,
            self.config.msg_size,
            self.config.effective_interval(),
            self.config.probe_mode
        );
        self.notify(ProgressEvent::Started { server: target });

        let start = Instant::now();
        self.measurements.start(start, self.clock.wall());

        let result = self.probe_loop(&socket, target).await;

        self.measurements.set_duration(start.elapsed());
        let final_measurements = self.measurements.get();
        let summary = final_measurements.summary();

        if self.config.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_results(&final_measurements);
        }
        self.notify(ProgressEvent::Completed(summary.clone()));

        match result {
            Ok(()) => Ok(summary),
            Err(e) => {
                error!("Probe run failed: {}", e);
                self.notify(ProgressEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn probe_loop(&self, socket: &UdpSocket, target: SocketAddr) -> Result<()> {
        let mut send_buf = vec![0u8; self.config.msg_size];
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut pacer = Pacer::new(self.config.pacing);
        let mut schedule = PacingSchedule::new(Instant::now(), self.config.effective_interval());
        let mut sequence: u32 = 1;
        let mut sent: u64 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                info!("Probe run cancelled by user");
                break;
            }

            let mut attempt = self
                .send_probe(socket, target, sequence, &mut send_buf)
                .await?;
            sent += 1;

            if self.config.probe_mode.expects_reply() {
                self.await_reply(socket, target, &mut attempt, &mut recv_buf)
                    .await?;
            }

            if self.config.count.map_or(false, |count| sent >= count) {
                break;
            }
            sequence = sequence.wrapping_add(1);

            let next = schedule.advance();
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Probe run cancelled by user");
                    break;
                }
                _ = pacer.delay_until(next) => {}
            }
        }

        let stats = pacer.stats();
        debug!(
            "Pacer: {} waits, {} coarse sleeps, {} late, max lateness {:?}",
            stats.waits, stats.coarse_sleeps, stats.late_wakeups, stats.max_lateness
        );
        Ok(())
    }

    async fn send_probe(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        sequence: u32,
        buf: &mut [u8],
    ) -> Result<ProbeAttempt> {
        let sent_wall = self.clock.wall();
        let header = Heartbeat::probe(
            sequence,
            self.config.probe_mode.code(),
            buf.len(),
            sent_wall,
        )
        .with_extras(&self.config.extras);
        header.write_into(buf)?;

        let sent_at = self.clock.now();
        let n = socket.send_to(buf, target).await?;
        self.measurements.record_sent(n as u64);
        self.notify(ProgressEvent::Sent { sequence, bytes: n });

        if self.config.trace_level >= 2 {
            debug!("Sent seq {} ({} bytes) at {}", sequence, n, sent_wall);
        }

        Ok(ProbeAttempt {
            sequence,
            sent_at,
            sent_wall,
            deadline: sent_at + self.config.reply_timeout,
            len: n,
            state: AttemptState::Pending,
        })
    }

    /// Waits for the reply to `attempt`, discarding mismatched datagrams until
    /// the deadline.
    async fn await_reply(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        attempt: &mut ProbeAttempt,
        buf: &mut [u8],
    ) -> Result<()> {
        loop {
            let received = time::timeout_at(attempt.deadline.into(), socket.recv_from(buf)).await;
            let (n, from) = match received {
                Err(_) => {
                    attempt.state = AttemptState::TimedOut;
                    self.measurements.record_timeout();
                    if self.config.trace_level >= 2 {
                        debug!("Timed out waiting for seq {}", attempt.sequence);
                    }
                    self.notify(ProgressEvent::Timeout {
                        sequence: attempt.sequence,
                    });
                    return Ok(());
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Ok(Ok(received)) => received,
            };

            if from != target {
                debug!("Ignoring {} bytes from unexpected peer {}", n, from);
                continue;
            }

            let received_at = self.clock.now();
            let received_wall = self.clock.wall();

            match match_reply(self.config.probe_mode, &buf[..n], attempt) {
                Ok(peer_ts) => {
                    let rtt = received_at.duration_since(attempt.sent_at).as_secs_f64();
                    let owd = received_wall.seconds_since(peer_ts);
                    attempt.state = AttemptState::Acked;
                    self.measurements
                        .record_reply(attempt.sequence, rtt, owd, n as u64);

                    if self.config.trace_level >= 1 && !self.config.json {
                        let m = self.measurements.get();
                        print_trace_line(received_wall, rtt, owd, &m);
                    }
                    self.notify(ProgressEvent::Reply {
                        sequence: attempt.sequence,
                        rtt,
                        owd,
                        bytes: n,
                    });
                    return Ok(());
                }
                Err(reason) => {
                    if self.config.strict_sequence {
                        return Err(Error::Protocol(reason));
                    }
                    warn!("Discarding reply for seq {}: {}", attempt.sequence, reason);
                    self.measurements.record_anomaly();
                    self.notify(ProgressEvent::Anomaly {
                        sequence: attempt.sequence,
                        reason,
                    });
                }
            }
        }
    }

    /// Returns a snapshot of the current measurements.
    pub fn get_measurements(&self) -> ProbeMeasurements {
        self.measurements.get()
    }
}

/// Checks a reply against the outstanding probe, returning the peer's timestamp.
fn match_reply(
    mode: ProbeMode,
    reply: &[u8],
    attempt: &ProbeAttempt,
) -> std::result::Result<Timestamp, String> {
    let (sequence, ts) = match mode {
        ProbeMode::Echo => {
            if reply.len() != attempt.len {
                return Err(format!(
                    "reply size {} does not match sent size {}",
                    reply.len(),
                    attempt.len
                ));
            }
            let (header, _) = Heartbeat::from_bytes(reply).map_err(|e| e.to_string())?;
            (header.sequence, header.timestamp())
        }
        ProbeMode::Ack => {
            if reply.len() != ACK_SIZE {
                return Err(format!(
                    "ack size {} does not match expected {}",
                    reply.len(),
                    ACK_SIZE
                ));
            }
            let ack = Ack::from_bytes(reply).map_err(|e| e.to_string())?;
            (ack.sequence, ack.timestamp())
        }
        ProbeMode::Stream => return Err("unexpected reply in stream mode".to_string()),
    };

    if sequence != attempt.sequence {
        return Err(format!(
            "reply sequence {} does not match outstanding {}",
            sequence, attempt.sequence
        ));
    }
    Ok(ts)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .map_err(|e| Error::Connection(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::Connection(format!("no address found for {}", host)))
}

/// `wallTime,RTT,OWD,totalBytesSent,ackedSeq,numberSent,numberDropped`
fn print_trace_line(wall: Timestamp, rtt: f64, owd: f64, m: &ProbeMeasurements) {
    println!(
        "{:.6},{:.6},{:.6},{},{},{},{}",
        wall.as_secs_f64(),
        rtt,
        owd,
        m.total_bytes_sent,
        m.last_acked_seq,
        m.number_sent,
        m.number_dropped
    );
}

fn print_results(m: &ProbeMeasurements) {
    let summary = m.summary();
    let fmt_secs = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |s| format!("{:.6}", s));

    println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
    println!(
        "Current time: {}, duration of the test: {:.6} secs, mode: {}",
        local_time_string(),
        summary.duration_secs,
        summary.mode
    );
    println!(
        "Messages sent: {}, received: {}, dropped: {}, anomalies: {}",
        summary.number_sent, summary.number_rxed, summary.number_dropped, summary.number_anomalies
    );
    if summary.mode.expects_reply() {
        println!(
            "RTT avg/min/max: {} / {} / {} secs, avg one way delay: {} secs, loss rate: {}",
            fmt_secs(summary.avg_rtt),
            fmt_secs(summary.min_rtt),
            fmt_secs(summary.max_rtt),
            fmt_secs(summary.avg_owd),
            summary
                .loss_rate
                .map_or_else(|| "n/a".to_string(), |r| format!("{:.4}", r))
        );
    }
    println!(
        "Bytes sent: {}, avg send rate: {}",
        summary.total_bytes_sent,
        summary
            .send_rate_bps
            .map_or_else(|| "n/a".to_string(), |bps| format!("{:.1} bps", bps))
    );
    println!();
}
