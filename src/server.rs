use crate::clock::{local_time_string, Clock, Timestamp};
use crate::config::{Config, ProbeMode};
use crate::flow::{Flow, FlowCollector, FlowKey, FlowReport};
use crate::measurements::{ServerCollector, ServerMeasurements, ServerSummary};
use crate::packet::{encode_header_into, Ack, Heartbeat};
use crate::stats::RunningMean;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// UDP probe server.
///
/// Receives heartbeats from any number of clients on one socket, keeps
/// per-flow statistics keyed by source address, and echoes, acknowledges or
/// silently records each heartbeat according to its `code`.
///
/// # Examples
///
/// ```no_run
/// use rudpping::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(5000);
/// let server = Server::new(config)?;
///
/// let token = server.cancellation_token().clone();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     token.cancel();
/// });
///
/// let summary = server.run().await?;
/// println!("{} flows seen", summary.flows.len());
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    flows: FlowCollector,
    measurements: ServerCollector,
    cancellation_token: CancellationToken,
    clock: Clock,
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive buffer is smaller than a heartbeat
    /// header or the flow capacity is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use rudpping::{Config, Server};
    ///
    /// let server = Server::new(Config::server(5000)).expect("valid config");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            flows: FlowCollector::new(config.max_flows),
            measurements: ServerCollector::new(),
            config,
            cancellation_token: CancellationToken::new(),
            clock: Clock::new(),
        })
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling stops the receive loop, archives all flows and prints the
    /// final summary.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Shared handle to the flow table for live inspection.
    pub fn flows(&self) -> FlowCollector {
        self.flows.clone()
    }

    pub fn get_measurements(&self) -> ServerMeasurements {
        self.measurements.get()
    }

    /// Binds the configured address. Port 0 picks an ephemeral port.
    pub async fn bind(&self) -> Result<UdpSocket> {
        let ip = self
            .config
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let socket = UdpSocket::bind(SocketAddr::new(ip, self.config.port)).await?;
        if let Err(e) = socket.set_broadcast(true) {
            debug!("Could not enable broadcast: {}", e);
        }
        Ok(socket)
    }

    /// Binds and serves until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or a send or receive on
    /// it fails. Final statistics are printed before the error is returned.
    pub async fn run(&self) -> Result<ServerSummary> {
        let socket = self.bind().await?;
        self.serve(socket).await
    }

    /// Serves on an already bound socket until cancelled.
    pub async fn serve(&self, socket: UdpSocket) -> Result<ServerSummary> {
        info!("UDP probe server listening on {}", socket.local_addr()?);

        let mut buf = vec![0u8; self.config.max_msg_size];
        let start = Instant::now();
        let idle = self.config.idle_timeout;
        let mut sweep = time::interval(sweep_period(idle));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Server shutting down");
                    break Ok(());
                }
                _ = sweep.tick() => {
                    for key in self.flows.expire_idle(self.clock.wall(), idle) {
                        info!("Archived idle flow {}", key);
                    }
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if self.config.trace_level >= 2 {
                            debug!("Received {} bytes from {}", len, peer);
                        }
                        if let Err(e) = self.handle_datagram(&socket, &mut buf[..len], peer).await {
                            error!("Error replying to {}: {}", peer, e);
                            break Err(e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving UDP datagram: {}", e);
                        break Err(Error::Io(e));
                    }
                },
            }
        };

        let summary = self.finish(start);
        result?;
        summary
    }

    async fn handle_datagram(
        &self,
        socket: &UdpSocket,
        datagram: &mut [u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let recv_wall = self.clock.wall();
        let len = datagram.len() as u64;
        self.measurements.record_datagram(len, recv_wall);

        let header = match Heartbeat::from_bytes(datagram) {
            Ok((header, _)) => header,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", peer, e);
                self.measurements.record_decode_error();
                self.flows.record_error(&FlowKey(peer));
                return Ok(());
            }
        };

        let key = FlowKey(peer);
        let flow = match self
            .flows
            .observe(key, header.sequence, header.timestamp(), recv_wall, len)
        {
            Ok(flow) => flow,
            Err(Error::FlowTableFull { capacity }) => {
                warn!(
                    "Flow table full ({} flows), dropping datagram from {}",
                    capacity, peer
                );
                self.measurements.record_rejected();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if flow.messages_received == 1 {
            info!("New flow {} from {}", flow.id, peer);
        }
        self.flows
            .annotate(&key, header.code, header.signal_quality, header.rssi);
        self.measurements.record_message(header.code);

        if self.config.trace_level >= 1 && !self.config.json {
            print_trace_line(recv_wall, header.sequence, &flow, &self.measurements.get());
        }

        let sent = match ProbeMode::from_code(header.code) {
            Some(ProbeMode::Echo) => {
                let mut reply = header;
                reply.set_timestamp(recv_wall);
                encode_header_into(&reply, datagram)?;
                Some(socket.send_to(datagram, peer).await?)
            }
            Some(ProbeMode::Ack) => {
                let ack = Ack::new(header.sequence, recv_wall);
                Some(socket.send_to(&ack.to_bytes(), peer).await?)
            }
            Some(ProbeMode::Stream) => None,
            None => {
                debug!("Unknown code {} from {}, recording only", header.code, peer);
                self.measurements.record_unknown_code();
                None
            }
        };

        if let Some(n) = sent {
            self.flows.record_sent(&key, n as u64);
            self.measurements.record_reply();
        }
        Ok(())
    }

    fn finish(&self, start: Instant) -> Result<ServerSummary> {
        self.measurements.set_duration(start.elapsed());
        let archived = self.flows.archive_all();
        debug!("Archived {} active flows at shutdown", archived);

        let owd: Vec<RunningMean> = self
            .flows
            .with_table(|table| table.archived().iter().map(|f| f.owd).collect());
        let summary = self
            .measurements
            .get()
            .summary(self.flows.report_all(), &owd);

        if self.config.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_results(&summary);
        }
        Ok(summary)
    }
}

/// Idle sweeps run a few times per idle period, bounded to a sane range.
fn sweep_period(idle: Duration) -> Duration {
    (idle / 4).clamp(Duration::from_millis(100), Duration::from_secs(60))
}

/// `wallTime,seq,lastSeq,numberMessages,outOfOrder,dropEstimate,totalBytesRxed,numberIterations`
fn print_trace_line(wall: Timestamp, seq: u32, flow: &Flow, totals: &ServerMeasurements) {
    println!(
        "{:.6},{},{},{},{},{},{},{}",
        wall.as_secs_f64(),
        seq,
        flow.last_seq,
        flow.messages_received,
        flow.out_of_order,
        flow.messages_lost,
        flow.bytes_received,
        totals.number_iterations
    );
}

fn print_flow(report: &FlowReport) {
    let fmt = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |x| format!("{:.6}", x));
    println!(
        "[flow {:3}] {}  rx {}  lost {} in {} events  ooo {}  dup {}  err {}  loss rate {}  mean burst {}",
        report.flow_id,
        report.peer,
        report.messages_received,
        report.messages_lost,
        report.loss_events,
        report.out_of_order,
        report.duplicates,
        report.errors,
        fmt(report.loss_rate),
        fmt(report.mean_burst_length)
    );
    println!(
        "            owd {} s  jitter {} s  iat {} s  throughput {} bps  bursts {:?}",
        fmt(report.avg_owd),
        fmt(report.avg_jitter),
        fmt(report.avg_inter_arrival),
        report
            .throughput_bps
            .map_or_else(|| "n/a".to_string(), |b| format!("{:.1}", b)),
        report.burst_histogram
    );
}

fn print_results(summary: &ServerSummary) {
    println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
    for report in &summary.flows {
        print_flow(report);
    }
    let mode = summary
        .mode
        .map_or_else(|| "n/a".to_string(), |m| m.to_string());
    println!(
        "Current time: {}, duration: {:.6} secs, mode: {}, messages: {}, avg one way delay: {}, estimated losses: {}, throughput: {}",
        local_time_string(),
        summary.duration_secs,
        mode,
        summary.number_messages,
        summary
            .avg_owd
            .map_or_else(|| "n/a".to_string(), |o| format!("{:.6} secs", o)),
        summary.estimated_losses,
        summary
            .throughput_bps
            .map_or_else(|| "n/a".to_string(), |b| format!("{:.1} bps", b))
    );
    if summary.decode_errors > 0 || summary.rejected_flows > 0 || summary.unknown_codes > 0 {
        println!(
            "Malformed datagrams: {}, rejected (table full): {}, unknown codes: {}",
            summary.decode_errors, summary.rejected_flows, summary.unknown_codes
        );
    }
    println!();
}
