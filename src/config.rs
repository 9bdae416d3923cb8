use crate::packet::{ProbeExtras, HEADER_SIZE, MAX_DATAGRAM_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Default UDP port for both roles.
pub const DEFAULT_PORT: u16 = 5000;

/// Default client datagram size in bytes, header included.
pub const DEFAULT_MSG_SIZE: usize = 1000;

/// Default server receive buffer size.
pub const DEFAULT_MAX_MSG_SIZE: usize = 50_000;

/// How long the client waits for each reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval used by stream mode when none is configured.
pub const STREAM_MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Idle time after which the server archives a flow.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Maximum number of concurrently active flows on the server.
pub const DEFAULT_MAX_FLOWS: usize = 2048;

/// Test mode: client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - receives heartbeats and answers per probe mode
    Server,
    /// Client mode - sends paced heartbeats to a server
    Client,
}

/// What the server does with each heartbeat, carried in the `code` byte.
///
/// # Examples
///
/// ```
/// use rudpping::ProbeMode;
///
/// assert_eq!(ProbeMode::from_code(1), Some(ProbeMode::Ack));
/// assert!(ProbeMode::Echo.expects_reply());
/// assert!(!ProbeMode::Stream.expects_reply());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeMode {
    /// Server echoes the full datagram with a refreshed timestamp
    Echo,
    /// Server replies with a 12-byte ACK
    Ack,
    /// Server records the heartbeat and sends nothing
    Stream,
}

impl ProbeMode {
    pub fn code(self) -> u8 {
        match self {
            ProbeMode::Echo => 0,
            ProbeMode::Ack => 1,
            ProbeMode::Stream => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ProbeMode::Echo),
            1 => Some(ProbeMode::Ack),
            2 => Some(ProbeMode::Stream),
            _ => None,
        }
    }

    pub fn expects_reply(self) -> bool {
        !matches!(self, ProbeMode::Stream)
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeMode::Echo => "echo",
            ProbeMode::Ack => "ack",
            ProbeMode::Stream => "stream",
        };
        write!(f, "{} ({})", self.code(), name)
    }
}

/// Send pacing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacingStrategy {
    /// Coarse timer sleep with a fixed margin, then spin
    CoarseFine,
    /// Coarse sleep shortened by a Kalman estimate of timer overshoot
    Adaptive,
}

/// Configuration for the probe client and server.
///
/// Use the builder methods to customize the configuration.
///
/// # Examples
///
/// ## Echo client, 10 ms interval
///
/// ```
/// use rudpping::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5000)
///     .with_msg_size(200)
///     .with_interval(Duration::from_millis(10));
/// ```
///
/// ## Stream-mode client with adaptive pacing
///
/// ```
/// use rudpping::{Config, PacingStrategy, ProbeMode};
///
/// let config = Config::client("192.168.1.100".to_string(), 5000)
///     .with_probe_mode(ProbeMode::Stream)
///     .with_pacing(PacingStrategy::Adaptive);
/// ```
///
/// ## Server
///
/// ```
/// use rudpping::Config;
///
/// let config = Config::server(5000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Port number to use
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode)
    pub bind_addr: Option<IpAddr>,

    /// Client datagram size in bytes, header included
    pub msg_size: usize,

    /// Time between consecutive probe sends; zero sends back-to-back
    pub interval: Duration,

    /// 0 = summary only, 1 = per-probe CSV lines, 2 = debug logging
    pub trace_level: u8,

    /// Reply mode requested from the server
    pub probe_mode: ProbeMode,

    /// Per-probe reply deadline
    pub reply_timeout: Duration,

    /// Stop after this many probes; `None` runs until cancelled
    pub count: Option<u64>,

    /// Treat a wrong-size or wrong-sequence reply as fatal
    pub strict_sequence: bool,

    /// Send pacing strategy
    pub pacing: PacingStrategy,

    /// Server receive buffer size
    pub max_msg_size: usize,

    /// Server idle time before a flow is archived
    pub idle_timeout: Duration,

    /// Server active flow capacity
    pub max_flows: usize,

    /// Output in JSON format
    pub json: bool,

    /// Optional metadata carried in each heartbeat
    pub extras: ProbeExtras,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            msg_size: DEFAULT_MSG_SIZE,
            interval: Duration::from_secs(1),
            trace_level: 1,
            probe_mode: ProbeMode::Echo,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            count: None,
            strict_sequence: false,
            pacing: PacingStrategy::CoarseFine,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_flows: DEFAULT_MAX_FLOWS,
            json: false,
            extras: ProbeExtras::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use rudpping::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 5000);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration.
    ///
    /// # Arguments
    ///
    /// * `port` - The UDP port to listen on; 0 picks an ephemeral port
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration.
    ///
    /// # Arguments
    ///
    /// * `server_addr` - The IP address or hostname of the server
    /// * `port` - The server's UDP port
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Sets the datagram size, header included.
    ///
    /// Sizes below the 56-byte header are rejected by [`Config::validate`].
    pub fn with_msg_size(mut self, size: usize) -> Self {
        self.msg_size = size;
        self
    }

    /// Sets the send interval.
    ///
    /// # Examples
    ///
    /// ```
    /// use rudpping::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5000)
    ///     .with_interval(Duration::from_micros(500));
    /// ```
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_trace_level(mut self, level: u8) -> Self {
        self.trace_level = level;
        self
    }

    pub fn with_probe_mode(mut self, mode: ProbeMode) -> Self {
        self.probe_mode = mode;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Limits the run to `count` probes.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_strict_sequence(mut self, strict: bool) -> Self {
        self.strict_sequence = strict;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingStrategy) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_flows(mut self, max_flows: usize) -> Self {
        self.max_flows = max_flows;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Enables or disables JSON output format.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_extras(mut self, extras: ProbeExtras) -> Self {
        self.extras = extras;
        self
    }

    /// Interval actually used for pacing.
    ///
    /// Stream mode never sends back-to-back: a zero interval becomes 200 ms.
    pub fn effective_interval(&self) -> Duration {
        if self.probe_mode == ProbeMode::Stream && self.interval.is_zero() {
            STREAM_MIN_INTERVAL
        } else {
            self.interval
        }
    }

    /// Checks the values relevant to this configuration's mode.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Client => {
                if self.server_addr.is_none() {
                    return Err(Error::Config(
                        "Server address is required for client mode".to_string(),
                    ));
                }
                if self.msg_size < HEADER_SIZE || self.msg_size > MAX_DATAGRAM_SIZE {
                    return Err(Error::Config(format!(
                        "message size {} outside {}..={}",
                        self.msg_size, HEADER_SIZE, MAX_DATAGRAM_SIZE
                    )));
                }
                if self.reply_timeout.is_zero() {
                    return Err(Error::Config("reply timeout must be positive".to_string()));
                }
            }
            Mode::Server => {
                if self.max_msg_size < HEADER_SIZE {
                    return Err(Error::Config(format!(
                        "max message size {} smaller than the {} byte header",
                        self.max_msg_size, HEADER_SIZE
                    )));
                }
                if self.max_flows == 0 {
                    return Err(Error::Config("max flows must be at least 1".to_string()));
                }
            }
        }
        Ok(())
    }
}
