use clap::{Parser, Subcommand};
use log::info;
use rudpping::{Client, Config, PacingStrategy, ProbeMode, Server};
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rudpping")]
#[command(about = "Paced UDP probe measuring RTT, one-way delay, jitter and burst loss", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        port: u16,

        /// Receive buffer size in bytes
        #[arg(default_value = "50000")]
        max_msg_size: usize,

        /// 0 = summary only, 1 = per-datagram CSV, 2 = debug
        #[arg(default_value = "1")]
        trace_level: u8,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Archive flows idle for this many seconds
        #[arg(long, default_value = "900")]
        idle_timeout_secs: u64,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },

    /// Run in client mode
    Client {
        /// Server address to probe
        server: String,

        /// Server port
        port: u16,

        /// Datagram size in bytes, header included
        #[arg(default_value = "1000")]
        msg_size: usize,

        /// Send interval in microseconds
        #[arg(default_value = "1000000")]
        interval_micros: u64,

        /// 0 = summary only, 1 = per-sample CSV, 2 = debug
        #[arg(default_value = "1")]
        trace_level: u8,

        /// 0 = echo, 1 = ack, 2 = stream
        #[arg(default_value = "0", value_parser = clap::value_parser!(u8).range(0..=2))]
        mode: u8,

        /// Use adaptive (Kalman) pacing
        #[arg(short, long)]
        adaptive: bool,

        /// Reply timeout in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,

        /// Stop after this many probes
        #[arg(short = 'c', long)]
        count: Option<u64>,

        /// Abort on a mismatched reply instead of counting it
        #[arg(long)]
        strict_sequence: bool,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

impl Commands {
    fn trace_level(&self) -> u8 {
        match self {
            Commands::Server { trace_level, .. } | Commands::Client { trace_level, .. } => {
                *trace_level
            }
        }
    }
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.command.trace_level() >= 2 {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Server {
            port,
            max_msg_size,
            trace_level,
            bind,
            idle_timeout_secs,
            json,
        } => {
            let mut config = Config::server(port)
                .with_max_msg_size(max_msg_size)
                .with_trace_level(trace_level)
                .with_idle_timeout(Duration::from_secs(idle_timeout_secs))
                .with_json(json);

            if let Some(bind_addr) = bind {
                config = config.with_bind_addr(bind_addr);
            }

            let server = Server::new(config)?;
            cancel_on_interrupt(server.cancellation_token().clone());
            server.run().await?;
        }

        Commands::Client {
            server,
            port,
            msg_size,
            interval_micros,
            trace_level,
            mode,
            adaptive,
            timeout_ms,
            count,
            strict_sequence,
            json,
        } => {
            let probe_mode = ProbeMode::from_code(mode)
                .ok_or_else(|| anyhow::anyhow!("unknown mode {}", mode))?;
            let pacing = if adaptive {
                PacingStrategy::Adaptive
            } else {
                PacingStrategy::CoarseFine
            };

            let mut config = Config::client(server, port)
                .with_msg_size(msg_size)
                .with_interval(Duration::from_micros(interval_micros))
                .with_trace_level(trace_level)
                .with_probe_mode(probe_mode)
                .with_pacing(pacing)
                .with_reply_timeout(Duration::from_millis(timeout_ms))
                .with_strict_sequence(strict_sequence)
                .with_json(json);

            if let Some(n) = count {
                config = config.with_count(n);
            }

            let client = Client::new(config)?;
            cancel_on_interrupt(client.cancellation_token().clone());
            client.run().await?;
        }
    }

    Ok(())
}
