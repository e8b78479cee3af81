//! Entry point for the `heartbeat-link` demo.
//!
//! Runs a TCP or UDP server that prints every payload it receives, or a client
//! that sends each line of stdin.  Either side can keep a heartbeat running.
//! `main.rs` owns only process setup (logging, signal handling, argument
//! parsing); everything else lives in the library.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;

use heartbeat_link::config::DEFAULT_MAX_RECEIVABLE_BYTES;
use heartbeat_link::{
    Connection, DatagramConnection, DatagramListener, LinkConfig, Listener, Packet,
    StreamConnection, StreamListener,
};

/// Heartbeat-monitored TCP/UDP connections.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Heartbeat interval in milliseconds (heartbeats are off when omitted;
    /// not used by udp-server).
    #[arg(long, global = true)]
    heartbeat_ms: Option<u64>,

    /// Receive buffer size in bytes.
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_RECEIVABLE_BYTES)]
    max_bytes: usize,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept TCP connections and print what they send.
    TcpServer {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,
    },
    /// Connect over TCP and send stdin line by line.
    TcpClient {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: String,
    },
    /// Receive UDP datagrams and print them.
    UdpServer {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,
    },
    /// Send stdin line by line as UDP datagrams.
    UdpClient {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: String,
    },
}

impl Cli {
    fn link_config(&self) -> LinkConfig {
        let config = LinkConfig::new().with_max_receivable_bytes(self.max_bytes);
        match self.heartbeat_ms {
            Some(ms) => config
                .with_heartbeat_interval(Duration::from_millis(ms))
                .with_heartbeat(true),
            None => config,
        }
    }
}

fn print_packet(packet: &Packet<'_>) {
    println!(
        "{} ({} bytes): {}",
        packet.peer,
        packet.len,
        String::from_utf8_lossy(packet.payload())
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.link_config();

    match cli.mode {
        Mode::TcpServer { bind } => {
            let listener = StreamListener::bind(&bind, config, print_packet)
                .await
                .with_context(|| format!("binding TCP listener on {bind}"))?;
            serve(listener).await
        }
        Mode::UdpServer { bind } => {
            // An unbound server has no peer to beat towards.
            if cli.heartbeat_ms.is_some() {
                log::warn!("--heartbeat-ms has no effect on udp-server; ignoring it");
            }
            let config = config.with_heartbeat(false);
            let listener = DatagramListener::bind(&bind, config, print_packet)
                .await
                .with_context(|| format!("binding UDP socket on {bind}"))?;
            serve(listener).await
        }
        Mode::TcpClient { server } => {
            log::info!("Connecting to {server} over TCP");
            let conn = StreamConnection::connect(&server, config, print_packet)
                .await
                .with_context(|| format!("connecting to {server}"))?;
            run_client(conn).await
        }
        Mode::UdpClient { server } => {
            log::info!("Sending to {server} over UDP");
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket
                .connect(&server)
                .await
                .with_context(|| format!("connecting UDP socket to {server}"))?;
            let conn = DatagramConnection::new(socket, config, print_packet)?;
            run_client(conn).await
        }
    }
}

async fn serve(listener: impl Listener) -> anyhow::Result<()> {
    log::info!("Listening on {}; Ctrl-C to stop", listener.local_addr());
    tokio::signal::ctrl_c().await?;
    listener.dispose().await?;
    Ok(())
}

async fn run_client<C>(conn: C) -> anyhow::Result<()>
where
    C: Connection + Clone + 'static,
{
    let receiver = conn.clone();
    let replies = tokio::spawn(async move {
        while receiver.is_connected() {
            if let Err(e) = receiver.receive().await {
                log::warn!("receive failed: {e}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !conn.is_connected() {
            log::warn!("Connection lost");
            break;
        }
        conn.send(line.as_bytes()).await?;
    }

    conn.dispose().await?;
    let _ = replies.await;
    Ok(())
}
