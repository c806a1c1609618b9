//! A minimal chat over UDP: every line typed on stdin is sent to the peer on the reliable channel,
//!  or on the unreliable channel if it starts with `!`. Start two instances with swapped
//!  addresses, e.g.
//!
//! ```ascii
//! cargo run --example udp_chat -- 127.0.0.1:7001 127.0.0.1:7002
//! cargo run --example udp_chat -- 127.0.0.1:7002 127.0.0.1:7001
//! ```

use clap::Parser;
use clap_derive::Parser;
use reliable_netcode::config::ReliableConfig;
use reliable_netcode::end_point::ReliableEndpoint;
use reliable_netcode::message_channel::{ChannelSink, QosType};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::Instant;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    local_address: String,
    peer_address: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Default)]
struct ChatSink {
    outgoing: Vec<Vec<u8>>,
}

impl ChannelSink for ChatSink {
    fn transmit(&mut self, datagram: &[u8]) {
        self.outgoing.push(datagram.to_vec());
    }

    fn deliver(&mut self, message: &[u8]) {
        println!("< {}", String::from_utf8_lossy(message));
    }
}

impl ChatSink {
    async fn flush(&mut self, socket: &UdpSocket, peer: SocketAddr) -> anyhow::Result<()> {
        for datagram in self.outgoing.drain(..) {
            socket.send_to(&datagram, peer).await?;
        }
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let local_addr: SocketAddr = args.local_address.parse()?;
    let peer_addr: SocketAddr = args.peer_address.parse()?;

    let socket = UdpSocket::bind(local_addr).await?;
    info!("listening on {}, sending to {}", local_addr, peer_addr);

    let start = Instant::now();
    let mut endpoint = ReliableEndpoint::with_default_config(Duration::ZERO)?;
    let mut sink = ChatSink::default();

    let mut update_interval = tokio::time::interval(Duration::from_millis(10));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut receive_buf = vec![0u8; ReliableConfig::default_config().max_datagram_size()];

    loop {
        select! {
            result = socket.recv_from(&mut receive_buf) => {
                let (len, from) = result?;
                if from != peer_addr {
                    warn!("ignoring datagram from unknown sender {}", from);
                    continue;
                }
                // rejected datagrams are logged by the endpoint
                let _ = endpoint.receive_packet(&receive_buf[..len], &mut sink);
            }
            _ = update_interval.tick() => {
                endpoint.update(start.elapsed(), &mut sink)?;
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    info!("end of input, shutting down");
                    return Ok(());
                };

                let (qos, text) = match line.strip_prefix('!') {
                    Some(text) => (QosType::Unreliable, text),
                    None => (QosType::Reliable, line.as_str()),
                };
                if let Err(e) = endpoint.send_message(text.as_bytes(), qos, &mut sink) {
                    warn!("could not send message: {}", e);
                }
            }
        }

        sink.flush(&socket, peer_addr).await?;
    }
}
