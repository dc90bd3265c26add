//! FEC relay CLI — the thin role-selector collaborator described in
//! SPEC_FULL.md §6. It owns the UDP socket and the single I/O task; all
//! relay state lives in [`fec_relay_core::relay::Relay`] and is only ever
//! touched from this task (§5).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use quanta::Clock;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use fec_relay_core::block::Block;
use fec_relay_core::error::RelayError;
use fec_relay_core::relay::Relay;
use fec_relay_core::stream::{StreamDecoder, StreamEncoder};
use fec_relay_core::wire::{ControlAction, Header, Packet, MAX_PACKET_SIZE};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    /// Run the full relay: receive, decode, re-encode, and shape egress.
    Proxy,
    /// Publish one bounded block to `--connect` and exit.
    Block,
    /// Publish a continuous stream of `--size` chunks to `--connect`.
    Stream,
    /// Subscribe to `--channel` at `--connect` and report what arrives.
    Subscribe,
}

/// FEC relay role selector (SPEC_FULL.md §6).
#[derive(Parser, Debug)]
#[command(name = "fec-relay", about = "UDP pub/sub relay with FEC-backed delivery")]
struct Cli {
    /// Role to run.
    #[arg(long, value_enum)]
    action: Action,

    /// Local UDP bind port.
    #[arg(long)]
    port: u16,

    /// Remote port on 127.0.0.1 (publish/subscribe targets; ignored for `proxy`).
    #[arg(long)]
    connect: Option<u16>,

    /// Shaper rate in kbps, used only by `subscribe`.
    #[arg(long, default_value_t = 2000)]
    kbps: u32,

    /// Block size in bytes (`block` action) or chunk count (`stream` action).
    #[arg(long, default_value_t = 1024)]
    size: u32,

    /// Channel id to operate on.
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// Simulated-loss test hook: drop every Nth BLOCK/STREAM packet. 0 disables it.
    #[arg(long, default_value_t = 0)]
    lose_every: u32,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tracing::info!(action = ?cli.action, port = cli.port, "fec-relay starting");

    let result = match cli.action {
        Action::Proxy => run_proxy(&cli).await,
        Action::Block => run_publish_block(&cli).await,
        Action::Stream => run_publish_stream(&cli).await,
        Action::Subscribe => run_subscribe(&cli).await,
    };

    if let Err(err) = &result {
        tracing::error!(%err, "fec-relay exiting with error");
    }
    result
}

/// The single-threaded relay loop (§4.F, §5): one task owns the socket,
/// the channel table, and every egress queue. There is exactly one
/// suspension point awaiting the socket and one awaiting the next release
/// time across every queue; between them all state mutation is atomic with
/// respect to the rest of the system.
async fn run_proxy(cli: &Cli) -> Result<()> {
    let socket = UdpSocket::bind(local_addr(cli.port)).await.context("binding relay socket")?;
    let clock = Clock::new();
    let mut relay = Relay::new(cli.lose_every);
    let mut recv_buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let next_release = earliest_release(&mut relay);
        let sleep_for = match next_release {
            Some(when) => {
                let now = clock.now();
                if when <= now {
                    Duration::ZERO
                } else {
                    when - now
                }
            }
            None => Duration::from_secs(60),
        };

        tokio::select! {
            recv = socket.recv_from(&mut recv_buf) => {
                // §7: IoError on receive is not locally recoverable — it
                // terminates the I/O task.
                let (len, src) = recv.map_err(RelayError::ReceiveFailed).context("receiving datagram")?;
                let bytes = Bytes::copy_from_slice(&recv_buf[..len]);
                let now = clock.now();
                match relay.handle_packet(src, bytes, now) {
                    Ok(events) => {
                        for (peer, payload) in events.immediate {
                            // §7: IoError on send is recovered locally; the
                            // shaper state (if any) has already advanced.
                            if let Err(source) = socket.send_to(&payload, peer).await {
                                let err = RelayError::SendFailed { peer, source };
                                tracing::warn!(%err, "send failed for immediate (ACK) packet");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, %src, "dropped inbound packet");
                    }
                }
            }
            _ = tokio::time::sleep(sleep_for) => {
                release_ready_packets(&mut relay, &socket, &clock).await;
            }
        }
    }
}

/// The minimum `when_can_pop()` across every subscriber's egress queue, or
/// `None` if every queue is empty.
fn earliest_release(relay: &mut Relay) -> Option<quanta::Instant> {
    relay
        .all_queues()
        .filter_map(|(_, _, queue)| queue.when_can_pop())
        .min()
}

/// Drains every packet whose release time has arrived from every queue,
/// sending each over the shared socket (§4.E scheduling contract).
async fn release_ready_packets(relay: &mut Relay, socket: &UdpSocket, clock: &Clock) {
    loop {
        let now = clock.now();
        let mut sent_any = false;
        let mut due: Vec<(SocketAddr, Packet)> = Vec::new();
        for (_channel_id, peer, queue) in relay.all_queues() {
            while matches!(queue.when_can_pop(), Some(when) if when <= now) {
                due.push((peer, queue.pop(now)));
            }
        }
        for (peer, packet) in due {
            sent_any = true;
            let bytes = packet.encode().freeze();
            if let Err(source) = socket.send_to(&bytes, peer).await {
                let err = RelayError::SendFailed { peer, source };
                tracing::warn!(%err, "send failed for shaped packet");
            }
        }
        if !sent_any {
            break;
        }
    }
}

fn require_connect(cli: &Cli) -> Result<SocketAddr> {
    let port = cli.connect.context("--connect is required for this action")?;
    Ok(local_addr(port))
}

/// Publish one block of `--size` random bytes to `--connect`, then exit.
async fn run_publish_block(cli: &Cli) -> Result<()> {
    let dest = require_connect(cli)?;
    let socket = UdpSocket::bind(local_addr(cli.port)).await.context("binding publish socket")?;

    let mut data = vec![0u8; cli.size as usize];
    rand::rng().fill(data.as_mut_slice());
    let block_id: u32 = rand::rng().random();

    let mut block = Block::from_data(Bytes::from(data));
    let n = block.n_original();
    let count = fec_relay_core::block::redundancy_count(n).max(n as usize);
    let symbols = block.take_unseen_prefix(count)?;

    tracing::info!(channel = cli.channel, block_id, symbols = symbols.len(), "publishing block");
    for (payload, index) in symbols {
        let packet = Packet::new(
            Header::Block { channel_id: cli.channel, block_id, block_size: cli.size, packet_index: index },
            payload,
        );
        socket.send_to(&packet.encode().freeze(), dest).await.context("sending block symbol")?;
    }
    Ok(())
}

/// Publish a stream of `--size` chunks of pseudo-random bytes to `--connect`,
/// pumping ACKs back into the encoder as they arrive.
async fn run_publish_stream(cli: &Cli) -> Result<()> {
    let dest = require_connect(cli)?;
    let socket = UdpSocket::bind(local_addr(cli.port)).await.context("binding publish socket")?;

    let mut encoder = StreamEncoder::new();
    for _ in 0..cli.size {
        let mut chunk = vec![0u8; 1000];
        rand::rng().fill(chunk.as_mut_slice());
        encoder.queue_chunk(Bytes::from(chunk));
    }

    let mut ack_buf = [0u8; MAX_PACKET_SIZE];
    while encoder.has_data() {
        let (payload, index) = encoder.get_symbol().expect("has_data() guarantees a symbol");
        let packet = Packet::new(Header::Stream { channel_id: cli.channel, packet_index: index }, payload);
        socket.send_to(&packet.encode().freeze(), dest).await.context("sending stream symbol")?;

        // Opportunistically drain any ACK that's already arrived without
        // blocking the publish loop.
        if let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(1), socket.recv_from(&mut ack_buf)).await
        {
            if let Ok(ack_packet) = Packet::decode(Bytes::copy_from_slice(&ack_buf[..len])) {
                if let Header::StreamAck { .. } = ack_packet.header {
                    encoder.process_ack(&ack_packet.payload);
                }
            }
        }
    }
    tracing::info!(channel = cli.channel, chunks = cli.size, "stream publish complete");
    Ok(())
}

/// Subscribe to `--channel` and report delivered blocks/chunks as they
/// arrive, demonstrating the relay end-to-end without a second relay role.
async fn run_subscribe(cli: &Cli) -> Result<()> {
    let dest = require_connect(cli)?;
    let socket = UdpSocket::bind(local_addr(cli.port)).await.context("binding subscribe socket")?;

    let subscribe_packet = Packet::new(
        Header::Control { action: ControlAction::Subscribe, channel_id: cli.channel, kbps: cli.kbps },
        Bytes::new(),
    );
    socket
        .send_to(&subscribe_packet.encode().freeze(), dest)
        .await
        .context("sending subscribe control packet")?;
    tracing::info!(channel = cli.channel, kbps = cli.kbps, "subscribed");

    let mut blocks: std::collections::HashMap<(u32, u32), Block> = std::collections::HashMap::new();
    let mut stream_decoder = StreamDecoder::new();
    let mut delivered_chunks: u64 = 0;
    let mut recv_buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (len, _src) = socket.recv_from(&mut recv_buf).await.context("receiving from subscription")?;
        let packet = match Packet::decode(Bytes::copy_from_slice(&recv_buf[..len])) {
            Ok(p) => p,
            Err(err) => {
                tracing::debug!(%err, "dropped malformed datagram");
                continue;
            }
        };
        match packet.header {
            Header::Block { channel_id, block_id, block_size, packet_index } => {
                let block = blocks
                    .entry((channel_id, block_id))
                    .or_insert_with(|| Block::from_size(block_size));
                if block.process_symbol(&packet.payload, packet_index) {
                    let crc = crc32fast::hash(block.decoded_data().expect("just decoded"));
                    tracing::info!(channel_id, block_id, crc32 = crc, "block decoded");
                }
            }
            Header::Stream { packet_index, .. } => {
                stream_decoder.process_symbol(packet.payload, packet_index);
                while stream_decoder.get_chunk().is_some() {
                    delivered_chunks += 1;
                }
                tracing::debug!(delivered_chunks, "stream progress");
            }
            _ => {}
        }
    }
}
