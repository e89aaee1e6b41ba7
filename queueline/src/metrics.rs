//! Queue runtime metrics.
//!
//! Per-process counters for queues, bytes, frames, and datagram filter
//! drops. Registered with metriken for exposition; dropped datagrams are
//! counted here because the data path itself stays silent about them.

use metriken::{metric, Counter};

// ── Queue lifecycle ──────────────────────────────────────────────

#[metric(name = "queueline/queues/created", description = "Total queues created")]
pub static QUEUES_CREATED: Counter = Counter::new();

#[metric(name = "queueline/queues/closed", description = "Total queues closed")]
pub static QUEUES_CLOSED: Counter = Counter::new();

#[metric(
    name = "queueline/connections/accepted",
    description = "Total connections accepted on listening queues"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(
    name = "queueline/bytes/pushed",
    description = "Total payload bytes pushed (framing excluded)"
)]
pub static BYTES_PUSHED: Counter = Counter::new();

#[metric(
    name = "queueline/bytes/popped",
    description = "Total payload bytes popped (framing excluded)"
)]
pub static BYTES_POPPED: Counter = Counter::new();

// ── Stream frames ────────────────────────────────────────────────

#[metric(name = "queueline/frames/sent", description = "Stream frames sent")]
pub static FRAMES_SENT: Counter = Counter::new();

#[metric(name = "queueline/frames/received", description = "Stream frames received")]
pub static FRAMES_RECEIVED: Counter = Counter::new();

// ── Datagrams ────────────────────────────────────────────────────

#[metric(name = "queueline/datagrams/sent", description = "Datagrams sent")]
pub static DATAGRAMS_SENT: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/received",
    description = "Datagrams delivered to the application"
)]
pub static DATAGRAMS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/dropped",
    description = "Datagrams silently dropped by the receive filter"
)]
pub static DATAGRAMS_DROPPED: Counter = Counter::new();

// Per-stage filter drops. The data path stays silent about every one of
// these; the counters are the only record.

#[metric(
    name = "queueline/datagrams/dropped/wrong_ether_addr",
    description = "Datagrams dropped: destination MAC is not the device's"
)]
pub static DROPPED_WRONG_ETHER_ADDR: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/dropped/wrong_ether_type",
    description = "Datagrams dropped: EtherType is not IPv4"
)]
pub static DROPPED_WRONG_ETHER_TYPE: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/dropped/wrong_ip_addr",
    description = "Datagrams dropped: destination IP is not the bound address"
)]
pub static DROPPED_WRONG_IP_ADDR: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/dropped/wrong_protocol",
    description = "Datagrams dropped: IP protocol is not UDP"
)]
pub static DROPPED_WRONG_PROTOCOL: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/dropped/wrong_udp_port",
    description = "Datagrams dropped: destination port is not the bound port"
)]
pub static DROPPED_WRONG_UDP_PORT: Counter = Counter::new();

#[metric(
    name = "queueline/datagrams/dropped/malformed",
    description = "Datagrams dropped: truncated headers or undecodable payload"
)]
pub static DROPPED_MALFORMED: Counter = Counter::new();

// ── Back-pressure ────────────────────────────────────────────────

#[metric(
    name = "queueline/would_block/yields",
    description = "Operations that yielded on device would-block"
)]
pub static WOULD_BLOCK_YIELDS: Counter = Counter::new();
