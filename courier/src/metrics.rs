//! courier endpoint metrics.
//!
//! Static counters for datagram I/O, connection lifecycle, address
//! validation, and event delivery. Exposed through the metriken registry.

use metriken::{metric, Counter, Gauge};

// ── UDP ──────────────────────────────────────────────────────────

#[metric(
    name = "courier/udp/datagrams_received",
    description = "Total UDP datagrams received"
)]
pub static UDP_DATAGRAMS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "courier/udp/datagrams_sent",
    description = "Total UDP datagrams sent"
)]
pub static UDP_DATAGRAMS_SENT: Counter = Counter::new();

#[metric(
    name = "courier/udp/send_failures",
    description = "UDP send errors and short sends"
)]
pub static UDP_SEND_FAILURES: Counter = Counter::new();

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "courier/connections/accepted",
    description = "Total connections accepted or initiated"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "courier/connections/closed",
    description = "Total connections reaped after close or timeout"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "courier/connections/active",
    description = "Currently tracked connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Address validation / authorization ───────────────────────────

#[metric(
    name = "courier/validation/retry_sent",
    description = "RETRY packets sent for address validation"
)]
pub static RETRY_PACKETS_SENT: Counter = Counter::new();

#[metric(
    name = "courier/validation/version_negotiation_sent",
    description = "Version negotiation packets sent"
)]
pub static VERSION_NEGOTIATIONS_SENT: Counter = Counter::new();

#[metric(
    name = "courier/validation/invalid_tokens",
    description = "Datagrams dropped for malformed retry tokens"
)]
pub static INVALID_TOKENS: Counter = Counter::new();

#[metric(
    name = "courier/auth/failures",
    description = "Connections closed for bearer-token mismatch"
)]
pub static AUTH_FAILURES: Counter = Counter::new();

#[metric(
    name = "courier/auth/cert_mismatches",
    description = "Connections closed for pinned-certificate mismatch"
)]
pub static CERT_MISMATCHES: Counter = Counter::new();

// ── Mailbox ──────────────────────────────────────────────────────

#[metric(
    name = "courier/mailbox/events_posted",
    description = "Events posted to endpoint mailboxes"
)]
pub static EVENTS_POSTED: Counter = Counter::new();
