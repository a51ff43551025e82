//! packetline runtime metrics.
//!
//! Counters for port lifecycle, datagram traffic, task throughput, and
//! resolver outcomes. Registered with the metriken global registry for
//! exposition by the embedding application.

use metriken::{Counter, Gauge, metric};

// ── Port lifecycle ───────────────────────────────────────────────

#[metric(name = "packetline/ports/opened", description = "Total ports opened")]
pub static PORTS_OPENED: Counter = Counter::new();

#[metric(
    name = "packetline/ports/closed",
    description = "Total ports fully closed"
)]
pub static PORTS_CLOSED: Counter = Counter::new();

#[metric(name = "packetline/ports/active", description = "Currently open ports")]
pub static PORTS_ACTIVE: Gauge = Gauge::new();

// ── Datagrams ────────────────────────────────────────────────────

#[metric(
    name = "packetline/datagrams/received",
    description = "Total UDP datagrams received"
)]
pub static DATAGRAMS_RECEIVED: Counter = Counter::new();

#[metric(
    name = "packetline/datagrams/sent",
    description = "Total UDP datagrams sent"
)]
pub static DATAGRAMS_SENT: Counter = Counter::new();

#[metric(name = "packetline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "packetline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "packetline/send_queue/overflow",
    description = "Outbound datagrams dropped because a port's send queue was full"
)]
pub static SEND_QUEUE_OVERFLOW: Counter = Counter::new();

// ── Tasks ────────────────────────────────────────────────────────

#[metric(
    name = "packetline/tasks/processed",
    description = "Total loop tasks completed"
)]
pub static TASKS_PROCESSED: Counter = Counter::new();

#[metric(name = "packetline/tasks/failed", description = "Total loop tasks failed")]
pub static TASKS_FAILED: Counter = Counter::new();

// ── Resolver ─────────────────────────────────────────────────────

#[metric(
    name = "packetline/resolves/completed",
    description = "Endpoint resolutions completed successfully"
)]
pub static RESOLVES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "packetline/resolves/failed",
    description = "Endpoint resolutions that failed"
)]
pub static RESOLVES_FAILED: Counter = Counter::new();

// ── Ring utilization ─────────────────────────────────────────────

#[metric(
    name = "packetline/sqe/submit_failures",
    description = "SQE submission failures"
)]
pub static SQE_SUBMIT_FAILURES: Counter = Counter::new();
