//! Plaintext carbon protocol listener.
//!
//! Newline-terminated lines of `metric value timestamp`. Parsing failures
//! and full-queue drops are counted, never propagated; any read error ends
//! the connection, and a trailing line without a newline is discarded.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::audit::Audit;
use crate::mq::MetricReading;

const LOG: &str = "carbond::listener";

#[derive(Debug, Clone)]
pub struct PlaintextConfig {
    pub port: u16,
}

pub struct PlaintextReceiver {
    config: PlaintextConfig,
    sink: Sender<MetricReading>,
    audit: Audit,
}

impl PlaintextReceiver {
    pub fn new(config: PlaintextConfig, sink: Sender<MetricReading>, audit: Audit) -> Self {
        Self { config, sink, audit }
    }

    /// Accept loop. Runs until the process exits; there is no graceful
    /// shutdown of the ingestion socket.
    pub async fn listen(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("listener bind failed on port {}", self.config.port))?;
        info!(target: LOG, "plaintext listener on {}", listener.local_addr()?);

        let mut conn_id: u64 = 0;
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(target: LOG, "accept failed: {}", e);
                    continue;
                }
            };
            conn_id += 1;
            info!(target: LOG, "connection({:010}) from {}", conn_id, peer);
            let sink = self.sink.clone();
            let audit = self.audit.clone();
            tokio::spawn(handle_conn(socket, conn_id, sink, audit));
        }
    }
}

/// Per-connection handler. Lines of one connection are processed in order.
async fn handle_conn(socket: TcpStream, id: u64, sink: Sender<MetricReading>, audit: Audit) {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    let mut lines_seen: u64 = 0;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!(target: LOG, "connection({:010}) received {} line(s); closing on EOF", id, lines_seen);
                return;
            }
            Ok(_) => {
                if !line.ends_with('\n') {
                    // partial trailing line: the transmission was cut short
                    info!(target: LOG, "connection({:010}) received {} line(s); discarding partial tail", id, lines_seen);
                    return;
                }
                lines_seen += 1;
                let stats = audit.current();
                match parse_line(&line) {
                    Some(reading) => {
                        stats.metrics_received.fetch_add(1, Ordering::Relaxed);
                        if sink.try_send(reading).is_err() {
                            warn!(target: LOG, "write buffer is full");
                            stats.writer.cache_full_events.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        stats.garbled_reception.fetch_add(1, Ordering::Relaxed);
                        debug!(target: LOG, "connection({:010}) garbled message: {:?}", id, line);
                    }
                }
            }
            Err(e) => {
                info!(target: LOG, "connection({:010}) received {} line(s); closing due to {}", id, lines_seen, e);
                return;
            }
        }
    }
}

/// Parse `metric value timestamp`; exactly three whitespace-separated
/// fields, or the line is garbled.
fn parse_line(line: &str) -> Option<MetricReading> {
    let mut fields = line.split_whitespace();
    let metric = fields.next()?;
    let value = fields.next()?.parse::<f64>().ok()?;
    let time = fields.next()?.parse::<u64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(MetricReading { metric: metric.to_string(), value, time })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines() {
        let r = parse_line("foo.bar 3.4 92\n").unwrap();
        assert_eq!(r.metric, "foo.bar");
        assert_eq!(r.value, 3.4);
        assert_eq!(r.time, 92);

        let r = parse_line("a 1 0\n").unwrap();
        assert_eq!(r.time, 0);

        // whitespace runs and missing newline are tolerated by the parser
        assert!(parse_line("foo.bar   -2.5\t1000").is_some());
    }

    #[test]
    fn rejects_garbled_lines() {
        assert!(parse_line("\n").is_none());
        assert!(parse_line("only-metric\n").is_none());
        assert!(parse_line("metric 1.0\n").is_none());
        assert!(parse_line("metric notafloat 92\n").is_none());
        assert!(parse_line("metric 1.0 notatime\n").is_none());
        assert!(parse_line("metric 1.0 -5\n").is_none());
        assert!(parse_line("metric 1.0 92 extra\n").is_none());
    }

    #[test]
    fn counters_reflect_queue_state() {
        let audit = Audit::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let stats = audit.current();

        let reading = parse_line("foo 1 2\n").unwrap();
        stats.metrics_received.fetch_add(1, Ordering::Relaxed);
        assert!(tx.try_send(reading.clone()).is_ok());
        // queue full now
        if tx.try_send(reading).is_err() {
            stats.writer.cache_full_events.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(stats.writer.cache_full_events.load(Ordering::Relaxed), 1);
        assert_eq!(rx.len(), 1);
    }
}
