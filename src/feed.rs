//! Event feed from the remote port monitor.
//!
//! The port monitor prints one JSON object per line:
//!
//! ```text
//! {"type":"port","action":"bound","port":8080,"protocol":"tcp","timestamp":"2025-01-01T10:00:00.000Z"}
//! {"type":"port","action":"unbound","port":8080,"protocol":"tcp","timestamp":"..."}
//! {"type":"log","message":"Port monitor starting...","timestamp":"..."}
//! ```
//!
//! Decoding is two-stage: the line is parsed as generic JSON and its `type`
//! discriminator checked, then the full variant is decoded. Anything that is
//! not JSON is treated as free text for the log; JSON without a usable `type`,
//! an unknown variant, or a port outside `1..=65535` is discarded. None of
//! these are errors: partial lines are normal around process start and stop.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Direction of a port event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortAction {
    Bound,
    Unbound,
}

/// Transport protocol reported by the monitor. Not part of the forward key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[serde(other)]
    Other,
}

/// A validated port event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBindingEvent {
    pub action: PortAction,
    pub port: u16,
    pub protocol: Protocol,
    pub observed_at: Option<DateTime<Utc>>,
}

/// Wire shape of a decoded line, selected by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Port {
        action: PortAction,
        port: i64,
        #[serde(default)]
        protocol: Option<Protocol>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Log {
        #[serde(default)]
        message: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
}

/// Classification of one feed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLine {
    Port(PortBindingEvent),
    Log {
        message: String,
        observed_at: Option<DateTime<Utc>>,
    },
    /// Not JSON; kept verbatim for the log.
    Text(String),
    /// JSON that is not a usable event; the reason is for debug logging.
    Malformed(String),
    Blank,
}

fn parse_timestamp(ts: Option<&str>) -> Option<DateTime<Utc>> {
    ts.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Classify one line of monitor output.
pub fn parse_line(line: &str) -> FeedLine {
    let line = line.trim();
    if line.is_empty() {
        return FeedLine::Blank;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return FeedLine::Text(line.to_string()),
    };

    match value.get("type") {
        Some(Value::String(_)) => {}
        Some(_) => return FeedLine::Malformed("non-string type".to_string()),
        None => return FeedLine::Malformed("missing type".to_string()),
    }

    match WireEvent::deserialize(value) {
        Ok(WireEvent::Port {
            action,
            port,
            protocol,
            timestamp,
        }) => match u16::try_from(port) {
            Ok(port) if port > 0 => FeedLine::Port(PortBindingEvent {
                action,
                port,
                protocol: protocol.unwrap_or(Protocol::Tcp),
                observed_at: parse_timestamp(timestamp.as_deref()),
            }),
            _ => FeedLine::Malformed(format!("invalid port {port}")),
        },
        Ok(WireEvent::Log { message, timestamp }) => FeedLine::Log {
            message,
            observed_at: parse_timestamp(timestamp.as_deref()),
        },
        Err(e) => FeedLine::Malformed(e.to_string()),
    }
}

/// Receiver of port events, invoked synchronously per line.
pub trait PortEventSink: Sync {
    fn on_bound(&self, port: u16) -> impl Future<Output = ()> + Send;
    fn on_unbound(&self, port: u16) -> impl Future<Output = ()> + Send;
}

impl PortEventSink for crate::forward::ForwardManager {
    fn on_bound(&self, port: u16) -> impl Future<Output = ()> + Send {
        crate::forward::ForwardManager::on_bound(self, port)
    }

    fn on_unbound(&self, port: u16) -> impl Future<Output = ()> + Send {
        crate::forward::ForwardManager::on_unbound(self, port)
    }
}

/// Counters returned when the feed ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub port_events: u64,
    pub log_lines: u64,
    pub text_lines: u64,
    pub malformed: u64,
}

/// Longest feed line accepted. Longer lines are skipped up to the next
/// newline and counted as malformed.
pub const MAX_FEED_LINE: usize = 64 * 1024;

enum LineRead {
    Eof,
    Line,
    Oversize(usize),
}

/// Read one line into `buf`, keeping at most [`MAX_FEED_LINE`] bytes in
/// memory.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(MAX_FEED_LINE).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.len() <= MAX_FEED_LINE || buf.last() == Some(&b'\n') {
        return Ok(LineRead::Line);
    }

    let mut skipped = buf.len();
    loop {
        let (used, done) = {
            let chunk = reader.fill_buf().await?;
            match chunk.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (chunk.len(), chunk.is_empty()),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(LineRead::Oversize(skipped));
        }
    }
}

/// Read the feed until EOF, a read error, or cancellation.
///
/// Each port event is delivered to `sink` before the next line is read, so a
/// slow sink applies backpressure to the pipe instead of growing a queue.
/// Invalid UTF-8 is replaced rather than rejected.
pub async fn run_feed<R, S>(reader: R, sink: &S, cancel: &CancellationToken) -> FeedStats
where
    R: AsyncBufRead + Unpin,
    S: PortEventSink,
{
    let mut reader = reader;
    let mut stats = FeedStats::default();
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Event feed cancelled");
                break;
            }
            r = read_bounded_line(&mut reader, &mut buf) => r,
        };

        match read {
            Ok(LineRead::Eof) => {
                debug!("Event feed reached EOF");
                break;
            }
            Ok(LineRead::Line) => {}
            Ok(LineRead::Oversize(len)) => {
                stats.malformed += 1;
                debug!(target: "port_monitor", "Discarded oversize feed line ({len} bytes)");
                continue;
            }
            Err(e) => {
                warn!("Error reading event feed: {e}");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        match parse_line(&line) {
            FeedLine::Port(event) => {
                stats.port_events += 1;
                debug!(
                    target: "port_monitor",
                    "{:?} {} ({:?}) at {:?}",
                    event.action, event.port, event.protocol, event.observed_at
                );
                match event.action {
                    PortAction::Bound => sink.on_bound(event.port).await,
                    PortAction::Unbound => sink.on_unbound(event.port).await,
                }
            }
            FeedLine::Log { message, .. } => {
                stats.log_lines += 1;
                info!(target: "port_monitor", "Port Monitor Log: {message}");
            }
            FeedLine::Text(text) => {
                stats.text_lines += 1;
                info!(target: "port_monitor", "Port Monitor: {text}");
            }
            FeedLine::Malformed(reason) => {
                stats.malformed += 1;
                debug!(target: "port_monitor", "Discarded feed line ({reason}): {}", line.trim());
            }
            FeedLine::Blank => {}
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(PortAction, u16)>>,
    }

    impl PortEventSink for Recorder {
        fn on_bound(&self, port: u16) -> impl Future<Output = ()> + Send {
            self.calls.lock().unwrap().push((PortAction::Bound, port));
            async {}
        }

        fn on_unbound(&self, port: u16) -> impl Future<Output = ()> + Send {
            self.calls.lock().unwrap().push((PortAction::Unbound, port));
            async {}
        }
    }

    #[test]
    fn parses_bound_event() {
        let line = r#"{"type":"port","action":"bound","port":8080,"protocol":"tcp","timestamp":"2025-03-01T10:00:00.123Z"}"#;
        let FeedLine::Port(ev) = parse_line(line) else {
            panic!("expected port event");
        };
        assert_eq!(ev.action, PortAction::Bound);
        assert_eq!(ev.port, 8080);
        assert_eq!(ev.protocol, Protocol::Tcp);
        assert!(ev.observed_at.is_some());
    }

    #[test]
    fn parses_log_event() {
        let line = r#"{"type":"log","message":"Port monitor starting...","timestamp":"2025-03-01T10:00:00.000Z"}"#;
        assert!(matches!(
            parse_line(line),
            FeedLine::Log { ref message, .. } if message == "Port monitor starting..."
        ));
    }

    #[test]
    fn non_json_is_text() {
        assert_eq!(
            parse_line("bash: jq: command not found"),
            FeedLine::Text("bash: jq: command not found".into())
        );
        assert_eq!(
            parse_line(r#"{"type":"port","act"#),
            FeedLine::Text(r#"{"type":"port","act"#.into())
        );
    }

    #[test]
    fn json_without_type_is_malformed() {
        assert!(matches!(
            parse_line(r#"{"action":"bound","port":8080}"#),
            FeedLine::Malformed(_)
        ));
        assert!(matches!(parse_line("[1,2,3]"), FeedLine::Malformed(_)));
        assert!(matches!(parse_line(r#"{"type":7}"#), FeedLine::Malformed(_)));
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(matches!(
            parse_line(r#"{"type":"heartbeat"}"#),
            FeedLine::Malformed(_)
        ));
    }

    #[test]
    fn bad_ports_are_malformed() {
        for port in ["0", "-5", "70000", "\"8080\"", "null"] {
            let line = format!(r#"{{"type":"port","action":"bound","port":{port},"protocol":"tcp"}}"#);
            assert!(
                matches!(parse_line(&line), FeedLine::Malformed(_)),
                "port {port} should be discarded"
            );
        }
    }

    #[test]
    fn unknown_action_is_malformed() {
        let line = r#"{"type":"port","action":"rebound","port":8080,"protocol":"tcp"}"#;
        assert!(matches!(parse_line(line), FeedLine::Malformed(_)));
    }

    #[test]
    fn bad_timestamp_is_tolerated() {
        let line = r#"{"type":"port","action":"unbound","port":3000,"protocol":"udp","timestamp":"yesterday"}"#;
        let FeedLine::Port(ev) = parse_line(line) else {
            panic!("expected port event");
        };
        assert_eq!(ev.protocol, Protocol::Udp);
        assert!(ev.observed_at.is_none());
    }

    #[test]
    fn blank_lines() {
        assert_eq!(parse_line("   \r\n"), FeedLine::Blank);
    }

    #[tokio::test]
    async fn feed_dispatches_in_order_and_skips_junk() {
        let input = concat!(
            "Warning: Permanently added host\n",
            "{\"type\":\"log\",\"message\":\"starting\"}\n",
            "{\"type\":\"port\",\"action\":\"bound\",\"port\":8080,\"protocol\":\"tcp\"}\n",
            "{\"no_type\":true}\n",
            "{\"type\":\"port\",\"action\":\"bound\",\"port\":0,\"protocol\":\"tcp\"}\n",
            "{\"type\":\"port\",\"action\":\"unbound\",\"port\":8080,\"protocol\":\"tcp\"}\n",
            "{\"type\":\"port\",\"action\":\"bou",
        );
        let sink = Recorder::default();
        let cancel = CancellationToken::new();
        let stats = run_feed(input.as_bytes(), &sink, &cancel).await;

        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![(PortAction::Bound, 8080), (PortAction::Unbound, 8080)]
        );
        assert_eq!(
            stats,
            FeedStats {
                port_events: 2,
                log_lines: 1,
                text_lines: 2,
                malformed: 2,
            }
        );
    }

    #[tokio::test]
    async fn oversize_line_is_skipped() {
        let mut input = vec![b'x'; MAX_FEED_LINE * 2];
        input.push(b'\n');
        input.extend_from_slice(
            b"{\"type\":\"port\",\"action\":\"bound\",\"port\":5173,\"protocol\":\"tcp\"}\n",
        );
        let sink = Recorder::default();
        let reader = tokio::io::BufReader::with_capacity(1024, &input[..]);
        let stats = run_feed(reader, &sink, &CancellationToken::new()).await;
        assert_eq!(*sink.calls.lock().unwrap(), vec![(PortAction::Bound, 5173)]);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.text_lines, 0);
    }

    #[tokio::test]
    async fn malformed_only_feed_touches_nothing() {
        let input = "not json\n{}\n{\"port\":8080}\n\u{0}\u{1}\n";
        let sink = Recorder::default();
        let stats = run_feed(input.as_bytes(), &sink, &CancellationToken::new()).await;
        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(stats.port_events, 0);
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_feed() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(
            b"{\"type\":\"port\",\"action\":\"bound\",\"port\":3000,\"protocol\":\"tcp\"}\n",
        );
        let sink = Recorder::default();
        run_feed(&input[..], &sink, &CancellationToken::new()).await;
        assert_eq!(*sink.calls.lock().unwrap(), vec![(PortAction::Bound, 3000)]);
    }

    #[tokio::test]
    async fn cancellation_stops_blocked_reader() {
        let (_writer, reader) = tokio::io::duplex(64);
        let reader = tokio::io::BufReader::new(reader);
        let sink = Recorder::default();
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            c.cancel();
        });
        let stats = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_feed(reader, &sink, &cancel),
        )
        .await
        .expect("feed should stop on cancel");
        assert_eq!(stats, FeedStats::default());
    }
}
