// src/services/stomp.rs
//! STOMP 1.2 over WebSocket push transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nanoid::nanoid;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, trace, warn};

use crate::errors::{SparrowError, SparrowResult};
use crate::services::channel::{PushLink, PushMessage, PushSession, PushTransport};

const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame is missing its NUL terminator")]
    Unterminated,
    #[error("frame has no command line")]
    MissingCommand,
    #[error("malformed header line: {0}")]
    BadHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    BadEscape(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`; repeated headers keep the earliest entry.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn escapes_headers(&self) -> bool {
        self.command != "CONNECT" && self.command != "CONNECTED"
    }

    pub fn encode(&self) -> String {
        let escape = self.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame. Returns `Ok(None)` for a heart-beat (bare EOLs).
    pub fn decode(raw: &str) -> Result<Option<Self>, FrameError> {
        let trimmed = raw.trim_start_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(None);
        }

        let end = trimmed.find('\0').ok_or(FrameError::Unterminated)?;
        let frame = &trimmed[..end];

        let (head, body) = match frame.find("\n\n") {
            Some(idx) => (&frame[..idx], &frame[idx + 2..]),
            None => match frame.find("\r\n\r\n") {
                Some(idx) => (&frame[..idx], &frame[idx + 4..]),
                None => (frame, ""),
            },
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim_end)
            .filter(|c| !c.is_empty())
            .ok_or(FrameError::MissingCommand)?
            .to_string();

        let mut parsed = StompFrame::new(command);
        let unescape = parsed.escapes_headers();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::BadHeader(line.to_string()))?;
            if unescape {
                parsed
                    .headers
                    .push((unescape_header(name)?, unescape_header(value)?));
            } else {
                parsed.headers.push((name.to_string(), value.to_string()));
            }
        }

        parsed.body = match parsed.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            Some(len) if len <= body.len() && body.is_char_boundary(len) => body[..len].to_string(),
            _ => body.to_string(),
        };
        Ok(Some(parsed))
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::BadEscape(value.to_string())),
        }
    }
    Ok(out)
}

/// `host` header value for the CONNECT frame.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority)
}

pub struct StompTransport {
    url: String,
}

impl StompTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushTransport for StompTransport {
    async fn open(&self, user_id: &str, auth_token: &str) -> SparrowResult<PushSession> {
        info!("Opening STOMP session: {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let mut connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host_of(&self.url))
            .header("heart-beat", "0,0");
        if !auth_token.is_empty() {
            connect = connect.header("Authorization", format!("Bearer {}", auth_token));
        }
        sink.send(Message::text(connect.encode())).await?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match StompFrame::decode(text.as_str())? {
                    Some(frame) if frame.command == "CONNECTED" => {
                        debug!(
                            "STOMP session established for user {} (version {})",
                            user_id,
                            frame.get("version").unwrap_or("unknown")
                        );
                        break;
                    }
                    Some(frame) if frame.command == "ERROR" => {
                        let message = frame.get("message").unwrap_or(frame.body.as_str());
                        return Err(SparrowError::ChannelConnect(message.to_string()));
                    }
                    Some(frame) => {
                        return Err(SparrowError::ChannelConnect(format!(
                            "unexpected {} frame during handshake",
                            frame.command
                        )));
                    }
                    None => continue,
                },
                Some(Ok(Message::Close(_))) | None => return Err(SparrowError::ChannelClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<PushMessage>(INBOUND_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("STOMP write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => match StompFrame::decode(text.as_str()) {
                        Ok(Some(frame)) if frame.command == "MESSAGE" => {
                            let message = PushMessage {
                                destination: frame.get("destination").unwrap_or_default().to_string(),
                                subscription: frame.get("subscription").map(str::to_string),
                                body: frame.body,
                            };
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(frame)) if frame.command == "ERROR" => {
                            warn!(
                                "STOMP error frame: {}",
                                frame.get("message").unwrap_or(frame.body.as_str())
                            );
                            break;
                        }
                        Ok(Some(frame)) => trace!("Ignoring STOMP {} frame", frame.command),
                        Ok(None) => trace!("STOMP heart-beat"),
                        Err(e) => warn!("Dropping undecodable STOMP frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("STOMP read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("STOMP inbound stream ended");
        });

        Ok(PushSession {
            link: Arc::new(StompLink {
                outbound: outbound_tx,
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
            }),
            inbound: inbound_rx,
        })
    }
}

struct StompLink {
    outbound: mpsc::UnboundedSender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StompLink {
    fn send(&self, frame: StompFrame) -> SparrowResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SparrowError::ChannelClosed);
        }
        self.outbound
            .send(Message::text(frame.encode()))
            .map_err(|_| SparrowError::ChannelClosed)
    }
}

#[async_trait]
impl PushLink for StompLink {
    async fn subscribe(&self, destination: &str) -> SparrowResult<String> {
        let id = format!("sub-{}", nanoid!(10));
        self.send(
            StompFrame::new("SUBSCRIBE")
                .header("id", id.as_str())
                .header("destination", destination)
                .header("ack", "auto"),
        )?;
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> SparrowResult<()> {
        self.send(StompFrame::new("UNSUBSCRIBE").header("id", subscription_id))
    }

    async fn close(&self) -> SparrowResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let sent = self.send(StompFrame::new("DISCONNECT"));
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        sent
    }
}

impl Drop for StompLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
