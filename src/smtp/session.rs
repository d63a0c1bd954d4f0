//! Per-connection SMTP state machine.
//!
//! The session consumes protocol lines (terminator stripped) and produces
//! replies; it does no I/O itself. A completed `DATA` transaction is handed
//! to the [`MessageSink`].

use tracing::{debug, warn};

use crate::error::IngestError;
use crate::ingest::MessageSink;
use crate::smtp::reply::Reply;

/// Maximum command line length including CRLF (RFC 5321 §4.5.3.1.4).
pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

/// Per-transaction limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_message_size: usize,
    pub max_recipients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for HELO/EHLO.
    Fresh,
    Greeted,
    /// MAIL FROM accepted.
    Mail,
    /// At least one RCPT TO accepted.
    Rcpt,
    /// Collecting message data until a lone `.`.
    Data,
}

pub struct Session<'a> {
    hostname: &'a str,
    limits: Limits,
    sink: &'a dyn MessageSink,
    state: State,
    sender: String,
    recipients: Vec<String>,
    data: Vec<u8>,
    oversized: bool,
    closed: bool,
}

impl<'a> Session<'a> {
    pub fn new(hostname: &'a str, limits: Limits, sink: &'a dyn MessageSink) -> Self {
        Self {
            hostname,
            limits,
            sink,
            state: State::Fresh,
            sender: String::new(),
            recipients: Vec::new(),
            data: Vec::new(),
            oversized: false,
            closed: false,
        }
    }

    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} mailsnare ESMTP ready", self.hostname))
    }

    /// `true` while message data is being collected.
    pub fn in_data(&self) -> bool {
        self.state == State::Data
    }

    /// `true` once QUIT was processed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed one line. Returns the reply to send, if any (data lines get none).
    pub fn handle_line(&mut self, line: &[u8]) -> Option<Reply> {
        if self.state == State::Data {
            return self.data_line(line);
        }
        Some(self.command(line))
    }

    fn command(&mut self, line: &[u8]) -> Reply {
        if line.len() + 2 > COMMAND_LINE_MAX_LENGTH {
            return Reply::new(500, "Line too long");
        }
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.helo(arg, false),
            "EHLO" => self.helo(arg, true),
            "MAIL" => self.mail(arg),
            "RCPT" => self.rcpt(arg),
            "DATA" => self.data(),
            "RSET" => {
                self.reset();
                Reply::ok()
            }
            "NOOP" => Reply::ok(),
            "VRFY" => Reply::new(252, "Cannot VRFY user, but will accept message"),
            "QUIT" => {
                self.closed = true;
                Reply::new(221, format!("{} closing connection", self.hostname))
            }
            "" => Reply::new(500, "Empty command"),
            _ => Reply::new(500, "Command not recognized"),
        }
    }

    fn helo(&mut self, domain: &str, extended: bool) -> Reply {
        if domain.is_empty() {
            return Reply::new(501, "Domain name required");
        }
        self.reset();
        self.state = State::Greeted;
        let first = format!("{} Hello {domain}", self.hostname);
        if !extended {
            return Reply::new(250, first);
        }
        Reply::multiline(
            250,
            vec![
                first,
                format!("SIZE {}", self.limits.max_message_size),
                "8BITMIME".to_string(),
                "PIPELINING".to_string(),
            ],
        )
    }

    fn mail(&mut self, arg: &str) -> Reply {
        match self.state {
            State::Fresh => return Reply::new(503, "Send HELO/EHLO first"),
            State::Mail | State::Rcpt => return Reply::new(503, "Sender already specified"),
            State::Greeted | State::Data => {}
        }
        let Some((path, params)) = parse_path(arg, "FROM:") else {
            return Reply::new(501, "Syntax: MAIL FROM:<address>");
        };

        let declared_size = params
            .split_whitespace()
            .find_map(|p| p.strip_prefix("SIZE=").or_else(|| p.strip_prefix("size=")))
            .and_then(|s| s.parse::<usize>().ok());
        if declared_size.is_some_and(|size| size > self.limits.max_message_size) {
            return Reply::new(552, "Message size exceeds fixed maximum message size");
        }

        self.sender = path;
        self.state = State::Mail;
        Reply::ok()
    }

    fn rcpt(&mut self, arg: &str) -> Reply {
        if !matches!(self.state, State::Mail | State::Rcpt) {
            return Reply::new(503, "Send MAIL FROM first");
        }
        let Some((path, _)) = parse_path(arg, "TO:") else {
            return Reply::new(501, "Syntax: RCPT TO:<address>");
        };
        if path.is_empty() {
            return Reply::new(501, "Recipient address required");
        }
        if self.recipients.len() >= self.limits.max_recipients {
            return Reply::new(452, "Too many recipients");
        }
        self.recipients.push(path);
        self.state = State::Rcpt;
        Reply::ok()
    }

    fn data(&mut self) -> Reply {
        if self.state != State::Rcpt {
            return Reply::new(503, "Send RCPT TO first");
        }
        self.data.clear();
        self.oversized = false;
        self.state = State::Data;
        Reply::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    fn data_line(&mut self, line: &[u8]) -> Option<Reply> {
        if line == b"." {
            return Some(self.finish());
        }
        if self.oversized {
            return None;
        }

        // Transparency: a leading dot was added by the client
        let line = line.strip_prefix(b".").unwrap_or(line);
        if self.data.len() + line.len() + 2 > self.limits.max_message_size {
            self.oversized = true;
            self.data = Vec::new();
            return None;
        }
        self.data.extend_from_slice(line);
        self.data.extend_from_slice(b"\r\n");
        None
    }

    fn finish(&mut self) -> Reply {
        let data = std::mem::take(&mut self.data);
        let oversized = self.oversized;
        let sender = std::mem::take(&mut self.sender);
        let recipients = std::mem::take(&mut self.recipients);
        self.reset();

        if oversized {
            warn!(from = %sender, "Rejected oversized message");
            return Reply::new(552, "Message exceeds fixed maximum message size");
        }

        match self.sink.on_message_received(&sender, &recipients, data) {
            Ok(id) => {
                debug!(%id, "Transaction complete");
                Reply::new(250, format!("OK: queued as {id}"))
            }
            Err(IngestError::Transient(_)) => {
                Reply::new(451, "Error receiving message, see log for details")
            }
            Err(IngestError::Rejected(reason)) => {
                Reply::new(554, format!("Transaction failed: {reason}"))
            }
        }
    }

    /// Abort the current transaction, keeping the greeting.
    fn reset(&mut self) {
        self.sender.clear();
        self.recipients.clear();
        self.data.clear();
        self.oversized = false;
        if self.state != State::Fresh {
            self.state = State::Greeted;
        }
    }
}

/// Parse `FROM:<addr> PARAMS` / `TO:<addr> PARAMS` into address and params.
///
/// Accepts a space after the colon and a bare address without brackets.
fn parse_path(arg: &str, keyword: &str) -> Option<(String, String)> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let close = inner.find('>')?;
        let address = inner[..close].trim();
        // Drop source routes: <@relay:user@host>
        let address = match address.rsplit_once(':') {
            Some((route, addr)) if route.starts_with('@') => addr,
            _ => address,
        };
        return Some((address.to_string(), inner[close + 1..].trim().to_string()));
    }

    let (address, params) = rest.split_once(' ').unwrap_or((rest, ""));
    Some((address.to_string(), params.trim().to_string()))
}
