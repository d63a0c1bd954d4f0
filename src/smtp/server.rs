//! Blocking SMTP listener: one thread per connection.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::ingest::MessageSink;
use crate::smtp::error::SmtpError;
use crate::smtp::reply::Reply;
use crate::smtp::session::{Limits, Session, COMMAND_LINE_MAX_LENGTH};

/// SMTP front end handing complete messages to a [`MessageSink`].
#[derive(Clone)]
pub struct SmtpServer {
    config: SmtpConfig,
    sink: Arc<dyn MessageSink>,
}

impl SmtpServer {
    pub fn new(config: SmtpConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self { config, sink }
    }

    /// Bind the configured address. Port `0` picks a free port.
    pub fn bind(&self) -> Result<TcpListener, SmtpError> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr).map_err(|source| SmtpError::Bind { addr, source })
    }

    /// Accept connections forever (blocking).
    pub fn serve(&self, listener: TcpListener) -> Result<(), SmtpError> {
        info!(addr = %listener.local_addr()?, "SMTP listener ready");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let peer = stream.peer_addr().ok();
            let server = self.clone();
            let spawned = thread::Builder::new()
                .name("smtp-conn".to_string())
                .spawn(move || {
                    if let Err(e) = server.handle_client(stream) {
                        debug!(peer = ?peer, error = %e, "Connection ended with error");
                    }
                });
            if let Err(e) = spawned {
                warn!(error = %e, "Failed to spawn connection thread");
            }
        }
        Ok(())
    }

    /// Run [`serve`](Self::serve) on a background thread.
    pub fn spawn(
        self,
        listener: TcpListener,
    ) -> std::io::Result<JoinHandle<Result<(), SmtpError>>> {
        thread::Builder::new()
            .name("smtp-accept".to_string())
            .spawn(move || self.serve(listener))
    }

    fn handle_client(&self, stream: TcpStream) -> Result<(), SmtpError> {
        let peer: Option<SocketAddr> = stream.peer_addr().ok();
        debug!(peer = ?peer, "Connection opened");

        if self.config.idle_timeout_secs > 0 {
            stream.set_read_timeout(Some(Duration::from_secs(self.config.idle_timeout_secs)))?;
        }
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let limits = Limits {
            max_message_size: self.config.max_message_size,
            max_recipients: self.config.max_recipients,
        };
        let mut session = Session::new(&self.config.hostname, limits, self.sink.as_ref());
        send(&mut writer, &session.greeting())?;

        let data_line_max = self.config.max_message_size.max(COMMAND_LINE_MAX_LENGTH) + 2;
        let mut line = Vec::with_capacity(COMMAND_LINE_MAX_LENGTH);
        loop {
            let limit = if session.in_data() {
                data_line_max
            } else {
                COMMAND_LINE_MAX_LENGTH + 2
            };
            line.clear();
            let read = (&mut reader)
                .take(limit as u64)
                .read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            let truncated = read == limit && !line.ends_with(b"\n");
            let content = line
                .strip_suffix(b"\n")
                .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
                .unwrap_or(line.as_slice());

            if let Some(reply) = session.handle_line(content) {
                send(&mut writer, &reply)?;
            }
            if truncated {
                debug!(peer = ?peer, limit, "Line over limit, discarding the rest");
                discard_line(&mut reader)?;
            }
            if session.is_closed() {
                break;
            }
        }

        debug!(peer = ?peer, "Connection closed");
        Ok(())
    }
}

/// Skip input up to and including the next `\n` without buffering it.
fn discard_line(reader: &mut impl BufRead) -> std::io::Result<()> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    }
}

fn send(stream: &mut TcpStream, reply: &Reply) -> Result<(), SmtpError> {
    stream.write_all(reply.format().as_bytes())?;
    stream.flush()?;
    Ok(())
}
