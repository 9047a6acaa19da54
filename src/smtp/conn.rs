//-
// Copyright (c) 2024, 2025, the mailgate authors
//
// This file is part of mailgate.
//
// mailgate is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// mailgate is distributed in the hope  that it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with mailgate. If not, see <http://www.gnu.org/licenses/>.

//! The per-connection object: socket framing, per-operation deadlines, the
//! dot-terminated DATA reader, and the envelope state of the session.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use log::info;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt,
    BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::smtp::auth::AuthUser;
use crate::smtp::codes::*;
use crate::smtp::limited::LimitedReader;
use crate::support::error::{Error, SmtpReply};
use crate::support::log_prefix::LogPrefix;
use crate::support::message_id::new_message_id;

/// How much of the header prefix is retained in discard-body mode.
const DISCARD_HEADER_PREFIX: usize = 4096;

/// The socket, before or after the STARTTLS upgrade.
pub(crate) enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match *self.get_mut() {
            SmtpStream::Plain(ref mut s) => Pin::new(s).poll_read(cx, buf),
            SmtpStream::Tls(ref mut s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match *self.get_mut() {
            SmtpStream::Plain(ref mut s) => Pin::new(s).poll_write(cx, buf),
            SmtpStream::Tls(ref mut s) => {
                Pin::new(s.as_mut()).poll_write(cx, buf)
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        match *self.get_mut() {
            SmtpStream::Plain(ref mut s) => Pin::new(s).poll_flush(cx),
            SmtpStream::Tls(ref mut s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        match *self.get_mut() {
            SmtpStream::Plain(ref mut s) => Pin::new(s).poll_shutdown(cx),
            SmtpStream::Tls(ref mut s) => {
                Pin::new(s.as_mut()).poll_shutdown(cx)
            },
        }
    }
}

/// Per-connection settings, frozen at accept time.
#[derive(Clone, Debug)]
pub(crate) struct ConnOptions {
    pub max_size: i64,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub verbose: bool,
    pub discard_body: bool,
}

/// A snapshot of connection facts, handed to the delivery callback with the
/// message so it can inspect TLS status, remote address, and the
/// authenticated principal.
#[derive(Clone)]
pub struct ConnContext {
    pub id: String,
    pub remote_addr: SocketAddr,
    pub tls: bool,
    pub client_hostname: Option<String>,
    pub forwarded_for: Option<String>,
    pub user: Option<AuthUser>,
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("tls", &self.tls)
            .field("client_hostname", &self.client_hostname)
            .field("forwarded_for", &self.forwarded_for)
            .field("authenticated", &self.user.is_some())
            .finish()
    }
}

/// A wrapper for an accepted socket providing convenience handlers for SMTP
/// requests, plus the mutable state of the session it carries.
pub struct Conn {
    id: String,
    io: Option<BufReader<LimitedReader<SmtpStream>>>,
    remote_addr: SocketAddr,
    tls: bool,

    client_hostname: Option<String>,
    forwarded_for: Option<String>,
    user: Option<AuthUser>,
    from_addr: Option<String>,
    to_addrs: Vec<String>,
    info_headers: String,

    max_size: i64,
    read_timeout: Duration,
    write_timeout: Duration,
    verbose: bool,
    discard_body: bool,

    transaction: i64,
    log: LogPrefix,
}

impl Conn {
    pub(crate) fn new(
        stream: TcpStream,
        remote_addr: SocketAddr,
        options: ConnOptions,
    ) -> Self {
        let id = new_message_id();
        let log = LogPrefix::new(id.clone(), remote_addr.to_string());
        let limit = if options.max_size > 0 {
            Some(options.max_size)
        } else {
            None
        };

        Conn {
            id,
            io: Some(BufReader::new(LimitedReader::new(
                SmtpStream::Plain(stream),
                limit,
            ))),
            remote_addr,
            tls: false,
            client_hostname: None,
            forwarded_for: None,
            user: None,
            from_addr: None,
            to_addrs: Vec::new(),
            info_headers: String::new(),
            max_size: options.max_size,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            verbose: options.verbose,
            discard_body: options.discard_body,
            transaction: 0,
            log,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn client_hostname(&self) -> Option<&str> {
        self.client_hostname.as_deref()
    }

    pub fn set_client_hostname(&mut self, hostname: Option<String>) {
        if let Some(ref name) = hostname {
            self.log.set_helo(name.clone());
        }
        self.client_hostname = hostname;
    }

    pub fn forwarded_for(&self) -> Option<&str> {
        self.forwarded_for.as_deref()
    }

    pub fn set_forwarded_for(&mut self, addr: Option<String>) {
        self.forwarded_for = addr;
    }

    pub fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    pub fn set_user(&mut self, identity: &str, user: AuthUser) {
        self.log.set_user(identity.to_owned());
        self.user = Some(user);
    }

    pub fn from_addr(&self) -> Option<&str> {
        self.from_addr.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.to_addrs
    }

    pub fn add_recipient(&mut self, addr: String) {
        self.to_addrs.push(addr);
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction != 0
    }

    pub(crate) fn log_prefix(&self) -> &LogPrefix {
        &self.log
    }

    /// A snapshot of this connection for the delivery callback.
    pub fn context(&self) -> ConnContext {
        ConnContext {
            id: self.id.clone(),
            remote_addr: self.remote_addr,
            tls: self.tls,
            client_hostname: self.client_hostname.clone(),
            forwarded_for: self.forwarded_for.clone(),
            user: self.user.clone(),
        }
    }

    fn limit(&self) -> Option<i64> {
        if self.max_size > 0 {
            Some(self.max_size)
        } else {
            None
        }
    }

    fn io_mut(
        &mut self,
    ) -> Result<&mut BufReader<LimitedReader<SmtpStream>>, Error> {
        self.io.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection torn down",
            ))
        })
    }

    /// Prepends a header to the accumulator inserted at the top of the
    /// stored source before parsing, such that the newest header ends up
    /// first.
    pub fn add_info_header(&mut self, name: &str, value: &str) {
        self.info_headers =
            format!("{}: {}\n{}", name, value, self.info_headers);
    }

    pub fn info_headers(&self) -> &str {
        &self.info_headers
    }

    /// Starts a new MAIL transaction.
    pub fn start_tx(&mut self, sender: &str) -> Result<(), Error> {
        if self.transaction != 0 {
            return Err(Error::TransactionInProgress);
        }
        let now = Utc::now();
        self.transaction = now.timestamp() * 1_000_000_000
            + now.timestamp_subsec_nanos() as i64;
        self.from_addr = Some(sender.to_owned());
        Ok(())
    }

    /// Closes off a MAIL transaction.
    pub fn end_tx(&mut self) -> Result<(), Error> {
        if self.transaction == 0 {
            return Err(Error::NoTransaction);
        }
        self.transaction = 0;
        Ok(())
    }

    /// Clears authentication and all envelope state. TLS state survives.
    pub fn reset(&mut self) {
        self.user = None;
        self.log.clear_user();
        self.reset_buffers();
    }

    /// Clears envelope and prepend-header state only, and re-arms the
    /// bounded reader.
    pub fn reset_buffers(&mut self) {
        self.from_addr = None;
        self.to_addrs.clear();
        self.info_headers.clear();
        self.transaction = 0;
        let limit = self.limit();
        if let Some(io) = self.io.as_mut() {
            io.get_mut().rearm(limit);
        }
    }

    /// Pulls a single SMTP command line and splits it into the uppercased
    /// verb and its arguments.
    pub async fn read_smtp(&mut self) -> Result<(String, String), Error> {
        let line = self.read_line().await?;
        let mut split = line.splitn(2, ' ');
        let verb = split.next().unwrap_or("").to_ascii_uppercase();
        let args = split.next().unwrap_or("").to_owned();
        Ok((verb, args))
    }

    /// Reads a single line from the client under the read deadline.
    pub async fn read_line(&mut self) -> Result<String, Error> {
        let deadline = self.read_timeout;
        let io = self.io_mut()?;

        let mut buf = Vec::new();
        let n = tokio::time::timeout(deadline, io.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "read timed out")
            })??;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client disconnected",
            )));
        }

        if buf.ends_with(b"\n") {
            buf.pop();
            if buf.ends_with(b"\r") {
                buf.pop();
            }
        }

        let line = String::from_utf8_lossy(&buf).into_owned();
        if self.verbose {
            info!("{} CLIENT: {}", self.log, line);
        }
        Ok(line)
    }

    /// Brokers the special case of SMTP data payloads.
    ///
    /// Reads until the `<CRLF>.<CRLF>` terminator, unstuffing leading dots,
    /// and returns the body lines joined with `\n`. In discard-body mode
    /// only the first few KiB (the header prefix) are retained, but the
    /// stream is still consumed through the terminator so the connection
    /// stays in sync. An exhausted size budget surfaces as the structured
    /// 552 reply.
    pub async fn read_data(&mut self) -> Result<Vec<u8>, Error> {
        let deadline = self.read_timeout;
        let keep = if self.discard_body {
            Some(DISCARD_HEADER_PREFIX)
        } else {
            None
        };

        let io = self.io_mut()?;
        let body = tokio::time::timeout(deadline, read_dot_lines(io, keep))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "read timed out")
            })??;

        if io.get_ref().hit_limit() {
            return Err(Error::Smtp(SmtpReply::oversize()));
        }

        Ok(body)
    }

    /// Writes a general SMTP response line under the write deadline.
    pub async fn write_smtp(
        &mut self,
        code: PrimaryCode,
        message: &str,
    ) -> Result<(), Error> {
        self.write_raw(&format!("{} {}\r\n", code as u16, message))
            .await
    }

    /// Writes a structured reply produced deeper in the stack.
    pub async fn write_reply(&mut self, reply: &SmtpReply) -> Result<(), Error> {
        self.write_raw(&format!("{} {}\r\n", reply.code, reply.text))
            .await
    }

    /// Writes an EHLO continuation line (`250-<message>`).
    pub async fn write_ehlo(&mut self, message: &str) -> Result<(), Error> {
        self.write_raw(&format!("250-{}\r\n", message)).await
    }

    /// Convenience for the default `250 OK` response.
    pub async fn write_ok(&mut self) -> Result<(), Error> {
        self.write_smtp(pc::Ok, "OK").await
    }

    async fn write_raw(&mut self, line: &str) -> Result<(), Error> {
        if self.verbose {
            info!("{} SERVER: {}", self.log, line.trim_end());
        }

        let deadline = self.write_timeout;
        let io = self.io_mut()?;
        tokio::time::timeout(deadline, async {
            io.write_all(line.as_bytes()).await?;
            io.flush().await
        })
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "write timed out")
        })??;

        Ok(())
    }

    /// Performs the server side of the STARTTLS handshake, re-seating the
    /// socket and regenerating the session id.
    pub(crate) async fn upgrade_tls(
        &mut self,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<(), Error> {
        let Some(io) = self.io.take() else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection torn down",
            )));
        };

        // Anything the client pipelined before the handshake is discarded
        // with the old buffer, as RFC 3207 requires.
        let tcp = match io.into_inner().into_inner() {
            SmtpStream::Plain(tcp) => tcp,
            SmtpStream::Tls(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "TLS already active",
                )));
            },
        };

        let acceptor = TlsAcceptor::from(config);
        let stream =
            tokio::time::timeout(self.read_timeout, acceptor.accept(tcp))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        "TLS handshake timed out",
                    )
                })??;

        self.io = Some(BufReader::new(LimitedReader::new(
            SmtpStream::Tls(Box::new(stream)),
            self.limit(),
        )));
        self.tls = true;
        self.id = new_message_id();
        self.log.set_session_id(self.id.clone());

        Ok(())
    }
}

/// Reads a dot-terminated data payload from `io`.
///
/// Lines are unstuffed (a leading `.` removed) and joined with `\n`; the
/// terminating `.` line is consumed but not included. `keep` caps how many
/// body bytes are retained; the stream is consumed to the terminator either
/// way.
pub(crate) async fn read_dot_lines<R: AsyncBufRead + Unpin>(
    io: &mut R,
    keep: Option<usize>,
) -> io::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut line: Vec<u8> = Vec::new();
    let mut first = true;

    loop {
        line.clear();
        let n = io.read_until(b'\n', &mut line).await?;
        if n == 0 || !line.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            ));
        }

        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }

        if line == b"." {
            break;
        }

        let content: &[u8] = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            &line
        };

        if keep.map_or(true, |cap| out.len() < cap) {
            if !first {
                out.push(b'\n');
            }
            out.extend_from_slice(content);
        }
        first = false;
    }

    if let Some(cap) = keep {
        out.truncate(cap);
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use tokio::io::BufReader;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    fn run<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    async fn read_dot(input: &[u8], keep: Option<usize>) -> io::Result<Vec<u8>> {
        let mut reader = BufReader::new(input);
        read_dot_lines(&mut reader, keep).await
    }

    #[test]
    fn dot_reader_joins_lines() {
        run(async {
            let body = read_dot(b"a\r\nb\r\n.\r\n", None).await.unwrap();
            assert_eq!(b"a\nb" as &[u8], &body[..]);

            let body = read_dot(b".\r\n", None).await.unwrap();
            assert!(body.is_empty());
        });
    }

    #[test]
    fn dot_reader_unstuffs_leading_dots() {
        run(async {
            let body =
                read_dot(b"..hidden\r\n...x\r\n.\r\n", None).await.unwrap();
            assert_eq!(b".hidden\n..x" as &[u8], &body[..]);
        });
    }

    #[test]
    fn dot_reader_requires_terminator() {
        run(async {
            let err = read_dot(b"a\r\nb\r\n", None).await.unwrap_err();
            assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());

            let err = read_dot(b"trailing without newline", None)
                .await
                .unwrap_err();
            assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        });
    }

    #[test]
    fn dot_reader_discard_mode_keeps_prefix() {
        run(async {
            let mut input = b"Header: value\r\n\r\n".to_vec();
            for _ in 0..2000 {
                input.extend_from_slice(b"0123456789abcdef\r\n");
            }
            input.extend_from_slice(b".\r\n");

            let body = read_dot(&input, Some(64)).await.unwrap();
            assert!(body.len() <= 64);
            assert!(body.starts_with(b"Header: value"));
        });
    }

    #[test]
    fn transaction_invariants() {
        run(async {
            let mut conn = test_conn().await;

            assert!(!conn.in_transaction());
            conn.start_tx("gir@example.com").unwrap();
            assert!(conn.in_transaction());
            assert_eq!(Some("gir@example.com"), conn.from_addr());

            assert_matches!(
                Err(Error::TransactionInProgress),
                conn.start_tx("zim@example.com"),
            );

            conn.end_tx().unwrap();
            assert_matches!(Err(Error::NoTransaction), conn.end_tx());
        });
    }

    #[test]
    fn reset_preserves_auth_but_reset_buffers_only_clears_envelope() {
        run(async {
            let mut conn = test_conn().await;
            conn.set_user("gir", Arc::new(()) as AuthUser);
            conn.start_tx("gir@example.com").unwrap();
            conn.add_recipient("zim@example.com".to_owned());
            conn.add_info_header("X-One", "1");
            conn.add_info_header("X-Two", "2");
            assert_eq!("X-Two: 2\nX-One: 1\n", conn.info_headers());

            conn.reset_buffers();
            assert!(conn.user().is_some());
            assert!(!conn.in_transaction());
            assert!(conn.recipients().is_empty());
            assert!(conn.info_headers().is_empty());

            conn.reset();
            assert!(conn.user().is_none());
        });
    }

    async fn test_conn() -> Conn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        drop(client);
        Conn::new(
            stream,
            remote,
            ConnOptions {
                max_size: 0,
                read_timeout: Duration::from_secs(5),
                write_timeout: Duration::from_secs(5),
                verbose: false,
                discard_body: false,
            },
        )
    }

    proptest! {
        #[test]
        fn dot_stuffing_decodes_properly(
            lines in prop::collection::vec("[x.]{0,8}", 0..16),
        ) {
            let mut wire = Vec::new();
            for line in &lines {
                if line.starts_with('.') {
                    wire.push(b'.');
                }
                wire.extend_from_slice(line.as_bytes());
                wire.extend_from_slice(b"\r\n");
            }
            wire.extend_from_slice(b".\r\n");

            let decoded = run(read_dot(&wire, None)).unwrap();
            let expected = lines.join("\n");
            prop_assert_eq!(expected.as_bytes(), &decoded[..]);
        }
    }
}
