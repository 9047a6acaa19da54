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

//! The listener: accept loop, per-connection task spawning, configuration
//! surface, and shutdown.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::mime::message::Message;
use crate::smtp::auth::AuthRegistry;
use crate::smtp::conn::{Conn, ConnOptions};
use crate::smtp::session::Session;
use crate::support::error::Error;

/// Verbs accepted before authentication unless overridden.
pub const DEFAULT_PRE_AUTH_VERBS: &[&str] =
    &["EHLO", "HELO", "AUTH", "STARTTLS", "QUIT", "NOOP", "RSET"];

/// The outcome of the delivery callback. An `Err` becomes the text of a
/// `554` response.
pub type DeliveryResult =
    Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub(crate) type DeliveryHandler =
    Arc<dyn Fn(Message) -> DeliveryResult + Send + Sync>;

/// Static configuration, shared between the listener and live sessions.
///
/// Sessions take a fresh snapshot per command, so changes made through the
/// server's setters apply to connections that are already open.
#[derive(Clone)]
pub(crate) struct Config {
    pub hostname: String,
    pub max_size: i64,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub auth: Option<AuthRegistry>,
    pub pre_auth_verbs_allowed: Vec<String>,
    pub verbose: bool,
    pub discard_body: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: "localhost".to_owned(),
            max_size: 0,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            tls_config: None,
            auth: None,
            pre_auth_verbs_allowed: DEFAULT_PRE_AUTH_VERBS
                .iter()
                .map(|&v| v.to_owned())
                .collect(),
            verbose: false,
            discard_body: false,
        }
    }
}

pub(crate) struct ServerInner {
    config: RwLock<Config>,
    pub(crate) handler: DeliveryHandler,
    addr: Mutex<Option<SocketAddr>>,
    conns: Mutex<HashMap<u64, AbortHandle>>,
    shutdown: Notify,
    closed: AtomicBool,
    next_conn: AtomicU64,
}

impl ServerInner {
    pub(crate) fn config_snapshot(&self) -> Config {
        self.config.read().unwrap().clone()
    }
}

/// An embeddable SMTP receiving server.
///
/// Construct with [`Server::new`], adjust options through the setters, and
/// run [`Server::listen_and_serve`]. Clones share the same underlying
/// server, which is how the accept loop and the embedding program can both
/// hold it.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a server that hands every received message to `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Message) -> DeliveryResult + Send + Sync + 'static,
    {
        Server {
            inner: Arc::new(ServerInner {
                config: RwLock::new(Config::default()),
                handler: Arc::new(handler),
                addr: Mutex::new(None),
                conns: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
                closed: AtomicBool::new(false),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// The hostname used in the banner and EHLO response.
    pub fn set_hostname(&self, hostname: &str) {
        self.inner.config.write().unwrap().hostname = hostname.to_owned();
    }

    /// Per-message byte cap. Zero disables the limit.
    pub fn set_max_size(&self, max_size: i64) {
        self.inner.config.write().unwrap().max_size = max_size;
    }

    /// Deadline applied to each individual read.
    pub fn set_read_timeout(&self, timeout: Duration) {
        self.inner.config.write().unwrap().read_timeout = timeout;
    }

    /// Deadline applied to each individual write.
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.inner.config.write().unwrap().write_timeout = timeout;
    }

    /// Installs a TLS configuration, enabling STARTTLS.
    pub fn set_tls_config(&self, config: Arc<rustls::ServerConfig>) {
        self.inner.config.write().unwrap().tls_config = Some(config);
    }

    /// Installs the AUTH registry. Installing one also activates the
    /// pre-auth verb gate.
    pub fn set_auth(&self, registry: AuthRegistry) {
        self.inner.config.write().unwrap().auth = Some(registry);
    }

    /// Replaces the whitelist of verbs accepted before authentication.
    pub fn set_pre_auth_verbs_allowed(&self, verbs: &[&str]) {
        self.inner.config.write().unwrap().pre_auth_verbs_allowed =
            verbs.iter().map(|&v| v.to_ascii_uppercase()).collect();
    }

    /// Logs every line sent and received.
    pub fn set_verbose(&self, verbose: bool) {
        self.inner.config.write().unwrap().verbose = verbose;
    }

    /// Retains only the header prefix of each DATA payload.
    pub fn set_discard_body(&self, discard: bool) {
        self.inner.config.write().unwrap().discard_body = discard;
    }

    /// Binds `addr` and serves until [`Server::close`] is called.
    ///
    /// Each accepted socket is driven by its own task; the bound address
    /// becomes visible through [`Server::address`] before the first accept.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.addr.lock().unwrap() = Some(local_addr);
        info!("SMTP server listening on {}", local_addr);

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                _ = self.inner.shutdown.notified() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, remote) = accepted?;
                    self.spawn_connection(stream, remote);
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        let cfg = inner.config_snapshot();

        let conn = Conn::new(
            stream,
            remote,
            ConnOptions {
                max_size: cfg.max_size,
                read_timeout: cfg.read_timeout,
                write_timeout: cfg.write_timeout,
                verbose: cfg.verbose,
                discard_body: cfg.discard_body,
            },
        );
        info!("{} Accepted connection", conn.log_prefix());

        let session = Session::new(Arc::clone(&inner), conn);
        let conn_id = inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let cleanup = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            session.run().await;
            cleanup.conns.lock().unwrap().remove(&conn_id);
        });
        inner
            .conns
            .lock()
            .unwrap()
            .insert(conn_id, handle.abort_handle());
    }

    /// Shuts the listener and drops all live connections.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();

        let handles: Vec<AbortHandle> = {
            let mut conns = self.inner.conns.lock().unwrap();
            conns.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    /// The bound address, once listening. Meaningful when the caller bound
    /// port `:0`.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.inner.addr.lock().unwrap()
    }

    /// Test helper: blocks until the listener is addressable.
    ///
    /// Returns `false` if the listener did not come up within a couple of
    /// seconds.
    pub fn wait_until_alive(&self) -> bool {
        for _ in 0..1000 {
            if self.address().is_some() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        error!("SMTP server did not become addressable");
        false
    }
}

/// Builds a rustls server configuration from PEM certificate-chain and
/// private-key files.
pub fn tls_config_from_pem(
    cert_chain: &Path,
    private_key: &Path,
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(File::open(
        cert_chain,
    )?))?
    .into_iter()
    .map(rustls::Certificate)
    .collect::<Vec<_>>();

    let key = load_private_key(private_key)?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, Error> {
    let mut reader = io::BufReader::new(File::open(path)?);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => {
                return Ok(rustls::PrivateKey(key));
            },
            Some(_) => continue,
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no private key found in {}", path.display()),
                )));
            },
        }
    }
}
