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

//! The SMTP command loop: greeting, command dispatch in legal order, the
//! pre-auth verb gate, STARTTLS coordination, DATA ingestion, and delivery.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::mime::message::Message;
use crate::smtp::auth::AuthStep;
use crate::smtp::codes::*;
use crate::smtp::conn::Conn;
use crate::smtp::server::{Config, ServerInner};
use crate::smtp::syntax;
use crate::support::error::Error;
use crate::support::message_id::new_message_id;

pub(crate) struct Session {
    server: Arc<ServerInner>,
    conn: Conn,
}

impl Session {
    pub(crate) fn new(server: Arc<ServerInner>, conn: Conn) -> Self {
        Session { server, conn }
    }

    pub(crate) async fn run(mut self) {
        let log = self.conn.log_prefix().clone();
        match self.run_inner().await {
            Ok(()) => info!("{} Normal client disconnect", log),
            Err(e) => warn!("{} Abnormal client disconnect: {}", log, e),
        }
    }

    /// The configuration is re-read for every command so that changes made
    /// on the server object while a session is live take effect, as they do
    /// for the listener itself.
    fn config(&self) -> Config {
        self.server.config_snapshot()
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        let cfg = self.config();
        self.conn
            .write_smtp(
                pc::ServiceReady,
                &format!("{} ESMTP {}", cfg.hostname, self.conn.id()),
            )
            .await?;

        loop {
            let (verb, args) = self.conn.read_smtp().await?;
            let cfg = self.config();

            if !pre_auth_allowed(&cfg, &self.conn, &verb) {
                self.conn
                    .write_smtp(
                        pc::AuthenticationRequired,
                        "5.7.0 Authentication required",
                    )
                    .await?;
                continue;
            }

            match verb.as_str() {
                "HELO" => self.cmd_helo(&cfg, &args).await?,
                "EHLO" => self.cmd_ehlo(&cfg, &args).await?,
                "STARTTLS" => self.cmd_starttls(&cfg).await?,
                "AUTH" => self.cmd_auth(&cfg, &args).await?,
                "MAIL" => self.cmd_mail(&cfg, &args).await?,
                "RCPT" => self.cmd_rcpt(&args).await?,
                "DATA" => self.cmd_data(&cfg).await?,
                "RSET" => {
                    self.conn.reset_buffers();
                    self.conn.write_smtp(pc::Ok, "2.0.0 Ok").await?;
                },
                "NOOP" => self.conn.write_smtp(pc::Ok, "2.0.0 Ok").await?,
                "VRFY" => {
                    self.conn
                        .write_smtp(pc::CannotVerify, "2.7.0 VRFY not supported")
                        .await?;
                },
                "HELP" => {
                    self.conn
                        .write_smtp(
                            pc::HelpMessage,
                            "2.0.0 This is the mailgate SMTP service",
                        )
                        .await?;
                },
                "QUIT" => {
                    let _ = self
                        .conn
                        .write_smtp(pc::ServiceClosing, "2.0.0 Bye")
                        .await;
                    return Ok(());
                },
                _ => {
                    warn!(
                        "{} Unrecognized command {:?}",
                        self.conn.log_prefix(),
                        verb,
                    );
                    self.conn
                        .write_smtp(
                            pc::CommandSyntaxError,
                            "5.5.1 Unrecognized command",
                        )
                        .await?;
                },
            }
        }
    }

    async fn cmd_helo(
        &mut self,
        cfg: &Config,
        args: &str,
    ) -> Result<(), Error> {
        let origin = args.split_whitespace().next().unwrap_or("");
        if origin.is_empty() {
            return self
                .conn
                .write_smtp(pc::ParameterSyntaxError, "5.5.4 Syntax: HELO hostname")
                .await;
        }

        // HELO starts the session over as far as the envelope is concerned
        self.conn.set_client_hostname(Some(origin.to_owned()));
        self.conn.reset_buffers();
        self.conn.write_smtp(pc::Ok, &cfg.hostname).await
    }

    async fn cmd_ehlo(
        &mut self,
        cfg: &Config,
        args: &str,
    ) -> Result<(), Error> {
        let origin = args.split_whitespace().next().unwrap_or("");
        if origin.is_empty() {
            return self
                .conn
                .write_smtp(pc::ParameterSyntaxError, "5.5.4 Syntax: EHLO hostname")
                .await;
        }

        self.conn.set_client_hostname(Some(origin.to_owned()));
        self.conn.reset_buffers();

        self.conn.write_ehlo(&cfg.hostname).await?;
        if cfg.max_size > 0 {
            self.conn
                .write_ehlo(&format!("SIZE {}", cfg.max_size))
                .await?;
        }
        // RFC 3207 requires not offering STARTTLS after TLS has been
        // negotiated.
        if cfg.tls_config.is_some() && !self.conn.is_tls() {
            self.conn.write_ehlo("STARTTLS").await?;
        }
        if let Some(ref auth) = cfg.auth {
            if self.conn.user().is_none() && !auth.is_empty() {
                self.conn
                    .write_ehlo(&format!("AUTH {}", auth.advertisement()))
                    .await?;
            }
        }
        self.conn.write_ehlo("8BITMIME").await?;
        self.conn.write_smtp(pc::Ok, "HELP").await
    }

    async fn cmd_starttls(&mut self, cfg: &Config) -> Result<(), Error> {
        if self.conn.is_tls() {
            return self
                .conn
                .write_smtp(pc::BadSequenceOfCommands, "5.5.1 TLS already active")
                .await;
        }

        let Some(tls_config) = cfg.tls_config.clone() else {
            return self
                .conn
                .write_smtp(pc::TlsNotAvailable, "4.7.0 TLS not available")
                .await;
        };

        self.conn
            .write_smtp(pc::ServiceReady, "2.0.0 Ready to start TLS")
            .await?;

        // A failed handshake is fatal to the session
        self.conn.upgrade_tls(tls_config).await?;

        // All prior EHLO/auth state is discarded per RFC 3207
        self.conn.reset();
        self.conn.set_client_hostname(None);
        info!("{} TLS handshake completed", self.conn.log_prefix());
        Ok(())
    }

    async fn cmd_auth(&mut self, cfg: &Config, args: &str) -> Result<(), Error> {
        let Some(ref registry) = cfg.auth else {
            return self
                .conn
                .write_smtp(pc::CommandNotImplemented, "5.5.1 AUTH not available")
                .await;
        };

        if self.conn.user().is_some() {
            return self
                .conn
                .write_smtp(pc::BadSequenceOfCommands, "5.5.1 Already authenticated")
                .await;
        }

        if self.conn.in_transaction() {
            return self
                .conn
                .write_smtp(
                    pc::BadSequenceOfCommands,
                    "5.5.1 AUTH not permitted during mail transaction",
                )
                .await;
        }

        let Some(parsed) = syntax::parse_auth(args) else {
            return self
                .conn
                .write_smtp(
                    pc::ParameterSyntaxError,
                    "5.5.4 Syntax: AUTH mechanism [initial-response]",
                )
                .await;
        };

        let Some(mechanism) = registry.get(&parsed.mechanism) else {
            warn!(
                "{} Rejected attempt to auth with mechanism {:?}",
                self.conn.log_prefix(),
                parsed.mechanism,
            );
            return self
                .conn
                .write_smtp(
                    pc::CommandParameterNotImplemented,
                    "5.5.4 Unrecognized authentication type",
                )
                .await;
        };

        let mut exchange = mechanism.start();
        let mut input = parsed.initial;
        loop {
            match exchange.advance(input.as_deref()) {
                AuthStep::Challenge(challenge) => {
                    self.conn
                        .write_smtp(
                            pc::ServerChallenge,
                            &base64::encode(&challenge),
                        )
                        .await?;

                    let line = self.conn.read_line().await?;
                    if line.trim() == "*" {
                        return self
                            .conn
                            .write_smtp(
                                pc::ParameterSyntaxError,
                                "5.7.0 Authentication aborted",
                            )
                            .await;
                    }
                    input = Some(line);
                },
                AuthStep::Done(identity, user) => {
                    info!(
                        "{} Authenticated as {}",
                        self.conn.log_prefix(),
                        identity,
                    );
                    self.conn.set_user(&identity, user);
                    return self
                        .conn
                        .write_smtp(
                            pc::AuthenticationSucceeded,
                            "2.7.0 Authentication successful",
                        )
                        .await;
                },
                AuthStep::Fail => {
                    warn!(
                        "{} Authentication failed",
                        self.conn.log_prefix(),
                    );
                    return self
                        .conn
                        .write_smtp(
                            pc::AuthenticationCredentialsInvalid,
                            "5.7.8 Authentication credentials invalid",
                        )
                        .await;
                },
            }
        }
    }

    async fn cmd_mail(&mut self, cfg: &Config, args: &str) -> Result<(), Error> {
        if self.conn.client_hostname().is_none() {
            return self
                .conn
                .write_smtp(pc::BadSequenceOfCommands, "5.5.1 Send HELO/EHLO first")
                .await;
        }

        let Some(parsed) = syntax::parse_mail_from(args) else {
            return self
                .conn
                .write_smtp(
                    pc::ParameterSyntaxError,
                    "5.5.4 Syntax: MAIL FROM:<address>",
                )
                .await;
        };

        if self.conn.in_transaction() {
            return self
                .conn
                .write_smtp(
                    pc::BadSequenceOfCommands,
                    "5.5.1 Error: nested MAIL command",
                )
                .await;
        }

        if cfg.max_size > 0
            && parsed.size.map_or(false, |sz| sz > cfg.max_size as u64)
        {
            return self
                .conn
                .write_smtp(
                    pc::ExceededStorageAllocation,
                    "5.3.4 Message size exceeds fixed maximum message size",
                )
                .await;
        }

        self.conn.start_tx(&parsed.sender)?;
        info!("{} Start mail transaction", self.conn.log_prefix());
        self.conn.write_smtp(pc::Ok, "2.1.0 Ok").await
    }

    async fn cmd_rcpt(&mut self, args: &str) -> Result<(), Error> {
        if !self.conn.in_transaction() {
            return self
                .conn
                .write_smtp(
                    pc::BadSequenceOfCommands,
                    "5.5.1 Error: need MAIL command",
                )
                .await;
        }

        let Some(addr) = syntax::parse_rcpt_to(args) else {
            return self
                .conn
                .write_smtp(
                    pc::ParameterSyntaxError,
                    "5.5.4 Syntax: RCPT TO:<address>",
                )
                .await;
        };

        self.conn.add_recipient(addr);
        self.conn.write_smtp(pc::Ok, "2.1.5 Ok").await
    }

    async fn cmd_data(&mut self, cfg: &Config) -> Result<(), Error> {
        if !self.conn.in_transaction() {
            return self
                .conn
                .write_smtp(
                    pc::BadSequenceOfCommands,
                    "5.5.1 Error: need MAIL command",
                )
                .await;
        }

        if self.conn.recipients().is_empty() {
            return self
                .conn
                .write_smtp(
                    pc::TransactionFailed,
                    "5.5.1 Error: no valid recipients",
                )
                .await;
        }

        self.conn
            .write_smtp(
                pc::StartMailInput,
                "End data with <CR><LF>.<CR><LF>",
            )
            .await?;

        let data = match self.conn.read_data().await {
            Ok(data) => data,
            Err(e) => {
                // An oversize payload still gets its 552 flushed before the
                // session is torn down; the bounded reader's grace window is
                // what makes the write possible.
                if let Some(reply) = e.smtp_reply().cloned() {
                    warn!(
                        "{} Message rejected: {}",
                        self.conn.log_prefix(),
                        reply,
                    );
                    let _ = self.conn.write_reply(&reply).await;
                    return Err(Error::Smtp(reply));
                }
                return Err(e);
            },
        };

        let received = format!(
            "from {} ({}) by {} (mailgate) with {}; {}",
            self.conn.client_hostname().unwrap_or("unknown"),
            self.conn.remote_addr(),
            cfg.hostname,
            if self.conn.is_tls() { "ESMTPS" } else { "ESMTP" },
            Utc::now().to_rfc2822(),
        );
        self.conn.add_info_header("Received", &received);

        let mut source = Vec::with_capacity(
            self.conn.info_headers().len() + data.len(),
        );
        source.extend_from_slice(self.conn.info_headers().as_bytes());
        source.extend_from_slice(&data);

        let rcpt = self.conn.recipients().to_vec();
        let message_id = new_message_id();
        let message = Message::new(Some(self.conn.context()), &source, &rcpt)
            .map(|mut m| {
                m.message_id = message_id.clone();
                m
            });

        match message {
            Err(e) => {
                warn!(
                    "{} Failed to parse message: {}",
                    self.conn.log_prefix(),
                    e,
                );
                self.conn
                    .write_smtp(
                        pc::TransactionFailed,
                        &format!("5.6.0 Message rejected: {}", e),
                    )
                    .await?;
            },
            Ok(message) => match (self.server.handler)(message) {
                Err(e) => {
                    warn!(
                        "{} Delivery callback rejected message: {}",
                        self.conn.log_prefix(),
                        e,
                    );
                    self.conn
                        .write_smtp(pc::TransactionFailed, &e.to_string())
                        .await?;
                },
                Ok(()) => {
                    info!(
                        "{} Delivered message {}",
                        self.conn.log_prefix(),
                        message_id,
                    );
                    self.conn
                        .write_smtp(
                            pc::Ok,
                            &format!("2.0.0 Ok: queued as {}", message_id),
                        )
                        .await?;
                },
            },
        }

        self.conn.end_tx()?;
        self.conn.reset_buffers();
        Ok(())
    }
}

/// Applies the pre-auth verb whitelist.
///
/// The gate is active only when an auth registry is installed and the
/// session has not authenticated yet.
fn pre_auth_allowed(cfg: &Config, conn: &Conn, verb: &str) -> bool {
    if cfg.auth.is_none() || conn.user().is_some() {
        return true;
    }

    cfg.pre_auth_verbs_allowed
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(verb))
}
