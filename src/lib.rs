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

//! mailgate is an embeddable SMTP receiving server.
//!
//! The [`Server`] listens on a TCP endpoint, drives each connection through
//! the RFC 5321 command/response state machine (STARTTLS and AUTH included),
//! assembles delivered bodies into [`Message`]s with MIME decoding, and hands
//! each message to a caller-supplied delivery callback. It receives mail; it
//! does not relay, store, or queue it.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
    ($expected:pat, $actual:expr,) => {
        assert_matches!($expected, $actual)
    };
}

mod mime;
mod smtp;
mod support;

pub use crate::mime::header::{Address, ContentType, HeaderMap};
pub use crate::mime::message::{Message, Part};
pub use crate::smtp::auth::{
    AuthExchange, AuthLogin, AuthMechanism, AuthPlain, AuthRegistry, AuthStep,
    AuthUser, CredentialFn,
};
pub use crate::smtp::conn::{Conn, ConnContext};
pub use crate::smtp::server::{
    tls_config_from_pem, DeliveryResult, Server, DEFAULT_PRE_AUTH_VERBS,
};
pub use crate::support::error::{Error, SmtpReply};
pub use crate::support::message_id::{init_fallback_rng, new_message_id};

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
