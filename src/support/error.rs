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

use std::io;

use thiserror::Error;

/// A complete SMTP reply, carrying the numeric code and the response text.
///
/// This is the structured form used for anything that must travel from deep
/// read code out to the response writer, most notably the oversize condition
/// raised by the bounded reader. It can be smuggled through an `io::Error`
/// and recovered on the other side with [`SmtpReply::from_io`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {text}")]
pub struct SmtpReply {
    pub code: u16,
    pub text: String,
}

impl SmtpReply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        SmtpReply {
            code,
            text: text.into(),
        }
    }

    pub fn oversize() -> Self {
        SmtpReply::new(552, "Message size too large")
    }

    /// Wraps the reply in an `io::Error` so it can pass through I/O plumbing
    /// that only speaks `io::Error`.
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }

    /// Recovers a reply previously wrapped with [`SmtpReply::into_io`].
    pub fn from_io(e: &io::Error) -> Option<&SmtpReply> {
        e.get_ref()
            .and_then(|inner| inner.downcast_ref::<SmtpReply>())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Mail transaction already in progress")]
    TransactionInProgress,
    #[error("No mail transaction in progress")]
    NoTransaction,
    #[error("Missing From header")]
    MissingFrom,
    #[error("Media Type error: {0}")]
    MediaType(String),
    #[error("MIME error: {0}")]
    Mime(String),
    #[error("{0} found, but no data in body")]
    EmptyBody(String),
    #[error("No multipart/alternative section found, can't find {0}")]
    NoAlternativeSection(String),
    #[error("No {0} content found in multipart/alternative section")]
    NoAlternativePart(String),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Smtp(#[from] SmtpReply),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// The structured SMTP reply carried by this error, if any.
    pub fn smtp_reply(&self) -> Option<&SmtpReply> {
        match *self {
            Error::Smtp(ref reply) => Some(reply),
            Error::Io(ref e) => SmtpReply::from_io(e),
            _ => None,
        }
    }
}
