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

//! Argument grammar for the commands that carry arguments.
//!
//! The verb itself is split off by the connection layer; these functions see
//! only the text after the first space.

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailFromArgs {
    /// The return path, without angle brackets. May be empty (null sender).
    pub sender: String,
    /// The declared SIZE parameter, if any.
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthArgs {
    /// Mechanism name, uppercased.
    pub mechanism: String,
    /// The optional initial response, still base64-encoded.
    pub initial: Option<String>,
}

lazy_static! {
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)FROM: ?<([^>]*)>(.*)$").unwrap();
    static ref RX_MAIL_SIZE_PARM: Regex =
        Regex::new("^(?i)SIZE=([0-9]+)$").unwrap();
    static ref RX_MAIL_BODY_PARM: Regex =
        Regex::new("^(?i)BODY=(7BIT|8BITMIME)$").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)TO: ?<(?:@[^:]+:)?([^>]+)>(.*)$").unwrap();
    static ref RX_AUTH: Regex =
        Regex::new("^(?i)([A-Z0-9_-]+)(?: ([0-9A-Za-z+/=]+))?$").unwrap();
}

/// Parses the arguments of `MAIL FROM:<addr> [SIZE=n]`.
///
/// Unknown ESMTP parameters are ignored, as is an unparseable SIZE value.
pub fn parse_mail_from(args: &str) -> Option<MailFromArgs> {
    let cap = RX_MAIL.captures(args.trim())?;

    let mut size = None::<u64>;
    for parm in cap
        .get(2)
        .map(|c| c.as_str())
        .unwrap_or("")
        .split(' ')
        .filter(|s| !s.is_empty())
    {
        if let Some(cap) = RX_MAIL_SIZE_PARM.captures(parm) {
            size = cap.get(1).and_then(|c| c.as_str().parse::<u64>().ok());
        }
    }

    Some(MailFromArgs {
        sender: cap.get(1).map(|c| c.as_str()).unwrap_or("").to_owned(),
        size,
    })
}

/// Parses the arguments of `RCPT TO:<addr>`, discarding any source route.
pub fn parse_rcpt_to(args: &str) -> Option<String> {
    RX_RCPT
        .captures(args.trim())
        .and_then(|cap| cap.get(1))
        .map(|c| c.as_str().to_owned())
}

/// Parses the arguments of `AUTH <mechanism> [initial-response]`.
pub fn parse_auth(args: &str) -> Option<AuthArgs> {
    let cap = RX_AUTH.captures(args.trim())?;
    Some(AuthArgs {
        mechanism: cap
            .get(1)
            .map(|c| c.as_str())
            .unwrap_or("")
            .to_ascii_uppercase(),
        initial: cap.get(2).map(|c| c.as_str().to_owned()),
    })
}
