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

//! Utilities for working with RFC 5322 header blocks: splitting a message
//! into headers and body, unfolding header lines, the Content-Type grammar,
//! and a tolerant address-list parser.

use nom::branch::alt;
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::{char, multispace0};
use nom::multi::many0;
use nom::sequence::{delimited, preceded, separated_pair, tuple};
use nom::IResult;

use crate::support::error::Error;

/// An ordered collection of message headers.
///
/// Names are stored exactly as they appeared on the wire, including any
/// nonstandard whitespace before the `:`. Lookups are case-insensitive and
/// ignore that whitespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// The value of the first header with the given name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of headers with the given name, in wire order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A single mailbox from an address header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    /// Display name, verbatim apart from removal of surrounding quotes.
    pub name: String,
    /// The bare `local@domain` form.
    pub address: String,
}

/// A parsed Content-Type value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType {
    /// The `type/subtype` pair, lowercased.
    pub media_type: String,
    params: Vec<(String, String)>,
}

impl ContentType {
    pub fn octet_stream() -> Self {
        ContentType {
            media_type: "application/octet-stream".to_owned(),
            params: Vec::new(),
        }
    }

    /// The value of the named parameter, if present. Names are
    /// case-insensitive.
    pub fn parm(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.media_type.starts_with("multipart/")
    }
}

/// Splits a message into its header block and body at the first blank line.
///
/// The returned header block includes its final line ending; the body starts
/// immediately after the blank line. Returns `None` if there is no blank
/// line at all.
pub fn split_block(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut ix = 0;
    while let Some(offset) = memchr::memchr(b'\n', &data[ix..]) {
        let pos = ix + offset;
        match data.get(pos + 1) {
            Some(b'\n') => return Some((&data[..pos + 1], &data[pos + 2..])),
            Some(b'\r') if data.get(pos + 2) == Some(&b'\n') => {
                return Some((&data[..pos + 1], &data[pos + 3..]));
            },
            _ => ix = pos + 1,
        }
    }
    None
}

/// Parses a header block into a `HeaderMap`, unfolding continuation lines.
///
/// Lines that are neither a header nor a continuation are skipped. Bytes
/// that are not valid UTF-8 are replaced rather than failing the parse.
pub fn parse_headers(block: &[u8]) -> HeaderMap {
    let text = String::from_utf8_lossy(block);
    let mut entries: Vec<(String, String)> = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = entries.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim_start());
            }
            continue;
        }

        if let Some(colon) = line.find(':') {
            entries.push((
                line[..colon].to_owned(),
                line[colon + 1..].trim_start().to_owned(),
            ));
        }
    }

    HeaderMap { entries }
}

fn is_token_char(c: char) -> bool {
    !c.is_ascii_control()
        && !c.is_whitespace()
        && !"()<>@,;:\\\"/[]?=".contains(c)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char)(input)
}

fn quoted_string(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c| c != '"'), char('"'))(input)
}

fn parameter(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(token, char('='), alt((quoted_string, token)))(input)
}

fn media_type(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(token, char('/'), token)(input)
}

fn content_type_value(input: &str) -> IResult<&str, ContentType> {
    let (rest, ((ty, sub), params)) = tuple((
        media_type,
        many0(preceded(
            tuple((multispace0, char(';'), multispace0)),
            parameter,
        )),
    ))(input)?;

    Ok((
        rest,
        ContentType {
            media_type: format!("{}/{}", ty, sub).to_ascii_lowercase(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_owned()))
                .collect(),
        },
    ))
}

/// Parses a Content-Type header value.
pub fn parse_content_type(value: &str) -> Result<ContentType, Error> {
    let input = value.trim();
    if input.is_empty() {
        return Err(Error::MediaType("no media type".to_owned()));
    }

    let (rest, ct) = content_type_value(input).map_err(|_| {
        Error::MediaType(format!("malformed media type {:?}", value))
    })?;

    // Tolerate a dangling semicolon and trailing whitespace
    if !rest.trim().trim_end_matches(';').trim().is_empty() {
        return Err(Error::MediaType(format!(
            "malformed media type {:?}",
            value,
        )));
    }

    Ok(ct)
}

/// Parses an address-list header value such as `To` or `From`.
///
/// The parser is deliberately tolerant: entries it cannot make sense of are
/// dropped rather than failing the whole list, and display names are kept
/// verbatim apart from removal of surrounding quotes. Escape noise and
/// undecodable sequences in names pass through unchanged.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    split_on_commas(value)
        .into_iter()
        .filter_map(parse_mailbox)
        .collect()
}

/// Splits on commas that are outside quoted strings and angle brackets.
fn split_on_commas(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;

    for (ix, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' if !in_angle => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                parts.push(&value[start..ix]);
                start = ix + 1;
            },
            _ => (),
        }
    }
    parts.push(&value[start..]);
    parts
}

fn parse_mailbox(raw: &str) -> Option<Address> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(lt) = raw.find('<') {
        let gt = raw.rfind('>')?;
        if gt <= lt {
            return None;
        }

        let address = raw[lt + 1..gt].trim();
        if address.is_empty() {
            return None;
        }

        Some(Address {
            name: unquote(raw[..lt].trim()),
            address: address.to_owned(),
        })
    } else {
        Some(Address {
            name: String::new(),
            address: raw.to_owned(),
        })
    }
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        s.to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_block_finds_first_blank_line() {
        let (headers, body) =
            split_block(b"A: 1\r\nB: 2\r\n\r\nbody text").unwrap();
        assert_eq!(b"A: 1\r\nB: 2\r\n" as &[u8], headers);
        assert_eq!(b"body text" as &[u8], body);

        let (headers, body) = split_block(b"A: 1\nB: 2\n\nbody").unwrap();
        assert_eq!(b"A: 1\nB: 2\n" as &[u8], headers);
        assert_eq!(b"body" as &[u8], body);

        assert!(split_block(b"A: 1\nB: 2\n").is_none());
        assert!(split_block(b"").is_none());
    }

    #[test]
    fn header_parsing_and_lookup() {
        let headers = parse_headers(
            b"Subject: Hello\r\n\
              Content-Type: multipart/alternative;\r\n\
              \t boundary=\"xyz\"\r\n\
              X-Empty:\r\n",
        );
        assert_eq!(3, headers.len());
        assert_eq!(Some("Hello"), headers.get("subject"));
        assert_eq!(Some("Hello"), headers.get("SUBJECT"));
        assert_eq!(
            Some("multipart/alternative; boundary=\"xyz\""),
            headers.get("Content-Type"),
        );
        assert_eq!(Some(""), headers.get("x-empty"));
        assert_eq!(None, headers.get("From"));
    }

    #[test]
    fn header_name_whitespace_is_preserved_raw() {
        let headers = parse_headers(b"Subject : spaced out\n");
        // The lookup tolerates the nonstandard whitespace...
        assert_eq!(Some("spaced out"), headers.get("Subject"));
        // ...but the raw name keeps it.
        let (raw_name, _) = headers.iter().next().unwrap();
        assert_eq!("Subject ", raw_name);
    }

    #[test]
    fn content_type_parsing() {
        let ct = parse_content_type("text/html").unwrap();
        assert_eq!("text/html", ct.media_type);
        assert!(!ct.is_multipart());

        let ct = parse_content_type("Text/HTML; charset=\"UTF-8\"").unwrap();
        assert_eq!("text/html", ct.media_type);
        assert_eq!(Some("UTF-8"), ct.parm("charset"));
        assert_eq!(Some("UTF-8"), ct.parm("CHARSET"));

        let ct = parse_content_type(
            "multipart/alternative; \t boundary=\"_=test=_abc123\"",
        )
        .unwrap();
        assert!(ct.is_multipart());
        assert_eq!(Some("_=test=_abc123"), ct.parm("boundary"));

        let ct = parse_content_type("text/plain; charset=us-ascii;").unwrap();
        assert_eq!(Some("us-ascii"), ct.parm("charset"));

        assert_matches!(Err(Error::MediaType(..)), parse_content_type(""));
        assert_matches!(Err(Error::MediaType(..)), parse_content_type("text"));
        assert_matches!(
            Err(Error::MediaType(..)),
            parse_content_type("text/plain extra garbage")
        );
    }

    #[test]
    fn address_list_parsing() {
        let list = parse_address_list(
            "recipient1@example.com, \"Recipient 2\" <recipient2@example.com>",
        );
        assert_eq!(
            vec![
                Address {
                    name: String::new(),
                    address: "recipient1@example.com".to_owned(),
                },
                Address {
                    name: "Recipient 2".to_owned(),
                    address: "recipient2@example.com".to_owned(),
                },
            ],
            list,
        );
    }

    #[test]
    fn address_display_name_noise_is_verbatim() {
        let list =
            parse_address_list("Sender \\u0014\\<sender@example.com>");
        assert_eq!(1, list.len());
        assert_eq!("Sender \\u0014\\", list[0].name);
        assert_eq!("sender@example.com", list[0].address);
    }

    #[test]
    fn address_list_tolerates_junk() {
        assert!(parse_address_list("").is_empty());
        assert!(parse_address_list(" , ,").is_empty());
        assert!(parse_address_list("Broken <>").is_empty());

        let list = parse_address_list("a@b.c, , Name <d@e.f>");
        assert_eq!(2, list.len());
        assert_eq!("a@b.c", list[0].address);
        assert_eq!("Name", list[1].name);
    }

    #[test]
    fn quoted_commas_do_not_split() {
        let list = parse_address_list("\"Last, First\" <last@example.com>");
        assert_eq!(1, list.len());
        assert_eq!("Last, First", list[0].name);
        assert_eq!("last@example.com", list[0].address);
    }
}
