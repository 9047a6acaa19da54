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

//! The structured view of a received message: RFC 5322 envelope headers plus
//! a recursively decoded MIME tree with convenience selectors.

use crate::mime::header::{self, Address, ContentType, HeaderMap};
use crate::mime::quoted_printable::qp_decode;
use crate::smtp::conn::ConnContext;
use crate::support::error::Error;

/// A nicely packaged representation of a received message.
#[derive(Clone, Debug)]
pub struct Message {
    conn: Option<ConnContext>,

    /// Recipients taken from the `To` header. May be empty.
    pub to: Vec<Address>,
    /// The first mailbox of the `From` header.
    pub from: Address,
    /// The `Subject` header, or empty.
    pub subject: String,
    /// The raw (not transfer-decoded) body bytes.
    pub raw_body: Vec<u8>,
    /// The full original source, headers included.
    pub source: Vec<u8>,

    /// The queue id assigned on delivery.
    pub message_id: String,
    /// The envelope recipients accepted with RCPT TO.
    pub rcpt: Vec<String>,

    headers: HeaderMap,
}

/// A single node of the decoded MIME tree.
///
/// `children` is nonempty exactly when the part's media type begins with
/// `multipart/`; children are ordered as on the wire. The transfer encoding
/// has already been applied to `body`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub children: Vec<Part>,
}

impl Message {
    /// Builds a `Message` from a complete data blob and the envelope
    /// recipient list.
    ///
    /// A message with no body at all (headers without a blank separator
    /// line) is accepted: a `text/plain` content type is synthesized when
    /// absent, along with a blank body. A missing or unparseable `From`
    /// header is an error.
    pub fn new(
        conn: Option<ConnContext>,
        data: &[u8],
        rcpt: &[String],
    ) -> Result<Self, Error> {
        let mut data = data.to_vec();

        if header::split_block(&data).is_none() {
            // Headers-only message. Patch it into parseable shape the same
            // way a body-bearing message would look.
            if !String::from_utf8_lossy(&data).contains("\nContent-Type:") {
                if !data.ends_with(b"\n") {
                    data.extend_from_slice(b"\n");
                }
                data.extend_from_slice(b"Content-Type: text/plain\n");
            }
            data.extend_from_slice(b"\n\n");
        }

        let (header_block, body) = header::split_block(&data)
            .ok_or_else(|| Error::Mime("no header block".to_owned()))?;
        let headers = header::parse_headers(header_block);
        let raw_body = body.to_vec();

        // To is optional; ideally there is a CC or BCC when it is absent.
        let to = header::parse_address_list(headers.get("To").unwrap_or(""));

        let from = header::parse_address_list(headers.get("From").unwrap_or(""))
            .into_iter()
            .next()
            .ok_or(Error::MissingFrom)?;

        let subject = headers.get("Subject").unwrap_or("").to_owned();

        Ok(Message {
            conn,
            to,
            from,
            subject,
            raw_body,
            source: data,
            message_id: String::new(),
            rcpt: rcpt.to_vec(),
            headers,
        })
    }

    /// The connection the message arrived on, when constructed by a server.
    pub fn conn(&self) -> Option<&ConnContext> {
        self.conn.as_ref()
    }

    /// The parsed header map. Lookups are case-insensitive.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Shorthand for a single header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Breaks the message body into its decoded MIME parts.
    pub fn parts(&self) -> Result<Vec<Part>, Error> {
        parse_content(&self.headers, &self.raw_body)
    }

    /// The `text/plain` content of the message, if any.
    pub fn plain(&self) -> Result<Vec<u8>, Error> {
        self.find_body("text/plain")
    }

    /// The `text/html` content of the message, if any.
    pub fn html(&self) -> Result<Vec<u8>, Error> {
        self.find_body("text/html")
    }

    /// Finds the body with the given media type.
    ///
    /// Resolution order: the root media type itself, then the children of a
    /// root `multipart/alternative`, then the children of the first
    /// `multipart/alternative` section among the root parts.
    pub fn find_body(&self, content_type: &str) -> Result<Vec<u8>, Error> {
        let root = self
            .headers
            .get("Content-Type")
            .ok_or_else(|| Error::MediaType("no media type".to_owned()))
            .and_then(header::parse_content_type)?;

        let parts = self.parts()?;

        let alternatives = if root.media_type == content_type {
            return parts
                .first()
                .map(|p| p.body.clone())
                .ok_or_else(|| Error::EmptyBody(content_type.to_owned()));
        } else if root.media_type == "multipart/alternative" {
            parts
        } else {
            match find_type_in_parts("multipart/alternative", &parts) {
                Some(alt) => alt.children.clone(),
                None => Vec::new(),
            }
        };

        if alternatives.is_empty() {
            return Err(Error::NoAlternativeSection(content_type.to_owned()));
        }

        find_type_in_parts(content_type, &alternatives)
            .map(|p| p.body.clone())
            .ok_or_else(|| Error::NoAlternativePart(content_type.to_owned()))
    }

    /// The attachments of the message.
    ///
    /// Only a `multipart/mixed` root is treated as an attachment container;
    /// its direct non-multipart children are the attachments.
    pub fn attachments(&self) -> Result<Vec<Part>, Error> {
        let root = self
            .headers
            .get("Content-Type")
            .ok_or_else(|| Error::MediaType("no media type".to_owned()))
            .and_then(header::parse_content_type)?;

        // A malformed body is an error regardless of the container type
        let parts = self.parts()?;

        let mut attachments = Vec::new();
        if root.media_type == "multipart/mixed" {
            for part in parts {
                let ct = part_content_type(&part.headers)?;
                if !ct.is_multipart() {
                    attachments.push(part);
                }
            }
        }
        Ok(attachments)
    }

    /// The envelope recipients that do not appear in the `To` header.
    pub fn bcc(&self) -> Vec<String> {
        let in_headers: std::collections::HashSet<&str> =
            self.to.iter().map(|a| a.address.as_str()).collect();

        self.rcpt
            .iter()
            .filter(|r| !in_headers.contains(r.as_str()))
            .cloned()
            .collect()
    }
}

fn part_content_type(headers: &HeaderMap) -> Result<ContentType, Error> {
    match headers.get("Content-Type") {
        None => Ok(ContentType::octet_stream()),
        Some(value) => header::parse_content_type(value),
    }
}

fn find_type_in_parts<'a>(
    content_type: &str,
    parts: &'a [Part],
) -> Option<&'a Part> {
    parts.iter().find(|p| {
        part_content_type(&p.headers)
            .map(|ct| ct.media_type == content_type)
            .unwrap_or(false)
    })
}

/// Applies the Content-Transfer-Encoding named in `headers` to `content`.
///
/// Quoted-printable and base64 both fail the decode on malformed input;
/// anything else is an identity transform.
fn transfer_decode(
    headers: &HeaderMap,
    content: &[u8],
) -> Result<Vec<u8>, Error> {
    let cte = headers
        .get("Content-Transfer-Encoding")
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match cte.as_str() {
        "quoted-printable" => qp_decode(content),
        "base64" => {
            let filtered: Vec<u8> = content
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            Ok(base64::decode(filtered)?)
        },
        _ => Ok(content.to_vec()),
    }
}

/// Recursively decodes `content` according to its headers.
///
/// Nested multiparts are parsed from the *decoded* bytes of their enclosing
/// part, each using its own boundary parameter.
fn parse_content(
    headers: &HeaderMap,
    content: &[u8],
) -> Result<Vec<Part>, Error> {
    let ct = part_content_type(headers)?;

    if !ct.is_multipart() {
        return Ok(vec![Part {
            headers: headers.clone(),
            body: transfer_decode(headers, content)?,
            children: Vec::new(),
        }]);
    }

    let boundary = ct
        .parm("boundary")
        .ok_or_else(|| Error::Mime("multipart boundary not specified".to_owned()))?;

    let mut parts = Vec::new();
    for raw in split_multipart(content, boundary) {
        let (sub_block, sub_body) = match header::split_block(&raw) {
            Some((block, body)) => (header::parse_headers(block), body),
            // Tolerate a headerless part
            None => (HeaderMap::default(), &raw[..]),
        };

        let mut part = Part {
            body: transfer_decode(&sub_block, sub_body)?,
            headers: sub_block,
            children: Vec::new(),
        };

        if part_content_type(&part.headers)?.is_multipart() {
            part.children = parse_content(&part.headers, &part.body)?;
        }

        parts.push(part);
    }

    Ok(parts)
}

/// Splits multipart content on its boundary lines.
///
/// The preamble before the first boundary and the epilogue after the closing
/// boundary are discarded, and the line ending immediately preceding a
/// boundary belongs to the boundary, not the content.
fn split_multipart(content: &[u8], boundary: &str) -> Vec<Vec<u8>> {
    let delimiter = format!("--{}", boundary);
    let close = format!("--{}--", boundary);

    fn boundary_text(line: &[u8]) -> &[u8] {
        let mut line = line;
        while let Some((&last, rest)) = line.split_last() {
            if last == b'\n' || last == b'\r' || last == b' ' || last == b'\t'
            {
                line = rest;
            } else {
                break;
            }
        }
        line
    }

    fn finish(mut part: Vec<u8>) -> Vec<u8> {
        if part.ends_with(b"\n") {
            part.pop();
        }
        if part.ends_with(b"\r") {
            part.pop();
        }
        part
    }

    let mut parts = Vec::new();
    let mut current: Option<Vec<u8>> = None;

    for line in content.split_inclusive(|&b| b == b'\n') {
        let text = boundary_text(line);
        if text == close.as_bytes() {
            if let Some(part) = current.take() {
                parts.push(finish(part));
            }
            break;
        } else if text == delimiter.as_bytes() {
            if let Some(part) = current.take() {
                parts.push(finish(part));
            }
            current = Some(Vec::new());
        } else if let Some(ref mut part) = current {
            part.extend_from_slice(line);
        }
    }

    // Unterminated multipart; keep what was accumulated
    if let Some(part) = current.take() {
        parts.push(finish(part));
    }

    parts
}

#[cfg(test)]
mod test {
    use super::*;

    const PLAIN_HTML_EMAIL: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: text/html
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>"#;

    const ALTERNATIVE_EMAIL: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: multipart/alternative;
 	 boundary="_=test=_bbd1e98aa6c34ef59d8d102a0e795027"
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/plain; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

Sending bees

=F0=9F=90=9D

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/html; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027--
"#;

    const EMAIL_WITH_ATTACHMENT: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: multipart/mixed;
 	 boundary="_=test=_bbd1e98aa6c34ef59d8d102a0e795027"
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: multipart/alternative; boundary="_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027"

--_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/plain; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

Sending bees

=F0=9F=90=9D

--_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/html; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>

--_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027--
--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/calendar; name="invite.ics"
Content-Transfer-Encoding: base64
Content-Disposition: attachment; filename="invite.ics"

QkVHSU46VkNBTEVOREFSClZFUlNJT046Mi4wClBST0RJRDotLy9tYWlscHJvdG8vL01haWxQcm90bwpDQUxTQ0FMRTpHUkVHT1JJQU4KQkVHSU46VkVWRU5UCkRUU1RBTVA6MjAxNzAxMTZUMTU0MDAwClVJRDpteWNvb2xldmVudEBtYWlscHJvdG8KCkRUU1RBUlQ7VFpJRD0iQW1lcmljYS9OZXdfWW9yayI6MjAxNzAxMThUMTEwMDAwCkRURU5EO1RaSUQ9IkFtZXJpY2EvTmV3X1lvcmsiOjIwMTcwMTE4VDEyMDAwMApTVU1NQVJZOlNlbmQgYW4gZW1haWwKTE9DQVRJT046VGVzdApFTkQ6VkVWRU5UCkVORDpWQ0FMRU5EQVI=
--_=test=_bbd1e98aa6c34ef59d8d102a0e795027--"#;

    const UTF8_ENCODED_FROM_NAME: &str = r#"From: Sender \u0014\<sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: text/html
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>"#;

    const EMAIL_WITH_INVALID_BODY: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Invalid Body Message
MIME-Version: 1.0
Content-Type: text/html
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=FG=XX==
  </body>
</html>"#;

    const EMAIL_WITH_NO_BODY: &str = r#"Received: from SJ0PR18MB4899.namprd18.prod.outlook.com (2603:10b6:a03:40a::11)
 by MN2PR18MB3421.namprd18.prod.outlook.com (2603:10b6:208:16b::23) with
 Microsoft SMTP Server (version=TLS1_2,
 cipher=TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384) id 15.20.5373.17; Fri, 24 Jun
 2022 17:29:08 +0000
From: Forking Team <team@forkingsoftware.com>
To: "asdf@mailsac-staging.com" <asdf@mailsac-staging.com>
Subject:
Thread-Index: AQHYh+/pLgiR3cDgnkCfp6Yvx97a9w==
Date: Fri, 24 Jun 2022 17:29:08 +0000
Message-ID: <4980494D-E7BC-4B37-BAB8-B6EF12280480@forkingsoftware.com>
Accept-Language: en-US
Content-Language: en-US
X-MS-Has-Attach:
X-MS-TNEF-Correlator:"#;

    const EXPECT_HTML: &str = r#"<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>🐝
  </body>
</html>"#;

    const EXPECT_PLAIN: &str = "Sending bees\n\n🐝";

    fn expect_to() -> Vec<Address> {
        vec![
            Address {
                name: String::new(),
                address: "recipient1@example.com".to_owned(),
            },
            Address {
                name: "Recipient 2".to_owned(),
                address: "recipient2@example.com".to_owned(),
            },
        ]
    }

    fn trimmed(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap().trim().to_owned()
    }

    #[test]
    fn plain_html_parsing() {
        let msg =
            Message::new(None, PLAIN_HTML_EMAIL.as_bytes(), &[]).unwrap();

        assert_eq!(expect_to(), msg.to);
        assert_eq!("sender@example.com", msg.from.address);
        assert_eq!("Multipart Message", msg.subject);
        assert_eq!(
            Some("<examplemessage@example.com>"),
            msg.header("Message-ID"),
        );

        assert_eq!(EXPECT_HTML, trimmed(msg.html().unwrap()));
        assert_matches!(Err(Error::NoAlternativeSection(..)), msg.plain());
    }

    #[test]
    fn alternative_message_parsing() {
        let msg =
            Message::new(None, ALTERNATIVE_EMAIL.as_bytes(), &[]).unwrap();

        assert_eq!(expect_to(), msg.to);
        assert_eq!(EXPECT_HTML, trimmed(msg.html().unwrap()));
        assert_eq!(EXPECT_PLAIN, trimmed(msg.plain().unwrap()));
    }

    #[test]
    fn empty_body_message_parses() {
        let msg =
            Message::new(None, EMAIL_WITH_NO_BODY.as_bytes(), &[]).unwrap();

        assert_eq!(1, msg.to.len());
        assert_eq!("asdf@mailsac-staging.com", msg.to[0].address);
        assert_eq!("team@forkingsoftware.com", msg.from.address);
        assert_eq!("Forking Team", msg.from.name);
        assert_eq!("", msg.subject);

        // Selectors fail gracefully rather than panicking
        assert!(msg.html().is_err());
    }

    #[test]
    fn mixed_message_parsing() {
        let msg =
            Message::new(None, EMAIL_WITH_ATTACHMENT.as_bytes(), &[]).unwrap();

        assert_eq!(expect_to(), msg.to);
        assert_eq!(EXPECT_HTML, trimmed(msg.html().unwrap()));
        assert_eq!(EXPECT_PLAIN, trimmed(msg.plain().unwrap()));

        let attachments = msg.attachments().unwrap();
        assert_eq!(1, attachments.len());

        let ct = header::parse_content_type(
            attachments[0].headers.get("Content-Type").unwrap(),
        )
        .unwrap();
        assert_eq!("text/calendar", ct.media_type);

        let body = String::from_utf8(attachments[0].body.clone()).unwrap();
        assert!(body.starts_with("BEGIN:VCALENDAR"));
        assert!(body.contains("SUMMARY:Send an email"));
        assert!(body.ends_with("END:VCALENDAR"));
    }

    #[test]
    fn invalid_body_still_constructs() {
        let msg = Message::new(None, EMAIL_WITH_INVALID_BODY.as_bytes(), &[])
            .unwrap();

        assert_eq!(expect_to(), msg.to);
        assert_matches!(Err(Error::Mime(..)), msg.parts());
        assert!(msg.html().is_err());
        // The decode error surfaces even though the root is not a
        // multipart/mixed container
        assert_matches!(Err(Error::Mime(..)), msg.attachments());
    }

    #[test]
    fn utf_escape_noise_in_from_name_is_verbatim() {
        let msg = Message::new(None, UTF8_ENCODED_FROM_NAME.as_bytes(), &[])
            .unwrap();

        assert_eq!("Sender \\u0014\\", msg.from.name);
        assert_eq!("sender@example.com", msg.from.address);
    }

    #[test]
    fn missing_from_is_an_error() {
        assert_matches!(
            Err(Error::MissingFrom),
            Message::new(None, b"To: a@b.c\n\nhello", &[]),
        );
    }

    #[test]
    fn bcc_is_envelope_minus_header_to() {
        let rcpt = vec![
            "recipient1@example.com".to_owned(),
            "bcc@example.net".to_owned(),
            "recipient2@example.com".to_owned(),
        ];
        let msg =
            Message::new(None, ALTERNATIVE_EMAIL.as_bytes(), &rcpt).unwrap();
        assert_eq!(vec!["bcc@example.net".to_owned()], msg.bcc());
    }

    #[test]
    fn parsing_is_idempotent() {
        let msg =
            Message::new(None, EMAIL_WITH_ATTACHMENT.as_bytes(), &[]).unwrap();
        assert_eq!(msg.parts().unwrap(), msg.parts().unwrap());
        assert_eq!(msg.html().unwrap(), msg.html().unwrap());
    }

    #[test]
    fn headers_only_message_gains_synthetic_content_type() {
        let msg = Message::new(
            None,
            b"From: a@b.c\nTo: d@e.f\nSubject: hi",
            &[],
        )
        .unwrap();
        assert_eq!(Some("text/plain"), msg.header("Content-Type"));
        assert!(msg.raw_body.iter().all(|&b| b == b'\n'));
    }

    #[test]
    fn multipart_without_boundary_is_an_error() {
        let msg = Message::new(
            None,
            b"From: a@b.c\nContent-Type: multipart/mixed\n\nbody",
            &[],
        )
        .unwrap();
        assert_matches!(Err(Error::Mime(..)), msg.parts());
    }

    #[test]
    fn split_multipart_handles_missing_close() {
        let content = b"preamble\n--b\nA: 1\n\nfirst\n--b\nB: 2\n\nsecond";
        let parts = split_multipart(content, "b");
        assert_eq!(2, parts.len());
        assert_eq!(b"A: 1\n\nfirst" as &[u8], &parts[0][..]);
        assert_eq!(b"B: 2\n\nsecond" as &[u8], &parts[1][..]);
    }

    #[test]
    fn base64_attachment_with_garbage_is_an_error() {
        let msg = Message::new(
            None,
            b"From: a@b.c\nContent-Type: text/plain\nContent-Transfer-Encoding: base64\n\nnot!!base64",
            &[],
        )
        .unwrap();
        assert_matches!(Err(Error::Base64(..)), msg.parts());
    }
}
