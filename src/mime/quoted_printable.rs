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

use crate::support::error::Error;

/// Decodes quoted-printable encoding, as described by RFC 2045.
///
/// Encoded bytes and soft line endings are both handled, the latter by
/// discarding. UNIX line endings are accepted as well as DOS line endings.
/// 8-bit characters are passed through, including invalid UTF-8.
///
/// An `=` that does not introduce a valid escape or soft line break fails
/// the decode; the invariant the message layer depends on is that a decode
/// error is surfaced rather than silently producing mangled content.
pub fn qp_decode(input: &[u8]) -> Result<Vec<u8>, Error> {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'A'..=b'F' => Some(b - b'A' + 10),
            b'a'..=b'f' => Some(b - b'a' + 10),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(input.len());
    let mut ix = 0;
    while ix < input.len() {
        let byte = input[ix];
        if byte != b'=' {
            out.push(byte);
            ix += 1;
            continue;
        }

        match input.get(ix + 1) {
            // Soft line break with UNIX ending
            Some(b'\n') => ix += 2,
            // Soft line break with DOS ending
            Some(b'\r') if input.get(ix + 2) == Some(&b'\n') => ix += 3,
            Some(&first) => match (hex(first), input.get(ix + 2).and_then(|&b| hex(b))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    ix += 3;
                },
                _ => {
                    return Err(Error::Mime(format!(
                        "quoted-printable: invalid escape at offset {}",
                        ix,
                    )));
                },
            },
            None => {
                return Err(Error::Mime(
                    "quoted-printable: dangling '=' at end of input".to_owned(),
                ));
            },
        }
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn assert_qp(expected: &[u8], input: &[u8]) {
        assert_eq!(expected, &qp_decode(input).unwrap()[..]);
    }

    #[test]
    fn test_qp_decode() {
        assert_qp(b"hello world", b"hello world");
        assert_qp(b"\xabfoo", b"=ABfoo");
        assert_qp(b"fo\xabo", b"fo=ABo");
        assert_qp(b"foo\xab", b"foo=AB");
        assert_qp(b"foo\xab", b"foo=ab");

        assert_qp(b"foo\xab\xcd", b"foo=AB=CD");
        assert_qp(b"foo\xabbar\xcd", b"foo=ABbar=CD");

        assert_qp(b"foo", b"foo=\n");
        assert_qp(b"foobar", b"foo=\nbar");
        assert_qp(b"foo", b"foo=\r\n");
        assert_qp(b"foobar", b"foo=\r\nbar");

        assert_qp(b"foo=bar", b"foo=3Dbar");
        assert_qp(
            "\u{1F41D}".as_bytes(), // the bee emoji
            b"=F0=9F=90=9D",
        );
    }

    #[test]
    fn test_qp_decode_errors() {
        assert_matches!(Err(Error::Mime(..)), qp_decode(b"foo=()bar"));
        assert_matches!(Err(Error::Mime(..)), qp_decode(b"=FG=XX=="));
        assert_matches!(Err(Error::Mime(..)), qp_decode(b"foo="));
        assert_matches!(Err(Error::Mime(..)), qp_decode(b"foo=A"));
        assert_matches!(Err(Error::Mime(..)), qp_decode(b"foo=\r"));
    }

    proptest! {
        #[test]
        fn qp_decode_is_identity_without_escapes(s in "[^=]*") {
            prop_assert_eq!(s.as_bytes(), &qp_decode(s.as_bytes()).unwrap()[..]);
        }

        #[test]
        fn qp_decode_never_panics(
            s in prop::collection::vec(prop::num::u8::ANY, 0..64)
        ) {
            let _ = qp_decode(&s);
        }
    }
}
