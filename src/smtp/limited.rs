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
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::SmtpReply;

/// Number of reads still delivered after the byte budget is exhausted.
///
/// The buffered line reader sitting above this wrapper pulls data in chunks;
/// failing the very first read past the budget would truncate the line it is
/// assembling and the 552 response would race the socket teardown. The grace
/// window lets the framing layer finish its line so the client actually
/// receives the 552 before the connection goes away.
const GRACE_READS: u32 = 10;

/// Keeps from reading past the configured maximum message size.
///
/// Reads decrement the remaining budget by the bytes actually delivered.
/// Once the budget is exhausted the limit becomes sticky: up to
/// [`GRACE_READS`] further reads still deliver data, after which every read
/// fails with the oversize [`SmtpReply`] wrapped in an `io::Error`. The
/// sticky state is observable through [`LimitedReader::hit_limit`] and
/// cleared by [`LimitedReader::rearm`].
///
/// Writes pass straight through to the underlying stream.
pub struct LimitedReader<R> {
    inner: R,
    remaining: Option<i64>,
    reads_remaining: u32,
    did_hit_limit: bool,
}

impl<R> LimitedReader<R> {
    /// Wraps `inner`, enforcing `limit` bytes. `None` disables the cap.
    pub fn new(inner: R, limit: Option<i64>) -> Self {
        LimitedReader {
            inner,
            remaining: limit,
            reads_remaining: 0,
            did_hit_limit: false,
        }
    }

    /// Whether the budget has been exhausted since the last re-arm.
    pub fn hit_limit(&self) -> bool {
        self.did_hit_limit
    }

    /// Refills the budget and clears the sticky limit state.
    pub fn rearm(&mut self, limit: Option<i64>) {
        self.remaining = limit;
        self.reads_remaining = 0;
        self.did_hit_limit = false;
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if matches!(this.remaining, Some(n) if n <= 0) && !this.did_hit_limit {
            this.did_hit_limit = true;
            this.reads_remaining = GRACE_READS;
        }

        if this.did_hit_limit {
            if this.reads_remaining == 0 {
                return Poll::Ready(Err(SmtpReply::oversize().into_io()));
            }
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if let Some(ref mut remaining) = this.remaining {
                    *remaining -= n as i64;
                }
                if this.did_hit_limit {
                    this.reads_remaining -= 1;
                }
                Poll::Ready(Ok(()))
            },
        }
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for LimitedReader<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    use super::*;

    fn run<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn unlimited_reader_passes_everything() {
        run(async {
            let data = vec![b'x'; 100_000];
            let mut reader = LimitedReader::new(&data[..], None);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(data, out);
            assert!(!reader.hit_limit());
        });
    }

    #[test]
    fn within_budget_is_untouched() {
        run(async {
            let data = b"hello world".to_vec();
            let mut reader = LimitedReader::new(&data[..], Some(1024));
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(data, out);
            assert!(!reader.hit_limit());
        });
    }

    #[test]
    fn grace_window_keeps_framing_reader_alive() {
        run(async {
            // A framing reader pulling >= 4KiB chunks must still be able to
            // complete the line it is assembling after the budget trips.
            let mut data = vec![b'x'; 8000];
            data.extend_from_slice(b"\r\n");
            data.extend(vec![b'y'; 56 * 1024]);
            data.extend_from_slice(b"\r\n");
            let mut reader = BufReader::with_capacity(
                4096,
                LimitedReader::new(&data[..], Some(1000)),
            );

            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).await.unwrap();
            assert_eq!(8002, n);
            assert!(reader.get_ref().hit_limit());

            // The hard stop arrives once the grace reads are spent.
            line.clear();
            let err = reader
                .read_until(b'\n', &mut line)
                .await
                .expect_err("expected the oversize error");
            let reply = SmtpReply::from_io(&err).expect("expected SmtpReply");
            assert_eq!(552, reply.code);
        });
    }

    #[test]
    fn rearm_clears_sticky_limit() {
        run(async {
            let data = vec![b'y'; 64 * 1024];
            let mut reader = LimitedReader::new(&data[..], Some(10));
            let mut buf = vec![0u8; 4096];

            let mut total = 0;
            let err = loop {
                match reader.read(&mut buf).await {
                    Ok(0) => panic!("EOF before oversize error"),
                    Ok(n) => total += n,
                    Err(e) => break e,
                }
            };
            assert_eq!(552, SmtpReply::from_io(&err).unwrap().code);
            assert!(total < data.len());
            assert!(reader.hit_limit());

            reader.rearm(Some(1_000_000));
            assert!(!reader.hit_limit());
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0);
        });
    }
}
