use std::io::{Error, Result as IOResult};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::io::{AsyncBufRead, AsyncRead, AsyncWrite};

use crate::error::PipeError;
use crate::ring::Ring;

/// Creates a connected pair of async pipe halves sharing one ring of
/// exactly `capacity` bytes.
///
/// Same ring, same close semantics as [`pipe`](crate::pipe), but a side
/// that cannot progress parks its task instead of its thread: the poll
/// registers a waker and the peer's next commit wakes it.
///
/// # Panics
///
/// Panics if `capacity` is zero.
///
/// # Example
///
/// ```rust
/// use futures::io::{AsyncReadExt, AsyncWriteExt};
///
/// futures_executor::block_on(async {
///     let (mut writer, mut reader) = bufpipe::async_pipe(16);
///     writer.write_all("hello".as_bytes()).await.unwrap();
///     drop(writer);
///
///     let mut out = String::new();
///     reader.read_to_string(&mut out).await.unwrap();
///     assert_eq!("hello", out);
/// });
/// ```
pub fn async_pipe(capacity: usize) -> (AsyncWriter, AsyncReader) {
    let ring = Arc::new(Ring::new(capacity));
    (
        AsyncWriter {
            ring: ring.clone(),
            pos: 0,
        },
        AsyncReader { ring, pos: 0 },
    )
}

/// The write half of an async pipe.
///
/// A `poll_write` moves at most one contiguous run per call; `write_all`
/// loops it. Closing through [`AsyncWrite::poll_close`] resolves once the
/// buffered bytes are drained or the reader is gone, so `close().await`
/// carries the same delivery guarantee as the blocking
/// [`Writer::close`](crate::Writer::close).
#[derive(Debug)]
pub struct AsyncWriter {
    ring: Arc<Ring>,
    pos: usize,
}

impl AsyncWriter {
    fn advance(&mut self, n: usize) {
        self.pos += n;
        if self.pos >= self.ring.capacity() {
            self.pos -= self.ring.capacity();
        }
        self.ring.commit_write(n);
    }

    /// Closes the half without waiting, handing `err` to the reader once
    /// it has drained the buffered bytes.
    ///
    /// This returns before the reader has seen anything; the buffered
    /// bytes stay readable and `err` follows them. For the delivery
    /// guarantee of the blocking [`Writer::close`](crate::Writer::close),
    /// close through [`AsyncWriteExt::close`](futures::io::AsyncWriteExt::close)
    /// instead, which resolves only once the ring is drained or the
    /// reader is gone.
    pub fn close_with_error(self, err: Error) {
        self.ring.close_write(Some(PipeError::Io(Arc::new(err))));
    }
}

impl AsyncWrite for AsyncWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IOResult<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            if this.ring.write_closed() || this.ring.read_closed() {
                return Poll::Ready(Err(PipeError::Closed.into()));
            }
            let free = this.ring.free_now();
            if free == 0 {
                this.ring.register_space_waker(cx.waker());
                // Room or a close may have raced the registration.
                if this.ring.read_closed() || this.ring.write_closed() {
                    return Poll::Ready(Err(PipeError::Closed.into()));
                }
                if this.ring.free_now() == 0 {
                    return Poll::Pending;
                }
                continue;
            }
            let span = this.ring.write_span(this.pos, free, buf.len());
            // SAFETY: sole producer; the span lies within the vacant run
            // derived from the `free` count just observed.
            unsafe { this.ring.vacant(this.pos, span) }.copy_from_slice(&buf[..span]);
            this.advance(span);
            return Poll::Ready(Ok(span));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IOResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IOResult<()>> {
        let this = self.get_mut();
        this.ring.close_write(None);
        if this.ring.occupancy() == 0 || this.ring.read_closed() {
            return Poll::Ready(Ok(()));
        }
        this.ring.register_space_waker(cx.waker());
        if this.ring.occupancy() == 0 || this.ring.read_closed() {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.ring.close_write(None);
    }
}

/// The read half of an async pipe.
///
/// Implements [`AsyncRead`] and [`AsyncBufRead`]; the buffered flavor
/// exposes the ring's contiguous runs directly, so a consumer can drain
/// without the extra copy.
#[derive(Debug)]
pub struct AsyncReader {
    ring: Arc<Ring>,
    pos: usize,
}

impl AsyncReader {
    fn advance(&mut self, n: usize) {
        self.pos += n;
        if self.pos >= self.ring.capacity() {
            self.pos -= self.ring.capacity();
        }
        self.ring.commit_read(n);
    }

    /// Closes the half, recording `err` as the reason. Buffered bytes are
    /// discarded and the writer's next poll fails with a closed pipe.
    pub fn close_with_error(self, err: Error) {
        self.ring.close_read(Some(PipeError::Io(Arc::new(err))));
    }
}

impl AsyncBufRead for AsyncReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IOResult<&[u8]>> {
        let this = self.get_mut();
        loop {
            if this.ring.read_closed() {
                return Poll::Ready(Err(PipeError::Closed.into()));
            }
            let mut free = this.ring.free_now();
            if free == this.ring.capacity() {
                if this.ring.write_closed() {
                    // Bytes may have been committed right before the close.
                    free = this.ring.free_now();
                    if free == this.ring.capacity() {
                        this.ring.close_read(None);
                        return Poll::Ready(match this.ring.write_error() {
                            None => Ok(&[]),
                            Some(err) => Err(err.into()),
                        });
                    }
                } else {
                    this.ring.register_data_waker(cx.waker());
                    if this.ring.free_now() == this.ring.capacity()
                        && !this.ring.write_closed()
                    {
                        return Poll::Pending;
                    }
                    continue;
                }
            }
            let span = this.ring.read_span(this.pos, free, usize::MAX);
            // SAFETY: sole consumer; the producer cannot touch this region
            // until consume() releases it.
            return Poll::Ready(Ok(unsafe { this.ring.filled(this.pos, span) }));
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        debug_assert!(amt <= self.ring.occupancy());
        self.get_mut().advance(amt);
    }
}

impl AsyncRead for AsyncReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IOResult<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = match self.as_mut().poll_fill_buf(cx) {
            Poll::Ready(Ok(chunk)) => chunk,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.consume(n);
        Poll::Ready(Ok(n))
    }
}

impl Drop for AsyncReader {
    fn drop(&mut self) {
        self.ring.close_read(None);
    }
}
