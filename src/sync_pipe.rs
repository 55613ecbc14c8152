use std::io::{BufRead, Error, ErrorKind, Read, Result as IOResult, Write};
use std::sync::Arc;

use crate::error::PipeError;
use crate::ring::{Filled, Ring};

/// Creates a connected pair of blocking pipe halves sharing one ring of
/// exactly `capacity` bytes.
///
/// Writes block once the ring fills until the reader makes room, which is
/// what lets a slow consumer throttle a fast producer without dropping
/// data. Each half belongs on its own thread for anything larger than the
/// capacity.
///
/// # Panics
///
/// Panics if `capacity` is zero.
///
/// # Example
///
/// ```rust
/// use std::io::{read_to_string, Write};
///
/// let (mut writer, reader) = bufpipe::pipe(16);
/// writer.write_all("hello".as_bytes()).unwrap();
/// drop(writer);
///
/// assert_eq!("hello".to_string(), read_to_string(reader).unwrap());
/// ```
pub fn pipe(capacity: usize) -> (Writer, Reader) {
    let ring = Arc::new(Ring::new(capacity));
    (
        Writer {
            ring: ring.clone(),
            pos: 0,
        },
        Reader { ring, pos: 0 },
    )
}

/// The write half of a pipe.
///
/// Implements [`Write`]; a `write` call copies the whole slice into the
/// ring, blocking for room as needed. If the reader goes away mid-write
/// the call returns the count absorbed so far and the next call fails
/// with [`ErrorKind::BrokenPipe`].
///
/// Dropping the half ends the stream cleanly: the reader drains whatever
/// is buffered and then sees end of file. Use [`Writer::close_with_error`]
/// to hand the reader an error instead, or [`Writer::close`] to block
/// until the buffered bytes were actually drained.
#[derive(Debug)]
pub struct Writer {
    ring: Arc<Ring>,
    pos: usize,
}

impl Writer {
    fn advance(&mut self, n: usize) {
        self.pos += n;
        if self.pos >= self.ring.capacity() {
            self.pos -= self.ring.capacity();
        }
        self.ring.commit_write(n);
    }

    /// Feeds the pipe from `src` until the source reaches end of file.
    ///
    /// Each source call is handed the longest contiguous vacant run, so a
    /// chunky source fills the ring with few calls. Returns the total
    /// byte count on a clean end of file; source errors are returned
    /// verbatim, and a reader that went away surfaces as
    /// [`ErrorKind::BrokenPipe`].
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R) -> IOResult<u64> {
        let mut total = 0u64;
        loop {
            let free = match self.ring.wait_space() {
                Ok(free) => free,
                Err(err) => return Err(err.into()),
            };
            let span = self.ring.write_span(self.pos, free, usize::MAX);
            // SAFETY: sole producer; the span lies within the vacant run
            // derived from the `free` count just observed.
            let vacant = unsafe { self.ring.vacant(self.pos, span) };
            match src.read(vacant) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    self.advance(n);
                    total += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Closes the half and blocks until the reader consumed the buffered
    /// bytes, observed end of stream, or went away itself.
    ///
    /// Prefer this over dropping inside a producer task: when it returns,
    /// every byte this half accepted has reached the reader (or the
    /// reader abandoned them deliberately).
    pub fn close(mut self) {
        self.close_with(None);
    }

    /// Like [`Writer::close`], but the reader receives `err` once it has
    /// drained the buffered bytes, instead of a clean end of stream.
    pub fn close_with_error(mut self, err: Error) {
        self.close_with(Some(PipeError::Io(Arc::new(err))));
    }

    pub(crate) fn close_with(&mut self, err: Option<PipeError>) {
        if !self.ring.close_write(err) {
            return;
        }
        if self.ring.occupancy() > 0 {
            self.ring.wait_reader_retired();
        }
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        while written < buf.len() {
            let free = match self.ring.wait_space() {
                Ok(free) => free,
                // Keep the partial count; the error reappears on the
                // next call.
                Err(_) if written > 0 => return Ok(written),
                Err(err) => return Err(err.into()),
            };
            let span = self.ring.write_span(self.pos, free, buf.len() - written);
            // SAFETY: sole producer; the span lies within the vacant run
            // derived from the `free` count just observed.
            unsafe { self.ring.vacant(self.pos, span) }
                .copy_from_slice(&buf[written..written + span]);
            self.advance(span);
            written += span;
        }
        Ok(written)
    }

    fn flush(&mut self) -> IOResult<()> {
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // No drain wait here: dropping both halves on one thread must not
        // deadlock. The buffered bytes stay readable.
        self.ring.close_write(None);
    }
}

/// The read half of a pipe.
///
/// Implements [`Read`] and [`BufRead`]. Reads return as soon as any bytes
/// are buffered; once the writer is gone the remaining bytes drain and the
/// stream ends with the writer's verdict (end of file, or the error it
/// attached at close).
#[derive(Debug)]
pub struct Reader {
    ring: Arc<Ring>,
    pos: usize,
}

impl Reader {
    fn advance(&mut self, n: usize) {
        self.pos += n;
        if self.pos >= self.ring.capacity() {
            self.pos -= self.ring.capacity();
        }
        self.ring.commit_read(n);
    }

    /// Drains the pipe into `dst` until the writer finishes.
    ///
    /// Returns the total delivered on a clean end of stream. Sink errors
    /// are returned verbatim; a sink that accepts fewer bytes than offered
    /// without erroring ends the call with [`ErrorKind::WriteZero`].
    pub fn write_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> IOResult<u64> {
        let mut total = 0u64;
        loop {
            let free = match self.ring.wait_data() {
                Filled::Data(free) => free,
                Filled::Finished(None) => return Ok(total),
                Filled::Finished(Some(err)) => return Err(err.into()),
                Filled::Closed => return Err(PipeError::Closed.into()),
            };
            let span = self.ring.read_span(self.pos, free, usize::MAX);
            // SAFETY: sole consumer; the span lies within the buffered run
            // derived from the `free` count just observed.
            let chunk = unsafe { self.ring.filled(self.pos, span) };
            match dst.write(chunk) {
                Ok(n) if n < span => {
                    self.advance(n);
                    return Err(PipeError::ShortWrite.into());
                }
                Ok(n) => {
                    self.advance(n);
                    total += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Closes the half. Buffered but unread bytes are discarded; the
    /// writer's next operation fails with [`ErrorKind::BrokenPipe`].
    pub fn close(self) {
        self.ring.close_read(None);
    }

    /// Like [`Reader::close`], recording `err` as the reason. The writer
    /// still observes [`ErrorKind::BrokenPipe`]; the reason only shows up
    /// in trace output.
    pub fn close_with_error(self, err: Error) {
        self.ring.close_read(Some(PipeError::Io(Arc::new(err))));
    }
}

impl BufRead for Reader {
    fn fill_buf(&mut self) -> IOResult<&[u8]> {
        let free = match self.ring.wait_data() {
            Filled::Data(free) => free,
            Filled::Finished(None) => return Ok(&[]),
            Filled::Finished(Some(err)) => return Err(err.into()),
            Filled::Closed => return Err(PipeError::Closed.into()),
        };
        let span = self.ring.read_span(self.pos, free, usize::MAX);
        // SAFETY: sole consumer; the producer cannot touch this region
        // until consume() releases it.
        Ok(unsafe { self.ring.filled(self.pos, span) })
    }

    fn consume(&mut self, amt: usize) {
        debug_assert!(amt <= self.ring.occupancy());
        self.advance(amt);
    }
}

impl Read for Reader {
    fn read(&mut self, mut buf: &mut [u8]) -> IOResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.write(self.fill_buf()?)?;
        self.consume(n);
        Ok(n)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.ring.close_read(None);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{read_to_string, BufRead, ErrorKind, Read, Write};
    use std::thread;

    use crate::testutil::random_blob;

    #[test]
    fn write_then_drop_then_read() {
        let (mut writer, reader) = crate::pipe(32);
        writer.write_all("hello ".as_bytes()).unwrap();
        writer.write_all("world".as_bytes()).unwrap();
        drop(writer);

        assert_eq!("hello world".to_string(), read_to_string(reader).unwrap());
    }

    #[test]
    fn empty_write_is_a_noop() {
        let (mut writer, reader) = crate::pipe(1);
        assert_eq!(0, writer.write(&[]).unwrap());
        drop(reader);
        assert_eq!(0, writer.write(&[]).unwrap());
    }

    #[test]
    fn odd_capacity_threaded_transfer_preserves_order() {
        let blob = random_blob(64 * 1024, 7);
        let (mut writer, mut reader) = crate::pipe(333);

        thread::scope(|s| {
            s.spawn(|| {
                // Chunk size chosen to stay out of phase with the ring.
                for chunk in blob.chunks(41) {
                    writer.write_all(chunk).unwrap();
                }
                drop(writer);
            });

            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(blob, out);
        });
    }

    #[test]
    fn capacity_one_still_moves_data() {
        let (mut writer, mut reader) = crate::pipe(1);

        thread::scope(|s| {
            s.spawn(|| {
                writer.write_all(&[0x01, 0x02, 0x03]).unwrap();
                drop(writer);
            });

            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(vec![0x01, 0x02, 0x03], out);
        });
    }

    #[test]
    fn reader_gone_fails_the_writer() {
        let (mut writer, reader) = crate::pipe(4);
        drop(reader);

        let err = writer.write("hello".as_bytes()).unwrap_err();
        assert_eq!(ErrorKind::BrokenPipe, err.kind());
    }

    #[test]
    fn blocked_writer_keeps_its_partial_count() {
        let (mut writer, mut reader) = crate::pipe(4);

        thread::scope(|s| {
            let feeder = s.spawn(move || {
                let mut delivered = 0usize;
                loop {
                    match writer.write(&[0xAB; 16]) {
                        Ok(n) => delivered += n,
                        Err(err) => return (delivered, err),
                    }
                }
            });

            let mut sink = [0u8; 6];
            reader.read_exact(&mut sink).unwrap();
            drop(reader);

            let (delivered, err) = feeder.join().unwrap();
            assert_eq!(ErrorKind::BrokenPipe, err.kind());
            // Everything the reader consumed had to be written first.
            assert!(delivered >= 6, "only {delivered} bytes were accepted");
        });
    }

    #[test]
    fn attached_error_arrives_after_the_buffered_bytes() {
        let (mut writer, mut reader) = crate::pipe(32);

        thread::scope(|s| {
            s.spawn(move || {
                writer.write_all("payload".as_bytes()).unwrap();
                writer.close_with_error(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "upstream stalled",
                ));
            });

            let mut out = Vec::new();
            let err = reader.read_to_end(&mut out).unwrap_err();
            assert_eq!("payload".as_bytes(), out);
            assert_eq!(ErrorKind::TimedOut, err.kind());
        });
    }

    #[test]
    fn writer_close_waits_for_the_drain() {
        let blob = random_blob(4 * 1024, 3);
        let (mut writer, mut reader) = crate::pipe(64);

        thread::scope(|s| {
            let feeder = s.spawn(|| {
                writer.write_all(&blob).unwrap();
                writer.close();
            });

            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(blob, out);
            feeder.join().unwrap();
        });
    }

    #[test]
    fn close_is_idempotent_per_half() {
        let (writer, mut reader) = crate::pipe(4);
        writer.close();

        assert_eq!(0, reader.read(&mut [0u8; 4]).unwrap());

        let (mut writer, reader) = crate::pipe(4);
        reader.close();
        assert_eq!(
            ErrorKind::BrokenPipe,
            writer.write(&[1]).unwrap_err().kind()
        );
    }

    #[test]
    fn trickling_source_reaches_the_reader_intact() {
        struct Trickle<'a> {
            data: &'a [u8],
        }

        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.data.split_first() {
                    Some((byte, rest)) if !buf.is_empty() => {
                        buf[0] = *byte;
                        self.data = rest;
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
        }

        let blob = random_blob(777, 11);
        let (mut writer, mut reader) = crate::pipe(3);

        thread::scope(|s| {
            s.spawn(|| {
                let fed = writer.read_from(&mut Trickle { data: &blob }).unwrap();
                assert_eq!(blob.len() as u64, fed);
                drop(writer);
            });

            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(blob, out);
        });
    }

    #[test]
    fn under_writing_sink_aborts_the_drain() {
        struct Stingy;

        impl Write for Stingy {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len() / 2)
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (mut writer, mut reader) = crate::pipe(8);
        writer.write_all(&[1, 2, 3, 4]).unwrap();
        drop(writer);

        let err = reader.write_to(&mut Stingy).unwrap_err();
        assert_eq!(ErrorKind::WriteZero, err.kind());
    }

    #[test]
    fn bufread_line_splitting_works_through_the_ring() {
        let (mut writer, mut reader) = crate::pipe(32);
        writer.write_all("hello\n".as_bytes()).unwrap();
        writer.write_all("world".as_bytes()).unwrap();
        drop(writer);

        let mut line = String::new();
        assert_ne!(0, reader.read_line(&mut line).unwrap());
        assert_eq!("hello\n".to_string(), line);

        let mut line = String::new();
        assert_ne!(0, reader.read_line(&mut line).unwrap());
        assert_eq!("world".to_string(), line);
    }
}
