use std::io::{Read, Result as IOResult, Write};
use std::panic;
use std::sync::Arc;
use std::thread;

use crate::error::PipeError;
use crate::sync_pipe::pipe;

/// Copies from `src` to `dst` through a ring of `capacity` bytes, letting
/// both sides run at once.
///
/// One scoped thread feeds the ring from `src` while the calling thread
/// drains it into `dst`, so a bursty source and a bursty sink no longer
/// take turns stalling each other; the ring absorbs the jitter and its
/// capacity bounds how far the source may run ahead.
///
/// Returns the byte count the sink actually received on success. A clean
/// source end of file is success, not an error. When both sides fail, the
/// sink-side error wins. Source and sink errors come back verbatim.
///
/// # Panics
///
/// Panics if `capacity` is zero, or to propagate a panic from the source.
///
/// # Example
///
/// ```rust
/// let blob: Vec<u8> = (0..=255).cycle().take(100_000).collect();
///
/// let mut sink = Vec::new();
/// let copied = bufpipe::copy(&mut sink, &mut blob.as_slice(), 4096).unwrap();
///
/// assert_eq!(blob.len() as u64, copied);
/// assert_eq!(blob, sink);
/// ```
pub fn copy<W, R>(dst: &mut W, src: &mut R, capacity: usize) -> IOResult<u64>
where
    W: Write + ?Sized,
    R: Read + Send + ?Sized,
{
    let (writer, mut reader) = pipe(capacity);

    thread::scope(|s| {
        let feeder = s.spawn(move || {
            let mut writer = writer;
            match writer.read_from(src) {
                Ok(fed) => {
                    writer.close_with(None);
                    Ok(fed)
                }
                Err(err) => {
                    // The reader drains what made it into the ring, then
                    // receives this instead of a clean end of stream.
                    let err = Arc::new(err);
                    writer.close_with(Some(PipeError::Io(err.clone())));
                    Err(PipeError::Io(err))
                }
            }
        });

        let drained = reader.write_to(dst);
        // Retiring the read half before the join: a feeder still blocked
        // on a full ring wakes against the closed pipe instead of waiting
        // for a consumer that will never come back.
        drop(reader);

        let fed = match feeder.join() {
            Ok(outcome) => outcome,
            Err(payload) => panic::resume_unwind(payload),
        };

        match drained {
            Ok(total) => {
                if let Err(err) = fed {
                    return Err(err.into());
                }
                tracing::debug!(bytes = total, capacity, "buffered copy complete");
                Ok(total)
            }
            Err(err) => Err(err),
        }
    })
}
