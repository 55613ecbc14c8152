//! # bufpipe
//! A ring-buffered pipe that connects code producing a stream of bytes to
//! code consuming one, with a fixed amount of slack between them. The
//! writer blocks only once the ring is full and the reader only while it
//! is empty, so a fast side never outruns a slow one by more than the
//! chosen capacity.
//!
//! Single thread usage example:
//! ```rust
//! use std::io::{read_to_string, Write};
//!
//! let (mut writer, reader) = bufpipe::pipe(16);
//! writer.write_all("hello".as_bytes()).unwrap();
//! drop(writer);
//!
//! assert_eq!("hello".to_string(), read_to_string(reader).unwrap());
//! ```
//!
//! Multi thread usage example:
//! ```rust
//! use std::io::{Read, Write};
//! use std::thread;
//!
//! let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
//! let (mut writer, mut reader) = bufpipe::pipe(64);
//!
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         writer.write_all(&data).unwrap();
//!         drop(writer);
//!     });
//!
//!     let mut out = Vec::new();
//!     reader.read_to_end(&mut out).unwrap();
//!     assert_eq!(data, out);
//! });
//! ```
//!
//! The easiest way to use the pipe is not to touch it at all: [`copy`]
//! builds one internally and runs both sides for you.
//! ```rust
//! let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
//!
//! let mut sink = Vec::new();
//! let copied = bufpipe::copy(&mut sink, &mut data.as_slice(), 4096).unwrap();
//! assert_eq!(data.len() as u64, copied);
//! ```
//!
//! Important: writing more than the capacity and then reading on the same
//! thread deadlocks, the writer is waiting for room only the reader can
//! make. Put the halves on separate threads (or use [`async_pipe`] and
//! separate tasks) for anything larger than the ring.
//!
//! Closing is asymmetric by design. A writer that goes away leaves its
//! buffered bytes behind for the reader to drain, then the stream ends
//! with end of file or whatever error the writer attached. A reader that
//! goes away discards the buffered bytes and fails the writer's next
//! operation, it asked for the stream to stop, in-flight data included.

mod async_pipe;
mod copy;
mod error;
mod ring;
mod state;
mod sync_pipe;
#[cfg(test)]
mod testutil;

pub use crate::async_pipe::{async_pipe, AsyncReader, AsyncWriter};
pub use crate::copy::copy;
pub use crate::error::PipeError;
pub use crate::sync_pipe::{pipe, Reader, Writer};
