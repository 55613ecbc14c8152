use std::io::{Error, ErrorKind};
use std::sync::Arc;

/// Failure classes generated or re-surfaced by a pipe.
///
/// At the `Read`/`Write` boundary these travel inside a [`std::io::Error`];
/// use [`Error::get_ref`] and a downcast to tell a pipe-generated condition
/// apart from an error forwarded verbatim from a user source or sink.
///
/// ```rust
/// use std::io::Write;
///
/// let (mut writer, reader) = bufpipe::pipe(8);
/// drop(reader);
///
/// let err = writer.write(b"hello").unwrap_err();
/// let inner = err.get_ref().and_then(|e| e.downcast_ref::<bufpipe::PipeError>());
/// assert!(matches!(inner, Some(bufpipe::PipeError::Closed)));
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum PipeError {
    /// The operation met a closed counterpart it was not prepared to see.
    #[error("read/write on closed pipe")]
    Closed,

    /// A sink accepted fewer bytes than it was offered without reporting
    /// an error of its own. Fatal to the draining call.
    #[error("sink accepted fewer bytes than offered")]
    ShortWrite,

    /// An error attached by a half at close time, handed to the peer once
    /// the buffered bytes are accounted for.
    #[error("{0}")]
    Io(Arc<Error>),
}

impl From<PipeError> for Error {
    fn from(err: PipeError) -> Self {
        let kind = match &err {
            PipeError::Closed => ErrorKind::BrokenPipe,
            PipeError::ShortWrite => ErrorKind::WriteZero,
            PipeError::Io(inner) => inner.kind(),
        };
        Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_maps_to_broken_pipe() {
        let err: Error = PipeError::Closed.into();
        assert_eq!(ErrorKind::BrokenPipe, err.kind());
    }

    #[test]
    fn short_write_maps_to_write_zero() {
        let err: Error = PipeError::ShortWrite.into();
        assert_eq!(ErrorKind::WriteZero, err.kind());
    }

    #[test]
    fn attached_error_keeps_its_kind() {
        let attached = PipeError::Io(Arc::new(Error::new(ErrorKind::TimedOut, "upstream stalled")));
        let err: Error = attached.clone().into();
        assert_eq!(ErrorKind::TimedOut, err.kind());
        assert!(err.to_string().contains("upstream stalled"));

        // A second surfacing of the same attached error is identical.
        let again: Error = attached.into();
        assert_eq!(ErrorKind::TimedOut, again.kind());
    }
}
