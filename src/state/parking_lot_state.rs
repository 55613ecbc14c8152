use parking_lot::{Mutex, MutexGuard};

use crate::error::PipeError;

/// Errors attached by each half at close time.
#[derive(Debug, Default)]
pub(crate) struct ErrorCells {
    /// Attached by the write half, handed to the reader after the drain.
    pub(crate) write_err: Option<PipeError>,
    /// Attached by the read half. Recorded for diagnostics only.
    pub(crate) read_err: Option<PipeError>,
}

/// Mutex-guarded close-time error cells. Only the close paths lock this.
#[derive(Debug, Default)]
pub(crate) struct SharedErrors(Mutex<ErrorCells>);

impl SharedErrors {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ErrorCells> {
        self.0.lock()
    }
}
