//! Worker side of an out-of-process counting job.
//!
//! The worker reads a single [`JobRequest`] from its input, runs the matching
//! counter and streams [`JobMessage`]s to its output, one JSON document per
//! line, flushing after each so the runner sees progress as it happens.

use std::io::{Read, Write};

use crate::counter::{count_points, sum_pixels, CountObserver, CountOptions};
use crate::message::{JobKind, JobMessage, JobRequest, JobResult};
use crate::tile::TileRef;
use crate::tile_source::TileSource;
use crate::{Error, Result};

/// Writes counter events as job messages.
struct MessageWriter<W: Write> {
    output: W,
    failed: Option<std::io::Error>,
}

impl<W: Write> MessageWriter<W> {
    fn new(output: W) -> Self {
        Self {
            output,
            failed: None,
        }
    }

    /// Send one message. After the first write failure (the runner hung up)
    /// further messages are dropped.
    fn send(&mut self, message: &JobMessage) {
        if self.failed.is_some() {
            return;
        }
        let result = message
            .to_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|line| {
                writeln!(self.output, "{}", line)?;
                self.output.flush()
            });
        if let Err(e) = result {
            log::warn!("Lost connection to runner: {}", e);
            self.failed = Some(e);
        }
    }

    fn finish(self) -> Result<()> {
        match self.failed {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }
}

impl<W: Write> CountObserver for MessageWriter<W> {
    fn on_progress(&mut self, processed: usize, total: usize) {
        self.send(&JobMessage::Step {
            progress: processed,
            total,
        });
    }

    fn on_tile_error(&mut self, _tile: &TileRef, error: &Error) {
        self.send(&JobMessage::TileError {
            message: error.to_string(),
        });
    }
}

/// Run one job request against `source`, returning its aggregate.
///
/// A tile cap in the request takes precedence over `options.max_tiles`.
pub fn execute(
    request: &JobRequest,
    source: &dyn TileSource,
    options: &CountOptions,
    observer: &mut dyn CountObserver,
) -> Result<JobResult> {
    let ring = request.ring();
    let options = CountOptions {
        max_tiles: request.max_tiles.or(options.max_tiles),
        ..options.clone()
    };

    match request.kind {
        JobKind::Points => {
            let result = count_points(ring.as_ref(), &request.layer, source, &options, observer)?;
            Ok(JobResult::Points {
                count: result.count,
                total: result.total,
                elapsed_ms: result.elapsed.as_millis() as u64,
            })
        }
        JobKind::Pixels => {
            let result = sum_pixels(ring.as_ref(), &request.layer, source, &options, observer)?;
            Ok(JobResult::Pixels {
                sum: result.sum,
                role: result.role,
                elapsed_ms: result.elapsed.as_millis() as u64,
            })
        }
    }
}

/// Serve one job: read the request from `input`, write messages to `output`.
///
/// Job failures are reported as an `error` message and are not errors of
/// this function; only a broken output channel is.
pub fn run_worker<R: Read, W: Write>(
    mut input: R,
    output: W,
    source: &dyn TileSource,
) -> Result<()> {
    let mut writer = MessageWriter::new(output);

    let mut raw = String::new();
    let request = input
        .read_to_string(&mut raw)
        .map_err(Error::from)
        .and_then(|_| serde_json::from_str::<JobRequest>(&raw).map_err(Error::from));

    let request = match request {
        Ok(request) => request,
        Err(e) => {
            log::error!("Invalid job request: {}", e);
            writer.send(&JobMessage::Error {
                message: format!("invalid job request: {}", e),
            });
            return writer.finish();
        }
    };

    log::info!(
        "Worker {} started {:?} job for layer '{}'",
        std::process::id(),
        request.kind,
        request.layer.name
    );

    let terminal = match execute(&request, source, &CountOptions::new(), &mut writer) {
        Ok(result) => JobMessage::Complete { result },
        Err(e) => JobMessage::Error {
            message: e.to_string(),
        },
    };
    writer.send(&terminal);
    writer.finish()
}
