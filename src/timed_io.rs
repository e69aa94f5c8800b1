//! Timed I/O driver: deadline-bounded record write/read.
//!
//! Both loops busy-poll the engine: one attempt, then a deadline check, then
//! continue or stop.  Neither loop sleeps; the raw connection's receive
//! timeout (10 ms once established) is the only place time passes while
//! idle.
//!
//! Outcomes:
//!
//! | operation | outcome                        | result                   |
//! |-----------|--------------------------------|--------------------------|
//! | write     | everything sent                | `Ok(len)`                |
//! | write     | deadline hit                   | `Err(WriteTimeout(n))`   |
//! | write     | hard engine error              | `Err(WriteError{..})`    |
//! | read      | buffer filled                  | `Ok(len)`                |
//! | read      | deadline hit, some bytes       | `Err(ReadTimeout(n))`    |
//! | read      | deadline hit, nothing          | `Err(NothingToRead)`     |
//! | read      | hard engine error              | `Err(ReadError{..})`     |

use core::time::Duration;

use log::{trace, warn};

use crate::error::IoError;
use crate::ports::{Clock, RawConnection};
use crate::tls::{EngineError, TlsEngine};

/// A monotonic expiry point.  Fixed when the operation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    expires_at: Duration,
}

impl Deadline {
    /// `timeout` from now.
    pub fn after(clock: &impl Clock, timeout: Duration) -> Self {
        Self {
            expires_at: clock.now().saturating_add(timeout),
        }
    }

    /// An absolute expiry on `clock`'s time line.
    pub fn at(expires_at: Duration) -> Self {
        Self { expires_at }
    }

    pub fn expires_at(&self) -> Duration {
        self.expires_at
    }

    pub fn has_expired(&self, clock: &impl Clock) -> bool {
        clock.now() >= self.expires_at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self, clock: &impl Clock) -> Duration {
        self.expires_at.saturating_sub(clock.now())
    }
}

/// Write all of `data` before `deadline`.
///
/// Each positive engine return is one fragment; the cursor only advances on
/// progress.  `Ok(0)` and would-block results are retried.
pub fn write<E, C, K>(
    engine: &mut E,
    link: &mut C,
    clock: &K,
    data: &[u8],
    deadline: Deadline,
) -> Result<usize, IoError>
where
    E: TlsEngine,
    C: RawConnection,
    K: Clock,
{
    let mut written = 0;
    let mut fragments = 0u32;

    while written < data.len() && !deadline.has_expired(clock) {
        match engine.write(link, &data[written..]) {
            Ok(n) if n > 0 => {
                written += n.min(data.len() - written);
                fragments += 1;
            }
            Ok(_) => {}
            Err(e) if e.is_would_block() => {}
            Err(e) => {
                warn!("STA: write failed after {}B ({})", written, e);
                return Err(IoError::WriteError { written });
            }
        }
    }

    if written < data.len() {
        return Err(IoError::WriteTimeout(written));
    }
    trace!("STA: wrote {}B in {} fragment(s)", written, fragments);
    Ok(written)
}

/// Fill `buf` before `deadline`.
///
/// `Ok(0)`, would-block and record-read timeouts are not fatal; the loop
/// re-checks the deadline after every attempt, so at least one read is
/// always made.
pub fn read<E, C, K>(
    engine: &mut E,
    link: &mut C,
    clock: &K,
    buf: &mut [u8],
    deadline: Deadline,
) -> Result<usize, IoError>
where
    E: TlsEngine,
    C: RawConnection,
    K: Clock,
{
    if buf.is_empty() {
        return Ok(0);
    }

    let mut read = 0;
    loop {
        match engine.read(link, &mut buf[read..]) {
            Ok(n) => read += n.min(buf.len() - read),
            Err(e) if e.is_would_block() || e == EngineError::Timeout => {}
            Err(e) => {
                warn!("STA: read failed after {}B ({})", read, e);
                return Err(IoError::ReadError { read });
            }
        }
        if read == buf.len() || deadline.has_expired(clock) {
            break;
        }
    }

    match read {
        0 => Err(IoError::NothingToRead),
        n if n < buf.len() => Err(IoError::ReadTimeout(n)),
        n => Ok(n),
    }
}
