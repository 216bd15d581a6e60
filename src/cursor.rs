//! The forward-only cursor over an archive's members.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use crate::backend::{Backing, CancelToken, Options, Progress};
use crate::encoding::PathEncoding;
use crate::error::{ArchiveError, Result};
use crate::member::{Member, Phase};

/// State shared between a cursor and the members it issues.
#[derive(Debug)]
pub(crate) struct CursorInner {
    pub(crate) backing: Option<Backing>,
    /// Bumped on every advance and on close; members carry the value that
    /// was current when they were issued.
    pub(crate) epoch: u64,
    /// Payload phase of the member stamped with the current epoch.
    pub(crate) live_phase: Phase,
    /// First fatal error observed; redelivered once by `next_member`.
    pub(crate) fatal: Option<ArchiveError>,
    pub(crate) busy: BusyFlag,
}

impl CursorInner {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        CursorInner {
            backing: None,
            epoch: 0,
            live_phase: Phase::Fresh,
            fatal: None,
            busy: BusyFlag::default(),
        }
    }
}

/// Lock the shared cell. A poisoned mutex only means a panic unwound while
/// holding it; the state itself stays coherent.
pub(crate) fn lock(inner: &Mutex<CursorInner>) -> MutexGuard<'_, CursorInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Debug-build detector for overlapping entry into core operations.
///
/// The shared mutex already serializes callers; this flag exists to assert
/// the single-threaded usage contract when it is circumvented.
#[derive(Debug, Default)]
pub(crate) struct BusyFlag(AtomicBool);

impl BusyFlag {
    pub(crate) fn enter(&self) -> BusyGuard<'_> {
        let was_busy = self.0.swap(true, Ordering::Acquire);
        debug_assert!(!was_busy, "overlapping archive operations detected");
        BusyGuard(self)
    }
}

pub(crate) struct BusyGuard<'a>(&'a BusyFlag);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::Release);
    }
}

/// A lazy, forward-only cursor over the members of an archive.
///
/// `next_member` yields one [`Member`] at a time; advancing implicitly
/// skips an unconsumed payload and invalidates the previously issued
/// member. End of archive is `Ok(None)`. After a fatal error the same
/// error is redelivered on the following call, and the one after that
/// reports end of archive.
///
/// # Example
///
/// ```no_run
/// use arcstream::{ArchiveCursor, PathEncoding};
///
/// # fn main() -> arcstream::Result<()> {
/// let mut cursor = ArchiveCursor::open("mods.tar.gz", PathEncoding::Utf8)?;
/// while let Some(mut member) = cursor.next_member()? {
///     let name = member.pathname()?.to_owned();
///     if name.ends_with(".plist") {
///         let bytes = member.data()?;
///         println!("{name}: {} bytes", bytes.len());
///     }
///     // Unconsumed payloads are skipped on the next call.
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ArchiveCursor {
    inner: Arc<Mutex<CursorInner>>,
    cancel: CancelToken,
    progress: Progress,
    fatal_redelivered: bool,
    ended: bool,
}

impl ArchiveCursor {
    /// Open an archive with default options and the given path encoding.
    pub fn open(path: impl AsRef<Path>, encoding: PathEncoding) -> Result<Self> {
        Self::open_with(
            path,
            Options {
                encoding,
                ..Options::default()
            },
        )
    }

    /// Open an archive with full control over limits and encoding.
    pub fn open_with(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let cancel = CancelToken::new();
        let backing = Backing::open(path.as_ref(), opts, cancel.clone())?;
        let progress = backing.progress();
        Ok(ArchiveCursor {
            inner: Arc::new(Mutex::new(CursorInner {
                backing: Some(backing),
                epoch: 0,
                live_phase: Phase::Fresh,
                fatal: None,
                busy: BusyFlag::default(),
            })),
            cancel,
            progress,
            fatal_redelivered: false,
            ended: false,
        })
    }

    /// Advance to the next member. `Ok(None)` at end of archive.
    ///
    /// If the current member's payload was neither fetched nor skipped it
    /// is skipped here; either way the current member is invalidated.
    pub fn next_member(&mut self) -> Result<Option<Member>> {
        if self.ended {
            return Ok(None);
        }
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let _busy = inner.busy.enter();

        if let Some(fatal) = inner.fatal.clone() {
            if self.fatal_redelivered {
                self.ended = true;
                return Ok(None);
            }
            self.fatal_redelivered = true;
            return Err(fatal);
        }

        let skipped = {
            let backing = match inner.backing.as_mut() {
                Some(backing) => backing,
                None => {
                    self.ended = true;
                    return Ok(None);
                }
            };
            if backing.payload_pending() {
                trace!("implicitly skipping unconsumed payload");
                backing.skip_data()
            } else {
                Ok(())
            }
        };
        if let Err(err) = skipped {
            if err.is_fatal() {
                inner.fatal = Some(err.clone());
            }
            return Err(err);
        }

        // The previous member, if any, is now stale.
        inner.epoch += 1;
        inner.live_phase = Phase::Fresh;

        let next = match inner.backing.as_mut() {
            Some(backing) => backing.next_header(),
            None => Ok(None),
        };
        match next {
            Ok(Some(snapshot)) => {
                let warning = inner.backing.as_mut().and_then(Backing::take_warning);
                let stamp = inner.epoch;
                Ok(Some(Member::new(
                    Arc::clone(&self.inner),
                    stamp,
                    snapshot,
                    warning,
                )))
            }
            Ok(None) => {
                debug!("end of archive");
                self.ended = true;
                Ok(None)
            }
            Err(err) => {
                if err.is_fatal() {
                    inner.fatal = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Iterator adapter over `next_member`. Yields a fatal error once,
    /// then fuses.
    pub fn members(&mut self) -> Members<'_> {
        Members {
            cursor: self,
            fused: false,
        }
    }

    /// Release the backing file. Idempotent; invalidates the live member.
    /// Bytes already fetched by a member remain readable.
    pub fn close(&mut self) {
        let mut guard = lock(&self.inner);
        if guard.backing.take().is_some() {
            debug!("closed archive");
        }
        guard.epoch += 1;
        guard.live_phase = Phase::Fresh;
        drop(guard);
        self.ended = true;
    }

    /// Request cooperative cancellation; the next operation that would
    /// touch the backing returns [`ArchiveError::Cancelled`] instead.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token for cancelling from another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Handle onto the compressed-bytes-consumed counter.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }
}

impl Drop for ArchiveCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator over a cursor's members. See [`ArchiveCursor::members`].
#[derive(Debug)]
pub struct Members<'a> {
    cursor: &'a mut ArchiveCursor,
    fused: bool,
}

impl Iterator for Members<'_> {
    type Item = Result<Member>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.cursor.next_member() {
            Ok(Some(member)) => Some(Ok(member)),
            Ok(None) => {
                self.fused = true;
                None
            }
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}
