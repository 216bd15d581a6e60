//! Members: the per-entry values a cursor hands out.
//!
//! A member is a snapshot of one entry's metadata plus a claim on that
//! entry's payload. At most one member is live at a time; advancing the
//! cursor (or closing it) bumps an epoch counter that invalidates the
//! previously issued member. Payload bytes fetched before the member went
//! stale remain readable; everything else on a stale member fails with
//! [`ArchiveError::MemberInvalidated`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::error;

use crate::backend::EntrySnapshot;
use crate::cursor::{lock, CursorInner};
use crate::error::{ArchiveError, Result, Warning};

/// What kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    /// Fifos, device nodes, and other types that cannot be extracted.
    Other,
}

/// Lifecycle of a member's payload.
///
/// A member starts `Fresh`; exactly one of `fetch_data`, `skip_data`, or
/// `extract` moves it to a consumed state. Advancing the cursor makes it
/// `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    DataFetched,
    DataSkipped,
    Invalid,
}

/// One archive entry, as issued by [`ArchiveCursor::next_member`].
///
/// Metadata accessors come in predicate/accessor pairs: probe with
/// `has_*` and the accessor fails with
/// [`ArchiveError::MetadataUnavailable`] when the attribute was not
/// recorded for this entry.
///
/// [`ArchiveCursor::next_member`]: crate::ArchiveCursor::next_member
#[derive(Debug)]
pub struct Member {
    shared: Arc<Mutex<CursorInner>>,
    stamp: u64,
    snapshot: EntrySnapshot,
    data: Option<Vec<u8>>,
    warning: Option<Warning>,
}

impl Member {
    pub(crate) fn new(
        shared: Arc<Mutex<CursorInner>>,
        stamp: u64,
        snapshot: EntrySnapshot,
        warning: Option<Warning>,
    ) -> Self {
        Member {
            shared,
            stamp,
            snapshot,
            data: None,
            warning,
        }
    }

    fn misuse(&self, err: ArchiveError) -> ArchiveError {
        error!("{err} (member {:?})", self.snapshot.pathname);
        err
    }

    /// Fail unless this member is still the cursor's live member.
    fn check(&self) -> Result<()> {
        let guard = lock(&self.shared);
        if guard.epoch != self.stamp {
            return Err(self.misuse(ArchiveError::MemberInvalidated));
        }
        Ok(())
    }

    // =======================================================================
    // Metadata
    // =======================================================================

    /// Whether the path name decoded in the configured encoding.
    pub fn has_pathname(&self) -> Result<bool> {
        self.check()?;
        Ok(self.snapshot.pathname.is_some())
    }

    pub fn pathname(&self) -> Result<&str> {
        self.check()?;
        self.snapshot
            .pathname
            .as_deref()
            .ok_or(ArchiveError::MetadataUnavailable {
                attribute: "pathname",
            })
    }

    /// The path name as raw bytes, unaffected by the encoding.
    pub fn c_pathname(&self) -> Result<&[u8]> {
        self.check()?;
        if self.snapshot.raw_path.is_empty() {
            return Err(ArchiveError::MetadataUnavailable {
                attribute: "pathname",
            });
        }
        Ok(&self.snapshot.raw_path)
    }

    pub fn has_size(&self) -> Result<bool> {
        self.check()?;
        Ok(true)
    }

    /// Declared payload size in bytes.
    pub fn size(&self) -> Result<i64> {
        self.check()?;
        Ok(self.snapshot.size as i64)
    }

    pub fn entry_type(&self) -> Result<EntryKind> {
        self.check()?;
        Ok(self.snapshot.kind)
    }

    pub fn has_link_target(&self) -> Result<bool> {
        self.check()?;
        Ok(self.snapshot.raw_link_target.is_some())
    }

    /// Target of a symlink or hard link entry, decoded.
    pub fn link_target(&self) -> Result<&str> {
        self.check()?;
        self.snapshot
            .link_target
            .as_deref()
            .ok_or(ArchiveError::MetadataUnavailable {
                attribute: "link_target",
            })
    }

    pub fn raw_link_target(&self) -> Result<&[u8]> {
        self.check()?;
        self.snapshot
            .raw_link_target
            .as_deref()
            .ok_or(ArchiveError::MetadataUnavailable {
                attribute: "link_target",
            })
    }

    /// Permission bits from the entry header.
    pub fn mode(&self) -> Result<u32> {
        self.check()?;
        self.snapshot
            .mode
            .ok_or(ArchiveError::MetadataUnavailable { attribute: "mode" })
    }

    /// Modification time, seconds since the epoch.
    pub fn mtime(&self) -> Result<i64> {
        self.check()?;
        self.snapshot
            .mtime
            .ok_or(ArchiveError::MetadataUnavailable { attribute: "mtime" })
    }

    /// Advisory recorded while this entry's headers were parsed, if any.
    /// Available even after the member goes stale.
    pub fn warning(&self) -> Option<&Warning> {
        self.warning.as_ref()
    }

    /// Current lifecycle phase. Stale members report [`Phase::Invalid`].
    pub fn phase(&self) -> Phase {
        let guard = lock(&self.shared);
        if guard.epoch != self.stamp {
            Phase::Invalid
        } else {
            guard.live_phase
        }
    }

    // =======================================================================
    // Payload
    // =======================================================================

    /// Materialize the payload into memory.
    ///
    /// Allowed exactly once per member, and only while the member is live
    /// and `Fresh`. A [`ArchiveError::PayloadTooLarge`] or
    /// [`ArchiveError::Cancelled`] failure leaves the member `Fresh`.
    pub fn fetch_data(&mut self) -> Result<()> {
        let mut guard = lock(&self.shared);
        let inner = &mut *guard;
        let _busy = inner.busy.enter();
        if inner.epoch != self.stamp {
            return Err(self.misuse(ArchiveError::MemberInvalidated));
        }
        match inner.live_phase {
            Phase::Fresh => {}
            Phase::DataFetched => {
                return Err(self.misuse(ArchiveError::WrongPhase {
                    consumed: "fetched",
                }))
            }
            Phase::DataSkipped => {
                return Err(self.misuse(ArchiveError::WrongPhase {
                    consumed: "skipped",
                }))
            }
            Phase::Invalid => return Err(self.misuse(ArchiveError::MemberInvalidated)),
        }
        let backing = match inner.backing.as_mut() {
            Some(backing) => backing,
            None => return Err(self.misuse(ArchiveError::MemberInvalidated)),
        };
        match backing.read_data() {
            Ok(bytes) => {
                inner.live_phase = Phase::DataFetched;
                self.data = Some(bytes);
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    inner.fatal = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Discard the payload without materializing it. Bounded memory
    /// regardless of the payload size.
    pub fn skip_data(&mut self) -> Result<()> {
        let mut guard = lock(&self.shared);
        let inner = &mut *guard;
        let _busy = inner.busy.enter();
        if inner.epoch != self.stamp {
            return Err(self.misuse(ArchiveError::MemberInvalidated));
        }
        match inner.live_phase {
            Phase::Fresh => {}
            Phase::DataFetched => {
                return Err(self.misuse(ArchiveError::WrongPhase {
                    consumed: "fetched",
                }))
            }
            Phase::DataSkipped => {
                return Err(self.misuse(ArchiveError::WrongPhase {
                    consumed: "skipped",
                }))
            }
            Phase::Invalid => return Err(self.misuse(ArchiveError::MemberInvalidated)),
        }
        let backing = match inner.backing.as_mut() {
            Some(backing) => backing,
            None => return Err(self.misuse(ArchiveError::MemberInvalidated)),
        };
        match backing.skip_data() {
            Ok(()) => {
                inner.live_phase = Phase::DataSkipped;
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    inner.fatal = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// The payload bytes. Fetches implicitly on a `Fresh` live member.
    ///
    /// Bytes fetched earlier stay readable even after the cursor advances
    /// or closes. A skipped payload is gone:
    /// [`ArchiveError::DataUnavailable`].
    pub fn data(&mut self) -> Result<&[u8]> {
        if self.data.is_none() {
            {
                let guard = lock(&self.shared);
                let fetchable = guard.epoch == self.stamp && guard.live_phase == Phase::Fresh;
                if !fetchable {
                    return Err(self.misuse(ArchiveError::DataUnavailable));
                }
            }
            self.fetch_data()?;
        }
        match self.data.as_deref() {
            Some(bytes) => Ok(bytes),
            None => Err(self.misuse(ArchiveError::DataUnavailable)),
        }
    }

    /// Stream the payload to `dst`, preserving the entry type.
    ///
    /// Consumes the payload: allowed only on a live `Fresh` member. A
    /// failure before any payload byte is consumed (bad destination,
    /// existing file) leaves the member `Fresh` for a retry or skip; a
    /// failed copy removes the partial destination file.
    pub fn extract(&mut self, dst: &Path, create_parents: bool) -> Result<()> {
        let mut guard = lock(&self.shared);
        let inner = &mut *guard;
        let _busy = inner.busy.enter();
        if inner.epoch != self.stamp {
            return Err(self.misuse(ArchiveError::MemberInvalidated));
        }
        match inner.live_phase {
            Phase::Fresh => {}
            Phase::DataFetched => {
                return Err(self.misuse(ArchiveError::WrongPhase {
                    consumed: "fetched",
                }))
            }
            Phase::DataSkipped => {
                return Err(self.misuse(ArchiveError::WrongPhase {
                    consumed: "skipped",
                }))
            }
            Phase::Invalid => return Err(self.misuse(ArchiveError::MemberInvalidated)),
        }
        let result = match inner.backing.as_mut() {
            Some(backing) => backing.extract_current(&self.snapshot, dst, create_parents),
            None => return Err(self.misuse(ArchiveError::MemberInvalidated)),
        };
        let pending = inner
            .backing
            .as_ref()
            .is_some_and(crate::backend::Backing::payload_pending);
        match &result {
            Ok(()) => inner.live_phase = Phase::DataSkipped,
            Err(err) => {
                if err.is_fatal() {
                    inner.fatal = Some(err.clone());
                }
                if !pending {
                    // The payload (or part of it) is gone from the stream.
                    inner.live_phase = Phase::DataSkipped;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pathname: Option<&str>) -> EntrySnapshot {
        EntrySnapshot {
            raw_path: pathname.map(|p| p.as_bytes().to_vec()).unwrap_or_default(),
            pathname: pathname.map(str::to_owned),
            size: 5,
            kind: EntryKind::Regular,
            raw_link_target: None,
            link_target: None,
            mode: Some(0o644),
            mtime: None,
        }
    }

    fn member_with(shared: &Arc<Mutex<CursorInner>>, snapshot: EntrySnapshot) -> Member {
        let stamp = lock(shared).epoch;
        Member::new(Arc::clone(shared), stamp, snapshot, None)
    }

    #[test]
    fn stale_member_fails_everything_but_retained_data() {
        let shared = Arc::new(Mutex::new(CursorInner::detached()));
        let mut member = member_with(&shared, snapshot(Some("a.txt")));
        member.data = Some(b"hello".to_vec());

        lock(&shared).epoch += 1;

        assert!(matches!(
            member.pathname(),
            Err(ArchiveError::MemberInvalidated)
        ));
        assert!(matches!(member.size(), Err(ArchiveError::MemberInvalidated)));
        assert!(matches!(
            member.skip_data(),
            Err(ArchiveError::MemberInvalidated)
        ));
        assert_eq!(member.phase(), Phase::Invalid);
        // Already-fetched bytes survive invalidation.
        assert_eq!(member.data().unwrap(), b"hello".as_slice());
    }

    #[test]
    fn stale_member_without_bytes_has_no_data() {
        let shared = Arc::new(Mutex::new(CursorInner::detached()));
        let mut member = member_with(&shared, snapshot(Some("a.txt")));
        lock(&shared).epoch += 1;
        assert!(matches!(member.data(), Err(ArchiveError::DataUnavailable)));
    }

    #[test]
    fn absent_metadata_is_reported_per_attribute() {
        let shared = Arc::new(Mutex::new(CursorInner::detached()));
        let member = member_with(&shared, snapshot(None));

        assert!(!member.has_pathname().unwrap());
        assert!(matches!(
            member.pathname(),
            Err(ArchiveError::MetadataUnavailable {
                attribute: "pathname"
            })
        ));
        assert!(matches!(
            member.c_pathname(),
            Err(ArchiveError::MetadataUnavailable {
                attribute: "pathname"
            })
        ));
        assert!(!member.has_link_target().unwrap());
        assert!(matches!(
            member.mtime(),
            Err(ArchiveError::MetadataUnavailable { attribute: "mtime" })
        ));
        assert!(member.has_size().unwrap());
        assert_eq!(member.size().unwrap(), 5);
        assert_eq!(member.mode().unwrap(), 0o644);
    }

    #[test]
    fn skipped_payload_is_unavailable() {
        let shared = Arc::new(Mutex::new(CursorInner::detached()));
        let mut member = member_with(&shared, snapshot(Some("a.txt")));
        lock(&shared).live_phase = Phase::DataSkipped;
        assert!(matches!(member.data(), Err(ArchiveError::DataUnavailable)));
    }
}
