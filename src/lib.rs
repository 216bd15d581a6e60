//! Streaming archive enumeration with strict single-pass discipline.
//!
//! `arcstream` walks a (possibly compressed) tar archive with a lazy,
//! forward-only cursor. At most one member is live at a time, each member's
//! payload is fetched or skipped exactly once, and memory stays bounded no
//! matter how large the archive is. The intended consumer is an installer
//! or mod manager that inspects a few members, extracts some, and skips the
//! rest without paying for payloads it never touches.
//!
//! - [`ArchiveCursor`] — open an archive, advance member by member.
//! - [`Member`] — metadata snapshot plus a one-shot claim on the payload
//!   (fetch into memory, skip, or stream to disk with [`Member::extract`]).
//! - [`ArchiveError`] — the complete failure taxonomy; end of archive is
//!   `Ok(None)`, not an error.
//!
//! Gzip and zstd compression are detected by magic bytes at open time.
//! Progress ([`Progress`]) counts compressed input bytes, so it can be
//! compared against the file size while extraction is running, and
//! [`CancelToken`] lets another thread stop the walk between (or inside)
//! operations.

mod backend;
mod cursor;
mod encoding;
mod error;
mod extract;
mod member;

pub use backend::{CancelToken, Options, Progress};
pub use cursor::{ArchiveCursor, Members};
pub use encoding::PathEncoding;
pub use error::{ArchiveError, Result, Warning, ERROR_DOMAIN};
pub use member::{EntryKind, Member, Phase};
