//! The backing adapter: file handle, decompression stack, and block-level
//! tar parsing.
//!
//! Everything below the cursor lives here. The adapter owns the open file,
//! sniffs the compression by magic bytes, counts compressed input bytes for
//! progress reporting, and walks the tar stream one 512-byte block at a
//! time, accumulating GNU long-name/long-link and PAX extended headers until
//! an actual entry arrives. No `std::io::Error` or `tar`-crate type escapes
//! this module; every failure is translated into [`ArchiveError`].

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use log::{debug, trace, warn};
use tar::{EntryType, PaxExtensions};

use crate::encoding::PathEncoding;
use crate::error::{ArchiveError, Result, Warning};
use crate::extract;
use crate::member::EntryKind;

const BLOCK: usize = 512;
const SKIP_CHUNK: usize = 8192;
const COPY_CHUNK: usize = 8192;

/// Tuning knobs for opening an archive.
///
/// The size limits protect against malicious or malformed archives that
/// could exhaust memory; exceeding one fails the affected entry with a
/// header-category error rather than allocating.
#[derive(Debug, Clone)]
pub struct Options {
    /// Encoding used to decode member path names.
    pub encoding: PathEncoding,
    /// Largest payload `fetch_data` will materialize in memory.
    pub max_payload: u64,
    /// Maximum path length in bytes (paths and link targets).
    pub max_path_len: usize,
    /// Maximum size of one PAX extended header's content.
    pub max_pax_size: u64,
    /// Maximum size of one GNU long-name/long-link entry's content.
    pub max_gnu_long_size: u64,
    /// Maximum consecutive metadata entries before an actual entry.
    pub max_meta_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            encoding: PathEncoding::Utf8,
            max_payload: 256 * 1024 * 1024,
            max_path_len: 4096,
            max_pax_size: 1024 * 1024,
            max_gnu_long_size: 4096,
            max_meta_entries: 16,
        }
    }
}

/// Cooperative cancellation flag shared between a cursor and its owner's
/// other threads.
///
/// Cancelling is sticky: once set, every subsequent backing operation
/// returns [`ArchiveError::Cancelled`] before touching the archive.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cloneable handle onto the progress counter of one archive.
///
/// `bytes_consumed` counts compressed input bytes, so it is monotone and
/// comparable against `total_bytes` (the input file length) even while a
/// decompressor sits in between.
#[derive(Debug, Clone)]
pub struct Progress {
    consumed: Arc<AtomicU64>,
    total: u64,
}

impl Progress {
    /// Compressed input bytes consumed so far.
    #[must_use]
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Length of the input file in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Completion in `0.0..=1.0` (1.0 for an empty input).
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.bytes_consumed() as f64 / self.total as f64
    }
}

/// Reader wrapper that adds every byte read to a shared counter.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        CountingReader { inner, count }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

fn sniff_compression(magic: &[u8]) -> Compression {
    if magic.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

/// Metadata resolved for one actual entry, copied out of the stream.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
    pub raw_path: Vec<u8>,
    pub pathname: Option<String>,
    pub size: u64,
    pub kind: EntryKind,
    pub raw_link_target: Option<Vec<u8>>,
    pub link_target: Option<String>,
    pub mode: Option<u32>,
    pub mtime: Option<i64>,
}

/// GNU/PAX metadata accumulated ahead of the entry it describes.
#[derive(Debug, Default)]
struct PendingMeta {
    long_name: Option<Vec<u8>>,
    long_link: Option<Vec<u8>>,
    pax: Option<Vec<u8>>,
    count: usize,
}

impl PendingMeta {
    fn is_empty(&self) -> bool {
        self.long_name.is_none() && self.long_link.is_none() && self.pax.is_none()
    }
}

/// Payload bookkeeping for the entry whose header was just yielded.
#[derive(Debug)]
struct CurrentPayload {
    remaining: u64,
    padding: u64,
}

/// The backing adapter. One per open archive; owned by the cursor's shared
/// inner cell and dropped on `close`.
pub(crate) struct Backing {
    reader: Box<dyn Read + Send>,
    opts: Options,
    cancel: CancelToken,
    consumed: Arc<AtomicU64>,
    input_len: u64,
    header_buf: [u8; BLOCK],
    pending: PendingMeta,
    pending_warning: Option<Warning>,
    current: Option<CurrentPayload>,
    pos: u64,
    done: bool,
}

impl Backing {
    pub(crate) fn open(path: &Path, opts: Options, cancel: CancelToken) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| ArchiveError::open_failed(&e))?;
        let input_len = file
            .metadata()
            .map_err(|e| ArchiveError::open_failed(&e))?
            .len();

        let mut magic = [0u8; 4];
        let mut got = 0;
        while got < magic.len() {
            match file.read(&mut magic[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArchiveError::open_failed(&e)),
            }
        }
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ArchiveError::open_failed(&e))?;

        let compression = sniff_compression(&magic[..got]);
        let consumed = Arc::new(AtomicU64::new(0));
        let counting = CountingReader::new(file, Arc::clone(&consumed));
        let reader: Box<dyn Read + Send> = match compression {
            Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(counting))),
            Compression::Zstd => Box::new(
                zstd::stream::read::Decoder::new(counting)
                    .map_err(|e| ArchiveError::open_failed(&e))?,
            ),
            Compression::None => Box::new(BufReader::new(counting)),
        };

        debug!("opened {path:?}: {input_len} bytes, {compression:?}");
        Ok(Backing {
            reader,
            opts,
            cancel,
            consumed,
            input_len,
            header_buf: [0u8; BLOCK],
            pending: PendingMeta::default(),
            pending_warning: None,
            current: None,
            pos: 0,
            done: false,
        })
    }

    pub(crate) fn progress(&self) -> Progress {
        Progress {
            consumed: Arc::clone(&self.consumed),
            total: self.input_len,
        }
    }

    pub(crate) fn bytes_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Warning recorded while parsing the most recent entry, if any.
    pub(crate) fn take_warning(&mut self) -> Option<Warning> {
        self.pending_warning.take()
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        Ok(())
    }

    /// Advance to the next actual entry's header.
    ///
    /// `Ok(None)` at end of archive (zero block or clean EOF). On success
    /// the entry's payload is pending: exactly one of `read_data`,
    /// `skip_data`, or `extract_current` must run before the next call.
    pub(crate) fn next_header(&mut self) -> Result<Option<EntrySnapshot>> {
        self.check_cancel()?;
        if self.done {
            return Ok(None);
        }
        debug_assert!(self.current.is_none(), "previous payload not consumed");

        loop {
            if self.pending.count > self.opts.max_meta_entries {
                return Err(ArchiveError::header(format!(
                    "more than {} consecutive metadata entries",
                    self.opts.max_meta_entries
                )));
            }

            if !self.read_header_block()? {
                self.done = true;
                if !self.pending.is_empty() {
                    return Err(ArchiveError::header(
                        "archive ends amid GNU/PAX metadata entries",
                    ));
                }
                return Ok(None);
            }

            if self.header_buf.iter().all(|&b| b == 0) {
                self.done = true;
                if !self.pending.is_empty() {
                    return Err(ArchiveError::header(
                        "archive ends amid GNU/PAX metadata entries",
                    ));
                }
                return Ok(None);
            }

            let header_pos = self.pos - BLOCK as u64;
            let stored = header(&self.header_buf).cksum().map_err(|_| {
                ArchiveError::header(format!("unparseable checksum field at offset {header_pos}"))
            })?;
            if stored != block_checksum(&self.header_buf) {
                return Err(ArchiveError::header(format!(
                    "checksum mismatch at offset {header_pos}"
                )));
            }

            let size = header(&self.header_buf)
                .entry_size()
                .map_err(|_| ArchiveError::header(format!("bad size field at offset {header_pos}")))?;
            if size > i64::MAX as u64 {
                return Err(ArchiveError::header(format!(
                    "entry size {size} exceeds the representable range"
                )));
            }
            let padded = size
                .checked_next_multiple_of(BLOCK as u64)
                .ok_or_else(|| ArchiveError::header(format!("entry size {size} overflows")))?;

            match header(&self.header_buf).entry_type() {
                EntryType::GNULongName => {
                    let data = self.read_meta(size, padded, "GNU long name")?;
                    if self.pending.long_name.replace(data).is_some() {
                        return Err(ArchiveError::header("duplicate GNU long name entry"));
                    }
                    self.pending.count += 1;
                }
                EntryType::GNULongLink => {
                    let data = self.read_meta(size, padded, "GNU long link")?;
                    if self.pending.long_link.replace(data).is_some() {
                        return Err(ArchiveError::header("duplicate GNU long link entry"));
                    }
                    self.pending.count += 1;
                }
                EntryType::XHeader => {
                    if size > self.opts.max_pax_size {
                        return Err(ArchiveError::header(format!(
                            "PAX header of {size} bytes exceeds the {} byte limit",
                            self.opts.max_pax_size
                        )));
                    }
                    let mut data = vec![0u8; size as usize];
                    self.read_payload(&mut data)
                        .map_err(|e| ArchiveError::header_io(&e))?;
                    self.discard(padded - size)
                        .map_err(|e| ArchiveError::header_io(&e))?;
                    if self.pending.pax.replace(data).is_some() {
                        return Err(ArchiveError::header("duplicate PAX extended header"));
                    }
                    self.pending.count += 1;
                }
                EntryType::XGlobalHeader => {
                    // Global headers would apply to all subsequent entries;
                    // nothing this layer surfaces depends on them.
                    self.discard(padded)
                        .map_err(|e| ArchiveError::header_io(&e))?;
                }
                EntryType::GNUSparse => {
                    return Err(ArchiveError::header("GNU sparse entries are not supported"));
                }
                _ => {
                    let long_name = self.pending.long_name.take();
                    let long_link = self.pending.long_link.take();
                    let pax = self.pending.pax.take();
                    self.pending.count = 0;

                    let snapshot = self.resolve_entry(size, long_name, long_link, pax)?;
                    // A PAX size record overrides the header field, and the
                    // payload on the wire follows the PAX value.
                    let size = snapshot.size;
                    if size > i64::MAX as u64 {
                        return Err(ArchiveError::header(format!(
                            "entry size {size} exceeds the representable range"
                        )));
                    }
                    let padded = size
                        .checked_next_multiple_of(BLOCK as u64)
                        .ok_or_else(|| {
                            ArchiveError::header(format!("entry size {size} overflows"))
                        })?;
                    self.current = Some(CurrentPayload {
                        remaining: size,
                        padding: padded - size,
                    });
                    trace!(
                        "entry at offset {header_pos}: {:?} ({} bytes, {:?})",
                        snapshot.pathname,
                        snapshot.size,
                        snapshot.kind
                    );
                    return Ok(Some(snapshot));
                }
            }
        }
    }

    /// Materialize the pending payload, enforcing the in-memory cap before
    /// consuming any stream bytes so the caller can still skip or extract.
    pub(crate) fn read_data(&mut self) -> Result<Vec<u8>> {
        self.check_cancel()?;
        let cur = match self.current.take() {
            Some(cur) => cur,
            None => return Err(ArchiveError::data_read("no payload is pending")),
        };
        if cur.remaining > self.opts.max_payload {
            let size = cur.remaining;
            self.current = Some(cur);
            return Err(ArchiveError::PayloadTooLarge {
                size,
                cap: self.opts.max_payload,
            });
        }
        let mut buf = vec![0u8; cur.remaining as usize];
        self.read_payload(&mut buf)
            .map_err(|e| ArchiveError::data_read_io(&e))?;
        self.discard(cur.padding)
            .map_err(|e| ArchiveError::data_read_io(&e))?;
        Ok(buf)
    }

    /// Discard the pending payload in fixed-size chunks.
    pub(crate) fn skip_data(&mut self) -> Result<()> {
        self.check_cancel()?;
        let cur = match self.current.take() {
            Some(cur) => cur,
            None => return Err(ArchiveError::data_read("no payload is pending")),
        };
        self.discard(cur.remaining + cur.padding)
            .map_err(|e| ArchiveError::data_read_io(&e))
    }

    /// Stream the pending payload to `dst`, preserving the entry type.
    ///
    /// Failures that occur before any payload byte is consumed (a bad
    /// destination, an unsupported entry type) leave the payload pending so
    /// the caller can retry or skip. A failed or cancelled copy removes the
    /// partial destination file.
    pub(crate) fn extract_current(
        &mut self,
        snapshot: &EntrySnapshot,
        dst: &Path,
        create_parents: bool,
    ) -> Result<()> {
        self.check_cancel()?;
        if self.current.is_none() {
            return Err(ArchiveError::extraction("no payload is pending"));
        }

        extract::prepare(dst, create_parents)?;

        match snapshot.kind {
            EntryKind::Regular => self.copy_payload_to(dst)?,
            EntryKind::Directory => {
                extract::create_dir(dst)?;
                self.consume_pending()?;
            }
            EntryKind::Symlink => {
                let target = snapshot
                    .raw_link_target
                    .as_deref()
                    .ok_or_else(|| ArchiveError::extraction("symlink entry has no target"))?;
                extract::create_symlink(target, dst)?;
                self.consume_pending()?;
            }
            EntryKind::HardLink => {
                let target = snapshot
                    .raw_link_target
                    .as_deref()
                    .ok_or_else(|| ArchiveError::extraction("hard link entry has no target"))?;
                extract::create_hardlink(target, dst)?;
                self.consume_pending()?;
            }
            EntryKind::Other => {
                return Err(ArchiveError::extraction(
                    "entry type cannot be extracted to a file",
                ));
            }
        }
        debug!("extracted {:?} to {dst:?}", snapshot.pathname);
        Ok(())
    }

    /// Copy the pending payload into a freshly created file, chunk by chunk
    /// with a cancellation check per chunk.
    fn copy_payload_to(&mut self, dst: &Path) -> Result<()> {
        use std::io::Write;

        let cur = match self.current.take() {
            Some(cur) => cur,
            None => return Err(ArchiveError::extraction("no payload is pending")),
        };
        let mut file = match extract::create_file(dst) {
            Ok(file) => file,
            Err(err) => {
                self.current = Some(cur);
                return Err(err);
            }
        };

        let mut remaining = cur.remaining;
        let mut buf = [0u8; COPY_CHUNK];
        while remaining > 0 {
            if self.cancel.is_cancelled() {
                drop(file);
                extract::discard_partial(dst);
                return Err(ArchiveError::Cancelled);
            }
            let want = remaining.min(buf.len() as u64) as usize;
            if let Err(e) = self.read_payload(&mut buf[..want]) {
                drop(file);
                extract::discard_partial(dst);
                return Err(ArchiveError::data_read_io(&e));
            }
            remaining -= want as u64;
            if let Err(e) = file.write_all(&buf[..want]) {
                drop(file);
                extract::discard_partial(dst);
                // Resync to the next header so iteration can continue.
                self.discard(remaining + cur.padding)
                    .map_err(|e2| ArchiveError::data_read_io(&e2))?;
                return Err(ArchiveError::extraction_io(&e));
            }
        }
        if let Err(e) = self.discard(cur.padding) {
            drop(file);
            extract::discard_partial(dst);
            return Err(ArchiveError::data_read_io(&e));
        }
        Ok(())
    }

    /// Discard the pending payload, if any.
    fn consume_pending(&mut self) -> Result<()> {
        if let Some(cur) = self.current.take() {
            self.discard(cur.remaining + cur.padding)
                .map_err(|e| ArchiveError::data_read_io(&e))?;
        }
        Ok(())
    }

    /// True while the current entry's payload has not been consumed.
    pub(crate) fn payload_pending(&self) -> bool {
        self.current.is_some()
    }

    // =======================================================================
    // Stream primitives
    // =======================================================================

    /// Read one header block. `Ok(false)` on clean EOF before any byte.
    fn read_header_block(&mut self) -> Result<bool> {
        let mut total = 0;
        while total < BLOCK {
            match self.reader.read(&mut self.header_buf[total..]) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(false);
                    }
                    return Err(ArchiveError::header(format!(
                        "unexpected end of file in entry header at offset {}",
                        self.pos + total as u64
                    )));
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArchiveError::header_io(&e)),
            }
        }
        self.pos += BLOCK as u64;
        Ok(true)
    }

    fn read_payload(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.reader.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn discard(&mut self, len: u64) -> std::io::Result<()> {
        let mut remaining = len;
        let mut buf = [0u8; SKIP_CHUNK];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            self.reader.read_exact(&mut buf[..want])?;
            remaining -= want as u64;
        }
        self.pos += len;
        Ok(())
    }

    fn read_meta(&mut self, size: u64, padded: u64, what: &str) -> Result<Vec<u8>> {
        if size > self.opts.max_gnu_long_size {
            return Err(ArchiveError::header(format!(
                "{what} of {size} bytes exceeds the {} byte limit",
                self.opts.max_gnu_long_size
            )));
        }
        let mut data = vec![0u8; size as usize];
        self.read_payload(&mut data)
            .map_err(|e| ArchiveError::header_io(&e))?;
        self.discard(padded - size)
            .map_err(|e| ArchiveError::header_io(&e))?;
        if data.last() == Some(&0) {
            data.pop();
        }
        if data.len() > self.opts.max_path_len {
            return Err(ArchiveError::header(format!(
                "{what} of {} bytes exceeds the {} byte path limit",
                data.len(),
                self.opts.max_path_len
            )));
        }
        Ok(data)
    }

    /// Merge the header fields with accumulated GNU/PAX metadata. PAX wins
    /// over GNU, GNU wins over the bare header.
    fn resolve_entry(
        &mut self,
        header_size: u64,
        long_name: Option<Vec<u8>>,
        long_link: Option<Vec<u8>>,
        pax: Option<Vec<u8>>,
    ) -> Result<EntrySnapshot> {
        let hdr = header(&self.header_buf);

        let mut raw_path: Vec<u8> = hdr.path_bytes().into_owned();
        let mut raw_link: Option<Vec<u8>> = hdr.link_name_bytes().map(|l| l.into_owned());
        let mut size = header_size;
        let mode = hdr.mode().ok();
        let mut mtime = hdr.mtime().ok().map(|m| m as i64);

        if let Some(name) = long_name {
            raw_path = name;
        }
        if let Some(link) = long_link {
            raw_link = Some(link);
        }

        if let Some(pax) = pax {
            for record in PaxExtensions::new(&pax) {
                let record = match record {
                    Ok(record) => record,
                    Err(_) => {
                        self.note_warning("malformed PAX record ignored");
                        break;
                    }
                };
                let key = match record.key() {
                    Ok(key) => key,
                    Err(_) => {
                        self.note_warning("non-UTF-8 PAX key ignored");
                        continue;
                    }
                };
                let value = record.value_bytes();
                match key {
                    "path" => {
                        if value.len() > self.opts.max_path_len {
                            return Err(ArchiveError::header(format!(
                                "PAX path of {} bytes exceeds the {} byte limit",
                                value.len(),
                                self.opts.max_path_len
                            )));
                        }
                        raw_path = value.to_vec();
                    }
                    "linkpath" => {
                        if value.len() > self.opts.max_path_len {
                            return Err(ArchiveError::header(format!(
                                "PAX linkpath of {} bytes exceeds the {} byte limit",
                                value.len(),
                                self.opts.max_path_len
                            )));
                        }
                        raw_link = Some(value.to_vec());
                    }
                    "size" => {
                        if let Ok(Ok(s)) = record.value().map(str::parse::<u64>) {
                            size = s;
                        }
                    }
                    "mtime" => {
                        // PAX mtime may carry a fractional part; truncate.
                        if let Ok(v) = record.value() {
                            if let Some(whole) = v.split('.').next() {
                                if let Ok(m) = whole.parse::<i64>() {
                                    mtime = Some(m);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if raw_path.len() > self.opts.max_path_len {
            return Err(ArchiveError::header(format!(
                "path of {} bytes exceeds the {} byte limit",
                raw_path.len(),
                self.opts.max_path_len
            )));
        }

        let pathname = self.opts.encoding.decode(&raw_path);
        let link_target = raw_link
            .as_deref()
            .and_then(|l| self.opts.encoding.decode(l));
        let kind = match hdr.entry_type() {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Link => EntryKind::HardLink,
            _ => EntryKind::Other,
        };

        Ok(EntrySnapshot {
            raw_path,
            pathname,
            size,
            kind,
            raw_link_target: raw_link,
            link_target,
            mode,
            mtime,
        })
    }

    fn note_warning(&mut self, message: &str) {
        warn!("{message}");
        if self.pending_warning.is_none() {
            self.pending_warning = Some(Warning::new(message));
        }
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backing")
            .field("pos", &self.pos)
            .field("done", &self.done)
            .field("input_len", &self.input_len)
            .finish_non_exhaustive()
    }
}

/// View the raw block as a `tar::Header` without copying.
fn header(block: &[u8; BLOCK]) -> tar::Header {
    let mut hdr = tar::Header::new_old();
    hdr.as_mut_bytes().copy_from_slice(block);
    hdr
}

/// Standard tar checksum: byte sum with the checksum field read as spaces.
fn block_checksum(block: &[u8; BLOCK]) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in block.iter().enumerate() {
        sum += if (148..156).contains(&i) { 0x20 } else { u32::from(b) };
    }
    sum
}
