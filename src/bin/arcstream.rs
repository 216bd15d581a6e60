use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use arcstream::{ArchiveCursor, EntryKind, Member, PathEncoding};

/// arcstream
#[derive(Debug, Parser)]
#[clap(name = "arcstream", version)]
struct App {
    /// Decode member names as Latin-1 instead of UTF-8
    #[clap(long)]
    latin1: bool,

    /// The archive to read (tar, tar.gz, or tar.zst)
    archive: PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lists the members of the archive
    List,
    /// Writes one member's payload to stdout
    Cat {
        /// the member's path name inside the archive
        name: String,
    },
    /// Extracts every member into a directory
    Extract {
        /// the destination directory
        #[clap(default_value = ".")]
        dest: PathBuf,
    },
}

fn encoding(app: &App) -> PathEncoding {
    if app.latin1 {
        PathEncoding::Latin1
    } else {
        PathEncoding::Utf8
    }
}

fn display_name(member: &Member) -> String {
    match member.pathname() {
        Ok(name) => name.to_owned(),
        Err(_) => match member.c_pathname() {
            Ok(raw) => String::from_utf8_lossy(raw).into_owned(),
            Err(_) => "<unnamed>".to_owned(),
        },
    }
}

fn type_char(kind: EntryKind) -> char {
    match kind {
        EntryKind::Regular => '-',
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::HardLink => 'h',
        EntryKind::Other => '?',
    }
}

fn list(cursor: &mut ArchiveCursor) -> Result<()> {
    for member in cursor.members() {
        let member = member?;
        let kind = member.entry_type()?;
        let size = member.size()?;
        if let Some(warning) = member.warning() {
            eprintln!("warning: {warning}");
        }
        println!("{} {:>10} {}", type_char(kind), size, display_name(&member));
    }
    Ok(())
}

fn cat(cursor: &mut ArchiveCursor, name: &str) -> Result<()> {
    for member in cursor.members() {
        let mut member = member?;
        if member.pathname().map(|p| p == name).unwrap_or(false) {
            let bytes = member.data()?;
            std::io::stdout().write_all(bytes)?;
            return Ok(());
        }
    }
    bail!("no member named {name:?} in the archive");
}

/// Map a member name to a path under `dest`, refusing anything that could
/// land outside of it.
fn dest_path(dest: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name.trim_start_matches('/'));
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("refusing member path {name:?}"),
        }
    }
    Ok(dest.join(relative))
}

fn extract(cursor: &mut ArchiveCursor, dest: &Path) -> Result<()> {
    let progress = cursor.progress();
    let bar = ProgressBar::new(progress.total_bytes());
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {wide_msg}")
            .context("progress bar template")?,
    );

    let mut extracted = 0u64;
    for member in cursor.members() {
        let mut member = member?;
        let kind = member.entry_type()?;
        let name = display_name(&member);
        if let Some(warning) = member.warning() {
            bar.println(format!("warning: {name}: {warning}"));
        }
        if kind == EntryKind::Other {
            bar.println(format!("skipping {name} (special file)"));
        } else {
            let dst = dest_path(dest, &name)?;
            match member.extract(&dst, true) {
                Ok(()) => extracted += 1,
                // Already-present files are left alone.
                Err(arcstream::ArchiveError::DestinationExists { path }) => {
                    bar.println(format!("exists, not overwritten: {path:?}"));
                }
                Err(err) => return Err(err).context(format!("extracting {name}")),
            }
        }
        bar.set_position(progress.bytes_consumed());
        bar.set_message(name);
    }
    bar.finish_and_clear();
    println!("extracted {extracted} members to {dest:?}");
    Ok(())
}

fn main() -> Result<()> {
    let app = App::parse();
    let mut cursor = ArchiveCursor::open(&app.archive, encoding(&app))
        .with_context(|| format!("opening {:?}", app.archive))?;

    match &app.cmd {
        Command::List => list(&mut cursor),
        Command::Cat { name } => cat(&mut cursor, name),
        Command::Extract { dest } => extract(&mut cursor, dest),
    }
}
