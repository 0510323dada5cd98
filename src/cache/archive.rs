//! Snapshot archive creation and extraction.
//!
//! Snapshots are gzip-compressed tarballs whose entries are relative to the
//! mirror directory. The system `tar` is preferred when present; otherwise the
//! `tar` and `flate2` crates produce and consume the same format.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

/// Errors returned by archive operations.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The native archiver exited unsuccessfully.
    #[error("{program} failed: {stderr}")]
    Native { program: String, stderr: String },
    /// Reading, writing or unpacking the archive failed.
    #[error("archive io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Capability used to pack and unpack snapshots, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extractor {
    /// A system `tar` binary.
    NativeArchiver { program: PathBuf },
    /// The in-process `tar` + `flate2` implementation.
    LibraryArchiver,
}

impl Extractor {
    /// Pick the native archiver when `tar` runs on this machine.
    pub fn detect() -> Self {
        let program = PathBuf::from("tar");
        let available = Command::new(&program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);

        if available {
            log::debug!("using native tar for snapshots");
            Extractor::NativeArchiver { program }
        } else {
            log::debug!("tar not found; using built-in archiver for snapshots");
            Extractor::LibraryArchiver
        }
    }

    /// Unpack `archive` into the existing directory `dest`.
    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
        match self {
            Extractor::NativeArchiver { program } => {
                let mut cmd = Command::new(program);
                cmd.arg("-xzf").arg(archive).arg("-C").arg(dest);
                run_native(cmd, program)
            }
            Extractor::LibraryArchiver => {
                let file = File::open(archive).map_err(io_error(archive))?;
                let mut unpacker = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
                unpacker.set_preserve_permissions(true);
                unpacker.unpack(dest).map_err(io_error(dest))
            }
        }
    }

    /// Pack the contents of `src_dir` into the archive file `out`.
    pub fn compress(&self, src_dir: &Path, out: &Path) -> Result<(), ArchiveError> {
        match self {
            Extractor::NativeArchiver { program } => {
                let mut cmd = Command::new(program);
                cmd.arg("-czf").arg(out).arg("-C").arg(src_dir).arg(".");
                run_native(cmd, program)
            }
            Extractor::LibraryArchiver => {
                let file = File::create(out).map_err(io_error(out))?;
                let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
                let mut builder = tar::Builder::new(encoder);
                builder.follow_symlinks(false);
                builder
                    .append_dir_all(".", src_dir)
                    .map_err(io_error(src_dir))?;
                let encoder = builder.into_inner().map_err(io_error(out))?;
                let mut writer = encoder.finish().map_err(io_error(out))?;
                io::Write::flush(&mut writer).map_err(io_error(out))
            }
        }
    }
}

fn run_native(mut cmd: Command, program: &Path) -> Result<(), ArchiveError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(io_error(program))?;
    if !output.status.success() {
        return Err(ArchiveError::Native {
            program: program.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}
