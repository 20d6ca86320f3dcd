//! Tar archive expansion.
//!
//! Upstream archives are plain tars whose members are already gzip parts,
//! but gzip-wrapped tars are accepted too; the wrapper is detected from the
//! first two bytes.

use flate2::read::MultiGzDecoder;
use snafu::prelude::*;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

use super::ArchiveExpander;
use crate::error::{DownloadError, ExtractArchiveSnafu, OpenArchiveSnafu};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extracts plain and gzip-compressed tar archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarExpander;

fn is_gzip(file: &mut File) -> std::io::Result<bool> {
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(read == 2 && magic == GZIP_MAGIC)
}

fn unpack<R: Read>(reader: R, archive: &Path, destination: &Path) -> Result<usize, DownloadError> {
    let mut tar = tar::Archive::new(reader);
    let mut count = 0usize;

    for entry in tar.entries().context(ExtractArchiveSnafu { path: archive })? {
        let mut entry = entry.context(ExtractArchiveSnafu { path: archive })?;
        // unpack_in refuses members that would escape `destination`
        let unpacked = entry
            .unpack_in(destination)
            .context(ExtractArchiveSnafu { path: archive })?;
        if unpacked {
            count += 1;
        } else {
            debug!(archive = %archive.display(), "Skipped member outside destination");
        }
    }
    Ok(count)
}

impl ArchiveExpander for TarExpander {
    fn expand(&self, archive: &Path, destination: &Path) -> Result<usize, DownloadError> {
        let mut file = File::open(archive).context(OpenArchiveSnafu { path: archive })?;
        std::fs::create_dir_all(destination).context(ExtractArchiveSnafu { path: destination })?;

        let gzipped = is_gzip(&mut file).context(OpenArchiveSnafu { path: archive })?;
        let reader = BufReader::new(file);
        let count = if gzipped {
            unpack(MultiGzDecoder::new(reader), archive, destination)?
        } else {
            unpack(reader, archive, destination)?
        };

        info!(
            archive = %archive.display(),
            destination = %destination.display(),
            members = count,
            gzipped,
            "Expanded archive"
        );
        Ok(count)
    }
}
