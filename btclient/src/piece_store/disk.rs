use std::fs::{self, File, OpenOptions};
use std::io::{Error, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::torrent_parser::info::TorrentFile;

trait WriteWithOffset {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error>;
}

impl WriteWithOffset for File {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}

trait ReadWithOffset {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), Error>;
}

impl ReadWithOffset for File {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Creates the parent directory of every output file under `download_dir`.
pub fn prepare_output_paths(download_dir: &Path, files: &[TorrentFile]) -> Result<(), Error> {
    for file in files {
        let path = download_dir.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Writes `data` at absolute position `start` of the virtual concatenated
/// stream, splitting it across every file whose extent it intersects.
///
/// Files are opened read-write if they exist and created otherwise. `files`
/// must be ordered by offset and cover the stream contiguously.
pub fn write_span(
    download_dir: &Path,
    files: &[TorrentFile],
    start: u64,
    data: &[u8],
) -> Result<(), Error> {
    let mut cursor = start;
    let mut src_pos = 0;
    let mut remaining = data.len() as u64;

    for file in files {
        if remaining == 0 {
            break;
        }
        let file_start = file.offset;
        let file_end = file.offset + file.length;
        if cursor >= file_end || cursor + remaining <= file_start {
            continue;
        }

        let count = (file_end.min(cursor + remaining) - cursor) as usize;
        let mut handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(download_dir.join(&file.path))?;
        handle.write_all_at(&data[src_pos..src_pos + count], cursor - file_start)?;

        src_pos += count;
        cursor += count as u64;
        remaining -= count as u64;
    }

    Ok(())
}

/// Reads `length` bytes at absolute position `start` of the virtual stream,
/// gathering them from every file whose extent intersects the range.
///
/// Missing or short files surface as the underlying io error.
pub fn read_span(
    download_dir: &Path,
    files: &[TorrentFile],
    start: u64,
    length: usize,
) -> Result<Vec<u8>, Error> {
    let mut cursor = start;
    let mut remaining = length as u64;
    let mut data = Vec::with_capacity(length);

    for file in files {
        if remaining == 0 {
            break;
        }
        let file_start = file.offset;
        let file_end = file.offset + file.length;
        if cursor >= file_end || cursor + remaining <= file_start {
            continue;
        }

        let count = (file_end.min(cursor + remaining) - cursor) as usize;
        let mut handle = OpenOptions::new()
            .read(true)
            .open(download_dir.join(&file.path))?;
        let mut buffer = vec![0; count];
        handle.read_exact_at(&mut buffer, cursor - file_start)?;
        data.extend(buffer);

        cursor += count as u64;
        remaining -= count as u64;
    }

    if data.len() != length {
        return Err(Error::from(std::io::ErrorKind::UnexpectedEof));
    }

    Ok(data)
}
