use std::{
    fs::File,
    io::{BufReader, Error, Read},
};

use super::torrent::{FromTorrentError, Torrent};

#[derive(Debug)]
pub enum ParseError {
    IoError(Error),
    FromTorrentError(FromTorrentError),
}

pub struct TorrentParser;

impl TorrentParser {
    /// Given a path to a torrent file, it parses the file and returns a
    /// `Torrent` struct.
    ///
    /// # Errors
    ///
    /// * `ParseError::IoError` - An error occurred while reading the file
    /// * `ParseError::FromTorrentError` - The file is not a valid torrent
    pub fn parse(filepath: &str) -> Result<Torrent, ParseError> {
        let buffer = TorrentParser::read_file(filepath).map_err(ParseError::IoError)?;
        Torrent::from_bytes(&buffer).map_err(ParseError::FromTorrentError)
    }

    fn read_file(filepath: &str) -> Result<Vec<u8>, Error> {
        let file = File::open(filepath)?;
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();

        reader.read_to_end(&mut buffer)?;

        Ok(buffer)
    }
}
