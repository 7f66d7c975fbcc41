use bencoder::bencode::Bencode;

use crate::Sha1Hash;

/// One file of the torrent, with its start offset inside the virtual
/// concatenated stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: String,
    pub length: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<Sha1Hash>,
    pub files: Vec<TorrentFile>,
    pub total_length: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FromInfoError {
    MissingName,
    MissingLength,
    MissingPieceLength,
    MissingPieces,
    InvalidPieces,
    InvalidFiles,
    NotADict,
}

impl Info {
    /// Builds an `Info` from the decoded `info` dictionary of a torrent.
    ///
    /// Handles both single-file torrents (a top level `length`) and
    /// multi-file torrents (a `files` list of `{length, path}` entries whose
    /// paths live under the `name` directory).
    ///
    /// It returns a `FromInfoError` if a required key is missing or the
    /// `pieces` string is not a multiple of 20 bytes.
    pub fn from(bencode: &Bencode) -> Result<Info, FromInfoError> {
        let d = match bencode {
            Bencode::BDict(d) => d,
            _ => return Err(FromInfoError::NotADict),
        };

        let name = match d.get(&b"name"[..]) {
            Some(Bencode::BString(s)) => String::from_utf8(s.clone())
                .map_err(|_| FromInfoError::MissingName)?,
            _ => return Err(FromInfoError::MissingName),
        };

        let piece_length = match d.get(&b"piece length"[..]) {
            Some(Bencode::BNumber(n)) if *n > 0 => *n as u64,
            _ => return Err(FromInfoError::MissingPieceLength),
        };

        let pieces = match d.get(&b"pieces"[..]) {
            Some(Bencode::BString(raw)) => Self::create_pieces(raw)?,
            _ => return Err(FromInfoError::MissingPieces),
        };

        let files = match d.get(&b"files"[..]) {
            Some(file_list) => Self::create_files(&name, file_list)?,
            None => {
                let length = match d.get(&b"length"[..]) {
                    Some(Bencode::BNumber(n)) if *n >= 0 => *n as u64,
                    _ => return Err(FromInfoError::MissingLength),
                };
                vec![TorrentFile {
                    path: name.clone(),
                    length,
                    offset: 0,
                }]
            }
        };

        let total_length = files.iter().map(|f| f.length).sum();

        Ok(Info {
            name,
            piece_length,
            pieces,
            files,
            total_length,
        })
    }

    fn create_pieces(raw: &[u8]) -> Result<Vec<Sha1Hash>, FromInfoError> {
        if raw.len() % 20 != 0 {
            return Err(FromInfoError::InvalidPieces);
        }
        Ok(raw
            .chunks(20)
            .map(|chunk| {
                let mut hash: Sha1Hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    fn create_files(name: &str, bencode: &Bencode) -> Result<Vec<TorrentFile>, FromInfoError> {
        let entries = match bencode {
            Bencode::BList(list) => list,
            _ => return Err(FromInfoError::InvalidFiles),
        };

        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0;

        for entry in entries {
            let d = match entry {
                Bencode::BDict(d) => d,
                _ => return Err(FromInfoError::InvalidFiles),
            };

            let length = match d.get(&b"length"[..]) {
                Some(Bencode::BNumber(n)) if *n >= 0 => *n as u64,
                _ => return Err(FromInfoError::InvalidFiles),
            };

            let parts = match d.get(&b"path"[..]) {
                Some(Bencode::BList(parts)) => parts,
                _ => return Err(FromInfoError::InvalidFiles),
            };
            let mut segments = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    Bencode::BString(s) => segments.push(
                        String::from_utf8(s.clone()).map_err(|_| FromInfoError::InvalidFiles)?,
                    ),
                    _ => return Err(FromInfoError::InvalidFiles),
                }
            }
            if segments.is_empty() {
                return Err(FromInfoError::InvalidFiles);
            }

            // Multi-file paths live under the torrent's name directory.
            files.push(TorrentFile {
                path: format!("{}/{}", name, segments.join("/")),
                length,
                offset,
            });
            offset += length;
        }

        if files.is_empty() {
            return Err(FromInfoError::InvalidFiles);
        }

        Ok(files)
    }

    /// Returns the number of pieces.
    pub fn total_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Returns the length in bytes of the given piece. Only the last piece
    /// may be shorter than `piece_length`.
    pub fn piece_len(&self, index: u32) -> u32 {
        let num_pieces = self.total_pieces();
        if index + 1 < num_pieces {
            self.piece_length as u32
        } else {
            (self.total_length - self.piece_length * (num_pieces as u64 - 1)) as u32
        }
    }
}
