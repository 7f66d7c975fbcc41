use sha1::{Digest, Sha1};

use bencoder::bencode::{Bencode, BencodeError};

use crate::Sha1Hash;

use super::info::{FromInfoError, Info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce_url: String,
    pub info: Info,
    pub info_hash: Sha1Hash,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FromTorrentError {
    BencodeError(BencodeError),
    MissingAnnounce,
    MissingInfo,
    FromInfoError(FromInfoError),
    NotADict,
}

impl Torrent {
    /// Builds a `Torrent` from the raw bytes of a torrent file.
    ///
    /// The info-hash is the SHA-1 over the exact byte slice of the bencoded
    /// `info` value as it appears in `data`, never over a re-encoding, so
    /// torrents with extra `info` keys keep their real identity.
    ///
    /// It returns a `FromTorrentError` if:
    /// - The data is not valid bencode or not a dictionary.
    /// - The `announce` or `info` keys are missing.
    /// - The `info` dictionary itself is malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Torrent, FromTorrentError> {
        let decoded = Bencode::decode(data).map_err(FromTorrentError::BencodeError)?;
        let d = match decoded {
            Bencode::BDict(d) => d,
            _ => return Err(FromTorrentError::NotADict),
        };

        let announce_url = match d.get(&b"announce"[..]) {
            Some(Bencode::BString(s)) => {
                String::from_utf8(s.clone()).map_err(|_| FromTorrentError::MissingAnnounce)?
            }
            _ => return Err(FromTorrentError::MissingAnnounce),
        };

        let info_bencode = match d.get(&b"info"[..]) {
            Some(info) => info,
            None => return Err(FromTorrentError::MissingInfo),
        };
        let info = Info::from(info_bencode).map_err(FromTorrentError::FromInfoError)?;

        let info_slice = Self::raw_info_slice(data)?;
        let info_hash: Sha1Hash = Sha1::digest(info_slice).into();

        Ok(Torrent {
            announce_url,
            info,
            info_hash,
        })
    }

    /// Finds the exact byte extent of the top level `info` value by walking
    /// the dictionary entry by entry with the span-aware decoder.
    fn raw_info_slice(data: &[u8]) -> Result<&[u8], FromTorrentError> {
        if data.first() != Some(&b'd') {
            return Err(FromTorrentError::NotADict);
        }

        let mut i = 1;
        loop {
            if i >= data.len() || data[i] == b'e' {
                return Err(FromTorrentError::MissingInfo);
            }
            let (key, size) =
                Bencode::decode_prefix(&data[i..]).map_err(FromTorrentError::BencodeError)?;
            i += size;
            let value_start = i;
            let (_, size) =
                Bencode::decode_prefix(&data[i..]).map_err(FromTorrentError::BencodeError)?;
            i += size;

            if key == Bencode::BString(b"info".to_vec()) {
                return Ok(&data[value_start..i]);
            }
        }
    }

    /// Returns the name of the torrent.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Returns the size of pieces of the torrent.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    /// Returns the length in bytes of the whole torrent.
    pub fn total_length(&self) -> u64 {
        self.info.total_length
    }

    /// Returns the number of pieces of the torrent.
    pub fn total_pieces(&self) -> u32 {
        self.info.total_pieces()
    }

    /// Returns the length of the given piece.
    pub fn piece_len(&self, index: u32) -> u32 {
        self.info.piece_len(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_full() {
        let mut info_bytes = Vec::new();
        info_bytes.extend(b"d6:lengthi100e4:name7:example12:piece lengthi20e6:pieces100:");
        info_bytes.extend(vec![0u8; 100]);
        info_bytes.push(b'e');
        let data = build_torrent_bytes(b"http://example.com/announce", &info_bytes);

        let torrent = Torrent::from_bytes(&data).unwrap();

        assert_eq!(torrent.announce_url, "http://example.com/announce");
        assert_eq!(torrent.name(), "example");
        assert_eq!(torrent.piece_length(), 20);
        assert_eq!(torrent.total_length(), 100);
        assert_eq!(torrent.total_pieces(), 5);
    }

    #[test]
    fn test_info_hash_is_sha1_of_raw_info_slice() {
        let info_bytes = build_info_bytes();
        let data = build_torrent_bytes(b"http://example.com/announce", &info_bytes);

        let torrent = Torrent::from_bytes(&data).unwrap();

        let expected: Sha1Hash = Sha1::digest(&info_bytes).into();
        assert_eq!(torrent.info_hash, expected);
    }

    #[test]
    fn test_info_hash_ignores_keys_after_info() {
        // A key sorting after "info" must not leak into the hashed slice.
        let info_bytes = build_info_bytes();
        let mut data = Vec::new();
        data.extend(b"d8:announce27:http://example.com/announce4:info");
        data.extend(&info_bytes);
        data.extend(b"8:url-list14:http://mirror/e");

        let torrent = Torrent::from_bytes(&data).unwrap();

        let expected: Sha1Hash = Sha1::digest(&info_bytes).into();
        assert_eq!(torrent.info_hash, expected);
    }

    #[test]
    fn test_from_bytes_missing_announce() {
        let data = b"d4:infod6:lengthi20e4:name7:example12:piece lengthi20e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

        assert_eq!(
            Torrent::from_bytes(data).unwrap_err(),
            FromTorrentError::MissingAnnounce
        );
    }

    #[test]
    fn test_from_bytes_missing_info() {
        let data = b"d8:announce27:http://example.com/announcee";

        assert_eq!(
            Torrent::from_bytes(data).unwrap_err(),
            FromTorrentError::MissingInfo
        );
    }

    #[test]
    fn test_from_bytes_not_a_dict() {
        let data = b"4:spam";

        assert_eq!(
            Torrent::from_bytes(data).unwrap_err(),
            FromTorrentError::NotADict
        );
    }

    // Auxiliary functions

    fn build_info_bytes() -> Vec<u8> {
        let mut info_bytes = Vec::new();
        info_bytes.extend(b"d6:lengthi20e4:name7:example12:piece lengthi20e6:pieces20:");
        info_bytes.extend((1..=20).collect::<Vec<u8>>());
        info_bytes.push(b'e');
        info_bytes
    }

    fn build_torrent_bytes(announce: &[u8], info_bytes: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(b"d8:announce");
        data.extend(announce.len().to_string().into_bytes());
        data.push(b':');
        data.extend(announce);
        data.extend(b"4:info");
        data.extend(info_bytes);
        data.push(b'e');
        data
    }
}
