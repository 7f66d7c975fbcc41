pub mod config;
pub mod peer;
pub mod piece_store;
pub mod session;
pub mod torrent_parser;
pub mod tracker;

/// The peer ID is an arbitrary 20 byte string.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The size of a block, the unit in which piece data travels over the wire.
/// All blocks are this size except possibly the last one of a piece.
pub const BLOCK_SIZE: u32 = 16384;

/// Incoming REQUEST messages asking for more than this are dropped.
pub const MAX_REQUEST_SIZE: u32 = 32 * 1024;
