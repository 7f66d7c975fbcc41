use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the client configuration.
///
/// - `tcp_port`: port announced to the tracker,
/// - `download_dir`: directory where the downloaded files will be stored,
/// - `pipeline_depth`: max outstanding block requests per peer,
/// - `block_timeout_s`: idle timer while downloading a piece,
/// - `connect_timeout_s`: TCP connect and handshake deadline,
/// - `choke_period_s`: choke round interval,
/// - `unchoke_base_slots`: starting unchoke slot count (adjusted 2..10),
/// - `optimistic_every`: rounds between optimistic unchokes,
/// - `max_peers`: how many tracker endpoints to dial.
///
/// Every setting has a default, so a config file only needs the keys it
/// wants to override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfg {
    pub tcp_port: u16,
    pub download_dir: String,
    pub pipeline_depth: u32,
    pub block_timeout_s: u64,
    pub connect_timeout_s: u64,
    pub choke_period_s: u64,
    pub unchoke_base_slots: u32,
    pub optimistic_every: u32,
    pub max_peers: u32,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            tcp_port: 6881,
            download_dir: String::from("."),
            pipeline_depth: 50,
            block_timeout_s: 10,
            connect_timeout_s: 5,
            choke_period_s: 10,
            unchoke_base_slots: 4,
            optimistic_every: 3,
            max_peers: 50,
        }
    }
}

impl Cfg {
    /// Builds a `Cfg` from the config file at the given path. The format of
    /// the config file must be: {config_name}={config_value} (without
    /// brackets), one setting per line. Missing settings keep their default.
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be read.
    /// - A line is not a `name=value` pair.
    /// - A setting name is unknown.
    /// - A numeric setting does not parse.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self::default();

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let current_line = line?;
            if current_line.trim().is_empty() {
                continue;
            }
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = cfg.load_setting(setting[0], setting[1])?;
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::TCP_PORT => {
                self.tcp_port = self.parse_value(value, constants::TCP_PORT)?;
            }
            constants::DOWNLOAD_DIR => self.download_dir = String::from(value),

            constants::PIPELINE_DEPTH => {
                self.pipeline_depth = self.parse_value(value, constants::PIPELINE_DEPTH)?;
            }

            constants::BLOCK_TIMEOUT_S => {
                self.block_timeout_s = self.parse_value(value, constants::BLOCK_TIMEOUT_S)?;
            }

            constants::CONNECT_TIMEOUT_S => {
                self.connect_timeout_s = self.parse_value(value, constants::CONNECT_TIMEOUT_S)?;
            }

            constants::CHOKE_PERIOD_S => {
                self.choke_period_s = self.parse_value(value, constants::CHOKE_PERIOD_S)?;
            }

            constants::UNCHOKE_BASE_SLOTS => {
                self.unchoke_base_slots = self.parse_value(value, constants::UNCHOKE_BASE_SLOTS)?;
            }

            constants::OPTIMISTIC_EVERY => {
                self.optimistic_every = self.parse_value(value, constants::OPTIMISTIC_EVERY)?;
            }

            constants::MAX_PEERS => {
                self.max_peers = self.parse_value(value, constants::MAX_PEERS)?;
            }

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        match value.parse::<F>() {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parsed) => Ok(parsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    #[test]
    fn test_full_config() {
        let path = "./test_full_config.cfg";
        let contents = b"TCP_PORT=1000\nDOWNLOAD_DIR=./download\nPIPELINE_DEPTH=5\nBLOCK_TIMEOUT_S=20\nCONNECT_TIMEOUT_S=3\nCHOKE_PERIOD_S=15\nUNCHOKE_BASE_SLOTS=6\nOPTIMISTIC_EVERY=4\nMAX_PEERS=25";
        create_and_write_file(path, contents);

        let config = Cfg::new(path).unwrap();

        assert_eq!(config.tcp_port, 1000);
        assert_eq!(config.download_dir, "./download");
        assert_eq!(config.pipeline_depth, 5);
        assert_eq!(config.block_timeout_s, 20);
        assert_eq!(config.connect_timeout_s, 3);
        assert_eq!(config.choke_period_s, 15);
        assert_eq!(config.unchoke_base_slots, 6);
        assert_eq!(config.optimistic_every, 4);
        assert_eq!(config.max_peers, 25);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_empty_file_keeps_defaults() {
        let path = "./test_empty_file.cfg";
        create_and_write_file(path, b"");

        let config = Cfg::new(path).unwrap();

        assert_eq!(config, Cfg::default());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let path = "./test_partial_config.cfg";
        create_and_write_file(path, b"PIPELINE_DEPTH=10\nDOWNLOAD_DIR=/tmp/out");

        let config = Cfg::new(path).unwrap();

        assert_eq!(config.pipeline_depth, 10);
        assert_eq!(config.download_dir, "/tmp/out");
        assert_eq!(config.block_timeout_s, Cfg::default().block_timeout_s);
        assert_eq!(config.tcp_port, Cfg::default().tcp_port);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Cfg::default();

        assert_eq!(config.pipeline_depth, 50);
        assert_eq!(config.block_timeout_s, 10);
        assert_eq!(config.connect_timeout_s, 5);
        assert_eq!(config.choke_period_s, 10);
        assert_eq!(config.unchoke_base_slots, 4);
        assert_eq!(config.optimistic_every, 3);
        assert_eq!(config.download_dir, ".");
    }

    #[test]
    fn test_bad_path() {
        let config = Cfg::new("bad path");
        assert!(config.is_err());
    }

    #[test]
    fn test_setting_doesnt_exist() {
        let path = "./test_setting_doesnt_exist.cfg";
        create_and_write_file(path, b"WRONG_SETTING=1000");

        assert!(Cfg::new(path).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_tcp_port_not_a_number() {
        let path = "./test_tcp_port_not_a_number.cfg";
        create_and_write_file(path, b"TCP_PORT=abcd");

        assert!(Cfg::new(path).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_bad_format() {
        let path = "./test_bad_format.cfg";
        create_and_write_file(path, b"TCP_PORT=abcd=1234");

        assert!(Cfg::new(path).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_order_doesnt_matter() {
        let path = "./test_order_doesnt_matter.cfg";
        create_and_write_file(path, b"MAX_PEERS=1\nTCP_PORT=2500");

        let config = Cfg::new(path).unwrap();

        assert_eq!(config.max_peers, 1);
        assert_eq!(config.tcp_port, 2500);
        fs::remove_file(path).unwrap();
    }

    // Auxiliary functions

    fn create_and_write_file(path: &str, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }
}
