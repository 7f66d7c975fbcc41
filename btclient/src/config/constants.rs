pub const TCP_PORT: &str = "TCP_PORT";
pub const DOWNLOAD_DIR: &str = "DOWNLOAD_DIR";
pub const PIPELINE_DEPTH: &str = "PIPELINE_DEPTH";
pub const BLOCK_TIMEOUT_S: &str = "BLOCK_TIMEOUT_S";
pub const CONNECT_TIMEOUT_S: &str = "CONNECT_TIMEOUT_S";
pub const CHOKE_PERIOD_S: &str = "CHOKE_PERIOD_S";
pub const UNCHOKE_BASE_SLOTS: &str = "UNCHOKE_BASE_SLOTS";
pub const OPTIMISTIC_EVERY: &str = "OPTIMISTIC_EVERY";
pub const MAX_PEERS: &str = "MAX_PEERS";
