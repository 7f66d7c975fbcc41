pub mod choke_manager;
pub mod peer_connection;
pub mod peer_message;
pub mod peer_scorer;
pub mod peer_session;
