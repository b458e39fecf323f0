mod handshake;
mod keepalive;
mod state;

pub use keepalive::{KeepaliveStats, KeepaliveTracker};
pub use state::{ClientState, Credentials, GameClient, MapState, Session};
