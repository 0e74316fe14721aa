//! Demo game server shard: a TCP transport and a tiny protocol wired to the
//! thais scheduler through the dispatch bridge.

pub mod listener;
pub mod protocol;
pub mod world;

pub use listener::Listener;
pub use protocol::DemoDecoder;
pub use world::GameWorld;
