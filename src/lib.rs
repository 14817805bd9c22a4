pub mod cipher;
pub mod commands;
pub mod frame;
pub mod message;
pub mod peer;
pub mod registry;
pub mod server;
pub mod store;
pub mod tcp;
pub mod transport;

use std::time::Duration;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const CHUNK_SIZE: usize = 32 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 4096;

pub const DEFAULT_STORAGE_ROOT: &str = "networkStorage";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const GET_TIMEOUT: Duration = Duration::from_secs(10);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(120);
pub const DIAL_PACING: Duration = Duration::from_millis(250);
pub const INBOUND_CAPACITY: usize = 64;
