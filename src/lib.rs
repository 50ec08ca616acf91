#![forbid(unsafe_op_in_unsafe_fn)]

mod checksum;
mod client;
mod constants;
mod election;
mod error;
mod instance;
mod layout;
mod naming;
mod server;
mod shared;
mod unix;

pub mod connection;
pub mod ffi;
pub mod protocol;

use std::time::Duration;

use rand::Rng;

pub use checksum::checksum;
pub use client::LocalConnector;
pub use constants::{ACK_BYTE, MAX_FRAME_LEN, MAX_HANDSHAKE_LEN};
pub use error::{Result, SingleError};
pub use instance::{InstanceHandler, InstanceOptions, NoopHandler, SingleInstance};
pub use naming::{block_server_name, socket_path, AppIdentity, NameOptions};
pub use protocol::ConnectionType;
pub use server::LocalListener;
pub use unix::{current_user, AccessMode};

/// Случайная пауза перед повторной попыткой, чтобы конкурирующие
/// процессы не шли в ногу.
pub(crate) fn random_sleep() {
    let ms = rand::rng().random_range(constants::BACKOFF_MIN_MS..constants::BACKOFF_MAX_MS);
    std::thread::sleep(Duration::from_millis(ms));
}
