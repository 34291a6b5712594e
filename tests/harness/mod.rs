//! Test harness shared by the integration tests.
//!
//! Each test binary uses a different subset, hence the `dead_code` allowance.
#![allow(dead_code)]

mod client;
mod process;
mod server;

pub use client::TestClient;
pub use process::{EchoProcess, is_alive, wait_until};
pub use server::TestServer;
