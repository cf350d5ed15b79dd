pub mod client;
pub mod server;

pub use client::ClientApp;
pub use server::ServerApp;
