//! DoH upstream plumbing: per-IP HTTP/2 connections and the per-provider
//! warm pool that multiplexes queries onto them.

pub mod connection;
pub mod provider;
pub mod tls;

pub use connection::DohConnection;
pub use provider::ProviderClient;
