//! Networking layer.
//!
//! - [`transport`] - Admission requests and chunked snapshot transfer

pub mod transport;

pub use transport::{AdmissionTransport, InMemoryTransport, PeerEndpoint, SnapshotTransport};
