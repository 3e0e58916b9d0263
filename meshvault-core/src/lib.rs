// Meshvault Core — shared configuration, error, and data-model types.
//
// Every other meshvault crate depends on this one for the vocabulary they
// operate on: `Manifest`, `ChunkDescriptor`, `IndexShardEntry`, `PeerId`,
// `Mode`, and the `MeshvaultError` kinds that the request surface maps to
// HTTP responses. Nothing here talks to the network or the filesystem.

mod config;
mod error;
mod types;

pub use config::MeshvaultConfig;
pub use error::{ErrorBody, MeshvaultError};
pub use types::*;
