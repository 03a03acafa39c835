//! Peer side of the Petri net debugger.
//!
//! [`DebugPeer`] listens for one debugging session at a time and drives a
//! [`NetHost`]: the process actually running the net. Evaluators sent by the
//! client are loaded through a [`LibraryProxy`].

pub mod dylib;
pub mod host;
pub mod server;

pub use dylib::{ArtifactKind, LibraryProxy, LuaChunkProxy, ProxyError};
#[cfg(unix)]
pub use dylib::NativeLibraryProxy;
pub use host::{NetHost, StaticNet};
pub use server::{DebugPeer, PeerConfig, SESSION_ACTIVE_MESSAGE};
