mod keys;
pub use keys::*;

mod cipher;
pub use cipher::*;

mod error;
pub use error::Error;

mod config;
pub use config::SessionConfig;

mod proto;

pub mod directory;
pub use directory::{BundleResponse, KeyDirectory, PeerBundle, PrekeyUpload};

pub mod store;
pub use store::{FileBackend, KeyMaterialStore, MemoryBackend, StoreBackend};

mod session;
pub use session::*;

pub mod transport;
pub use transport::{Conversation, FrameSink, OutboundFrame};
