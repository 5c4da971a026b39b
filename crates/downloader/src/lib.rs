//! Chain synchronisation against remote peers: per-peer throughput tracking,
//! the header/body/receipt fetch queue, the concurrent fetcher and the
//! downloader that drives a sync cycle end to end.

pub mod api;
pub mod downloader;
pub mod error;
pub mod events;
pub mod fetchers;
pub mod msgrate;
pub mod peer;
pub mod queue;

pub use api::{DownloaderApi, SyncStatus, SyncStatusSubscription, SyncingResult};
pub use downloader::{Config, DropPeerFn, Downloader, SyncMode, SyncProgress};
pub use error::DownloadError;
pub use events::DownloaderEvent;
pub use fetchers::FetchHook;
pub use peer::{LightPeer, LightPeerWrapper, Peer, PeerConnection, PeerSet, PeeringEvent, ResponseSink};
pub use queue::{FetchQueue, FetchResult};
