use chain::Header;

/// Sync lifecycle events posted on the downloader's mux.
#[derive(Debug, Clone)]
pub enum DownloaderEvent {
    /// A sync cycle started.
    Start,
    /// A sync cycle completed; carries the local head afterwards.
    Done(Header),
    /// A sync cycle failed with the given error.
    Failed(String),
}
