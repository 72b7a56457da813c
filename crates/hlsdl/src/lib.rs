//! HLS video-on-demand downloader engine.
//!
//! A [`DownloadSession`] resolves a playlist URL to a media playlist, plans the
//! segment list, applies the skip expression and downloads the remaining
//! segments concurrently before handing them to a [`ContainerAssembler`].
//!
//! ## Component Overview
//!
//! - `hls::resolver`: playlist fetching and master playlist traversal
//! - `hls::planner`: segment list with resolved URLs, IVs and discontinuity groups
//! - `hls::filter`: the skip expression grammar and its application
//! - `hls::scheduler`: bounded concurrent download with retries
//! - `hls::fetcher`: single segment retrieval, decoding, decryption and repair
//! - `hls::throughput`: sliding-window speed and ETA
//! - `cache`: short-circuits requests whose output already exists
//! - `assembler`: joins downloaded segments into one output file

pub mod assembler;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod hls;
pub mod proxy;
pub mod session;

pub use assembler::{ConcatAssembler, ContainerAssembler};
pub use cache::{ManifestCache, ResultCache};
pub use config::DownloaderConfig;
pub use error::DownloadError;
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use session::{DownloadSession, SessionConfig, SessionStatus};
