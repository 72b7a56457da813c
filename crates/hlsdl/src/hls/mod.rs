// HLS engine: playlist resolution, segment planning, filtering and concurrent download

pub mod codec;
pub mod config;
pub mod decryption;
pub mod fetcher;
pub mod filter;
pub mod planner;
pub mod playlist;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod segment;
pub mod throughput;

// Re-exports for easier access
pub use config::HlsConfig;
pub use decryption::KeyStore;
pub use fetcher::{SegmentDownloader, SegmentFetcher};
pub use filter::{ExclusionReason, FilterOutcome, SkipRange, SkipSpec};
pub use planner::plan_segments;
pub use playlist::{PlaylistDocument, PlaylistPart};
pub use resolver::{HttpPlaylistProvider, PlaylistProvider, PlaylistResolver, ResolvedPlaylist};
pub use retry::{RetryPolicy, SleepGauge};
pub use scheduler::{DownloadScheduler, ScheduleContext, ScheduleOutcome};
pub use segment::{Disposition, Segment, SegmentReport};
pub use throughput::{Throughput, ThroughputTracker};
