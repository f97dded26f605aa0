//! Thumbnail generation, scaling and caching pipeline
//!
//! This crate turns full-resolution images of many formats into correctly
//! rotated, correctly scaled thumbnails without blocking the caller. Requests
//! are prioritized and deduplicated per display target, built on a bounded
//! worker pool, and cached both in memory (LRU) and on disk.
//!
//! # Features
//!
//! - **Pluggable decoding**: ordered codec registry probed by header bytes
//! - **Rotation-aware loading**: explicit angles or EXIF orientation, lossless quarter turns
//! - **Priority scheduling**: promotion, replacement and withdrawal of queued requests
//! - **Dual caching**: in-memory LRU with entry and byte limits + persistent disk cache
//! - **Batch warming**: parallel generation with rayon for bulk imports
//! - **Folder thumbnails**: the first pictures of a folder drawn onto one canvas
//!
//! # Example
//!
//! ```no_run
//! use thumbnail_pipeline::{
//!     Bound, ChannelDelivery, PipelineConfig, Priority, RequestOutcome, ThumbnailRequest,
//!     ThumbnailService,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let service = ThumbnailService::new(PipelineConfig::default())?;
//! let delivery = ChannelDelivery::new();
//!
//! let request = ThumbnailRequest::new("row-1", "photo.jpg", Bound::square(350), delivery.callback())
//!     .with_priority(Priority::Highest);
//! if let RequestOutcome::Ready(thumbnail) = service.request(request) {
//!     println!("cached: {}x{}", thumbnail.width(), thumbnail.height());
//! }
//!
//! for ready in delivery.poll() {
//!     let (target, thumbnail) = ready.into_thumbnail_or_broken();
//!     println!("{target}: {}x{}", thumbnail.width(), thumbnail.height());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod error;
pub mod exif;
pub mod factory;
pub mod group;
pub mod lru;
pub mod queue;
pub mod request;
pub mod scale;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod source_cache;
pub mod thumbnail;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use codec::{CodecRegistry, ImageCodec};
pub use config::PipelineConfig;
pub use delivery::ChannelDelivery;
pub use error::{Result, ThumbnailError};
pub use exif::ExifSummary;
pub use factory::ThumbnailFactory;
pub use group::GroupLayout;
pub use queue::{RequestQueue, SubmitOutcome};
pub use request::{Priority, RequestState, TargetId, ThumbnailCallback, ThumbnailReady, ThumbnailRequest};
pub use scale::{scale_factor_to_fit, Bound, OutputFormat, ScaleQuality, ScaledImage, Scaler};
pub use scheduler::ThumbnailScheduler;
pub use service::{RequestOutcome, ThumbnailService};
pub use source::{ImageLoader, Rotation, SourceImage};
pub use source_cache::SourceBytesCache;
pub use thumbnail::Thumbnail;
