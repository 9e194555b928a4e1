pub mod chunker;
pub mod config;
pub mod error;
pub mod processor;
pub mod progress;

pub use chunker::{chunk_count, count_rows, Chunk, ChunkReader};
pub use config::ProcessorConfig;
pub use error::ProcessError;
pub use processor::{ChunkReport, ChunkedProcessor};
pub use progress::{NoopProgress, ProgressReporter, RecordingProgress};
