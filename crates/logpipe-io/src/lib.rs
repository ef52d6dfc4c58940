//! # Logpipe I/O - Source and Sink Implementations
//!
//! This crate provides the built-in connectors for logpipe pipelines.
//!
//! ## Sources
//! - **File**: tail a path with rotation detection and offset tracking
//! - **Kafka**: consumer-group subscription with broker metadata
//! - **S3**: poll a bucket prefix for new objects
//! - **Winlog**: structured Windows event streams from files,
//!   directories, or a TCP listener
//!
//! ## Sinks
//! - **File**: JSON lines or templated text, flushed per batch
//! - **Search**: Elasticsearch/OpenSearch bulk indexing with retry
//! - **S3**: size-bounded buffering into dated objects
//!
//! Sources push into the pipeline's bounded event channel and watch a
//! cancellation token at every suspension point; sinks serialize
//! their internal state so concurrent per-source writers are safe.

pub mod encode;

/// Tailing file source
pub mod source_file;

/// Kafka consumer source
pub mod source_kafka;

/// Object-store polling source
pub mod source_s3;

/// Windows event log source
pub mod source_winlog;

/// Local file sink
pub mod sink_file;

/// Search-cluster bulk sink
pub mod sink_search;

/// Object-store sink
pub mod sink_s3;

pub use self::sink_file::FileSink;
pub use self::sink_s3::S3Sink;
pub use self::sink_search::SearchSink;
pub use self::source_file::FileSource;
pub use self::source_kafka::KafkaSource;
pub use self::source_s3::S3Source;
pub use self::source_winlog::WinlogSource;
