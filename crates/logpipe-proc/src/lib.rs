//! # Logpipe Processors - Event Transformation Operators
//!
//! This crate provides the built-in processors for logpipe pipelines.
//! A processor consumes one event and produces zero or one: returning
//! `None` drops the event from the pipeline.
//!
//! ## Available Processors
//!
//! ### Parsing and Extraction
//! - **Json**: parse a string field as JSON, flattened or nested
//! - **Regex**: extract named or positional capture groups
//! - **Grok**: named-pattern templates over a built-in library
//!
//! ### Filtering and Shaping
//! - **Filter**: boolean condition language over event fields
//! - **Mutate**: add/remove/rename/case/convert/substitute/merge/
//!   split/strip field operations
//!
//! ### Enrichment
//! - **Enrich**: lookup tables, GeoIP, DNS, and user-agent parsing
//!
//! Processors are read-only after `configure`, which is what makes a
//! single configured chain safe to share across all per-source reader
//! tasks of a pipeline.

pub mod enrich;
pub mod filter;
pub mod grok;
pub mod json;
pub mod mutate;
pub mod regex;

pub use self::enrich::EnrichProcessor;
pub use self::filter::FilterProcessor;
pub use self::grok::GrokProcessor;
pub use self::json::JsonProcessor;
pub use self::mutate::MutateProcessor;
pub use self::regex::RegexProcessor;
