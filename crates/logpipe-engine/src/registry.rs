//! Component registry: (role, type tag) to constructor.
//!
//! Built-ins register at engine start-up; extensions register through
//! the public `register_*` methods before pipelines are loaded. An
//! unknown tag surfaces as a `ConfigError` before anything starts.

use std::collections::HashMap;

use logpipe_core::{ConfigError, Processor, Sink, Source};

type SourceCtor = Box<dyn Fn(&str) -> Box<dyn Source> + Send + Sync>;
type ProcessorCtor = Box<dyn Fn(&str) -> Box<dyn Processor> + Send + Sync>;
type SinkCtor = Box<dyn Fn(&str) -> Box<dyn Sink> + Send + Sync>;

/// Constructors for every component type a pipeline may name.
pub struct Registry {
    sources: HashMap<String, SourceCtor>,
    processors: HashMap<String, ProcessorCtor>,
    sinks: HashMap<String, SinkCtor>,
}

impl Registry {
    /// A registry with no constructors at all. Useful for embedders
    /// that want full control over the component set.
    pub fn empty() -> Self {
        Self {
            sources: HashMap::new(),
            processors: HashMap::new(),
            sinks: HashMap::new(),
        }
    }

    /// The built-in component set.
    pub fn with_builtins() -> Self {
        use logpipe_io as io;
        use logpipe_proc as proc;

        let mut registry = Self::empty();

        registry.register_source("file", |name| Box::new(io::FileSource::new(name)));
        registry.register_source("kafka", |name| Box::new(io::KafkaSource::new(name)));
        registry.register_source("s3", |name| Box::new(io::S3Source::new(name)));
        registry.register_source("winlog", |name| Box::new(io::WinlogSource::new(name)));

        registry.register_processor("json", |name| Box::new(proc::JsonProcessor::new(name)));
        registry.register_processor("filter", |name| Box::new(proc::FilterProcessor::new(name)));
        registry.register_processor("regex", |name| Box::new(proc::RegexProcessor::new(name)));
        registry.register_processor("grok", |name| Box::new(proc::GrokProcessor::new(name)));
        registry.register_processor("mutate", |name| Box::new(proc::MutateProcessor::new(name)));
        registry.register_processor("enrich", |name| Box::new(proc::EnrichProcessor::new(name)));

        registry.register_sink("file", |name| Box::new(io::FileSink::new(name)));
        // One bulk implementation answers both cluster flavors.
        registry.register_sink("elasticsearch", |name| Box::new(io::SearchSink::new(name)));
        registry.register_sink("opensearch", |name| Box::new(io::SearchSink::new(name)));
        registry.register_sink("s3", |name| Box::new(io::S3Sink::new(name)));

        registry
    }

    pub fn register_source<F>(&mut self, tag: impl Into<String>, ctor: F)
    where
        F: Fn(&str) -> Box<dyn Source> + Send + Sync + 'static,
    {
        self.sources.insert(tag.into(), Box::new(ctor));
    }

    pub fn register_processor<F>(&mut self, tag: impl Into<String>, ctor: F)
    where
        F: Fn(&str) -> Box<dyn Processor> + Send + Sync + 'static,
    {
        self.processors.insert(tag.into(), Box::new(ctor));
    }

    pub fn register_sink<F>(&mut self, tag: impl Into<String>, ctor: F)
    where
        F: Fn(&str) -> Box<dyn Sink> + Send + Sync + 'static,
    {
        self.sinks.insert(tag.into(), Box::new(ctor));
    }

    pub fn create_source(&self, tag: &str, name: &str) -> Result<Box<dyn Source>, ConfigError> {
        self.sources
            .get(tag)
            .map(|ctor| ctor(name))
            .ok_or_else(|| ConfigError::UnknownComponent {
                role: "source",
                tag: tag.to_string(),
            })
    }

    pub fn create_processor(
        &self,
        tag: &str,
        name: &str,
    ) -> Result<Box<dyn Processor>, ConfigError> {
        self.processors
            .get(tag)
            .map(|ctor| ctor(name))
            .ok_or_else(|| ConfigError::UnknownComponent {
                role: "processor",
                tag: tag.to_string(),
            })
    }

    pub fn create_sink(&self, tag: &str, name: &str) -> Result<Box<dyn Sink>, ConfigError> {
        self.sinks
            .get(tag)
            .map(|ctor| ctor(name))
            .ok_or_else(|| ConfigError::UnknownComponent {
                role: "sink",
                tag: tag.to_string(),
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
