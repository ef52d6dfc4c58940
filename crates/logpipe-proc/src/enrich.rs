//! Event enrichment: lookup tables, GeoIP, DNS, user-agent parsing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use maxminddb::geoip2;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use woothee::parser::Parser as UserAgentParser;

use logpipe_core::{parse_options, value_to_string, ConfigError, LogEvent, Processor};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum EnrichKind {
    Lookup,
    Geo,
    Dns,
    Useragent,
}

#[derive(Debug, Deserialize)]
struct EnrichOptions {
    enrich_type: EnrichKind,
    source_field: String,
    target_field: String,
    #[serde(default)]
    lookup_table: HashMap<String, Value>,
    #[serde(default)]
    lookup_file: Option<PathBuf>,
    #[serde(default)]
    default_value: Option<Value>,
    #[serde(default = "default_true")]
    preserve_existing: bool,
    #[serde(default = "default_true")]
    ignore_missing: bool,
    #[serde(default)]
    geo_db_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Attaches externally sourced information to events.
///
/// One of four modes, fixed at configure time: in-memory table lookup
/// (optionally seeded from a JSON file), GeoIP city lookup, forward or
/// reverse DNS, or user-agent parsing. The target field is never
/// overwritten while `preserve_existing` holds, and enrichment
/// failures annotate `metadata.enrich_error` rather than dropping the
/// event.
pub struct EnrichProcessor {
    name: String,
    kind: EnrichKind,
    source_field: String,
    target_field: String,
    lookup_table: HashMap<String, Value>,
    default_value: Option<Value>,
    preserve_existing: bool,
    ignore_missing: bool,
    geo_db: Option<maxminddb::Reader<Vec<u8>>>,
    resolver: Option<TokioAsyncResolver>,
}

impl EnrichProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EnrichKind::Lookup,
            source_field: String::new(),
            target_field: String::new(),
            lookup_table: HashMap::new(),
            default_value: None,
            preserve_existing: true,
            ignore_missing: true,
            geo_db: None,
            resolver: None,
        }
    }

    fn enrich_lookup(&self, event: &mut LogEvent, source: &str) {
        let value = self
            .lookup_table
            .get(source)
            .cloned()
            .or_else(|| self.default_value.clone());
        if let Some(value) = value {
            event.add_field(self.target_field.clone(), value);
        }
    }

    fn enrich_geo(&self, event: &mut LogEvent, source: &str) {
        let ip: IpAddr = match source.parse() {
            Ok(ip) => ip,
            Err(_) => {
                if !self.ignore_missing {
                    event.add_metadata(
                        "enrich_error",
                        Value::String(format!("invalid IP address: {}", source)),
                    );
                }
                return;
            }
        };
        if is_private_ip(&ip) {
            return;
        }

        let reader = match &self.geo_db {
            Some(reader) => reader,
            None => return,
        };
        match reader.lookup::<geoip2::City>(ip) {
            Ok(city) => {
                let subdivision = city
                    .subdivisions
                    .as_ref()
                    .and_then(|subs| subs.last());
                let geo = json!({
                    "country_code": city.country.as_ref().and_then(|c| c.iso_code),
                    "country_name": city.country.as_ref().and_then(|c| english_name(&c.names)),
                    "city_name": city.city.as_ref().and_then(|c| english_name(&c.names)),
                    "region_name": subdivision.and_then(|s| english_name(&s.names)),
                    "region_code": subdivision.and_then(|s| s.iso_code),
                    "continent_code": city.continent.as_ref().and_then(|c| c.code),
                    "latitude": city.location.as_ref().and_then(|l| l.latitude),
                    "longitude": city.location.as_ref().and_then(|l| l.longitude),
                    "timezone": city.location.as_ref().and_then(|l| l.time_zone),
                    "postal_code": city.postal.as_ref().and_then(|p| p.code),
                });
                event.add_field(self.target_field.clone(), geo);
            }
            Err(e) => {
                event.add_metadata("enrich_error", Value::String(e.to_string()));
            }
        }
    }

    async fn enrich_dns(&self, event: &mut LogEvent, source: &str) {
        let resolver = match &self.resolver {
            Some(resolver) => resolver,
            None => return,
        };

        let resolved = if let Ok(ip) = source.parse::<Ipv4Addr>() {
            resolver
                .reverse_lookup(IpAddr::V4(ip))
                .await
                .ok()
                .and_then(|ptr| {
                    ptr.iter()
                        .next()
                        .map(|name| name.to_string().trim_end_matches('.').to_string())
                })
        } else {
            resolver
                .lookup_ip(source)
                .await
                .ok()
                .and_then(|ips| ips.iter().next().map(|ip| ip.to_string()))
        };

        match resolved {
            Some(value) => event.add_field(self.target_field.clone(), Value::String(value)),
            None => {
                if let Some(default) = &self.default_value {
                    event.add_field(self.target_field.clone(), default.clone());
                } else if !self.ignore_missing {
                    event.add_metadata(
                        "enrich_error",
                        Value::String(format!("DNS lookup failed for: {}", source)),
                    );
                }
            }
        }
    }

    fn enrich_useragent(&self, event: &mut LogEvent, source: &str) {
        match UserAgentParser::new().parse(source) {
            Some(ua) => {
                let info = json!({
                    "browser_family": ua.name,
                    "browser_version": ua.version,
                    "browser_type": ua.browser_type,
                    "os_family": ua.os,
                    "os_version": ua.os_version,
                    "device_category": ua.category,
                    "vendor": ua.vendor,
                    "is_bot": ua.category == "crawler",
                });
                event.add_field(self.target_field.clone(), info);
            }
            None => {
                if !self.ignore_missing {
                    event.add_metadata(
                        "enrich_error",
                        Value::String(format!("unrecognized user agent: {}", source)),
                    );
                }
            }
        }
    }
}

fn english_name<'a>(names: &Option<std::collections::BTreeMap<&'a str, &'a str>>) -> Option<&'a str> {
    names.as_ref().and_then(|names| names.get("en").copied())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[async_trait]
impl Processor for EnrichProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: EnrichOptions = parse_options("enrich processor", options)?;
        if opts.source_field.is_empty() {
            return Err(ConfigError::invalid("enrich processor: source field is required"));
        }
        if opts.target_field.is_empty() {
            return Err(ConfigError::invalid("enrich processor: target field is required"));
        }

        match opts.enrich_type {
            EnrichKind::Lookup => {
                self.lookup_table = opts.lookup_table;
                if let Some(path) = &opts.lookup_file {
                    let text = std::fs::read_to_string(path).map_err(|e| {
                        ConfigError::Invalid(format!(
                            "enrich processor: lookup file {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    let data: Map<String, Value> =
                        serde_json::from_str(&text).map_err(|e| {
                            ConfigError::Invalid(format!(
                                "enrich processor: lookup file must contain a JSON object: {}",
                                e
                            ))
                        })?;
                    self.lookup_table.extend(data);
                }
            }
            EnrichKind::Geo => {
                let path = opts.geo_db_path.as_ref().ok_or_else(|| {
                    ConfigError::invalid(
                        "enrich processor: geo_db_path is required for geo enrichment",
                    )
                })?;
                let reader = maxminddb::Reader::open_readfile(path).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "enrich processor: error loading GeoIP database {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                self.geo_db = Some(reader);
            }
            EnrichKind::Dns => {
                let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
                    ConfigError::Invalid(format!("enrich processor: resolver setup: {}", e))
                })?;
                self.resolver = Some(resolver);
            }
            EnrichKind::Useragent => {}
        }

        self.kind = opts.enrich_type;
        self.source_field = opts.source_field;
        self.target_field = opts.target_field;
        self.default_value = opts.default_value;
        self.preserve_existing = opts.preserve_existing;
        self.ignore_missing = opts.ignore_missing;
        Ok(())
    }

    async fn process(&self, mut event: LogEvent) -> Result<Option<LogEvent>> {
        let source = match event.field_value(&self.source_field) {
            Some(value) => value_to_string(&value),
            None => {
                if !self.ignore_missing {
                    event.add_metadata(
                        "enrich_error",
                        Value::String(format!(
                            "source field not found: {}",
                            self.source_field
                        )),
                    );
                }
                return Ok(Some(event));
            }
        };

        if self.preserve_existing && event.fields.contains_key(&self.target_field) {
            return Ok(Some(event));
        }

        match self.kind {
            EnrichKind::Lookup => self.enrich_lookup(&mut event, &source),
            EnrichKind::Geo => self.enrich_geo(&mut event, &source),
            EnrichKind::Dns => self.enrich_dns(&mut event, &source).await,
            EnrichKind::Useragent => self.enrich_useragent(&mut event, &source),
        }

        Ok(Some(event))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}
