//! Named-pattern (grok) extraction.
//!
//! Patterns are templates of `%{NAME}` and `%{NAME:field}` references
//! into a library of named regex fragments. Resolution expands each
//! reference recursively — fragments may themselves contain
//! references — rejecting cycles and memoizing expanded names. A
//! `:field` suffix turns the fully expanded fragment into a named
//! capture group.
//!
//! The expanded fragments use lookarounds and atomic groups, hence
//! `fancy_regex` rather than the linear-time engine.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use fancy_regex::Regex;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{Map, Value};

use logpipe_core::{parse_options, ConfigError, LogEvent, Processor};

/// Built-in pattern library: numeric, networking, path, date/time,
/// syslog, and web-log shapes.
pub const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    // Base
    ("WORD", r"\b\w+\b"),
    ("NOTSPACE", r"\S+"),
    ("SPACE", r"\s+"),
    ("DATA", r".*?"),
    ("GREEDYDATA", r".*"),
    (
        "QUOTEDSTRING",
        r#"(?>"(?>[^\\"]|\\.)*"|'(?>[^\\']|\\.)*'|`(?>[^\\`]|\\.)*`)"#,
    ),
    // Numbers
    ("INT", r"(?:[+-]?(?:[0-9]+))"),
    (
        "BASE10NUM",
        r"(?<![0-9.+-])(?>[+-]?(?:(?:[0-9]+(?:\.[0-9]+)?)|(?:\.[0-9]+)))",
    ),
    ("NUMBER", r"(?:%{BASE10NUM})"),
    ("BASE16NUM", r"(?<![0-9A-Fa-f])(?:[+-]?(?:0x)?(?:[0-9A-Fa-f]+))"),
    (
        "BASE16FLOAT",
        r"\b(?<![0-9A-Fa-f.])(?:[+-]?(?:0x)?(?:(?:[0-9A-Fa-f]+(?:\.[0-9A-Fa-f]*)?)|(?:\.[0-9A-Fa-f]+)))\b",
    ),
    ("POSINT", r"\b(?:[1-9][0-9]*)\b"),
    ("NONNEGINT", r"\b(?:[0-9]+)\b"),
    // Networking
    ("IP", r"(?:%{IPV4}|%{IPV6})"),
    (
        "IPV4",
        r"(?<![0-9])(?:(?:[0-1]?[0-9]{1,2}|2[0-4][0-9]|25[0-5])[.](?:[0-1]?[0-9]{1,2}|2[0-4][0-9]|25[0-5])[.](?:[0-1]?[0-9]{1,2}|2[0-4][0-9]|25[0-5])[.](?:[0-1]?[0-9]{1,2}|2[0-4][0-9]|25[0-5]))(?![0-9])",
    ),
    (
        "IPV6",
        r"((([0-9A-Fa-f]{1,4}:){7}([0-9A-Fa-f]{1,4}|:))|(([0-9A-Fa-f]{1,4}:){6}(:[0-9A-Fa-f]{1,4}|((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3})|:))|(([0-9A-Fa-f]{1,4}:){5}(((:[0-9A-Fa-f]{1,4}){1,2})|:((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3})|:))|(([0-9A-Fa-f]{1,4}:){4}(((:[0-9A-Fa-f]{1,4}){1,3})|((:[0-9A-Fa-f]{1,4})?:((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}))|:))|(([0-9A-Fa-f]{1,4}:){3}(((:[0-9A-Fa-f]{1,4}){1,4})|((:[0-9A-Fa-f]{1,4}){0,2}:((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}))|:))|(([0-9A-Fa-f]{1,4}:){2}(((:[0-9A-Fa-f]{1,4}){1,5})|((:[0-9A-Fa-f]{1,4}){0,3}:((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}))|:))|(([0-9A-Fa-f]{1,4}:){1}(((:[0-9A-Fa-f]{1,4}){1,6})|((:[0-9A-Fa-f]{1,4}){0,4}:((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}))|:))|(:(((:[0-9A-Fa-f]{1,4}){1,7})|((:[0-9A-Fa-f]{1,4}){0,5}:((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}))|:)))(%.+)?",
    ),
    (
        "HOSTNAME",
        r"\b(?:[0-9A-Za-z][0-9A-Za-z-]{0,62})(?:\.(?:[0-9A-Za-z][0-9A-Za-z-]{0,62}))*(\.?|\b)",
    ),
    ("HOST", r"%{HOSTNAME}"),
    ("IPORHOST", r"(?:%{IP}|%{HOSTNAME})"),
    ("HOSTPORT", r"(?:%{IPORHOST}:%{POSINT})"),
    // Paths
    ("PATH", r"(?:%{UNIXPATH}|%{WINPATH})"),
    ("UNIXPATH", r"(/[^/\s]*)+"),
    ("WINPATH", r"([A-Za-z]:|\\)(?:\\[^\\?*]*)+"),
    ("TTY", r"(?:/dev/(pts|tty([pq])?)(\w+)?/?(?:[0-9]+))"),
    ("URIPROTO", r"[A-Za-z]([A-Za-z0-9+\-.])+"),
    ("URIHOST", r"%{IPORHOST}(?::%{POSINT})?"),
    ("URIPATH", r"(?:/[A-Za-z0-9$.+!*'(){},~:;=@#%_\-]*)+"),
    ("URIPARAM", r"\?[A-Za-z0-9$.+!*'|(){},~@#%&/=:;_?\-\[\]<>]*"),
    ("URIPATHPARAM", r"%{URIPATH}(?:%{URIPARAM})?"),
    (
        "URI",
        r"%{URIPROTO}://(?:%{USER}(?::[^@]*)?@)?(?:%{URIHOST})?(?:%{URIPATHPARAM})?",
    ),
    // Date and time
    (
        "MONTH",
        r"\b(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|Jun(?:e)?|Jul(?:y)?|Aug(?:ust)?|Sep(?:tember)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)\b",
    ),
    ("MONTHNUM", r"(?:0?[1-9]|1[0-2])"),
    ("MONTHNUM2", r"(?:0[1-9]|1[0-2])"),
    ("MONTHDAY", r"(?:(?:0[1-9])|(?:[12][0-9])|(?:3[01])|[1-9])"),
    (
        "DAY",
        r"(?:Mon(?:day)?|Tue(?:sday)?|Wed(?:nesday)?|Thu(?:rsday)?|Fri(?:day)?|Sat(?:urday)?|Sun(?:day)?)",
    ),
    ("YEAR", r"(?:\d\d){1,2}"),
    ("HOUR", r"(?:2[0123]|[01]?[0-9])"),
    ("MINUTE", r"(?:[0-5][0-9])"),
    ("SECOND", r"(?:(?:[0-5]?[0-9]|60)(?:[:.,][0-9]+)?)"),
    ("TIME", r"(?!<[0-9])%{HOUR}:%{MINUTE}(?::%{SECOND})(?![0-9])"),
    ("DATE_US", r"%{MONTHNUM}[/-]%{MONTHDAY}[/-]%{YEAR}"),
    ("DATE_EU", r"%{MONTHDAY}[./-]%{MONTHNUM}[./-]%{YEAR}"),
    ("ISO8601_TIMEZONE", r"(?:Z|[+-]%{HOUR}(?::?%{MINUTE}))"),
    ("ISO8601_SECOND", r"(?:%{SECOND}|60)"),
    (
        "TIMESTAMP_ISO8601",
        r"%{YEAR}-%{MONTHNUM}-%{MONTHDAY}[T ]%{HOUR}:?%{MINUTE}(?::?%{SECOND})?%{ISO8601_TIMEZONE}?",
    ),
    ("DATE", r"%{DATE_US}|%{DATE_EU}"),
    ("DATESTAMP", r"%{DATE}[- ]%{TIME}"),
    ("TZ", r"(?:[PMCE][SD]T|UTC)"),
    ("DATESTAMP_RFC822", r"%{DAY} %{MONTH} %{MONTHDAY} %{YEAR} %{TIME} %{TZ}"),
    (
        "DATESTAMP_RFC2822",
        r"%{DAY}, %{MONTHDAY} %{MONTH} %{YEAR} %{TIME} %{ISO8601_TIMEZONE}",
    ),
    ("DATESTAMP_OTHER", r"%{DAY} %{MONTH} %{MONTHDAY} %{TIME} %{TZ} %{YEAR}"),
    ("DATESTAMP_EVENTLOG", r"%{YEAR}%{MONTHNUM2}%{MONTHDAY}%{HOUR}%{MINUTE}%{SECOND}"),
    ("HTTPDATE", r"%{MONTHDAY}/%{MONTH}/%{YEAR}:%{TIME} %{INT}"),
    // Syslog
    ("SYSLOGTIMESTAMP", r"%{MONTH} +%{MONTHDAY} %{TIME}"),
    ("PROG", r"[\w._/%-]+"),
    ("SYSLOGPROG", r"%{PROG:program}(?:\[%{POSINT:pid}\])?"),
    ("SYSLOGHOST", r"%{IPORHOST}"),
    ("SYSLOGFACILITY", r"<%{NONNEGINT:facility}.%{NONNEGINT:priority}>"),
    (
        "SYSLOGBASE",
        r"%{SYSLOGTIMESTAMP:timestamp} (?:%{SYSLOGFACILITY} )?%{SYSLOGHOST:logsource} %{SYSLOGPROG}:",
    ),
    // Users
    ("USER", r"[a-zA-Z0-9._-]+"),
    ("USERNAME", r"[a-zA-Z0-9._-]+"),
    ("EMAILLOCALPART", r"[a-zA-Z0-9!#$%&'*+/=?^_`{|}~-]+"),
    ("EMAILADDRESS", r"%{EMAILLOCALPART}@%{HOSTNAME}"),
    // HTTP
    ("HTTPDUSER", r"%{EMAILADDRESS}|%{USER}"),
    ("HTTPDERROR_DATE", r"%{DAY} %{MONTH} %{MONTHDAY} %{TIME} %{YEAR}"),
    (
        "COMMONAPACHELOG",
        r#"%{IPORHOST:clientip} %{HTTPDUSER:ident} %{USER:auth} \[%{HTTPDATE:timestamp}\] "(?:%{WORD:verb} %{NOTSPACE:request}(?: HTTP/%{NUMBER:httpversion})?|%{DATA:rawrequest})" %{NUMBER:response} (?:%{NUMBER:bytes}|-)"#,
    ),
    ("COMBINEDAPACHELOG", r"%{COMMONAPACHELOG} %{QS:referrer} %{QS:agent}"),
    // Shortcuts
    ("QS", r"%{QUOTEDSTRING}"),
];

static GROK_REF: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"%\{([A-Za-z0-9_]+)(?::([A-Za-z0-9_]+))?\}").expect("reference grammar")
});

/// Expand every `%{NAME[:field]}` reference in a template.
///
/// `stack` carries the chain of names currently being expanded so a
/// self-referential library is rejected instead of recursing forever;
/// `cache` memoizes fully expanded names.
fn expand_template(
    template: &str,
    library: &HashMap<String, String>,
    stack: &mut Vec<String>,
    cache: &mut HashMap<String, String>,
) -> Result<String, ConfigError> {
    let mut out = String::new();
    let mut last = 0;

    for caps in GROK_REF.captures_iter(template) {
        let whole = caps.get(0).expect("group 0 always present");
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let name = &caps[1];
        let expanded = expand_name(name, library, stack, cache)?;
        match caps.get(2) {
            Some(field) => {
                out.push_str("(?P<");
                out.push_str(field.as_str());
                out.push('>');
                out.push_str(&expanded);
                out.push(')');
            }
            None => {
                out.push_str("(?:");
                out.push_str(&expanded);
                out.push(')');
            }
        }
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn expand_name(
    name: &str,
    library: &HashMap<String, String>,
    stack: &mut Vec<String>,
    cache: &mut HashMap<String, String>,
) -> Result<String, ConfigError> {
    if let Some(expanded) = cache.get(name) {
        return Ok(expanded.clone());
    }
    if stack.iter().any(|n| n == name) {
        return Err(ConfigError::Invalid(format!(
            "recursive pattern definition: {} -> {}",
            stack.join(" -> "),
            name
        )));
    }
    let fragment = library
        .get(name)
        .ok_or_else(|| ConfigError::Invalid(format!("unknown pattern: {}", name)))?;

    stack.push(name.to_string());
    let expanded = expand_template(fragment, library, stack, cache)?;
    stack.pop();

    cache.insert(name.to_string(), expanded.clone());
    Ok(expanded)
}

#[derive(Debug, Deserialize)]
struct GrokOptions {
    #[serde(default = "default_field")]
    field: String,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    custom_patterns: HashMap<String, String>,
    #[serde(default)]
    target_field: Option<String>,
    #[serde(default = "default_true")]
    preserve_original: bool,
    #[serde(default)]
    ignore_errors: bool,
    #[serde(default = "default_true")]
    break_on_match: bool,
}

fn default_field() -> String {
    "raw_data".to_string()
}

fn default_true() -> bool {
    true
}

/// Extracts fields by trying a list of named-pattern templates
/// against a source field, first match wins by default.
///
/// User-supplied `custom_patterns` shadow built-in names.
pub struct GrokProcessor {
    name: String,
    field: String,
    target_field: Option<String>,
    preserve_original: bool,
    ignore_errors: bool,
    break_on_match: bool,
    compiled: Vec<Regex>,
}

impl GrokProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: default_field(),
            target_field: None,
            preserve_original: true,
            ignore_errors: false,
            break_on_match: true,
            compiled: Vec::new(),
        }
    }

    fn captures_to_map(regex: &Regex, caps: &fancy_regex::Captures<'_>) -> Map<String, Value> {
        let mut extracted = Map::new();
        for name in regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                extracted.insert(name.to_string(), Value::String(m.as_str().to_string()));
            }
        }
        extracted
    }
}

#[async_trait]
impl Processor for GrokProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: GrokOptions = parse_options("grok processor", options)?;
        if opts.patterns.is_empty() {
            return Err(ConfigError::invalid(
                "grok processor: at least one pattern is required",
            ));
        }

        let mut library: HashMap<String, String> = BUILTIN_PATTERNS
            .iter()
            .map(|(name, fragment)| (name.to_string(), fragment.to_string()))
            .collect();
        library.extend(opts.custom_patterns);

        let mut cache = HashMap::new();
        self.compiled = Vec::with_capacity(opts.patterns.len());
        for pattern in &opts.patterns {
            let mut stack = Vec::new();
            let expanded = expand_template(pattern, &library, &mut stack, &mut cache)?;
            let regex = Regex::new(&expanded).map_err(|e| {
                ConfigError::Invalid(format!("invalid grok pattern '{}': {}", pattern, e))
            })?;
            self.compiled.push(regex);
        }

        self.field = opts.field;
        self.target_field = opts.target_field.filter(|t| !t.is_empty());
        self.preserve_original = opts.preserve_original;
        self.ignore_errors = opts.ignore_errors;
        self.break_on_match = opts.break_on_match;
        Ok(())
    }

    async fn process(&self, mut event: LogEvent) -> Result<Option<LogEvent>> {
        let text = match event.field_as_string(&self.field) {
            Some(text) if !text.is_empty() => text,
            _ => return Ok(Some(event)),
        };

        let mut matched = false;
        for regex in &self.compiled {
            let caps = match regex.captures(&text) {
                Ok(Some(caps)) => caps,
                Ok(None) => continue,
                Err(e) => {
                    // Backtracking limits surface here, not at compile time.
                    if self.ignore_errors {
                        event.add_metadata("grok_error", Value::String(e.to_string()));
                        return Ok(Some(event));
                    }
                    return Ok(None);
                }
            };

            matched = true;
            let extracted = Self::captures_to_map(regex, &caps);
            match &self.target_field {
                Some(target) => event.add_field(target.clone(), Value::Object(extracted)),
                None => {
                    for (key, value) in extracted {
                        event.add_field(key, value);
                    }
                }
            }

            if self.break_on_match {
                break;
            }
        }

        if matched && !self.preserve_original && self.field != "raw_data" {
            event.fields.remove(&self.field);
        }
        Ok(Some(event))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn grok(yaml: &str) -> GrokProcessor {
        let mut processor = GrokProcessor::new("grok");
        processor
            .configure(&serde_yaml::from_str(yaml).unwrap())
            .await
            .unwrap();
        processor
    }

    #[tokio::test]
    async fn extracts_apache_common_log() {
        let processor = grok(r#"{patterns: ["%{COMMONAPACHELOG}"]}"#).await;
        let line = r#"127.0.0.1 - alice [10/Oct/2000:13:55:36 -0700] "GET /x HTTP/1.0" 200 2326"#;
        let out = processor
            .process(LogEvent::new(line, "file", "f"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(out.fields["clientip"], json!("127.0.0.1"));
        assert_eq!(out.fields["auth"], json!("alice"));
        assert_eq!(out.fields["verb"], json!("GET"));
        assert_eq!(out.fields["request"], json!("/x"));
        assert_eq!(out.fields["httpversion"], json!("1.0"));
        assert_eq!(out.fields["response"], json!("200"));
        assert_eq!(out.fields["bytes"], json!("2326"));
    }

    #[tokio::test]
    async fn no_match_leaves_event_unchanged() {
        let processor = grok(r#"{patterns: ["%{IPV4:ip}"]}"#).await;
        let out = processor
            .process(LogEvent::new("no addresses here", "file", "f"))
            .await
            .unwrap()
            .unwrap();
        assert!(out.fields.is_empty());
    }

    #[tokio::test]
    async fn custom_patterns_shadow_builtins() {
        let processor = grok(
            r#"{patterns: ["%{WORD:token}"], custom_patterns: {WORD: "[A-Z]{3}"}}"#,
        )
        .await;
        let out = processor
            .process(LogEvent::new("abc DEF ghi", "file", "f"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.fields["token"], json!("DEF"));
    }

    #[tokio::test]
    async fn target_field_nests_extraction() {
        let processor = grok(
            r#"{patterns: ["%{IPV4:ip}"], target_field: net}"#,
        )
        .await;
        let out = processor
            .process(LogEvent::new("from 10.1.2.3 port 22", "file", "f"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.fields["net"], json!({"ip": "10.1.2.3"}));
    }

    #[tokio::test]
    async fn first_match_wins_by_default() {
        let processor = grok(
            r#"{patterns: ["%{INT:first}", "%{WORD:second}"]}"#,
        )
        .await;
        let out = processor
            .process(LogEvent::new("42 things", "file", "f"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.fields["first"], json!("42"));
        assert!(!out.fields.contains_key("second"));
    }

    #[tokio::test]
    async fn cyclic_definitions_are_rejected() {
        let mut processor = GrokProcessor::new("grok");
        let options = serde_yaml::from_str(
            r#"{patterns: ["%{A:a}"], custom_patterns: {A: "%{B}", B: "%{A}"}}"#,
        )
        .unwrap();
        let err = processor.configure(&options).await.unwrap_err();
        assert!(err.to_string().contains("recursive pattern"));
    }

    #[tokio::test]
    async fn unknown_pattern_names_are_rejected() {
        let mut processor = GrokProcessor::new("grok");
        let options =
            serde_yaml::from_str(r#"{patterns: ["%{NO_SUCH_PATTERN:x}"]}"#).unwrap();
        let err = processor.configure(&options).await.unwrap_err();
        assert!(err.to_string().contains("unknown pattern"));
    }

    #[tokio::test]
    async fn missing_patterns_option_is_rejected() {
        let mut processor = GrokProcessor::new("grok");
        let err = processor
            .configure(&serde_yaml::from_str("{}").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one pattern"));
    }

    #[tokio::test]
    async fn syslog_prog_extracts_nested_named_groups() {
        let processor = grok(r#"{patterns: ["%{SYSLOGPROG}"]}"#).await;
        let out = processor
            .process(LogEvent::new("sshd[4122]: accepted", "file", "f"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.fields["program"], json!("sshd"));
        assert_eq!(out.fields["pid"], json!("4122"));
    }
}
