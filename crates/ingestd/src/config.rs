//! INI-style configuration: `[section]` headers, `key = value` lines,
//! `#`/`;` comments. The parsed table is passed down explicitly; unknown
//! keys are kept for other consumers of the same file and ignored here.

use series_schema::LoadOptions;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct Config {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn parse(text: &str) -> Config {
        let mut config = Config::default();
        let mut section = String::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                section = name.trim().to_owned();
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    config
                        .sections
                        .entry(section.clone())
                        .or_default()
                        .insert(key.trim().to_owned(), value.trim().to_owned());
                }
                None => tracing::debug!(line, "ignoring configuration line"),
            }
        }
        config
    }

    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("configuration {}: {}", path.display(), err))?;
        Ok(Config::parse(&text))
    }

    pub fn lookup(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .get(key)
            .map(String::as_str)
    }
}

/// The recognized options, with their defaults applied.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Store endpoints, `host:port` each.
    pub servers: Vec<String>,
    /// `redis.enabled` gates the whole store module.
    pub redis_enabled: bool,
    /// `pmseries.enabled` gates series loading.
    pub series_enabled: bool,
    /// `pmsearch.enabled` gates search schema registration.
    pub search_enabled: bool,
    /// `pmproxy.redis.enabled` gates the command-table probe used when
    /// proxying store traffic.
    pub proxy_protocol: bool,
    pub discover_enabled: bool,
    pub exclude_metrics: Option<String>,
    pub exclude_indoms: Option<String>,
    /// Cursor page size for store scans by the query surfaces.
    pub cursor_count: u32,
    pub stream_maxlen: u32,
    pub stream_expire: u64,
}

impl Settings {
    pub fn from_config(config: &Config) -> Settings {
        Settings {
            servers: config
                .lookup("redis", "servers")
                .unwrap_or("localhost:6379")
                .split(',')
                .map(|server| server.trim().to_owned())
                .filter(|server| !server.is_empty())
                .collect(),
            redis_enabled: flag(config, "redis", "enabled", true),
            series_enabled: flag(config, "pmseries", "enabled", true),
            search_enabled: flag(config, "pmsearch", "enabled", false),
            proxy_protocol: flag(config, "pmproxy", "redis.enabled", false),
            discover_enabled: flag(config, "discover", "enabled", true),
            exclude_metrics: config
                .lookup("discover", "exclude.metrics")
                .map(str::to_owned),
            exclude_indoms: config
                .lookup("discover", "exclude.indoms")
                .map(str::to_owned),
            cursor_count: number(config, "pmseries", "cursor.count", 256),
            stream_maxlen: number(config, "pmseries", "stream.maxlen", 8640),
            stream_expire: number(config, "pmseries", "stream.expire", 86400),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            stream_maxlen: self.stream_maxlen,
            stream_expire: self.stream_expire,
        }
    }
}

fn flag(config: &Config, section: &str, key: &str, default: bool) -> bool {
    match config.lookup(section, key) {
        Some(value) => value.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn number<T: std::str::FromStr + Copy>(config: &Config, section: &str, key: &str, default: T) -> T {
    match config.lookup(section, key) {
        Some(text) => match text.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(section, key, value = text, "unparseable option, using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_sections_and_comments() {
        let config = Config::parse(
            "# a comment\n\
             [pmseries]\n\
             stream.maxlen = 720\n\
             ; another comment\n\
             [discover]\n\
             enabled = false\n\
             exclude.metrics = proc.*, kernel.all.load\n\
             stray line without equals\n",
        );

        assert_eq!(config.lookup("pmseries", "stream.maxlen"), Some("720"));
        assert_eq!(config.lookup("discover", "enabled"), Some("false"));
        assert_eq!(
            config.lookup("discover", "exclude.metrics"),
            Some("proc.*, kernel.all.load")
        );
        assert_eq!(config.lookup("pmseries", "enabled"), None);
        assert_eq!(config.lookup("redis", "servers"), None);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_config(&Config::default());
        assert_eq!(settings.servers, vec!["localhost:6379".to_owned()]);
        assert!(settings.redis_enabled);
        assert!(settings.series_enabled);
        assert!(!settings.search_enabled);
        assert!(!settings.proxy_protocol);
        assert!(settings.discover_enabled);
        assert_eq!(settings.cursor_count, 256);
        assert_eq!(settings.stream_maxlen, 8640);
        assert_eq!(settings.stream_expire, 86400);
        assert_eq!(settings.exclude_metrics, None);
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse(
            "[redis]\n\
             servers = a:6379, b:6380\n\
             enabled = TRUE\n\
             [pmseries]\n\
             stream.maxlen = 720\n\
             stream.expire = not-a-number\n\
             [pmproxy]\n\
             redis.enabled = true\n",
        );
        let settings = Settings::from_config(&config);

        assert_eq!(settings.servers, vec!["a:6379".to_owned(), "b:6380".to_owned()]);
        assert!(settings.redis_enabled);
        assert!(settings.proxy_protocol);
        assert_eq!(settings.stream_maxlen, 720);
        // Unparseable values fall back to the default.
        assert_eq!(settings.stream_expire, 86400);

        let options = settings.load_options();
        assert_eq!(options.stream_maxlen, 720);
        assert_eq!(options.stream_expire, 86400);
    }
}
