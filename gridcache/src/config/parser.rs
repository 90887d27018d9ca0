//! INI parsing: `Ini` → [`ConfigFile`].
//!
//! The single place where INI key names map to struct fields.

use std::path::PathBuf;
use std::str::FromStr;

use ini::{Ini, Properties};

use super::settings::{ConfigFile, CoordinationBackend};
use super::ConfigFileError;

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses an optional field; `reason` describes the expected form.
fn parse_field<T: FromStr>(
    props: &Properties,
    section: &str,
    key: &str,
    reason: &str,
) -> Result<Option<T>, ConfigFileError> {
    match props.get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(section, key, v, reason)),
        None => Ok(None),
    }
}

fn non_empty(props: &Properties, key: &str) -> Option<String> {
    props
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Overlays values found in `ini` onto `ConfigFile::default()`.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();
    const SECONDS: &str = "must be a positive integer (seconds)";
    const COUNT: &str = "must be a positive integer";
    const POLL_INTERVAL: &str = "must be a positive integer (milliseconds)";

    // [elasticsearch]
    if let Some(s) = ini.section(Some("elasticsearch")) {
        if let Some(v) = non_empty(s, "url") {
            if !(v.starts_with("http://") || v.starts_with("https://")) {
                return Err(invalid("elasticsearch", "url", &v, "must start with http:// or https://"));
            }
            config.elasticsearch.url = v;
        }
        if let Some(v) = non_empty(s, "index") {
            config.elasticsearch.index = v;
        }
        if let Some(v) = non_empty(s, "geo_point_field") {
            config.elasticsearch.geo_point_field = v;
        }
        if let Some(v) = non_empty(s, "preference") {
            config.elasticsearch.preference = v;
        }
        if let Some(v) = parse_field(s, "elasticsearch", "request_timeout", SECONDS)? {
            config.elasticsearch.request_timeout = v;
        }
    }

    // [cache]
    if let Some(s) = ini.section(Some("cache")) {
        if let Some(v) = non_empty(s, "directory") {
            config.cache.directory = Some(expand_tilde(&v));
        }
        if let Some(v) = parse_field(s, "cache", "data_ttl", SECONDS)? {
            config.cache.data_ttl = v;
        }
        if let Some(v) = parse_field(s, "cache", "lock_ttl", SECONDS)? {
            config.cache.lock_ttl = v;
        }
        if let Some(v) = parse_field(s, "cache", "count_timeout", SECONDS)? {
            config.cache.count_timeout = v;
        }
        if let Some(v) = parse_field(s, "cache", "fetch_timeout", SECONDS)? {
            config.cache.fetch_timeout = v;
        }
        if let Some(v) = parse_field(s, "cache", "lower_threshold", COUNT)? {
            config.cache.lower_threshold = v;
        }
        if let Some(v) = parse_field(s, "cache", "high_threshold", COUNT)? {
            config.cache.high_threshold = v;
        }
        if let Some(v) = parse_field::<usize>(s, "cache", "write_concurrency", COUNT)? {
            if v == 0 {
                return Err(invalid("cache", "write_concurrency", "0", COUNT));
            }
            config.cache.write_concurrency = v;
        }
    }

    // [coordination]
    if let Some(s) = ini.section(Some("coordination")) {
        if let Some(v) = s.get("backend") {
            config.coordination.backend = CoordinationBackend::from_str(v)
                .map_err(|_| invalid("coordination", "backend", v, "must be one of: file, memory, redis"))?;
        }
        if let Some(v) = non_empty(s, "redis_url") {
            config.coordination.redis_url = Some(v);
        }
        if let Some(v) = parse_field(s, "coordination", "count_ttl", SECONDS)? {
            config.coordination.count_ttl = v;
        }
        if let Some(v) = parse_field(s, "coordination", "wait_timeout", SECONDS)? {
            config.coordination.wait_timeout = v;
        }
        if let Some(v) = parse_field::<u64>(s, "coordination", "poll_interval_ms", POLL_INTERVAL)? {
            if v == 0 {
                return Err(invalid("coordination", "poll_interval_ms", "0", POLL_INTERVAL));
            }
            config.coordination.poll_interval_ms = v;
        }
    }
    if config.coordination.backend == CoordinationBackend::Redis && config.coordination.redis_url.is_none() {
        return Err(invalid("coordination", "redis_url", "", "required when backend = redis"));
    }

    // [render]
    if let Some(s) = ini.section(Some("render")) {
        if let Some(v) = parse_field(s, "render", "tile_size", "must be a positive integer (pixels)")? {
            config.render.tile_size = v;
        }
    }

    Ok(config)
}

/// Expands a leading `~/` to the home directory.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<ConfigFile, ConfigFileError> {
        parse_ini(&Ini::load_from_str(content).unwrap())
    }

    #[test]
    fn test_empty_is_default() {
        assert_eq!(parse("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            "[elasticsearch]\n\
             url = https://search.internal:9200\n\
             index = obs\n\
             geo_point_field = private_location\n\
             request_timeout = 10\n\
             [cache]\n\
             directory = /var/cache/tiles\n\
             data_ttl = 3600\n\
             lower_threshold = 1000\n\
             write_concurrency = 8\n\
             [coordination]\n\
             backend = memory\n\
             poll_interval_ms = 100\n\
             [render]\n\
             tile_size = 512\n",
        )
        .unwrap();
        assert_eq!(config.elasticsearch.url, "https://search.internal:9200");
        assert_eq!(config.elasticsearch.index, "obs");
        assert_eq!(config.query_config().geo_point_field, "private_location");
        assert_eq!(config.cache.directory, Some(PathBuf::from("/var/cache/tiles")));
        assert_eq!(config.cache_config().data_ttl.as_secs(), 3600);
        assert_eq!(config.pipeline_config().lower_threshold, 1000);
        assert_eq!(config.pipeline_config().write_concurrency, 8);
        assert_eq!(config.coordination.backend, CoordinationBackend::Memory);
        assert_eq!(config.reservation_config().poll_interval.as_millis(), 100);
        assert_eq!(config.render.tile_size, 512);
    }

    #[test]
    fn test_invalid_number() {
        match parse("[cache]\nfetch_timeout = soon\n") {
            Err(ConfigFileError::InvalidValue { section, key, value, .. }) => {
                assert_eq!((section.as_str(), key.as_str(), value.as_str()), ("cache", "fetch_timeout", "soon"));
            }
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_backend_and_missing_redis_url() {
        assert!(parse("[coordination]\nbackend = etcd\n").is_err());
        assert!(parse("[coordination]\nbackend = redis\n").is_err());
        let config = parse("[coordination]\nbackend = redis\nredis_url = redis://127.0.0.1/\n").unwrap();
        assert_eq!(config.coordination.backend, CoordinationBackend::Redis);
    }

    #[test]
    fn test_zero_write_concurrency_rejected() {
        assert!(parse("[cache]\nwrite_concurrency = 0\n").is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        match parse("[coordination]\npoll_interval_ms = 0\n") {
            Err(ConfigFileError::InvalidValue { section, key, .. }) => {
                assert_eq!(section, "coordination");
                assert_eq!(key, "poll_interval_ms");
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
        let config = parse("[coordination]\npoll_interval_ms = 50\n").unwrap();
        assert_eq!(config.coordination.poll_interval_ms, 50);
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/tiles"), home.join("tiles"));
        }
    }
}
