use std::{net::SocketAddr, path::Path};

use crate::{HoardConfig, StoreKind};

/// Validation output for a loaded Hoard configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    /// Returns true when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true when at least one error was found.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        push_section(&mut out, "Errors", &self.errors);
        push_section(&mut out, "Warnings", &self.warnings);
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

fn push_section(out: &mut String, title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(title);
    out.push_str(":\n");
    for line in lines {
        out.push_str("  - ");
        out.push_str(line);
        out.push('\n');
    }
}

/// Validate a Hoard configuration and return a report of issues.
pub fn validate(cfg: &HoardConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    validate_server(cfg, &mut report);
    validate_cache(cfg, &mut report);

    report
}

fn validate_server(cfg: &HoardConfig, report: &mut ConfigReport) {
    let server = &cfg.server;

    if server.listen.trim().is_empty() {
        report.error("server.listen is empty");
    } else if server.listen.parse::<SocketAddr>().is_err() {
        report.warn(format!(
            "server.listen '{listen}' is not a socket address; DNS resolution will be used",
            listen = server.listen
        ));
    }

    if server.root.trim().is_empty() {
        report.warn("server.root is empty");
    } else if !Path::new(&server.root).exists() {
        report.warn(format!(
            "server.root '{root}' does not exist",
            root = server.root
        ));
    }
}

fn validate_cache(cfg: &HoardConfig, report: &mut ConfigReport) {
    let cache = &cfg.cache;

    if cache.cacheable_paths.is_empty() {
        report.warn("cache.cacheable_paths is empty; no request will be cached");
    }
    for prefix in &cache.cacheable_paths {
        if !prefix.starts_with('/') {
            report.error(format!(
                "cache.cacheable_paths entry '{prefix}' must start with '/'"
            ));
        }
    }

    if cache.default_max_age_secs == 0 {
        report.warn(
            "cache.default_max_age_secs is 0; responses without max-age will not be stored",
        );
    }

    if cache.max_object_bytes == Some(0) {
        report.warn("cache.max_object_bytes is 0; only empty bodies will be stored");
    }

    match (cache.store, cache.cache_dir.as_deref()) {
        (StoreKind::Disk, None) => {
            report.error("cache.store is 'disk' but cache.cache_dir is not set");
        }
        (StoreKind::Memory, Some(dir)) => {
            report.warn(format!(
                "cache.cache_dir '{dir}' is ignored because cache.store is 'memory'"
            ));
        }
        (StoreKind::Disk, Some(dir)) => {
            let path = Path::new(dir);
            if path.exists() {
                if !path.is_dir() {
                    report.error(format!(
                        "cache.cache_dir '{dir}' exists but is not a directory"
                    ));
                }
            } else {
                report.warn(format!(
                    "cache.cache_dir '{dir}' does not exist; it will be created at runtime"
                ));
            }
        }
        (StoreKind::Memory, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::validate;
    use crate::{CacheConfig, HoardConfig, StoreKind};

    fn config_with(cache: CacheConfig) -> HoardConfig {
        let mut cfg = HoardConfig::default();
        cfg.server.listen = "127.0.0.1:8080".into();
        cfg.server.root = ".".into();
        cfg.cache = cache;
        cfg
    }

    #[test]
    fn valid_memory_config_is_ok() {
        let report = validate(&config_with(CacheConfig::new(["/assets"], 10)));
        assert!(report.is_ok(), "{}", report.format());
        assert!(report.warnings().is_empty(), "{}", report.format());
    }

    #[test]
    fn relative_prefix_is_an_error() {
        let report = validate(&config_with(CacheConfig::new(["assets"], 10)));
        assert!(report.has_errors());
        assert!(report.errors()[0].contains("must start with '/'"));
    }

    #[test]
    fn disk_store_requires_cache_dir() {
        let mut cache = CacheConfig::new(["/assets"], 10);
        cache.store = StoreKind::Disk;
        let report = validate(&config_with(cache));
        assert!(report.has_errors());
        assert!(report.format().starts_with("Errors:\n"));
    }

    #[test]
    fn zero_ttl_and_no_paths_warn() {
        let report = validate(&config_with(CacheConfig::new(Vec::<String>::new(), 0)));
        assert!(report.is_ok());
        assert_eq!(report.warnings().len(), 2);
    }
}
