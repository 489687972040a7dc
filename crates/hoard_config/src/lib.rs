use serde::Deserialize;

mod validation;

pub use validation::{ConfigReport, validate};

// =======================================================
// GLOBAL CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info,hoard=debug".into(),
        }
    }
}

impl GlobalConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

// =======================================================
// SERVER CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub root: String,
    pub index: String,
    /// Upper bound on concurrently served connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            root: "./public".into(),
            index: "index.html".into(),
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

// =======================================================
// STORE KIND (enum tipado)
// =======================================================
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "disk")]
    Disk,
}

// =======================================================
// CACHE CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Path prefixes eligible for caching (plain, case-sensitive prefix match).
    pub cacheable_paths: Vec<String>,
    /// TTL in seconds used when a response carries no `max-age`.
    pub default_max_age_secs: u64,
    /// Largest body in bytes that will be stored (optional).
    pub max_object_bytes: Option<u64>,
    pub store: StoreKind,
    /// Directory used by the disk store.
    pub cache_dir: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cacheable_paths: Vec::new(),
            default_max_age_secs: 30,
            max_object_bytes: None,
            store: StoreKind::Memory,
            cache_dir: None,
        }
    }
}

impl CacheConfig {
    /// Build a config with the two settings every cache needs.
    pub fn new<I, S>(cacheable_paths: I, default_max_age_secs: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cacheable_paths: cacheable_paths.into_iter().map(Into::into).collect(),
            default_max_age_secs,
            ..Self::default()
        }
    }

    pub fn with_max_object_bytes(mut self, limit: u64) -> Self {
        self.max_object_bytes = Some(limit);
        self
    }

    pub fn cacheable_paths(&self) -> &[String] {
        &self.cacheable_paths
    }

    pub fn default_max_age_secs(&self) -> u64 {
        self.default_max_age_secs
    }

    pub fn max_object_bytes(&self) -> Option<u64> {
        self.max_object_bytes
    }

    pub fn store(&self) -> StoreKind {
        self.store
    }

    pub fn cache_dir(&self) -> Option<&str> {
        self.cache_dir.as_deref()
    }
}

// =======================================================
// HOARD CONFIG (main config)
// =======================================================
#[derive(Debug, Deserialize, Default)]
pub struct HoardConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl HoardConfig {
    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn from_file(file_name: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::new(file_name, config::FileFormat::Toml).required(false))
            .build()?;

        let mut cfg: HoardConfig = built.try_deserialize()?;

        cfg.apply_defaults();
        Ok(cfg)
    }

    pub fn from_file_or_default(file_name: &str) -> Self {
        match Self::from_file(file_name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("⚠️  Error reading config '{file_name}': {e}");
                eprintln!("➡️  Using default config (in-memory)...");
                HoardConfig::default()
            }
        }
    }

    fn apply_defaults(&mut self) {
        let def_global = GlobalConfig::default();
        if self.global.log_level.is_empty() {
            self.global.log_level = def_global.log_level;
        }

        let def_server = ServerConfig::default();
        if self.server.listen.is_empty() {
            self.server.listen = def_server.listen;
        }
        if self.server.root.is_empty() {
            self.server.root = def_server.root;
        }
        if self.server.index.is_empty() {
            self.server.index = def_server.index;
        }
        if self.server.max_connections == 0 {
            self.server.max_connections = def_server.max_connections;
        }

        // Blank prefixes would match every path.
        self.cache.cacheable_paths.retain(|p| !p.trim().is_empty());
    }

    pub fn print(&self) {
        println!("================ HOARD CONFIG ================");

        println!("\n[global]");
        println!("  log_level            = {}", self.global.log_level);

        println!("\n[server]");
        println!("  listen               = {}", self.server.listen);
        println!("  root                 = {}", self.server.root);
        println!("  index                = {}", self.server.index);
        println!("  max_connections      = {}", self.server.max_connections);

        println!("\n[cache]");
        println!("  cacheable_paths      = {:?}", self.cache.cacheable_paths);
        println!(
            "  default_max_age_secs = {}",
            self.cache.default_max_age_secs
        );
        println!("  max_object_bytes     = {:?}", self.cache.max_object_bytes);
        println!("  store                = {:?}", self.cache.store);
        println!("  cache_dir            = {:?}", self.cache.cache_dir);

        println!("==============================================");
    }
}
