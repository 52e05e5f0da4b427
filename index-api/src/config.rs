use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "STORE_URL", default = "redis://localhost:6379/")]
    pub store_url: String,

    /// Where submitted image payloads are staged until a worker consumes them.
    #[envconfig(from = "STAGING_DIR", default = "/tmp/index-staging")]
    pub staging_dir: String,

    #[envconfig(from = "EMBEDDING_URL", default = "http://localhost:8100/embed")]
    pub embedding_url: String,

    /// Vector dimension shared with the vector-store collaborator.
    #[envconfig(from = "EMBEDDING_DIMENSION", default = "512")]
    pub embedding_dimension: usize,

    #[envconfig(from = "EMBEDDING_TIMEOUT", default = "30")]
    pub embedding_timeout_secs: u64,

    #[envconfig(from = "VECTOR_STORE_URL", default = "http://localhost:6333")]
    pub vector_store_url: String,

    #[envconfig(from = "VECTOR_COLLECTION", default = "products")]
    pub vector_collection: String,

    #[envconfig(from = "VECTOR_STORE_TIMEOUT", default = "10")]
    pub vector_store_timeout_secs: u64,

    #[envconfig(from = "CLEANUP_INTERVAL_SECS", default = "3600")]
    pub cleanup_interval_secs: u64,

    /// Terminal job records older than this are deleted by the cleanup loop.
    #[envconfig(from = "CLEANUP_MAX_AGE_HOURS", default = "168")]
    pub cleanup_max_age_hours: i64,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
