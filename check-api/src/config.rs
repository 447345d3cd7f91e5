use envconfig::Envconfig;

use check_common::jobs::JobsSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "LEAN_SERVER_HOST", default = "0.0.0.0")]
    pub host: String,

    // The hosting platform provides PORT at runtime; 8000 is the local dev
    // fallback.
    #[envconfig(from = "PORT", default = "8000")]
    pub port: u16,

    #[envconfig(from = "LEAN_SERVER_API_KEY")]
    pub api_key: Option<String>,

    #[envconfig(from = "LEAN_SERVER_ASYNC_ENABLED", default = "false")]
    pub async_enabled: bool,

    #[envconfig(from = "LEAN_SERVER_REDIS_URL")]
    pub redis_url: Option<String>,

    #[envconfig(from = "LEAN_SERVER_ASYNC_QUEUE_NAME", default = "lean_async_check")]
    pub async_queue_name: String,

    #[envconfig(from = "LEAN_SERVER_ASYNC_RESULT_TTL_SEC", default = "86400")]
    pub async_result_ttl_sec: u64,

    #[envconfig(from = "LEAN_SERVER_ASYNC_BACKLOG_LIMIT", default = "50000")]
    pub async_backlog_limit: usize,

    /// How long clients are expected to wait on a queued job before giving
    /// up. Informational; not enforced here.
    #[envconfig(from = "LEAN_SERVER_ASYNC_MAX_QUEUE_WAIT_SEC", default = "600")]
    pub async_max_queue_wait_sec: u64,

    #[envconfig(from = "LEAN_SERVER_ASYNC_REDIS_KEY_PREFIX", default = "lean_async")]
    pub async_redis_key_prefix: String,

    #[envconfig(from = "LEAN_SERVER_ASYNC_USE_IN_MEMORY_BACKEND", default = "false")]
    pub async_use_in_memory_backend: bool,

    #[envconfig(from = "LEAN_SERVER_MAX_BODY_SIZE", default = "5000000")]
    pub max_body_size: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn jobs_settings(&self) -> JobsSettings {
        JobsSettings {
            redis_url: self.redis_url.clone(),
            queue_name: self.async_queue_name.clone(),
            key_prefix: self.async_redis_key_prefix.clone(),
            result_ttl_sec: self.async_result_ttl_sec,
            backlog_limit: self.async_backlog_limit,
            use_in_memory_backend: self.async_use_in_memory_backend,
        }
    }
}
