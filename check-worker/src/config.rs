use std::str::FromStr;

use envconfig::Envconfig;

use check_common::jobs::JobsSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "LEAN_SERVER_HOST", default = "0.0.0.0")]
    pub host: String,

    // Liveness and metrics only; the API service owns the main port.
    #[envconfig(from = "LEAN_SERVER_WORKER_PORT", default = "8001")]
    pub port: u16,

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

    #[envconfig(from = "LEAN_SERVER_ASYNC_REDIS_KEY_PREFIX", default = "lean_async")]
    pub async_redis_key_prefix: String,

    #[envconfig(from = "LEAN_SERVER_ASYNC_USE_IN_MEMORY_BACKEND", default = "false")]
    pub async_use_in_memory_backend: bool,

    /// Checker attempts per task before the task is recorded as failed.
    #[envconfig(from = "LEAN_SERVER_ASYNC_WORKER_RETRIES", default = "3")]
    pub async_worker_retries: u32,

    /// Short dequeue timeout so shutdown drains within one iteration.
    #[envconfig(from = "LEAN_SERVER_ASYNC_DEQUEUE_TIMEOUT_SEC", default = "3")]
    pub async_dequeue_timeout_sec: u64,

    #[envconfig(from = "LEAN_SERVER_CHECKER_URL", default = "http://127.0.0.1:8000")]
    pub checker_url: String,

    #[envconfig(from = "LEAN_SERVER_API_KEY")]
    pub api_key: Option<String>,

    #[envconfig(from = "LEAN_SERVER_MIN_HOST_FREE_MEM", default = "4G")]
    pub min_host_free_mem: EnvMemoryMb,
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

/// A memory amount in megabytes. Accepts `<n>M`, `<n>G`, or a bare integer
/// interpreted as gigabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMemoryMb(pub u64);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMemoryError;

impl FromStr for EnvMemoryMb {
    type Err = ParseEnvMemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(gigabytes) = s.parse::<u64>() {
            return Ok(EnvMemoryMb(gigabytes * 1024));
        }
        if s.len() < 2 || !s.is_ascii() {
            return Err(ParseEnvMemoryError);
        }
        let (digits, unit) = s.split_at(s.len() - 1);
        let n = digits.parse::<u64>().map_err(|_| ParseEnvMemoryError)?;
        match unit {
            "m" | "M" => Ok(EnvMemoryMb(n)),
            "g" | "G" => Ok(EnvMemoryMb(n * 1024)),
            _ => Err(ParseEnvMemoryError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes_parse() {
        assert_eq!("512M".parse(), Ok(EnvMemoryMb(512)));
        assert_eq!("8g".parse(), Ok(EnvMemoryMb(8192)));
        // A bare integer means gigabytes.
        assert_eq!("4".parse(), Ok(EnvMemoryMb(4096)));
        assert_eq!(" 4G ".parse(), Ok(EnvMemoryMb(4096)));
    }

    #[test]
    fn bad_memory_sizes_are_rejected() {
        assert_eq!("".parse::<EnvMemoryMb>(), Err(ParseEnvMemoryError));
        assert_eq!("4T".parse::<EnvMemoryMb>(), Err(ParseEnvMemoryError));
        assert_eq!("G".parse::<EnvMemoryMb>(), Err(ParseEnvMemoryError));
        assert_eq!("lots".parse::<EnvMemoryMb>(), Err(ParseEnvMemoryError));
    }
}
