use std::path::PathBuf;

/// Runtime configuration, loaded from the environment with defaults.
#[derive(Clone)]
pub struct Config {
    pub server: ServerConfig,
}

/// Settings for the listening side of the server.
#[derive(Clone)]
pub struct ServerConfig {
    /// TCP address to listen on.
    pub listen_addr: String,

    /// Optional Unix-domain socket path to listen on as well.
    pub unix_listen: Option<PathBuf>,

    /// Size of the per-connection read buffer in bytes.
    pub buffer_size: usize,

    /// Contain panics escaping application handlers instead of letting them
    /// take the whole process down.
    pub safe_mode: bool,
}

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_BUFFER_SIZE: usize = 8192;

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Recognized variables:
    ///
    /// - `LISTEN` - TCP listen address (default `127.0.0.1:8080`)
    /// - `UNIX_LISTEN` - Unix socket path (unset by default)
    /// - `BUFFER_SIZE` - per-connection read buffer size in bytes
    /// - `SAFE_MODE` - `1`/`true` to contain handler panics
    pub fn load() -> Self {
        let listen_addr = std::env::var("LISTEN")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

        let unix_listen = std::env::var("UNIX_LISTEN")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let buffer_size = std::env::var("BUFFER_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BUFFER_SIZE);

        let safe_mode = std::env::var("SAFE_MODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            server: ServerConfig {
                listen_addr,
                unix_listen,
                buffer_size,
                safe_mode,
            },
        }
    }
}
