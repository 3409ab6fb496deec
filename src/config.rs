use std::error;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::result;
use std::time::Duration;

use serde::de;
use serde::Deserialize;

use crate::crypto::Method;

pub type Result<T> = result::Result<T, Box<dyn error::Error>>;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub listen: SocketAddr,
    pub server: SocketAddr,
    pub password: String,
    pub method: Method,
    pub timeout: Duration,
    pub fast_open: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub password: String,
    pub method: Method,
    pub timeout: Duration,
    pub fast_open: bool,
    pub workers: usize,
}

impl LocalConfig {
    pub fn new(path: &str) -> Result<LocalConfig> {
        let raw: TomlLocalConfig = read_toml_config(path)?;

        let method = match raw.method {
            Some(ref m) => Method::new(m).map_err(|err| format!("'{}' {}", m, err))?,
            None => Method::default(),
        };

        let listen = raw
            .listen
            .parse::<SocketAddr>()
            .map_err(|err| format!("parse listen {}, {}", raw.listen, err))?;

        let server = raw
            .server
            .to_socket_addrs()
            .map_err(|err| format!("resolve server {}, {}", raw.server, err))?
            .next()
            .ok_or_else(|| format!("resolve server {}, no usable address", raw.server))?;

        if raw.password.is_empty() {
            return Err("password must not be empty".into());
        }

        Ok(LocalConfig {
            listen,
            server,
            password: raw.password,
            method,
            timeout: Duration::from_secs(raw.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            fast_open: raw.fast_open.unwrap_or(false),
        })
    }
}

impl ServerConfig {
    pub fn new(path: &str) -> Result<ServerConfig> {
        let raw: TomlServerConfig = read_toml_config(path)?;

        let method = match raw.method {
            Some(ref m) => Method::new(m).map_err(|err| format!("'{}' {}", m, err))?,
            None => Method::default(),
        };

        let listen = raw
            .listen
            .parse::<SocketAddr>()
            .map_err(|err| format!("parse listen {}, {}", raw.listen, err))?;

        if raw.password.is_empty() {
            return Err("password must not be empty".into());
        }

        Ok(ServerConfig {
            listen,
            password: raw.password,
            method,
            timeout: Duration::from_secs(raw.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            fast_open: raw.fast_open.unwrap_or(false),
            workers: raw.workers.unwrap_or(1).max(1),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TomlLocalConfig {
    listen: String,
    server: String,
    password: String,
    method: Option<String>,
    timeout: Option<u64>,
    fast_open: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct TomlServerConfig {
    listen: String,
    password: String,
    method: Option<String>,
    timeout: Option<u64>,
    fast_open: Option<bool>,
    workers: Option<usize>,
}

fn read_toml_config<T>(path: &str) -> Result<T>
where
    T: de::DeserializeOwned,
{
    let content = fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use std::env;
    use std::fs;

    use super::*;

    fn write_temp(name: &str, content: &str) -> String {
        let mut path = env::temp_dir();
        path.push(name);
        fs::write(&path, content).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_local_config() {
        let path = write_temp(
            "umbra-test-local.toml",
            r#"
            listen = "127.0.0.1:1080"
            server = "127.0.0.1:8118"
            password = "barfoo!"
            method = "aes-256-ctr"
            timeout = 60
            "#,
        );

        let config = LocalConfig::new(&path).unwrap();
        assert_eq!(config.listen.port(), 1080);
        assert_eq!(config.server.port(), 8118);
        assert_eq!(config.timeout.as_secs(), 60);
        assert!(!config.fast_open);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_unknown_method() {
        let path = write_temp(
            "umbra-test-method.toml",
            r#"
            listen = "127.0.0.1:8118"
            password = "barfoo!"
            method = "rot13"
            "#,
        );

        assert!(ServerConfig::new(&path).is_err());
        fs::remove_file(&path).unwrap();
    }
}
