use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct WebserviceConfig {
    pub bind_addr: SocketAddr,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_schema: String,
    pub upload_dir: String,
    pub ws_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl WebserviceConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("LEVSEQ_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("LEVSEQ_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8123),
            "LEVSEQ_BIND_ADDR",
        )?;

        let db_host = nonempty_or(kv.get("LEVSEQ_DB_HOST"), "localhost");
        let db_port = parse_u16(kv.get("LEVSEQ_DB_PORT"), 5432, "LEVSEQ_DB_PORT")?;
        let db_name = nonempty_or(kv.get("LEVSEQ_DB_NAME"), "levseq");
        let db_schema = nonempty_or(kv.get("LEVSEQ_DB_SCHEMA"), "levseq");

        // Peer authentication: the Postgres role is the OS username unless
        // explicitly overridden.
        let db_user = kv
            .get("LEVSEQ_DB_USER")
            .or_else(|| kv.get("USER"))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "set LEVSEQ_DB_USER or USER to name the database role".to_string(),
            })?;
        if !is_safe_conninfo_token(&db_user) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "LEVSEQ_DB_USER must contain only [A-Za-z0-9._-]".to_string(),
            });
        }
        for (key, value) in [
            ("LEVSEQ_DB_HOST", &db_host),
            ("LEVSEQ_DB_NAME", &db_name),
        ] {
            if !is_safe_conninfo_token(value) {
                return Err(StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: format!("{} must contain only [A-Za-z0-9._-]", key),
                });
            }
        }

        let upload_dir = nonempty_or(kv.get("LEVSEQ_UPLOAD_DIR"), "uploads");
        let ws_id = parse_i64(kv.get("LEVSEQ_WS_ID"), 1, "LEVSEQ_WS_ID")?;

        Ok(Self {
            bind_addr,
            db_host,
            db_port,
            db_name,
            db_user,
            db_schema,
            upload_dir,
            ws_id,
        })
    }

    pub fn pg_conninfo(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.db_user, self.db_host, self.db_port, self.db_name
        )
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        let mut value = value.trim().to_string();
        value = strip_quotes(&value);
        kv.insert(key.to_string(), value);
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn nonempty_or(value: Option<&String>, default: &str) -> String {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u16(value: Option<&String>, default: u16, key: &'static str) -> Result<u16, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<u16>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_i64(value: Option<&String>, default: i64, key: &'static str) -> Result<i64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<i64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn is_safe_conninfo_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_ok_env() -> HashMap<String, String> {
        HashMap::from([("USER".to_string(), "seqlab".to_string())])
    }

    #[test]
    fn defaults_apply_when_only_user_is_present() {
        let cfg = WebserviceConfig::from_kv(&minimal_ok_env()).expect("config should parse");
        assert_eq!(cfg.db_user, "seqlab");
        assert_eq!(cfg.db_port, 5432);
        assert_eq!(cfg.db_schema, "levseq");
        assert_eq!(cfg.pg_conninfo(), "postgres://seqlab@localhost:5432/levseq");
    }

    #[test]
    fn explicit_db_user_wins_over_os_user() {
        let mut env = minimal_ok_env();
        env.insert("LEVSEQ_DB_USER".to_string(), "pipeline".to_string());
        let cfg = WebserviceConfig::from_kv(&env).expect("config should parse");
        assert_eq!(cfg.db_user, "pipeline");
    }

    #[test]
    fn missing_user_fails() {
        let err = WebserviceConfig::from_kv(&HashMap::new()).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
    }

    #[test]
    fn unsafe_db_user_fails() {
        let mut env = minimal_ok_env();
        env.insert(
            "LEVSEQ_DB_USER".to_string(),
            "evil@host/other".to_string(),
        );
        let err = WebserviceConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn invalid_bind_addr_fails() {
        let mut env = minimal_ok_env();
        env.insert("LEVSEQ_BIND_ADDR".to_string(), "not-an-addr".to_string());
        let err = WebserviceConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }
}
