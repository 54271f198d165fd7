//! Connection options.
//!
//! Options can be built from discrete fields, a key/value mapping, a
//! conninfo string (`key='value' ...`), or a `postgres://` URL. All forms
//! normalize to the same conninfo representation, which is also what the
//! startup packet is generated from.

use url::Url;

use crate::error::ConnectionError;

/// Parameter keys that steer the client itself and must not be forwarded
/// to the server in the startup packet.
const CLIENT_ONLY_KEYS: &[&str] = &["sslmode", "connect_timeout"];

/// Connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `"localhost"`
    pub host: String,

    /// Port number.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path, used instead of TCP when set.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name reported to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            params: Vec::new(),
        }
    }
}

impl Opts {
    /// Build options from a key/value mapping.
    ///
    /// Accepts the same keys as conninfo strings: `host`, `port`, `dbname`
    /// (or `database`), `user`, `password`, `application_name`, plus
    /// arbitrary server parameters.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut opts = Opts::default();
        for (key, value) in pairs {
            opts.apply(key.as_ref(), value.as_ref())?;
        }
        Ok(opts)
    }

    /// Parse a conninfo string of `key='value'` pairs.
    ///
    /// Values may be unquoted words or single-quoted strings where `\'` and
    /// `\\` escape a quote and a backslash.
    pub fn from_conninfo(conninfo: &str) -> Result<Self, ConnectionError> {
        let mut opts = Opts::default();
        let mut chars = conninfo.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c.is_whitespace() {
                    break;
                }
                key.push(c);
                chars.next();
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next() != Some('=') {
                return Err(invalid(format!("missing '=' after key {:?}", key)));
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if(|&c| c == '\'').is_some() {
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(invalid("dangling escape".into())),
                        },
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => return Err(invalid("unterminated quoted value".into())),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    if c == '\\' {
                        chars.next();
                        match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(invalid("dangling escape".into())),
                        }
                        continue;
                    }
                    value.push(c);
                    chars.next();
                }
            }

            opts.apply(&key, &value)?;
        }

        Ok(opts)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConnectionError> {
        match key {
            "host" | "hostaddr" => {
                if value.starts_with('/') {
                    self.socket = Some(value.to_string());
                } else {
                    self.host = value.to_string();
                }
            }
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| invalid(format!("invalid port: {:?}", value)))?;
            }
            "dbname" | "database" => self.database = Some(value.to_string()),
            "user" => self.user = value.to_string(),
            "password" => self.password = Some(value.to_string()),
            "application_name" => self.application_name = Some(value.to_string()),
            other if CLIENT_ONLY_KEYS.contains(&other) => {
                tracing::debug!(key = other, "ignoring client-only connection parameter");
            }
            other => self.params.push((other.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// The normalized conninfo string all input forms converge to.
    ///
    /// Every value is quoted, so embedded spaces and quotes survive.
    pub fn to_conninfo(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut push = |key: &str, value: &str| {
            parts.push(format!("{}={}", key, quote_value(value)));
        };

        match &self.socket {
            Some(socket) => push("host", socket),
            None => push("host", &self.host),
        }
        push("port", &self.port.to_string());
        if let Some(database) = &self.database {
            push("dbname", database);
        }
        push("user", &self.user);
        if let Some(password) = &self.password {
            push("password", password);
        }
        if let Some(name) = &self.application_name {
            push("application_name", name);
        }
        for (key, value) in &self.params {
            push(key, value);
        }

        parts.join(" ")
    }

    /// The (name, value) pairs for the startup packet.
    pub fn startup_params(&self) -> Vec<(&str, &str)> {
        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.user), ("client_encoding", "UTF8")];
        if let Some(database) = &self.database {
            params.push(("database", database));
        }
        if let Some(name) = &self.application_name {
            params.push(("application_name", name));
        }
        for (key, value) in &self.params {
            params.push((key, value));
        }
        params
    }
}

fn invalid(message: String) -> ConnectionError {
    ConnectionError::EstablishFailed(message)
}

/// Quote a conninfo value: `'...'` with `\` and `'` backslash-escaped.
fn quote_value(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

impl TryFrom<&Url> for Opts {
    type Error = ConnectionError;

    /// Parse a `postgres://[user[:password]@]host[:port][/database][?k=v&..]`
    /// URL.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql", "pg"].contains(&url.scheme()) {
            return Err(invalid(format!(
                "invalid scheme: expected 'postgres://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            opts.apply(&key, &value)?;
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = ConnectionError;

    /// Accepts both URL and conninfo forms.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.contains("://") {
            let url = Url::parse(s).map_err(|e| invalid(format!("invalid URL: {}", e)))?;
            Self::try_from(&url)
        } else {
            Self::from_conninfo(s)
        }
    }
}

impl TryFrom<String> for Opts {
    type Error = ConnectionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_fields_normalize() {
        let opts = Opts {
            host: "db.example.com".into(),
            port: 5433,
            database: Some("app".into()),
            user: "svc".into(),
            password: Some("hunter2".into()),
            ..Opts::default()
        };
        assert_eq!(
            opts.to_conninfo(),
            "host='db.example.com' port='5433' dbname='app' user='svc' password='hunter2'"
        );
    }

    #[test]
    fn quoting_tolerates_special_characters() {
        let opts = Opts {
            password: Some("it's a \\trap".into()),
            user: "bob".into(),
            ..Opts::default()
        };
        let conninfo = opts.to_conninfo();
        assert!(conninfo.contains("password='it\\'s a \\\\trap'"));

        // and the round trip preserves the value
        let parsed = Opts::from_conninfo(&conninfo).unwrap();
        assert_eq!(parsed.password.as_deref(), Some("it's a \\trap"));
    }

    #[test]
    fn all_forms_converge() {
        let discrete = Opts {
            host: "localhost".into(),
            port: 5432,
            database: Some("mydb".into()),
            user: "me".into(),
            password: Some("pw".into()),
            ..Opts::default()
        };

        let mapped = Opts::from_pairs([
            ("host", "localhost"),
            ("port", "5432"),
            ("dbname", "mydb"),
            ("user", "me"),
            ("password", "pw"),
        ])
        .unwrap();

        let conninfo =
            Opts::from_conninfo("host='localhost' port='5432' dbname='mydb' user='me' password='pw'")
                .unwrap();

        let url = Opts::try_from("postgres://me:pw@localhost:5432/mydb").unwrap();

        assert_eq!(discrete.to_conninfo(), mapped.to_conninfo());
        assert_eq!(discrete.to_conninfo(), conninfo.to_conninfo());
        assert_eq!(discrete.to_conninfo(), url.to_conninfo());
    }

    #[test]
    fn conninfo_unquoted_values_and_spacing() {
        let opts = Opts::from_conninfo("host = localhost port=5432 user=me").unwrap();
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, 5432);
        assert_eq!(opts.user, "me");
    }

    #[test]
    fn conninfo_errors() {
        assert!(Opts::from_conninfo("host").is_err());
        assert!(Opts::from_conninfo("host='unterminated").is_err());
        assert!(Opts::from_conninfo("port=abc").is_err());
    }

    #[test]
    fn unix_socket_host() {
        let opts = Opts::from_conninfo("host=/var/run/postgresql user=me").unwrap();
        assert_eq!(opts.socket.as_deref(), Some("/var/run/postgresql"));
    }

    #[test]
    fn extra_params_reach_startup() {
        let opts = Opts::from_conninfo("user=me search_path=app sslmode=disable").unwrap();
        let startup = opts.startup_params();
        assert!(startup.contains(&("search_path", "app")));
        // client-only keys never reach the server
        assert!(!startup.iter().any(|(k, _)| *k == "sslmode"));
    }

    #[test]
    fn url_query_parameters() {
        let opts = Opts::try_from("postgres://me@localhost/mydb?application_name=app1").unwrap();
        assert_eq!(opts.application_name.as_deref(), Some("app1"));
        assert_eq!(opts.database.as_deref(), Some("mydb"));
    }
}
