use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 64738;

/// Boundary for SRV lookups. The engine never performs DNS itself; the host
/// injects a resolver (or none, in which case resolution falls back to the
/// literal host and default port).
pub trait SrvResolver {
    /// Resolve an SRV service name (e.g. `_mumble._tcp.example.org`) to a
    /// host/port pair, or `None` when no record exists or the lookup fails
    /// within its bounded wait.
    fn resolve(&self, service: &str) -> Option<(String, u16)>;
}

/// Resolver that never finds a record; resolution falls back to the literal
/// host and default port.
#[derive(Debug, Default)]
pub struct NoopSrvResolver;

impl SrvResolver for NoopSrvResolver {
    fn resolve(&self, _service: &str) -> Option<(String, u16)> {
        None
    }
}

/// A connection target. Carries a lazily computed resolved endpoint that is
/// cached until the host or port is mutated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    id: i64,
    name: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    #[serde(skip)]
    resolved: Option<(String, u16)>,
}

impl Server {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            resolved: None,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    /// The user-defined name, falling back to the host when unset.
    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
        self.resolved = None;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.resolved = None;
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    /// Whether this server is stored persistently by the host.
    pub fn is_saved(&self) -> bool {
        self.id != -1
    }

    /// Resolve the connection endpoint.
    ///
    /// An explicit nonzero port short-circuits resolution; literal IP
    /// addresses and `.onion` pseudo-hosts skip SRV and use the default
    /// port. Everything else attempts an SRV lookup and falls back to the
    /// literal host and default port. The result is cached until the host
    /// or port changes.
    pub fn resolve(&mut self, resolver: &dyn SrvResolver) -> (String, u16) {
        if let Some(endpoint) = &self.resolved {
            return endpoint.clone();
        }

        let endpoint = if self.port != 0 {
            (self.host.clone(), self.port)
        } else if self.host.parse::<std::net::IpAddr>().is_ok() || self.host.ends_with(".onion") {
            (self.host.clone(), DEFAULT_PORT)
        } else {
            let service = format!("_mumble._tcp.{}", self.host);
            match resolver.resolve(&service) {
                Some(endpoint) => endpoint,
                None => {
                    log::debug!("no SRV record for {service}, using literal host");
                    (self.host.clone(), DEFAULT_PORT)
                }
            }
        };

        self.resolved = Some(endpoint.clone());
        endpoint
    }
}
