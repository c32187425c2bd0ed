use std::fmt;

/// A target host and port.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates a new `Endpoint`.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a plaintext HTTP URL for `path` on this endpoint.
    ///
    /// `path` must start with `/`.
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    /// Creates one endpoint per host, all on the same port.
    ///
    /// Hosts are comma-separated. Surrounding whitespace and empty entries are ignored.
    pub fn parse_list(hosts: &str, port: u16) -> Vec<Self> {
        hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| Self::new(host, port))
            .collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
