//! Host list parsing.
//!
//! The list is a `+`-separated sequence of `host:n` entries.  An empty host
//! (`:n`) names the local socket `<socket_dir>/<n>`; any other host is a TCP
//! address listening on port `4101 + n`.  A missing `:n` means `n = 0`.

use std::fmt;
use std::path::{Path, PathBuf};

use super::NetworkError;

/// TCP port of endpoint number 0.
pub const BASE_PORT: u16 = 4101;

/// Largest number of endpoints served at once.
pub const MAX_ENDPOINTS: usize = 4;

/// One place clients can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Local { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Parses a host list.  Empty entries are skipped.
///
/// # Errors
///
/// [`NetworkError::InvalidEndpoint`] for an entry whose number is not a valid
/// port offset, [`NetworkError::TooManyEndpoints`] for more than
/// [`MAX_ENDPOINTS`] entries.
pub fn parse_hosts(hosts: &str, socket_dir: &Path) -> Result<Vec<Endpoint>, NetworkError> {
    let endpoints = hosts
        .split('+')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_entry(entry, socket_dir))
        .collect::<Result<Vec<_>, _>>()?;
    if endpoints.len() > MAX_ENDPOINTS {
        return Err(NetworkError::TooManyEndpoints {
            count: endpoints.len(),
            max: MAX_ENDPOINTS,
        });
    }
    Ok(endpoints)
}

fn parse_entry(entry: &str, socket_dir: &Path) -> Result<Endpoint, NetworkError> {
    let invalid = || NetworkError::InvalidEndpoint(entry.to_string());

    let (host, number) = match entry.rsplit_once(':') {
        // A bare IPv6 address has colons but no port suffix.
        Some((host, _)) if host.contains(':') && !host.ends_with(']') => (entry, "0"),
        Some((host, number)) => (host, number),
        None => (entry, "0"),
    };
    let number: u16 = number.parse().map_err(|_| invalid())?;

    if host.is_empty() {
        return Ok(Endpoint::Local {
            path: socket_dir.join(number.to_string()),
        });
    }
    let port = BASE_PORT.checked_add(number).ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(Endpoint::Tcp {
        host: host.to_string(),
        port,
    })
}
