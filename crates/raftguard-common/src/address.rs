// Address helpers shared by the client pool and the configuration layer
// Raft and API addresses are plain "host:port" strings

use crate::error::{ConfigError, ConfigResult};

/// Extract the port from an address, taking whatever follows the last ':'.
///
/// Lenient on purpose for listen addresses such as `[::]:9000` or `:9000`.
pub fn port_number(addr: &str) -> ConfigResult<u16> {
    let port = addr.rsplit(':').next().unwrap_or(addr);
    port.parse::<u16>()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))
}

/// Split a peer address into host and port.
///
/// Exactly two ':'-delimited components are accepted, so IPv6 literals are
/// rejected here.
pub fn host_and_port(addr: &str) -> ConfigResult<(&str, u16)> {
    let parts: Vec<&str> = addr.split(':').collect();
    if parts.len() != 2 {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }

    let port = parts[1]
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;

    Ok((parts[0], port))
}
