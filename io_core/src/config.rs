//! Tunables (§6), collected into one `Config` so embedding applications can override
//! them from a config file without this crate reaching for a CLI parser of its own.

use serde::Deserialize;

/// Default max bytes requested per `recv` on a stream socket.
pub const DEFAULT_RECV_SIZE_SOCKET: usize = 65536;
/// Default max bytes requested per `read` on a pipe fd.
pub const DEFAULT_RECV_SIZE_PIPE: usize = 262144;
/// Default high-water mark for write buffering.
pub const DEFAULT_HIGH_WATER: usize = 65536;
/// Default low-water mark for write buffering.
pub const DEFAULT_LOW_WATER: usize = 16384;
/// Outstanding-bytes threshold past which a `ReadProtocol` asks its transport to pause reading.
pub const DEFAULT_READ_PAUSE_THRESHOLD: usize = 131072;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recv_size_socket: usize,
    pub recv_size_pipe: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub read_pause_threshold: usize,
    /// Max slices batched into a single `sendmsg`; `None` disables batching (no `IOV_MAX` available).
    pub max_sendmsg_slices: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv_size_socket: DEFAULT_RECV_SIZE_SOCKET,
            recv_size_pipe: DEFAULT_RECV_SIZE_PIPE,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            read_pause_threshold: DEFAULT_READ_PAUSE_THRESHOLD,
            max_sendmsg_slices: default_iov_max(),
        }
    }
}

#[cfg(unix)]
fn default_iov_max() -> Option<usize> {
    let value = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    if value > 0 {
        Some(value as usize)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn default_iov_max() -> Option<usize> {
    None
}

/// Derives the low/high water-mark pair from at-most-one user-provided value,
/// matching §4.4: "low defaults to high/4; if only one is provided the other is
/// derived; invariant `0 <= low <= high`".
pub fn resolve_water_marks(low: Option<usize>, high: Option<usize>) -> Result<(usize, usize), String> {
    let (low, high) = match (low, high) {
        (None, None) => (DEFAULT_LOW_WATER, DEFAULT_HIGH_WATER),
        (Some(low), None) => (low, low.saturating_mul(4)),
        (None, Some(high)) => (high / 4, high),
        (Some(low), Some(high)) => (low, high),
    };

    if high < low {
        return Err(format!(
            "high water must be greater than or equal to low water, got high={high}, low={low}"
        ));
    }

    Ok((low, high))
}

/// Default port registry (§6) used only by default-port detection utilities consumed
/// by higher layers (e.g. to decide whether a URL's explicit port can be omitted).
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "ws" => Some(80),
        "wss" => Some(443),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let (low, high) = resolve_water_marks(None, None).unwrap();
        assert_eq!(low, DEFAULT_LOW_WATER);
        assert_eq!(high, DEFAULT_HIGH_WATER);
    }

    #[test]
    fn low_only_derives_high() {
        let (low, high) = resolve_water_marks(Some(100), None).unwrap();
        assert_eq!(low, 100);
        assert_eq!(high, 400);
    }

    #[test]
    fn high_only_derives_low() {
        let (low, high) = resolve_water_marks(None, Some(400)).unwrap();
        assert_eq!(low, 100);
        assert_eq!(high, 400);
    }

    #[test]
    fn high_below_low_rejected() {
        assert!(resolve_water_marks(Some(10), Some(5)).is_err());
    }

    #[test]
    fn default_ports_known_schemes() {
        assert_eq!(default_port("https"), Some(443));
        assert_eq!(default_port("gopher"), None);
    }
}
