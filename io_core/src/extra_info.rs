//! Keyed transport metadata with alias fallback, grounded on scarletio's
//! `extra_info.py` `ALTERNATIVE_EXTRA_INFO_NAMES` table.

use std::any::Any;
use std::collections::HashMap;

pub const EXTRA_INFO_NAME_SOCKET: &str = "socket";
pub const EXTRA_INFO_NAME_SOCKET_NAME: &str = "socket_name";
pub const EXTRA_INFO_NAME_PEER_NAME: &str = "peer_name";
pub const EXTRA_INFO_NAME_SSL_CONTEXT: &str = "ssl_context";
pub const EXTRA_INFO_NAME_SSL_OBJECT: &str = "ssl_object";
pub const EXTRA_INFO_NAME_PEER_CERTIFICATE: &str = "peer_certification";
pub const EXTRA_INFO_NAME_CIPHER: &str = "cipher";
pub const EXTRA_INFO_NAME_COMPRESSION: &str = "compression";
pub const EXTRA_INFO_NAME_PIPE: &str = "pipe";

/// Maps a canonical or alias name to its counterpart, whichever side is looked up:
/// entries are always stored under the canonical key, but callers may query by either.
fn related_name(name: &str) -> Option<&'static str> {
    Some(match name {
        "socket" => "sock",
        "sock" => "socket",
        "socket_name" => "sockname",
        "sockname" => "socket_name",
        "peer_name" => "peername",
        "peername" => "peer_name",
        "peer_certification" => "peercert",
        "peercert" => "peer_certification",
        _ => return None,
    })
}

/// A type-erased bag of transport metadata, looked up by canonical name with alias fallback.
#[derive(Default)]
pub struct ExtraInfo {
    entries: HashMap<&'static str, Box<dyn Any>>,
}

impl ExtraInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &'static str, value: impl Any) {
        self.entries.insert(name, Box::new(value));
    }

    pub fn get<T: 'static>(&self, name: &str) -> Option<&T> {
        if let Some(value) = self.entries.get(name) {
            return value.downcast_ref::<T>();
        }
        if let Some(related) = related_name(name) {
            if let Some(value) = self.entries.get(related) {
                return value.downcast_ref::<T>();
            }
        }
        None
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
            || related_name(name).is_some_and(|related| self.entries.contains_key(related))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_lookup() {
        let mut extra = ExtraInfo::new();
        extra.set(EXTRA_INFO_NAME_PEER_NAME, "1.2.3.4:80".to_string());
        assert_eq!(extra.get::<String>("peer_name").map(String::as_str), Some("1.2.3.4:80"));
    }

    #[test]
    fn alias_lookup_falls_back() {
        let mut extra = ExtraInfo::new();
        extra.set(EXTRA_INFO_NAME_PEER_NAME, "1.2.3.4:80".to_string());
        assert_eq!(extra.get::<String>("peername").map(String::as_str), Some("1.2.3.4:80"));
    }

    #[test]
    fn has_resolves_aliases_too() {
        let mut extra = ExtraInfo::new();
        extra.set(EXTRA_INFO_NAME_SOCKET_NAME, "127.0.0.1:0".to_string());
        assert!(extra.has("sockname"));
        assert!(extra.has("socket_name"));
    }

    #[test]
    fn missing_key_is_none() {
        let extra = ExtraInfo::new();
        assert!(extra.get::<String>("cipher").is_none());
        assert!(!extra.has("cipher"));
    }
}
