//! Server identity token included in search replies.

use std::fmt;

use rand::RngCore;

/// Length of a [`Guid`] on the wire
pub const GUID_LENGTH: usize = 12;

/// Globally unique ID of a server process
///
/// Twelve random bytes, generated once per server. Clients use it to tell
/// apart servers that reply from the same address, e.g. after a restart.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; GUID_LENGTH]);

impl Guid {
    /// Create a new random Guid
    pub fn random() -> Self {
        let mut bytes = [0u8; GUID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }

    pub fn from_bytes(bytes: [u8; GUID_LENGTH]) -> Self {
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GUID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GUID 0x")?;
        for b in self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
