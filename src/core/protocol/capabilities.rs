// src/core/protocol/capabilities.rs

//! Optional protocol features negotiated during the handshake.

use bitflags::bitflags;

bitflags! {
    /// Capabilities a client may request. The daemon acknowledges the
    /// intersection of what was requested and what it supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// The client accepts out-of-band `progress` events.
        const PROGRESS = 1 << 0;
        /// The client may resume a detached session after reconnecting.
        const RESUME   = 1 << 1;
        /// The client relies on the daemon suppressing duplicate frames.
        const DEDUP    = 1 << 2;
    }
}

const NAMES: [(&str, Capabilities); 3] = [
    ("progress", Capabilities::PROGRESS),
    ("resume", Capabilities::RESUME),
    ("dedup", Capabilities::DEDUP),
];

impl Capabilities {
    /// Everything this daemon implements.
    pub fn supported() -> Self {
        Capabilities::all()
    }

    /// Parses capability names. Unknown names are ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(Capabilities::empty(), |acc, name| {
            let name = name.as_ref().trim().to_ascii_lowercase();
            match NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, flag)) => acc | *flag,
                None => acc,
            }
        })
    }

    /// Renders the set back into its wire names, in a stable order.
    pub fn names(&self) -> Vec<String> {
        NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(n, _)| n.to_string())
            .collect()
    }
}
