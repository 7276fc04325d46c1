//! Host byte-order probe.

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

static SYSTEM: OnceLock<Endianness> = OnceLock::new();

impl Endianness {
    /// Byte order of the running host, probed once per process.
    pub fn system() -> Self {
        *SYSTEM.get_or_init(|| {
            if 1u16.to_ne_bytes()[0] == 1 {
                Endianness::Little
            } else {
                Endianness::Big
            }
        })
    }

    /// Device buffers are little endian; big-endian hosts swap every word.
    pub fn needs_swap(self) -> bool {
        self == Endianness::Big
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_matches_target() {
        let expected = if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        };
        assert_eq!(Endianness::system(), expected);
        assert_eq!(Endianness::system(), Endianness::system());
    }
}
