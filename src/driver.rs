//! Driver registry.
//!
//! Maps a device node's (major, minor) identity to a driver tag, so the
//! host framework's fd-type classifier can decide whether to hand a verbs
//! fd to this subsystem at all. One row is mapped today.

/// Driver tags this core understands. Currently only soft-RoCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverTag {
    Rxe,
}

/// (major, minor) -> driver tag. `rxe0`'s character device is major 231,
/// minor 192 on the kernels this core targets.
const DRIVER_TABLE: &[(u32, u32, DriverTag)] = &[(231, 192, DriverTag::Rxe)];

/// Look up the driver tag for a device node, if this core recognizes it.
pub fn lookup_driver(major: u32, minor: u32) -> Option<DriverTag> {
    DRIVER_TABLE
        .iter()
        .find(|(maj, min, _)| *maj == major && *min == minor)
        .map(|(_, _, tag)| *tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_rxe_node() {
        assert_eq!(lookup_driver(231, 192), Some(DriverTag::Rxe));
    }

    #[test]
    fn rejects_unknown_node() {
        assert_eq!(lookup_driver(1, 1), None);
    }
}
