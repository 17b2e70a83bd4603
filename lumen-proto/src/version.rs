//! Compile-time version constants (`spec.md` §6.5).

/// `(major, minor, patch)` of this library, taken from `Cargo.toml`.
pub const LIBRARY_VERSION: (u16, u16, u16) = (0, 1, 0);

/// `(major, minor)` of the wire protocol this crate speaks.
///
/// Bumping the minor version must stay backward compatible (new message
/// kinds or payload fields appended); a major bump means the wire format in
/// `spec.md` §6.1 itself changed.
pub const PROTOCOL_VERSION: (u16, u16) = (1, 0);
