//! BLE GATT identifiers for Good Sleep device provisioning
//!
//! The sensor exposes a UART-style service. Two firmware families are in the
//! field and they name their characteristics differently, so channels are
//! recognized by identifier prefix rather than by full UUID.

/// Prefix of the provisioning service (Nordic UART service family)
pub const SERVICE_PREFIX: &str = "6E400001";

/// Prefixes of the command characteristic (write)
pub const WRITE_PREFIXES: &[&str] = &["6E400002", "0000C304"];

/// Prefixes of the status characteristic (notify)
pub const NOTIFY_PREFIXES: &[&str] = &["6E400003", "0000C305"];

/// Advertised name fragment every Good Sleep sensor carries
pub const DEVICE_NAME_PATTERN: &str = "GOODSLEEP";

/// Returns true if `id` contains one of `prefixes` anywhere, ignoring case
///
/// The fragment does not have to lead: some platforms wrap identifiers in
/// braces. Identifiers are reported upper-case on some platforms and
/// lower-case on others, and 16-bit UUIDs are expanded with a `0000` lead.
/// `prefixes` must be upper-case.
pub fn matches_prefix(id: &str, prefixes: &[&str]) -> bool {
    let id = id.to_ascii_uppercase();
    prefixes.iter().any(|p| id.contains(p))
}
