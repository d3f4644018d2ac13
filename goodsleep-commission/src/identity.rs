//! Identity resolution - a stable address from unstable advertisement data
//!
//! Some platforms hide the radio address behind a per-install identifier. The
//! sensor firmware leaks its address through the first three advertised
//! service UUIDs, which lets us rebuild it. That derivation is a heuristic and
//! is only used when the platform cannot hand us the real address.

use serde::{Deserialize, Serialize};

/// How an address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// Reported by the platform, or the transport id already was an address
    Native,
    /// Rebuilt from advertised service UUIDs
    Derived,
    /// Nothing better available, the raw transport id
    Degraded,
}

/// Stable per-device address
///
/// Only `Native` and `Derived` addresses are address-shaped
/// (`XX:XX:XX:XX:XX:XX`); a `Degraded` one is an opaque transport id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedAddress {
    value: String,
    source: AddressSource,
}

impl ResolvedAddress {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> AddressSource {
        self.source
    }

    pub fn is_degraded(&self) -> bool {
        self.source == AddressSource::Degraded
    }

    fn octets(&self) -> Option<[u8; 6]> {
        if self.is_degraded() {
            return None;
        }
        parse_mac(&self.value)
    }

    /// Address of the sensor's Wi-Fi interface
    ///
    /// The Wi-Fi MAC sits two below the Bluetooth MAC in the last octet.
    /// None when this address is not address-shaped or the last octet would
    /// underflow.
    pub fn network_address(&self) -> Option<ResolvedAddress> {
        let mut octets = self.octets()?;
        octets[5] = octets[5].checked_sub(2)?;
        Some(ResolvedAddress {
            value: format_mac(&octets),
            source: self.source,
        })
    }

    /// Label shown to users, `zzZMinga_gx_` plus the last four hex digits
    pub fn display_label(&self) -> String {
        let clean: String = self.value.chars().filter(|c| *c != ':' && *c != '-').collect();
        let tail = if clean.len() >= 4 { &clean[clean.len() - 4..] } else { "" };
        format!("zzZMinga_gx_{}", tail.to_ascii_uppercase())
    }
}

impl std::fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

/// Resolve without a platform-supplied address
pub fn resolve(transport_id: &str, advertised_service_ids: &[String]) -> ResolvedAddress {
    resolve_with_native(None, transport_id, advertised_service_ids)
}

/// Resolve, preferring `native` when the platform supplies one
pub fn resolve_with_native(
    native: Option<&str>,
    transport_id: &str,
    advertised_service_ids: &[String],
) -> ResolvedAddress {
    if let Some(octets) = native.and_then(parse_mac) {
        return ResolvedAddress {
            value: format_mac(&octets),
            source: AddressSource::Native,
        };
    }

    if let Some(octets) = parse_mac(transport_id) {
        return ResolvedAddress {
            value: format_mac(&octets),
            source: AddressSource::Native,
        };
    }

    match derive_from_services(advertised_service_ids) {
        Some(value) => ResolvedAddress {
            value,
            source: AddressSource::Derived,
        },
        None => {
            log::debug!("cannot derive address for {transport_id}, using transport id");
            ResolvedAddress {
                value: transport_id.to_string(),
                source: AddressSource::Degraded,
            }
        }
    }
}

/// Rebuild from the first three service UUIDs
///
/// Each UUID contributes its leading 8 hex characters with leading zeros
/// stripped (the last 4 when all zero). The concatenation must yield exactly
/// 12 hex digits.
fn derive_from_services(service_ids: &[String]) -> Option<String> {
    if service_ids.len() < 3 {
        return None;
    }

    let mut combined = String::with_capacity(12);
    for id in &service_ids[..3] {
        let head = id.get(..8)?;
        if !head.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let stripped = head.trim_start_matches('0');
        combined.push_str(if stripped.is_empty() { &head[4..] } else { stripped });
    }

    if combined.len() != 12 {
        return None;
    }

    let upper = combined.to_ascii_uppercase();
    let groups: Vec<&str> = (0..12).step_by(2).map(|i| &upper[i..i + 2]).collect();
    Some(groups.join(":"))
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut octets = [0u8; 6];
    let mut parts = s.split(':');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

fn format_mac(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
