pub mod dns;
pub mod geo;

pub use dns::{DnsLookup, HostnameResolver, TargetResolver};
pub use geo::{GeoResolver, MaxMindResolver, NoopResolver, new_geo_resolver};

/// Sanitize a string for safe terminal display by removing control characters.
///
/// This filters out ASCII control characters (0x00-0x1F, 0x7F) and Unicode control
/// characters that could be used to inject terminal escape sequences.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
