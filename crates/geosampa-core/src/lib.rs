//! Core domain model, identity derivation and legacy codecs for the GeoSampa harvester.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use rslug::slugify;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Prefix used for every catalog package title.
pub const TITLE_PREFIX: &str = "[GeoSampa]";

/// Tag attached to every package next to the theme and sub-theme.
pub const SOURCE_TAG: &str = "geosampa";

static THEME_ORDER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+_").expect("valid theme prefix regex"));

/// One downloadable file discovered on the portal.
///
/// This is also the on-disk sidecar document, so the field names are part of
/// the snapshot format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub theme: String,
    pub sub_theme: String,
    pub layer: String,
    pub file: String,
    pub link: String,
}

impl FileDescriptor {
    pub fn hierarchy(&self) -> (&str, &str, &str, &str) {
        (&self.theme, &self.sub_theme, &self.layer, &self.file)
    }
}

/// Coarse failure classes shared by every stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure (connect, timeout, unexpected status).
    Network,
    /// A remote response was missing an expected field or was malformed.
    Protocol,
    /// A local path was missing, unreadable or not a directory.
    Filesystem,
    /// The catalog API rejected a request.
    Catalog,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::Catalog => "catalog",
        };
        f.write_str(label)
    }
}

/// Package-level identity derived from a `(theme, sub_theme)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageIdentity {
    pub theme_name: String,
    pub sub_theme: String,
    pub title: String,
    pub slug: String,
}

impl PackageIdentity {
    pub fn new(theme: &str, sub_theme: &str) -> Self {
        let theme_name = theme_display_name(theme).to_string();
        let title = if theme_name == sub_theme {
            format!("{TITLE_PREFIX} {theme_name}")
        } else {
            format!("{TITLE_PREFIX} {theme_name} - {sub_theme}")
        };
        let slug = slugify!(&title);
        Self {
            theme_name,
            sub_theme: sub_theme.to_string(),
            title,
            slug,
        }
    }

    pub fn for_descriptor(descriptor: &FileDescriptor) -> Self {
        Self::new(&descriptor.theme, &descriptor.sub_theme)
    }

    /// Package tags in insertion order with repeats removed.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::with_capacity(3);
        for tag in [SOURCE_TAG, self.theme_name.as_str(), self.sub_theme.as_str()] {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        tags
    }

    pub fn resource_hash(&self, file_name: &str) -> String {
        resource_hash(&self.slug, file_name)
    }
}

/// Theme name with the portal's ordering prefix (`"01_"`) removed.
pub fn theme_display_name(theme: &str) -> &str {
    match THEME_ORDER_PREFIX.find(theme) {
        Some(m) => &theme[m.end()..],
        None => theme,
    }
}

/// Structural identity of a catalog resource: `sha1(slug ++ file_name)` as lowercase hex.
pub fn resource_hash(package_slug: &str, file_name: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(package_slug.as_bytes());
    hasher.update(file_name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Encode as ISO-8859-1, or `None` when a character has no single-byte form.
pub fn encode_latin1(text: &str) -> Option<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

/// Decode ISO-8859-1 bytes. Every byte maps to the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Replace every non-ASCII character with a JSON `\uXXXX` escape (UTF-16 units).
///
/// The output is plain ASCII and therefore valid in any single-byte codepage.
/// It must only be applied to serialized JSON text.
pub fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        for unit in c.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{unit:04x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_title_strips_numeric_theme_prefix() {
        let identity = PackageIdentity::new("01_Cartografia", "Quadras");
        assert_eq!(identity.theme_name, "Cartografia");
        assert_eq!(identity.title, "[GeoSampa] Cartografia - Quadras");
        assert_eq!(identity.slug, "geosampa-cartografia-quadras");
    }

    #[test]
    fn package_title_collapses_when_theme_equals_sub_theme() {
        let identity = PackageIdentity::new("05_Habitacao", "Habitacao");
        assert_eq!(identity.title, "[GeoSampa] Habitacao");
        assert_eq!(identity.tags(), vec!["geosampa", "Habitacao"]);
    }

    #[test]
    fn only_leading_prefix_is_stripped() {
        assert_eq!(theme_display_name("Lotes_2020_01"), "Lotes_2020_01");
        assert_eq!(theme_display_name("12_Meio_Ambiente"), "Meio_Ambiente");
    }

    #[test]
    fn resource_hash_is_stable_sha1() {
        let first = resource_hash("geosampa-cartografia-quadras", "a.zip");
        let second = resource_hash("geosampa-cartografia-quadras", "a.zip");
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
        assert_eq!(resource_hash("", "abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn resource_hash_separates_file_names_within_a_package() {
        let identity = PackageIdentity::new("01_Cartografia", "Quadras");
        assert_ne!(identity.resource_hash("a.zip"), identity.resource_hash("b.zip"));
    }

    #[test]
    fn latin1_roundtrip_and_rejection() {
        let encoded = encode_latin1("Educação").expect("latin-1 representable");
        assert_eq!(encoded, b"Educa\xe7\xe3o".to_vec());
        assert_eq!(decode_latin1(&encoded), "Educação");
        assert!(encode_latin1("Zona \u{2013} Sul").is_none());
    }

    #[test]
    fn escaped_json_stays_parseable() {
        let descriptor = FileDescriptor {
            theme: "Educação".into(),
            sub_theme: "Escolas".into(),
            layer: "SHP".into(),
            file: "escolas.zip".into(),
            link: "http://x/escolas.zip".into(),
        };
        let text = escape_non_ascii(&serde_json::to_string(&descriptor).unwrap());
        assert!(text.is_ascii());
        assert!(text.contains("Educa\\u00e7\\u00e3o"));
        let back: FileDescriptor = serde_json::from_str(&text).unwrap();
        assert_eq!(back, descriptor);
    }
}
