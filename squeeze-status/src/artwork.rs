//! Cover-art URL resolution.
//!
//! The server describes artwork in several ways: absolute URLs (possibly on
//! the public internet), well-known placeholder images, bare cover ids and
//! relative image paths. [`ArtworkResolver`] turns any of them into one
//! absolute URL the UI can load.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{form_urlencoded, Host, Url};

use crate::error::{Result, StatusError};

/// Thumbnail size suffix understood by the server's image resizer.
pub const THUMBNAIL_SIZE: &str = "600x600_f";

pub const DEFAULT_COVER: &str = "asset://cover.png";
pub const RADIO_COVER: &str = "asset://radio.png";
pub const WORKS_COVER: &str = "asset://works.png";
pub const RANDOM_PLAY_COVER: &str = "asset://randomplay.png";

const PLACEHOLDERS: [(&str, &str); 4] = [
    ("html/images/cover.png", DEFAULT_COVER),
    ("html/images/radio.png", RADIO_COVER),
    ("html/images/works.png", WORKS_COVER),
    ("html/images/randomplay.png", RANDOM_PLAY_COVER),
];

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// Resolves artwork references against one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtworkResolver {
    base: Url,
}

impl ArtworkResolver {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let base = Url::parse(&format!("http://{}:{}/", host, port))
            .map_err(|e| StatusError::InvalidServer(format!("{}:{}: {}", host, port, e)))?;
        Ok(Self { base })
    }

    /// Resolve an artwork reference to an absolute URL.
    ///
    /// Returns `None` for an empty reference. Placeholder images resolve to
    /// local asset URLs instead of server paths.
    pub fn resolve(&self, artwork: &str) -> Option<String> {
        let artwork = artwork.trim();
        if artwork.is_empty() {
            return None;
        }

        let path = match Url::parse(artwork) {
            Ok(url) if url.has_host() => {
                if is_local_host(&url) {
                    return Some(artwork.to_string());
                }
                proxy_path(artwork)
            }
            _ => {
                let relative = artwork.trim_start_matches('/');
                if let Some(asset) = placeholder(relative) {
                    return Some(asset.to_string());
                }
                if is_hex(relative) {
                    format!("music/{}/cover_{}", relative, THUMBNAIL_SIZE)
                } else {
                    sized_image_path(relative)
                }
            }
        };

        Some(self.absolute(&path))
    }

    fn absolute(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        match self.base.join(&path) {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::debug!(path, error = %e, "artwork path does not resolve");
                format!("{}{}", self.base.as_str().trim_end_matches('/'), path)
            }
        }
    }
}

fn placeholder(path: &str) -> Option<&'static str> {
    PLACEHOLDERS
        .iter()
        .find(|(placeholder, _)| *placeholder == path)
        .map(|(_, asset)| *asset)
}

fn proxy_path(url: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(url.as_bytes()).collect();
    format!("imageproxy/{}/image_{}", encoded, THUMBNAIL_SIZE)
}

fn is_hex(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn sized_image_path(path: &str) -> String {
    if path.starts_with("plugins/") {
        return path.to_string();
    }

    match path.rsplit_once('.') {
        Some((stem, extension))
            if !stem.is_empty()
                && IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) =>
        {
            format!("{}_{}.{}", stem, THUMBNAIL_SIZE, extension)
        }
        _ => path.to_string(),
    }
}

/// Whether the URL points at the local network, where the server cannot or
/// need not proxy it.
fn is_local_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_local_v4(ip),
        Some(Host::Ipv6(ip)) => is_local_v6(ip),
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".local")
        }
        None => false,
    }
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local() || ip.is_loopback()
}

fn is_local_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}
