use std::collections::HashSet;

use url::Url;

use crate::types::{ListingCandidate, SemanticNode, TargetVehicle};

pub const PROVENANCE: &str = "accessibility-tree navigation";

const CURRENCY_MARKERS: [&str; 3] = ["$", "ars", "usd"];

const DENYLIST: [&str; 10] = [
    "vende tu",
    "ayuda",
    "contacto",
    "términos",
    "privacidad",
    "sucursales",
    "trabajá",
    "blog",
    "recomendados",
    "publicidad",
];

/// Picks vehicle listing links out of the final results snapshot.
#[derive(Debug, Clone)]
pub struct ListingExtractor {
    pub max_results: usize,
    pub title_len: usize,
    pub denylist: Vec<String>,
}

impl Default for ListingExtractor {
    fn default() -> Self {
        Self {
            max_results: 50,
            title_len: 60,
            denylist: DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ListingExtractor {
    pub fn extract(
        &self,
        nodes: &[SemanticNode],
        vehicle: &TargetVehicle,
        base_url: &str,
    ) -> Vec<ListingCandidate> {
        let keywords = vehicle.keywords();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for node in nodes {
            if out.len() >= self.max_results {
                break;
            }
            if node.role != "link" {
                continue;
            }
            let Some(href) = node.url.as_deref() else {
                continue;
            };
            if !self.qualifies(&node.text, &keywords) {
                continue;
            }
            let Some(url) = resolve_url(base_url, href) else {
                continue;
            };
            if seen.insert(url.clone()) {
                out.push(ListingCandidate {
                    title: node.text.chars().take(self.title_len).collect(),
                    url,
                    provenance: PROVENANCE.to_string(),
                });
            }
        }
        out
    }

    /// Price marker, at least one vehicle keyword, no denylisted phrase.
    pub fn qualifies(&self, text: &str, keywords: &[String]) -> bool {
        let text = text.to_lowercase();
        CURRENCY_MARKERS.iter().any(|m| text.contains(m))
            && keywords.iter().any(|k| text.contains(k.as_str()))
            && !self.denylist.iter().any(|d| text.contains(d.as_str()))
    }
}

/// Resolve a listing href against the scheme and host of the visit's base URL.
///
/// A base without a scheme is taken as an https host. Anything that does not
/// end up as an http(s) URL (`javascript:`, `mailto:`, ...) is dropped.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let base = base.trim();
    let mut origin = if base.contains("://") {
        Url::parse(base).ok()?
    } else {
        Url::parse(&format!("https://{base}")).ok()?
    };
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);

    let url = origin.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.into())
}
