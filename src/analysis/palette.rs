//! Presentation colors
//!
//! Token series colors are derived from a SHA-256 of the token symbol so the
//! same token always renders the same color. Pattern and severity colors are
//! exhaustive matches.

use sha2::{Digest, Sha256};

use crate::analysis::cluster::Cluster;
use crate::analysis::patterns::{PatternKind, Severity};

/// Hex color for a token series
pub fn token_color(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hue = u16::from_be_bytes([digest[0], digest[1]]) % 360;
    // Saturation 55..75, lightness 45..60
    let saturation = 55 + digest[2] % 21;
    let lightness = 45 + digest[3] % 16;
    hsl_to_hex(
        f64::from(hue),
        f64::from(saturation) / 100.0,
        f64::from(lightness) / 100.0,
    )
}

pub fn pattern_color(kind: PatternKind) -> &'static str {
    match kind {
        PatternKind::RapidSuccession => "#f59e0b",
        PatternKind::CircularTrading => "#8b5cf6",
        PatternKind::WashTrading => "#ec4899",
        PatternKind::Layering => "#0ea5e9",
    }
}

pub fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "#22c55e",
        Severity::Medium => "#eab308",
        Severity::High => "#ef4444",
    }
}

/// Cluster color keyed on suspicion
pub fn cluster_color(cluster: &Cluster) -> &'static str {
    severity_color(Severity::from_confidence(cluster.suspicious_score))
}

fn hsl_to_hex(hue: f64, saturation: f64, lightness: f64) -> String {
    let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = lightness - chroma / 2.0;
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}
