//! Normalized types the adapter layer hands upward.
//!
//! Geometry is always CSS pixels relative to the top-level document,
//! regardless of backend-native units.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stable identifier of a browsing context in the frame tree.
pub type FrameId = Arc<str>;

/// Protocol-local identifier of a JavaScript realm (execution context).
///
/// Not guaranteed unique across frames on every backend; realms are always
/// looked up through the owning target's realm table.
pub type RealmId = Arc<str>;

/// Identifier of one document generation within a frame (Chromium calls this
/// the loader id, BiDi the navigation id). Lifecycle events are only
/// meaningful relative to the generation they were reported against.
pub type DocumentId = Arc<str>;

/// Protocol-level network request id.
pub type RequestId = Arc<str>;

/// A point in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An axis-aligned rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Four corner points of a (possibly rotated) content box.
pub type Quad = [Point; 4];

impl Rect {
    /// Smallest axis-aligned rectangle enclosing the quad.
    pub fn enclosing(quad: &Quad) -> Rect {
        let xs = quad.map(|p| p.x);
        let ys = quad.map(|p| p.y);
        let x = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let y = ys.iter().copied().fold(f64::INFINITY, f64::min);
        Rect {
            x,
            y,
            width: xs.iter().copied().fold(f64::NEG_INFINITY, f64::max) - x,
            height: ys.iter().copied().fold(f64::NEG_INFINITY, f64::max) - y,
        }
    }
}

/// The JavaScript world a realm belongs to.
///
/// Every frame has a `Main` world (page scripts) and a lazily provisioned
/// `Utility` world isolated from the page, used for internal helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum World {
    Main,
    Utility,
}

/// Document lifecycle milestones reported per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    DomContentLoaded,
    Load,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::DomContentLoaded => "domcontentloaded",
            LifecycleEvent::Load => "load",
        }
    }
}

/// Mouse button for pointer actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Keyboard modifier keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyboardModifier {
    Alt,
    Control,
    Meta,
    Shift,
}

/// Screenshot image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotFormat {
    Png,
    Jpeg,
}

/// Resource timing for one network exchange.
///
/// All phase values are seconds relative to `start_time`; a phase the
/// backend reports as unavailable is `-1`, never `0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceTiming {
    /// Wall-clock request start, seconds since the unix epoch.
    pub start_time: f64,
    pub domain_lookup_start: f64,
    pub domain_lookup_end: f64,
    pub connect_start: f64,
    pub secure_connection_start: f64,
    pub connect_end: f64,
    pub request_start: f64,
    pub response_start: f64,
}

impl ResourceTiming {
    /// Timing with every phase marked unavailable.
    pub fn unavailable(start_time: f64) -> ResourceTiming {
        ResourceTiming {
            start_time,
            domain_lookup_start: -1.0,
            domain_lookup_end: -1.0,
            connect_start: -1.0,
            secure_connection_start: -1.0,
            connect_end: -1.0,
            request_start: -1.0,
            response_start: -1.0,
        }
    }
}

/// One HTTP header as a name/value pair, order-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Converts a JSON object of header name → value into an ordered array.
pub fn headers_object_to_array(headers: &serde_json::Value) -> Vec<Header> {
    let Some(map) = headers.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(name, value)| Header {
            name: name.clone(),
            value: value.as_str().map(str::to_string).unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enclosing_rect_of_quad() {
        let quad = [
            Point { x: 10.0, y: 20.0 },
            Point { x: 30.0, y: 20.0 },
            Point { x: 30.0, y: 40.0 },
            Point { x: 10.0, y: 40.0 },
        ];
        let rect = Rect::enclosing(&quad);
        assert_eq!(rect.x, 10.0);
        assert_eq!(rect.y, 20.0);
        assert_eq!(rect.width, 20.0);
        assert_eq!(rect.height, 20.0);
    }

    #[test]
    fn unavailable_timing_uses_minus_one() {
        let timing = ResourceTiming::unavailable(123.0);
        assert_eq!(timing.start_time, 123.0);
        assert_eq!(timing.response_start, -1.0);
        assert_ne!(timing.response_start, 0.0);
    }
}
