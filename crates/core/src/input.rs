//! Logical input actions, translated per backend into wire calls.
//!
//! The traits are stateless per call: the page layer keeps cursor position
//! and pressed-button state and passes everything each action needs.
//! Backends with action batching (BiDi) express multi-step gestures as one
//! ordered batch to keep their timing atomic relative to the remote event
//! loop; the others issue sequential calls and accept the jitter.

use async_trait::async_trait;
use drover_protocol::{KeyboardModifier, MouseButton};
use drover_runtime::Result;

/// Options for a click gesture.
#[derive(Debug, Clone, Default)]
pub struct ClickOptions {
    /// Delay between button down and up, in milliseconds.
    pub delay: Option<u64>,
    pub button: Option<MouseButton>,
    pub click_count: Option<u32>,
}

/// A fully resolved key, as the page layer's keyboard layout produced it.
#[derive(Debug, Clone, Default)]
pub struct KeyDescription {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    pub text: Option<String>,
    pub location: i64,
    pub auto_repeat: bool,
}

/// Raw mouse actions.
#[async_trait]
pub trait RawMouse: Send + Sync {
    async fn move_to(
        &self,
        x: f64,
        y: f64,
        buttons: &[MouseButton],
        modifiers: &[KeyboardModifier],
    ) -> Result<()>;

    async fn down(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
        modifiers: &[KeyboardModifier],
    ) -> Result<()>;

    async fn up(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
        modifiers: &[KeyboardModifier],
    ) -> Result<()>;

    /// A full click gesture. Backends that support batching send this as a
    /// single ordered action batch.
    async fn click(&self, x: f64, y: f64, options: ClickOptions) -> Result<()>;

    async fn wheel(
        &self,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        modifiers: &[KeyboardModifier],
    ) -> Result<()>;
}

/// Raw keyboard actions.
#[async_trait]
pub trait RawKeyboard: Send + Sync {
    async fn key_down(&self, key: &KeyDescription, modifiers: &[KeyboardModifier]) -> Result<()>;

    async fn key_up(&self, key: &KeyDescription, modifiers: &[KeyboardModifier]) -> Result<()>;

    /// Inserts text without synthesizing key events.
    async fn send_text(&self, text: &str) -> Result<()>;
}

/// Raw touchscreen actions.
#[async_trait]
pub trait RawTouchscreen: Send + Sync {
    async fn tap(&self, x: f64, y: f64, modifiers: &[KeyboardModifier]) -> Result<()>;
}

/// Chromium/WebKit modifier bitmask: Alt=1, Control=2, Meta=4, Shift=8.
pub(crate) fn chromium_modifiers_mask(modifiers: &[KeyboardModifier]) -> i64 {
    let mut mask = 0;
    for modifier in modifiers {
        mask |= match modifier {
            KeyboardModifier::Alt => 1,
            KeyboardModifier::Control => 2,
            KeyboardModifier::Meta => 4,
            KeyboardModifier::Shift => 8,
        };
    }
    mask
}

/// WebKit event modifier bitmask: Shift=1, Control=2, Alt=4, Meta=8.
pub(crate) fn webkit_modifiers_mask(modifiers: &[KeyboardModifier]) -> i64 {
    let mut mask = 0;
    for modifier in modifiers {
        mask |= match modifier {
            KeyboardModifier::Shift => 1,
            KeyboardModifier::Control => 2,
            KeyboardModifier::Alt => 4,
            KeyboardModifier::Meta => 8,
        };
    }
    mask
}

/// Pressed-buttons bitmask shared by Chromium and WebKit: left=1, right=2,
/// middle=4.
pub(crate) fn buttons_mask(buttons: &[MouseButton]) -> i64 {
    let mut mask = 0;
    for button in buttons {
        mask |= match button {
            MouseButton::Left => 1,
            MouseButton::Right => 2,
            MouseButton::Middle => 4,
        };
    }
    mask
}

pub(crate) fn button_name(button: MouseButton) -> &'static str {
    match button {
        MouseButton::Left => "left",
        MouseButton::Right => "right",
        MouseButton::Middle => "middle",
    }
}
