//! Input dispatch for the WebKit backend.
//!
//! Events go to whichever target currently backs the page, with WebKit's
//! own modifier bitmask (Shift=1, Control=2, Alt=4, Meta=8). No batching;
//! gestures are sequential calls.

use super::WkShared;
use crate::input::{
    ClickOptions, KeyDescription, RawKeyboard, RawMouse, RawTouchscreen, button_name,
    buttons_mask, webkit_modifiers_mask,
};
use async_trait::async_trait;
use drover_protocol::{KeyboardModifier, MouseButton};
use drover_runtime::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct WebKitMouse {
    shared: Arc<WkShared>,
}

impl WebKitMouse {
    pub(crate) fn new(shared: Arc<WkShared>) -> WebKitMouse {
        WebKitMouse { shared }
    }

    async fn dispatch(
        &self,
        kind: &str,
        x: f64,
        y: f64,
        button: Option<MouseButton>,
        buttons: &[MouseButton],
        click_count: u32,
        modifiers: &[KeyboardModifier],
        deltas: Option<(f64, f64)>,
    ) -> Result<()> {
        let target = self.shared.current_target()?;
        let mut params = json!({
            "type": kind,
            "x": x,
            "y": y,
            "modifiers": webkit_modifiers_mask(modifiers),
            "buttons": buttons_mask(buttons),
            "clickCount": click_count,
        });
        if let Some(button) = button {
            params["button"] = json!(button_name(button));
        }
        if let Some((dx, dy)) = deltas {
            params["deltaX"] = json!(dx);
            params["deltaY"] = json!(dy);
        }
        target.session.send("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }
}

#[async_trait]
impl RawMouse for WebKitMouse {
    async fn move_to(
        &self,
        x: f64,
        y: f64,
        buttons: &[MouseButton],
        modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        self.dispatch("move", x, y, None, buttons, 0, modifiers, None).await
    }

    async fn down(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
        modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        self.dispatch("down", x, y, Some(button), &[button], click_count, modifiers, None)
            .await
    }

    async fn up(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
        modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        self.dispatch("up", x, y, Some(button), &[], click_count, modifiers, None)
            .await
    }

    async fn click(&self, x: f64, y: f64, options: ClickOptions) -> Result<()> {
        let button = options.button.unwrap_or(MouseButton::Left);
        let click_count = options.click_count.unwrap_or(1);
        self.move_to(x, y, &[], &[]).await?;
        for count in 1..=click_count {
            self.down(x, y, button, count, &[]).await?;
            if let Some(delay) = options.delay {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.up(x, y, button, count, &[]).await?;
            if let Some(delay) = options.delay {
                if count < click_count {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        Ok(())
    }

    async fn wheel(
        &self,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        self.dispatch("wheel", x, y, None, &[], 0, modifiers, Some((delta_x, delta_y)))
            .await
    }
}

pub(crate) struct WebKitKeyboard {
    shared: Arc<WkShared>,
}

impl WebKitKeyboard {
    pub(crate) fn new(shared: Arc<WkShared>) -> WebKitKeyboard {
        WebKitKeyboard { shared }
    }
}

#[async_trait]
impl RawKeyboard for WebKitKeyboard {
    async fn key_down(&self, key: &KeyDescription, modifiers: &[KeyboardModifier]) -> Result<()> {
        let target = self.shared.current_target()?;
        target
            .session
            .send(
                "Input.dispatchKeyEvent",
                json!({
                    "type": "keyDown",
                    "modifiers": webkit_modifiers_mask(modifiers),
                    "windowsVirtualKeyCode": key.key_code,
                    "code": key.code,
                    "key": key.key,
                    "text": key.text.as_deref().unwrap_or(""),
                    "unmodifiedText": key.text.as_deref().unwrap_or(""),
                    "autoRepeat": key.auto_repeat,
                    "isKeypad": key.location == 3,
                }),
            )
            .await?;
        Ok(())
    }

    async fn key_up(&self, key: &KeyDescription, modifiers: &[KeyboardModifier]) -> Result<()> {
        let target = self.shared.current_target()?;
        target
            .session
            .send(
                "Input.dispatchKeyEvent",
                json!({
                    "type": "keyUp",
                    "modifiers": webkit_modifiers_mask(modifiers),
                    "windowsVirtualKeyCode": key.key_code,
                    "code": key.code,
                    "key": key.key,
                }),
            )
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let target = self.shared.current_target()?;
        target
            .session
            .send("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }
}

pub(crate) struct WebKitTouchscreen {
    shared: Arc<WkShared>,
}

impl WebKitTouchscreen {
    pub(crate) fn new(shared: Arc<WkShared>) -> WebKitTouchscreen {
        WebKitTouchscreen { shared }
    }
}

#[async_trait]
impl RawTouchscreen for WebKitTouchscreen {
    async fn tap(&self, x: f64, y: f64, modifiers: &[KeyboardModifier]) -> Result<()> {
        let target = self.shared.current_target()?;
        let mask = webkit_modifiers_mask(modifiers);
        let point = json!({ "x": x, "y": y, "id": 1 });
        target
            .session
            .send(
                "Input.dispatchTouchEvent",
                json!({ "type": "touchStart", "modifiers": mask, "touchPoints": [point] }),
            )
            .await?;
        target
            .session
            .send(
                "Input.dispatchTouchEvent",
                json!({ "type": "touchEnd", "modifiers": mask, "touchPoints": [] }),
            )
            .await?;
        Ok(())
    }
}
