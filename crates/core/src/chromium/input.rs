//! Input dispatch for the Chromium backend.
//!
//! DevTools has no action batching; gestures go out as sequential
//! `Input.dispatch*` calls and the timing jitter between them is a known
//! limitation of this backend.

use crate::input::{
    ClickOptions, KeyDescription, RawKeyboard, RawMouse, RawTouchscreen, button_name,
    buttons_mask, chromium_modifiers_mask,
};
use async_trait::async_trait;
use drover_protocol::{KeyboardModifier, MouseButton};
use drover_runtime::{Result, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ChromiumMouse {
    session: Arc<Session>,
}

impl ChromiumMouse {
    pub(crate) fn new(session: Arc<Session>) -> ChromiumMouse {
        ChromiumMouse { session }
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
        let mut params = json!({
            "type": kind,
            "x": x,
            "y": y,
            "modifiers": chromium_modifiers_mask(modifiers),
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
        self.session.send("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }
}

#[async_trait]
impl RawMouse for ChromiumMouse {
    async fn move_to(
        &self,
        x: f64,
        y: f64,
        buttons: &[MouseButton],
        modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        self.dispatch("mouseMoved", x, y, None, buttons, 0, modifiers, None)
            .await
    }

    async fn down(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
        modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        self.dispatch(
            "mousePressed",
            x,
            y,
            Some(button),
            &[button],
            click_count,
            modifiers,
            None,
        )
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
        self.dispatch(
            "mouseReleased",
            x,
            y,
            Some(button),
            &[],
            click_count,
            modifiers,
            None,
        )
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
        self.dispatch(
            "mouseWheel",
            x,
            y,
            None,
            &[],
            0,
            modifiers,
            Some((delta_x, delta_y)),
        )
        .await
    }
}

pub(crate) struct ChromiumKeyboard {
    session: Arc<Session>,
}

impl ChromiumKeyboard {
    pub(crate) fn new(session: Arc<Session>) -> ChromiumKeyboard {
        ChromiumKeyboard { session }
    }
}

#[async_trait]
impl RawKeyboard for ChromiumKeyboard {
    async fn key_down(&self, key: &KeyDescription, modifiers: &[KeyboardModifier]) -> Result<()> {
        let kind = if key.text.is_some() { "keyDown" } else { "rawKeyDown" };
        self.session
            .send(
                "Input.dispatchKeyEvent",
                json!({
                    "type": kind,
                    "modifiers": chromium_modifiers_mask(modifiers),
                    "windowsVirtualKeyCode": key.key_code,
                    "code": key.code,
                    "key": key.key,
                    "text": key.text.as_deref().unwrap_or(""),
                    "unmodifiedText": key.text.as_deref().unwrap_or(""),
                    "location": key.location,
                    "autoRepeat": key.auto_repeat,
                }),
            )
            .await?;
        Ok(())
    }

    async fn key_up(&self, key: &KeyDescription, modifiers: &[KeyboardModifier]) -> Result<()> {
        self.session
            .send(
                "Input.dispatchKeyEvent",
                json!({
                    "type": "keyUp",
                    "modifiers": chromium_modifiers_mask(modifiers),
                    "windowsVirtualKeyCode": key.key_code,
                    "code": key.code,
                    "key": key.key,
                    "location": key.location,
                }),
            )
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.session
            .send("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }
}

pub(crate) struct ChromiumTouchscreen {
    session: Arc<Session>,
}

impl ChromiumTouchscreen {
    pub(crate) fn new(session: Arc<Session>) -> ChromiumTouchscreen {
        ChromiumTouchscreen { session }
    }
}

#[async_trait]
impl RawTouchscreen for ChromiumTouchscreen {
    async fn tap(&self, x: f64, y: f64, modifiers: &[KeyboardModifier]) -> Result<()> {
        let mask = chromium_modifiers_mask(modifiers);
        self.session
            .send(
                "Input.dispatchTouchEvent",
                json!({
                    "type": "touchStart",
                    "modifiers": mask,
                    "touchPoints": [{ "x": x, "y": y }],
                }),
            )
            .await?;
        self.session
            .send(
                "Input.dispatchTouchEvent",
                json!({
                    "type": "touchEnd",
                    "modifiers": mask,
                    "touchPoints": [],
                }),
            )
            .await?;
        Ok(())
    }
}
