//! Input dispatch for the BiDi backend.
//!
//! BiDi batches input through `input.performActions`: a multi-step gesture
//! goes out as one ordered action list, including `pause` entries for click
//! delays, so its timing stays atomic relative to the remote page's event
//! loop.

use crate::input::{ClickOptions, KeyDescription, RawKeyboard, RawMouse, RawTouchscreen};
use async_trait::async_trait;
use drover_protocol::{FrameId, KeyboardModifier, MouseButton};
use drover_runtime::{Result, Session};
use serde_json::{Value, json};
use std::sync::Arc;

fn bidi_button(button: MouseButton) -> u32 {
    match button {
        MouseButton::Left => 0,
        MouseButton::Middle => 1,
        MouseButton::Right => 2,
    }
}

async fn perform_actions(
    session: &Session,
    context: &FrameId,
    source: Value,
) -> Result<()> {
    session
        .send(
            "input.performActions",
            json!({ "context": context.as_ref(), "actions": [source] }),
        )
        .await?;
    Ok(())
}

fn pointer_source(kind: &str, id: &str, actions: Vec<Value>) -> Value {
    json!({
        "type": "pointer",
        "id": id,
        "parameters": { "pointerType": kind },
        "actions": actions,
    })
}

pub(crate) struct BidiMouse {
    session: Arc<Session>,
    context: FrameId,
}

impl BidiMouse {
    pub(crate) fn new(session: Arc<Session>, context: FrameId) -> BidiMouse {
        BidiMouse { session, context }
    }
}

#[async_trait]
impl RawMouse for BidiMouse {
    async fn move_to(
        &self,
        x: f64,
        y: f64,
        _buttons: &[MouseButton],
        _modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        // Fractional coordinates are rejected on the wire.
        let actions = vec![json!({ "type": "pointerMove", "x": x.round(), "y": y.round() })];
        perform_actions(
            &self.session,
            &self.context,
            pointer_source("mouse", "drover_mouse", actions),
        )
        .await
    }

    async fn down(
        &self,
        _x: f64,
        _y: f64,
        button: MouseButton,
        _click_count: u32,
        _modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        let actions = vec![json!({ "type": "pointerDown", "button": bidi_button(button) })];
        perform_actions(
            &self.session,
            &self.context,
            pointer_source("mouse", "drover_mouse", actions),
        )
        .await
    }

    async fn up(
        &self,
        _x: f64,
        _y: f64,
        button: MouseButton,
        _click_count: u32,
        _modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        let actions = vec![json!({ "type": "pointerUp", "button": bidi_button(button) })];
        perform_actions(
            &self.session,
            &self.context,
            pointer_source("mouse", "drover_mouse", actions),
        )
        .await
    }

    async fn click(&self, x: f64, y: f64, options: ClickOptions) -> Result<()> {
        let button = bidi_button(options.button.unwrap_or(MouseButton::Left));
        let click_count = options.click_count.unwrap_or(1);
        let mut actions = vec![json!({
            "type": "pointerMove",
            "x": x.round(),
            "y": y.round(),
        })];
        for count in 1..=click_count {
            actions.push(json!({ "type": "pointerDown", "button": button }));
            if let Some(delay) = options.delay {
                actions.push(json!({ "type": "pause", "duration": delay }));
            }
            actions.push(json!({ "type": "pointerUp", "button": button }));
            if let Some(delay) = options.delay {
                if count < click_count {
                    actions.push(json!({ "type": "pause", "duration": delay }));
                }
            }
        }
        perform_actions(
            &self.session,
            &self.context,
            pointer_source("mouse", "drover_mouse", actions),
        )
        .await
    }

    async fn wheel(
        &self,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        _modifiers: &[KeyboardModifier],
    ) -> Result<()> {
        let source = json!({
            "type": "wheel",
            "id": "drover_wheel",
            "actions": [{
                "type": "scroll",
                "x": x.round() as i64,
                "y": y.round() as i64,
                "deltaX": delta_x as i64,
                "deltaY": delta_y as i64,
            }],
        });
        perform_actions(&self.session, &self.context, source).await
    }
}

pub(crate) struct BidiKeyboard {
    session: Arc<Session>,
    context: FrameId,
}

impl BidiKeyboard {
    pub(crate) fn new(session: Arc<Session>, context: FrameId) -> BidiKeyboard {
        BidiKeyboard { session, context }
    }

    async fn key_actions(&self, actions: Vec<Value>) -> Result<()> {
        perform_actions(
            &self.session,
            &self.context,
            json!({ "type": "key", "id": "drover_keyboard", "actions": actions }),
        )
        .await
    }
}

#[async_trait]
impl RawKeyboard for BidiKeyboard {
    async fn key_down(&self, key: &KeyDescription, _modifiers: &[KeyboardModifier]) -> Result<()> {
        self.key_actions(vec![json!({ "type": "keyDown", "value": key.key })])
            .await
    }

    async fn key_up(&self, key: &KeyDescription, _modifiers: &[KeyboardModifier]) -> Result<()> {
        self.key_actions(vec![json!({ "type": "keyUp", "value": key.key })])
            .await
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        // One batch per string keeps the characters ordered.
        let mut actions = Vec::new();
        for ch in text.chars() {
            let value = ch.to_string();
            actions.push(json!({ "type": "keyDown", "value": value }));
            actions.push(json!({ "type": "keyUp", "value": value }));
        }
        self.key_actions(actions).await
    }
}

pub(crate) struct BidiTouchscreen {
    session: Arc<Session>,
    context: FrameId,
}

impl BidiTouchscreen {
    pub(crate) fn new(session: Arc<Session>, context: FrameId) -> BidiTouchscreen {
        BidiTouchscreen { session, context }
    }
}

#[async_trait]
impl RawTouchscreen for BidiTouchscreen {
    async fn tap(&self, x: f64, y: f64, _modifiers: &[KeyboardModifier]) -> Result<()> {
        let actions = vec![
            json!({ "type": "pointerMove", "x": x.round(), "y": y.round() }),
            json!({ "type": "pointerDown", "button": 0 }),
            json!({ "type": "pointerUp", "button": 0 }),
        ];
        perform_actions(
            &self.session,
            &self.context,
            pointer_source("touch", "drover_touch", actions),
        )
        .await
    }
}
