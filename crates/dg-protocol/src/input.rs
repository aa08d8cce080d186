//! Input events relayed from the presentation layer to the gateway

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::instruction::Instruction;

/// Most wheel notches a single event may scroll
pub const MAX_WHEEL_NOTCHES: u32 = 16;

/// Pointer buttons, numbered the way the gateway button mask expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    /// Bit for this button in the pointer mask
    pub fn mask(&self) -> u8 {
        match self {
            MouseButton::Left => 1 << 0,
            MouseButton::Middle => 1 << 1,
            MouseButton::Right => 1 << 2,
        }
    }
}

const WHEEL_UP: u8 = 1 << 3;
const WHEEL_DOWN: u8 = 1 << 4;

/// An input event submitted to a connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    /// Key press or release, identified by X11 keysym
    Key { keysym: u32, pressed: bool },
    /// Pointer moved to an absolute display position
    PointerMove { x: i32, y: i32 },
    /// Pointer button press or release at the current position
    PointerButton { button: MouseButton, pressed: bool },
    /// Scroll wheel; negative is up, positive is down, magnitude is notches
    PointerWheel { delta: i32 },
}

impl InputEvent {
    pub fn key_down(keysym: u32) -> Self {
        Self::Key {
            keysym,
            pressed: true,
        }
    }

    pub fn key_up(keysym: u32) -> Self {
        Self::Key {
            keysym,
            pressed: false,
        }
    }

    pub fn pointer_move(x: i32, y: i32) -> Self {
        Self::PointerMove { x, y }
    }

    /// Reject events no client legitimately sends
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            InputEvent::PointerWheel { delta } if delta.unsigned_abs() > MAX_WHEEL_NOTCHES => {
                Err(ProtocolError::InvalidInput(format!(
                    "wheel delta {} exceeds {} notches",
                    delta, MAX_WHEEL_NOTCHES
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Tracks pointer position and pressed buttons for one session
///
/// The gateway expects absolute pointer state on every `mouse`
/// instruction, so button and wheel events need the last known position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerState {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
}

impl PointerState {
    /// Apply an event and return the instructions to send, in order
    pub fn apply(&mut self, event: InputEvent) -> Vec<Instruction> {
        match event {
            InputEvent::Key { keysym, pressed } => vec![Instruction::key(keysym, pressed)],
            InputEvent::PointerMove { x, y } => {
                self.x = x;
                self.y = y;
                vec![self.instruction()]
            }
            InputEvent::PointerButton { button, pressed } => {
                if pressed {
                    self.buttons |= button.mask();
                } else {
                    self.buttons &= !button.mask();
                }
                vec![self.instruction()]
            }
            InputEvent::PointerWheel { delta } => {
                let bit = if delta < 0 { WHEEL_UP } else { WHEEL_DOWN };
                let notches = delta.unsigned_abs().min(MAX_WHEEL_NOTCHES);
                let mut out = Vec::new();
                for _ in 0..notches {
                    out.push(Instruction::mouse(self.x, self.y, self.buttons | bit));
                    out.push(self.instruction());
                }
                out
            }
        }
    }

    fn instruction(&self) -> Instruction {
        Instruction::mouse(self.x, self.y, self.buttons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_events_map_to_key_instructions() {
        let mut pointer = PointerState::default();
        assert_eq!(
            pointer.apply(InputEvent::key_down(0x41)),
            vec![Instruction::key(0x41, true)]
        );
        assert_eq!(
            pointer.apply(InputEvent::key_up(0x41)),
            vec![Instruction::key(0x41, false)]
        );
    }

    #[test]
    fn test_button_uses_last_position() {
        let mut pointer = PointerState::default();
        pointer.apply(InputEvent::pointer_move(10, 10));

        let out = pointer.apply(InputEvent::PointerButton {
            button: MouseButton::Right,
            pressed: true,
        });
        assert_eq!(out, vec![Instruction::mouse(10, 10, 4)]);

        let out = pointer.apply(InputEvent::PointerButton {
            button: MouseButton::Right,
            pressed: false,
        });
        assert_eq!(out, vec![Instruction::mouse(10, 10, 0)]);
    }

    #[test]
    fn test_wheel_presses_and_releases_per_notch() {
        let mut pointer = PointerState {
            x: 5,
            y: 6,
            buttons: MouseButton::Left.mask(),
        };

        let out = pointer.apply(InputEvent::PointerWheel { delta: 2 });
        assert_eq!(
            out,
            vec![
                Instruction::mouse(5, 6, 1 | WHEEL_DOWN),
                Instruction::mouse(5, 6, 1),
                Instruction::mouse(5, 6, 1 | WHEEL_DOWN),
                Instruction::mouse(5, 6, 1),
            ]
        );

        let out = pointer.apply(InputEvent::PointerWheel { delta: -1 });
        assert_eq!(out[0], Instruction::mouse(5, 6, 1 | WHEEL_UP));
    }

    #[test]
    fn test_input_event_json_shape() {
        let event: InputEvent =
            serde_json::from_str(r#"{"type":"pointer_move","x":3,"y":4}"#).unwrap();
        assert_eq!(event, InputEvent::pointer_move(3, 4));
    }

    #[test]
    fn test_huge_wheel_delta_is_bounded() {
        let event = InputEvent::PointerWheel { delta: i32::MIN };
        assert!(matches!(
            event.validate(),
            Err(ProtocolError::InvalidInput(_))
        ));
        assert!(InputEvent::PointerWheel { delta: -16 }.validate().is_ok());

        let mut pointer = PointerState::default();
        let out = pointer.apply(event);
        assert_eq!(out.len(), MAX_WHEEL_NOTCHES as usize * 2);
    }
}
