//! Translates high-level actions (move, click, drag, scroll, type, shortcut)
//! into sequences of RFB PointerEvent/KeyEvent messages against a session.

use std::sync::atomic::{AtomicU8, Ordering};

use log::warn;
use tokio::time::{sleep, Duration};

use crate::error::Result;
use crate::session::RfbSession;

/// Looks up a named key (as used by browser `KeyboardEvent.key` values) in
/// the core's X11 keysym table. Falls back to the Unicode code point for a
/// single-character key; returns `None` for an unrecognized multi-character
/// name.
#[must_use]
pub fn keysym_for(key: &str) -> Option<u32> {
    let named = match key {
        "Backspace" => 0xFF08,
        "Tab" => 0xFF09,
        "Enter" => 0xFF0D,
        "Escape" => 0xFF1B,
        "Delete" => 0xFFFF,
        "Home" => 0xFF50,
        "ArrowLeft" => 0xFF51,
        "ArrowUp" => 0xFF52,
        "ArrowRight" => 0xFF53,
        "ArrowDown" => 0xFF54,
        "PageUp" => 0xFF55,
        "PageDown" => 0xFF56,
        "End" => 0xFF57,
        "Control" => 0xFFE3,
        "Shift" => 0xFFE1,
        "Alt" => 0xFFE9,
        "Meta" => 0xFFEB,
        "CapsLock" => 0xFFE5,
        _ => return key.chars().next().filter(|_| key.chars().count() == 1).map(|c| c as u32),
    };
    Some(named)
}

/// The live input surface for one session: the current button mask is
/// retained so that a `Move` without an explicit mask override preserves
/// whatever buttons are already held.
pub struct InputSurface {
    button_mask: AtomicU8,
}

impl Default for InputSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSurface {
    #[must_use]
    pub fn new() -> Self {
        Self { button_mask: AtomicU8::new(0) }
    }

    /// Moves the pointer to `(x, y)`, clamped to the framebuffer bounds.
    /// `mask_override` updates the stored button mask if provided.
    pub async fn move_pointer(
        &self,
        session: &RfbSession,
        x: i32,
        y: i32,
        mask_override: Option<u8>,
    ) -> Result<()> {
        let (width, height) = session.framebuffer.dimensions();
        let clamped_x = x.clamp(0, i32::from(width).saturating_sub(1)) as u16;
        let clamped_y = y.clamp(0, i32::from(height).saturating_sub(1)) as u16;
        let mask = match mask_override {
            Some(mask) => {
                self.button_mask.store(mask, Ordering::Relaxed);
                mask
            }
            None => self.button_mask.load(Ordering::Relaxed),
        };
        session.send_pointer_event(mask, clamped_x, clamped_y).await
    }

    /// Presses `button` at `(x, y)`, holds 50 ms, releases.
    pub async fn click(&self, session: &RfbSession, x: i32, y: i32, button: u8) -> Result<()> {
        self.move_pointer(session, x, y, Some(1 << (button.saturating_sub(1)))).await?;
        sleep(Duration::from_millis(50)).await;
        self.move_pointer(session, x, y, Some(0)).await
    }

    /// Scroll is a click with the wheel-up (4) or wheel-down (5) button.
    pub async fn scroll(&self, session: &RfbSession, x: i32, y: i32, direction_down: bool) -> Result<()> {
        let button = if direction_down { 5 } else { 4 };
        self.click(session, x, y, button).await
    }

    /// Presses `button` at `start`, waits 100 ms, linearly interpolates to
    /// `end` over `max(1, delay/0.05)` steps, then releases at `end`.
    pub async fn drag(
        &self,
        session: &RfbSession,
        start: (i32, i32),
        end: (i32, i32),
        button: u8,
        delay_secs: f64,
    ) -> Result<()> {
        let mask = 1 << (button.saturating_sub(1));
        self.move_pointer(session, start.0, start.1, Some(mask)).await?;
        sleep(Duration::from_millis(100)).await;

        let steps = (delay_secs / 0.05).floor().max(1.0) as u32;
        let step_delay = Duration::from_secs_f64(delay_secs / f64::from(steps));
        for step in 1..=steps {
            let fraction = f64::from(step) / f64::from(steps);
            let x = start.0 + ((end.0 - start.0) as f64 * fraction).round() as i32;
            let y = start.1 + ((end.1 - start.1) as f64 * fraction).round() as i32;
            self.move_pointer(session, x, y, Some(mask)).await?;
            sleep(step_delay).await;
        }

        self.move_pointer(session, end.0, end.1, Some(0)).await
    }

    /// Types `text` one character at a time: key-down, key-up, each
    /// separated by `delay/2`.
    pub async fn type_text(&self, session: &RfbSession, text: &str, delay_secs: f64) -> Result<()> {
        let half = Duration::from_secs_f64(delay_secs / 2.0);
        for ch in text.chars() {
            let keysym = ch as u32;
            session.send_key_event(true, keysym).await?;
            sleep(half).await;
            session.send_key_event(false, keysym).await?;
            sleep(half).await;
        }
        Ok(())
    }

    /// Presses every key in `keys` in order (50 ms apart), then releases
    /// them in reverse order (50 ms apart).
    pub async fn shortcut(&self, session: &RfbSession, keys: &[String]) -> Result<()> {
        let gap = Duration::from_millis(50);
        let mut keysyms = Vec::with_capacity(keys.len());
        for key in keys {
            match keysym_for(key) {
                Some(keysym) => keysyms.push(keysym),
                None => warn!("unmapped shortcut key: {key}"),
            }
        }
        for &keysym in &keysyms {
            session.send_key_event(true, keysym).await?;
            sleep(gap).await;
        }
        for &keysym in keysyms.iter().rev() {
            session.send_key_event(false, keysym).await?;
            sleep(gap).await;
        }
        Ok(())
    }

    /// Sends a single key transition, resolving `key` through
    /// [`keysym_for`]. Unmapped multi-character names are dropped with a
    /// warning.
    pub async fn send_named_key(&self, session: &RfbSession, key: &str, down: bool) -> Result<()> {
        match keysym_for(key) {
            Some(keysym) => session.send_key_event(down, keysym).await,
            None => {
                warn!("unmapped key event: {key}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys_resolve_to_x11_keysyms() {
        assert_eq!(keysym_for("Backspace"), Some(0xFF08));
        assert_eq!(keysym_for("Enter"), Some(0xFF0D));
        assert_eq!(keysym_for("Control"), Some(0xFFE3));
        assert_eq!(keysym_for("CapsLock"), Some(0xFFE5));
    }

    #[test]
    fn single_character_keys_use_code_point() {
        assert_eq!(keysym_for("c"), Some('c' as u32));
        assert_eq!(keysym_for("5"), Some('5' as u32));
    }

    #[test]
    fn unmapped_multi_character_keys_are_none() {
        assert_eq!(keysym_for("F13"), None);
        assert_eq!(keysym_for("Unrecognized"), None);
    }

    #[test]
    fn drag_step_count_matches_delay_formula() {
        let steps = (0.5_f64 / 0.05).floor().max(1.0) as u32;
        assert_eq!(steps, 10);
        let steps_tiny = (0.01_f64 / 0.05).floor().max(1.0) as u32;
        assert_eq!(steps_tiny, 1);
    }

    #[test]
    fn shortcut_keys_resolve_to_expected_keysym_sequence() {
        // Ctrl+c: down order is press order, up order is the reverse.
        let keys = ["Control".to_string(), "c".to_string()];
        let keysyms: Vec<u32> = keys.iter().map(|k| keysym_for(k).unwrap()).collect();
        assert_eq!(keysyms, vec![0xFFE3, 0x63]);
        let release_order: Vec<u32> = keysyms.iter().rev().copied().collect();
        assert_eq!(release_order, vec![0x63, 0xFFE3]);
    }
}
