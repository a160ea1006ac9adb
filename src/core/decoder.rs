//! Decoding of button notification bytes
//! The remote control reports every button event as a single byte whose bits
//! select the action. This module turns that byte into typed local actions;
//! delivering them to the host's media session, volume or ringer is the
//! embedder's job via [`LocalActionSink`].

use crate::core::constants::{
    ACTION_DOWN, BACK, FORWARD, MUTE, PLAY_PAUSE, STOP, TWO_STEP, VOLUME_DOWN, VOLUME_UP,
};

/// Media keys the remote can press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKey {
    PlayPause,
    Next,
    Previous,
}

/// Press/release phase of a media key event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Press,
    Release,
}

/// One action to apply on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAction {
    VolumeUp,
    VolumeDown,
    ToggleMute,
    ToggleRinger,
    Media { key: MediaKey, phase: KeyPhase },
}

/// Result of decoding one notification byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The reserved stop value: shut the bridge down, nothing else
    Stop,
    /// Actions to apply, in order; may be empty
    Actions(Vec<LocalAction>),
}

/// Decoding behavior the embedder controls
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Substitute a ringer-mode flip for the mute toggle
    pub toggle_ringer: bool,
    /// Host cannot flip the ringer; the mute command is swallowed instead
    /// of falling back to a mute toggle
    pub ringer_toggle_unsupported: bool,
}

/// Receiver of decoded actions, implemented by the embedding layer
///
/// Implementations typically ignore volume steps while the output stream is
/// muted. A returned error is logged by the bridge and otherwise ignored.
pub trait LocalActionSink: Send + Sync {
    fn apply(&self, action: LocalAction) -> anyhow::Result<()>;
}

/// Decodes one notification byte into the actions it requests.
///
/// In two-step mode (bit 0x80) volume and mute changes only apply on release,
/// and media keys carry their press/release phase; outside it a media key
/// expands into a synthetic press-then-release pair.
pub fn decode(value: u8, options: &DecodeOptions) -> Decoded {
    if value & STOP == STOP {
        return Decoded::Stop;
    }

    let two_step = value & TWO_STEP == TWO_STEP;
    let pressed = value & ACTION_DOWN == ACTION_DOWN;
    let apply_audio = !two_step || !pressed;

    let mut actions = Vec::new();
    if value & MUTE == MUTE {
        if apply_audio {
            if options.toggle_ringer {
                if !options.ringer_toggle_unsupported {
                    actions.push(LocalAction::ToggleRinger);
                }
            } else {
                actions.push(LocalAction::ToggleMute);
            }
        }
    } else if apply_audio {
        if value & VOLUME_UP == VOLUME_UP {
            actions.push(LocalAction::VolumeUp);
        } else if value & VOLUME_DOWN == VOLUME_DOWN {
            actions.push(LocalAction::VolumeDown);
        }
    }

    let key = if value & PLAY_PAUSE == PLAY_PAUSE {
        Some(MediaKey::PlayPause)
    } else if value & BACK == BACK {
        Some(MediaKey::Previous)
    } else if value & FORWARD == FORWARD {
        Some(MediaKey::Next)
    } else {
        None
    };

    if let Some(key) = key {
        if two_step {
            let phase = if pressed {
                KeyPhase::Press
            } else {
                KeyPhase::Release
            };
            actions.push(LocalAction::Media { key, phase });
        } else {
            actions.push(LocalAction::Media {
                key,
                phase: KeyPhase::Press,
            });
            actions.push(LocalAction::Media {
                key,
                phase: KeyPhase::Release,
            });
        }
    }

    Decoded::Actions(actions)
}
