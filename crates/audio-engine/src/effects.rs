//! Audio effects control.
//!
//! The DSP itself lives in an [`EffectsProcessor`]; this module only remembers the user's
//! settings, clamps them and re-applies them whenever the processor is attached to a new
//! output session. It has its own lock and never talks to the engine thread.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Strength range shared by bass boost and virtualizer.
pub const MAX_STRENGTH: u16 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrengthEffect {
    BassBoost,
    Virtualizer,
}

impl StrengthEffect {
    fn name(self) -> &'static str {
        match self {
            StrengthEffect::BassBoost => "bass_boost",
            StrengthEffect::Virtualizer => "virtualizer",
        }
    }
}

/// Native effects collaborator.
pub trait EffectsProcessor: Send {
    /// Bind the effects to output session `session_id`.
    fn attach(&mut self, session_id: i32) -> anyhow::Result<()>;
    fn detach(&mut self);

    /// Returns whether the equalizer is enabled afterwards.
    fn set_equalizer_enabled(&mut self, enabled: bool) -> bool;
    /// Band levels in millibels, lowest band first.
    fn set_equalizer_band_levels(&mut self, levels: &[i16]);

    fn strength_supported(&self, effect: StrengthEffect) -> bool;
    /// Returns whether the effect is enabled afterwards.
    fn set_enabled(&mut self, effect: StrengthEffect, enabled: bool) -> bool;
    /// Returns the strength the processor actually applied.
    fn set_strength(&mut self, effect: StrengthEffect, strength: u16) -> u16;
}

#[derive(Clone, Copy, Debug, Default)]
struct StrengthSettings {
    enabled: bool,
    strength: u16,
}

struct EffectsState {
    processor: Box<dyn EffectsProcessor>,
    session_id: Option<i32>,
    attached: bool,
    equalizer_enabled: bool,
    band_levels: Vec<i16>,
    bass_boost: StrengthSettings,
    virtualizer: StrengthSettings,
}

impl EffectsState {
    fn settings(&mut self, effect: StrengthEffect) -> &mut StrengthSettings {
        match effect {
            StrengthEffect::BassBoost => &mut self.bass_boost,
            StrengthEffect::Virtualizer => &mut self.virtualizer,
        }
    }

    /// Strength handed to the processor. Effects without strength control are either off
    /// or at full strength.
    fn effective_strength(&self, effect: StrengthEffect, strength: u16) -> u16 {
        if self.processor.strength_supported(effect) || strength == 0 {
            strength
        } else {
            MAX_STRENGTH
        }
    }

    fn apply_strength(&mut self, effect: StrengthEffect) {
        let wanted = self.settings(effect).strength;
        let strength = self.effective_strength(effect, wanted);
        let applied = self.processor.set_strength(effect, strength).min(MAX_STRENGTH);
        self.settings(effect).strength = applied;
    }

    fn apply_enabled(&mut self, effect: StrengthEffect) {
        let enabled = self.settings(effect).enabled;
        if enabled {
            if !self.processor.strength_supported(effect) {
                self.settings(effect).strength = MAX_STRENGTH;
            }
            self.apply_strength(effect);
        }
        let now = self.processor.set_enabled(effect, enabled);
        self.settings(effect).enabled = now;
    }
}

pub struct Effects {
    state: Mutex<EffectsState>,
}

impl Effects {
    pub fn new(processor: Box<dyn EffectsProcessor>) -> Self {
        Self {
            state: Mutex::new(EffectsState {
                processor,
                session_id: None,
                attached: false,
                equalizer_enabled: false,
                band_levels: Vec::new(),
                bass_boost: StrengthSettings::default(),
                virtualizer: StrengthSettings::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EffectsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to `session_id`, or to the last known session with `None`, and re-apply every
    /// stored setting.
    ///
    /// Returns `false` when the processor refused; the effects then stay unsupported until
    /// the next successful initialize.
    pub fn initialize(&self, session_id: Option<i32>) -> bool {
        let mut s = self.lock();
        if let Some(id) = session_id {
            s.session_id = Some(id);
        }
        let Some(id) = s.session_id else {
            tracing::debug!("no output session yet; effects stay detached");
            return false;
        };
        if s.attached {
            s.processor.detach();
            s.attached = false;
        }
        if let Err(err) = s.processor.attach(id) {
            tracing::warn!(session_id = id, error = %err, "audio effects unavailable");
            return false;
        }
        s.attached = true;

        let levels = s.band_levels.clone();
        if !levels.is_empty() {
            s.processor.set_equalizer_band_levels(&levels);
        }
        let eq = s.equalizer_enabled;
        s.equalizer_enabled = s.processor.set_equalizer_enabled(eq);
        s.apply_enabled(StrengthEffect::BassBoost);
        s.apply_enabled(StrengthEffect::Virtualizer);
        tracing::debug!(session_id = id, "audio effects attached");
        true
    }

    pub fn release(&self) {
        let mut s = self.lock();
        if s.attached {
            s.processor.detach();
            s.attached = false;
        }
    }

    pub fn is_supported(&self) -> bool {
        self.lock().attached
    }

    pub fn session_id(&self) -> Option<i32> {
        self.lock().session_id
    }

    pub fn set_equalizer_enabled(&self, enabled: bool) {
        let mut s = self.lock();
        s.equalizer_enabled = enabled;
        if s.attached {
            s.equalizer_enabled = s.processor.set_equalizer_enabled(enabled);
        }
    }

    pub fn is_equalizer_enabled(&self) -> bool {
        self.lock().equalizer_enabled
    }

    /// Set one band, growing the stored band list with flat bands if needed.
    pub fn set_equalizer_band_level(&self, band: usize, level_millibels: i16) {
        let mut s = self.lock();
        if s.band_levels.len() <= band {
            s.band_levels.resize(band + 1, 0);
        }
        s.band_levels[band] = level_millibels;
        if s.attached {
            let levels = s.band_levels.clone();
            s.processor.set_equalizer_band_levels(&levels);
        }
    }

    pub fn set_equalizer_band_levels(&self, levels: &[i16]) {
        let mut s = self.lock();
        s.band_levels = levels.to_vec();
        if s.attached {
            s.processor.set_equalizer_band_levels(levels);
        }
    }

    pub fn equalizer_band_levels(&self) -> Vec<i16> {
        self.lock().band_levels.clone()
    }

    pub fn set_enabled(&self, effect: StrengthEffect, enabled: bool) {
        let mut s = self.lock();
        s.settings(effect).enabled = enabled;
        if s.attached && s.session_id.is_some() {
            s.apply_enabled(effect);
        }
        tracing::debug!(effect = effect.name(), enabled = s.settings(effect).enabled, "effect toggled");
    }

    pub fn is_enabled(&self, effect: StrengthEffect) -> bool {
        self.lock().settings(effect).enabled
    }

    /// Store `strength`, clamped to `0..=1000`, and apply it right away when attached.
    pub fn set_strength(&self, effect: StrengthEffect, strength: i32) {
        let strength = strength.clamp(0, i32::from(MAX_STRENGTH)) as u16;
        let mut s = self.lock();
        s.settings(effect).strength = strength;
        if s.attached {
            s.apply_strength(effect);
        }
    }

    pub fn strength(&self, effect: StrengthEffect) -> u16 {
        self.lock().settings(effect).strength
    }
}
