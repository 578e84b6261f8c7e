//! Lighting modes cycled by the DPS mode button.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FirmwareKind;

/// A lighting mode of the DPS firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightingMode {
    /// LED dark (MAX_ONLY power-up mode).
    Off,
    /// Full brightness (MAX_ONLY).
    Max,
    /// Full brightness (FLASH power-up mode).
    Strong,
    /// Reduced brightness (FLASH).
    Light,
    /// Blinking (FLASH); has no current window.
    Blinking,
}

impl LightingMode {
    /// Modes of a firmware kind in button order; the first is active after
    /// power-up.
    pub fn sequence(kind: FirmwareKind) -> &'static [LightingMode] {
        match kind {
            FirmwareKind::MaxOnly => &[LightingMode::Off, LightingMode::Max],
            FirmwareKind::Flash => &[
                LightingMode::Strong,
                LightingMode::Light,
                LightingMode::Blinking,
            ],
        }
    }
}

impl fmt::Display for LightingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LightingMode::Off => "off",
            LightingMode::Max => "max",
            LightingMode::Strong => "strong",
            LightingMode::Light => "light",
            LightingMode::Blinking => "blinking",
        };
        f.write_str(name)
    }
}

/// Position in the mode sequence of one firmware kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCycle {
    kind: FirmwareKind,
    index: usize,
}

impl ModeCycle {
    /// Power-up mode of `kind`.
    pub fn new(kind: FirmwareKind) -> Self {
        Self { kind, index: 0 }
    }

    /// Firmware kind this cycle follows.
    pub fn kind(&self) -> FirmwareKind {
        self.kind
    }

    /// Active mode.
    pub fn current(&self) -> LightingMode {
        LightingMode::sequence(self.kind)[self.index]
    }

    /// Step to the next mode, wrapping around, and return it.
    pub fn advance(&mut self) -> LightingMode {
        let modes = LightingMode::sequence(self.kind);
        self.index = (self.index + 1) % modes.len();
        modes[self.index]
    }
}
