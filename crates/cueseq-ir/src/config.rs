//! Engine-wide configuration: hardware class and parameter-scale generation.

/// The class of output device the engine is driving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceClass {
    #[default]
    GeneralMidi,
    /// MT-32 family device (emulated unless `native_mt32` is also set).
    Mt32,
    /// Amiga audio hardware; never accepts instrument-definition sysex.
    Amiga,
}

/// Static engine configuration, fixed at construction time.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// New parameter scale: speed centers on 64 and priority defaults
    /// lower. The legacy scale centers speed on 128.
    pub new_system: bool,
    pub device: DeviceClass,
    /// A real MT-32 is attached (no velocity remap needed, narrow
    /// transpose range).
    pub native_mt32: bool,
    /// Clamp part transpose to +/-12 regardless of device.
    pub narrow_transpose: bool,
    /// Global tempo scaling in percent; 100 = nominal.
    pub tempo_factor: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            new_system: false,
            device: DeviceClass::GeneralMidi,
            native_mt32: false,
            narrow_transpose: false,
            tempo_factor: 100,
        }
    }
}

impl EngineConfig {
    pub fn default_speed(&self) -> u8 {
        if self.new_system {
            64
        } else {
            128
        }
    }

    pub fn default_priority(&self) -> u8 {
        if self.new_system {
            0x40
        } else {
            0x80
        }
    }

    /// Shift applied when scaling the sink's base tempo by the speed byte.
    pub fn speed_shift(&self) -> u32 {
        if self.new_system {
            6
        } else {
            7
        }
    }

    /// Per-generation part transpose bound (+/-12 or +/-24 semitones).
    pub fn transpose_limit(&self) -> i8 {
        if self.narrow_transpose || self.native_mt32 {
            12
        } else {
            24
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.default_speed(), 128);
        assert_eq!(cfg.default_priority(), 0x80);
        assert_eq!(cfg.speed_shift(), 7);
        assert_eq!(cfg.transpose_limit(), 24);
    }

    #[test]
    fn new_system_defaults() {
        let cfg = EngineConfig { new_system: true, ..Default::default() };
        assert_eq!(cfg.default_speed(), 64);
        assert_eq!(cfg.default_priority(), 0x40);
        assert_eq!(cfg.speed_shift(), 6);
    }

    #[test]
    fn native_mt32_narrows_transpose() {
        let cfg = EngineConfig { native_mt32: true, ..Default::default() };
        assert_eq!(cfg.transpose_limit(), 12);
    }
}
