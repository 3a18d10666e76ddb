use serde::{Deserialize, Serialize};

/// Número de bandas del ecualizador del nodo (25 Hz a 16 kHz)
pub const EQ_BANDS: usize = 15;

/// Rango de ganancia aceptado por el nodo por banda
const EQ_GAIN_RANGE: (f32, f32) = (-0.25, 1.0);

/// Estado completo de filtros DSP de un player.
///
/// Cada grupo es opcional e independiente. `volume` siempre se envía: el nodo
/// limpia cualquier grupo que no venga en el parche, y el volumen también.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    pub volume: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<Band>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Tremolo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Vibrato>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
}

impl Default for Filters {
    fn default() -> Self {
        Self::with_volume(1.0)
    }
}

impl Filters {
    /// Filtros vacíos que solo conservan el volumen
    pub fn with_volume(volume: f32) -> Self {
        Self {
            volume,
            equalizer: None,
            karaoke: None,
            timescale: None,
            tremolo: None,
            vibrato: None,
            rotation: None,
            low_pass: None,
        }
    }

    /// Resetea todos los grupos excepto el volumen
    pub fn reset(&mut self) {
        *self = Self::with_volume(self.volume);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

impl Default for Karaoke {
    fn default() -> Self {
        Self {
            level: 1.0,
            mono_level: 1.0,
            filter_band: 220.0,
            filter_width: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

impl Timescale {
    /// Preset "nightcore"
    pub fn nightcore() -> Self {
        Self {
            speed: 1.2,
            pitch: 1.2,
            rate: 1.0,
        }
    }

    /// Preset "vaporwave"
    pub fn vaporwave() -> Self {
        Self {
            speed: 0.85,
            pitch: 0.8,
            rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tremolo {
    pub frequency: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vibrato {
    pub frequency: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f32,
}

/// Presets de ecualizador disponibles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqPreset {
    Flat,
    Bass,
    Pop,
    Rock,
    Jazz,
    Classical,
    Electronic,
    Vocal,
}

impl EqPreset {
    /// Ganancias por banda (25, 40, 63, 100, 160, 250, 400, 630, 1k, 1.6k,
    /// 2.5k, 4k, 6.3k, 10k, 16k Hz)
    pub fn gains(self) -> [f32; EQ_BANDS] {
        match self {
            Self::Flat => [0.0; EQ_BANDS],
            Self::Bass => [
                0.30, 0.25, 0.20, 0.15, 0.10, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            ],
            Self::Pop => [
                -0.05, 0.0, 0.05, 0.10, 0.15, 0.20, 0.15, 0.10, 0.0, -0.05, -0.05, 0.0, 0.0, 0.0,
                0.0,
            ],
            Self::Rock => [
                0.25, 0.20, 0.15, 0.10, 0.05, -0.05, -0.05, 0.0, 0.0, 0.05, 0.10, 0.15, 0.20, 0.20,
                0.20,
            ],
            Self::Jazz => [
                0.0, 0.05, 0.05, 0.10, 0.10, 0.15, 0.10, 0.05, 0.0, 0.05, 0.05, 0.10, 0.15, 0.15,
                0.15,
            ],
            Self::Classical => [
                0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -0.05, -0.10, -0.10, -0.10, -0.15,
                -0.15,
            ],
            Self::Electronic => [
                0.25, 0.20, 0.15, 0.05, 0.0, -0.05, -0.10, 0.0, 0.10, 0.05, 0.05, 0.10, 0.15, 0.20,
                0.20,
            ],
            Self::Vocal => [
                -0.10, -0.10, -0.05, 0.0, 0.05, 0.10, 0.20, 0.20, 0.15, 0.10, 0.05, 0.0, 0.0, -0.05,
                -0.05,
            ],
        }
    }

    pub fn bands(self) -> Vec<Band> {
        bands_from_gains(&self.gains())
    }

    /// Obtiene un preset por nombre
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "flat" | "normal" => Some(Self::Flat),
            "bass" => Some(Self::Bass),
            "pop" => Some(Self::Pop),
            "rock" => Some(Self::Rock),
            "jazz" => Some(Self::Jazz),
            "classical" => Some(Self::Classical),
            "electronic" => Some(Self::Electronic),
            "vocal" => Some(Self::Vocal),
            _ => None,
        }
    }

    /// Lista todos los presets disponibles
    pub fn list() -> &'static [&'static str] {
        &[
            "flat",
            "bass",
            "pop",
            "rock",
            "jazz",
            "classical",
            "electronic",
            "vocal",
        ]
    }
}

/// Convierte ganancias en bandas, recortadas al rango del nodo
pub fn bands_from_gains(gains: &[f32]) -> Vec<Band> {
    gains
        .iter()
        .take(EQ_BANDS)
        .enumerate()
        .map(|(band, gain)| Band {
            band: band as u8,
            gain: gain.clamp(EQ_GAIN_RANGE.0, EQ_GAIN_RANGE.1),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_default_payload_only_carries_volume() {
        let payload = serde_json::to_value(Filters::default()).unwrap();
        assert_eq!(payload, json!({"volume": 1.0}));
    }

    #[test]
    fn test_reset_keeps_volume() {
        let mut filters = Filters::with_volume(0.5);
        filters.timescale = Some(Timescale::nightcore());
        filters.karaoke = Some(Karaoke::default());

        let payload = serde_json::to_value(&filters).unwrap();
        assert_eq!(payload["volume"], json!(0.5));
        assert_eq!(payload["timescale"]["speed"], json!(1.2f32));
        assert!(payload.get("karaoke").is_some());

        filters.reset();
        assert_eq!(serde_json::to_value(&filters).unwrap(), json!({"volume": 0.5}));
    }

    #[test]
    fn test_presets_fit_band_range() {
        for name in EqPreset::list() {
            let preset = EqPreset::from_name(name).unwrap();
            let bands = preset.bands();
            assert_eq!(bands.len(), EQ_BANDS);
            assert!(bands.iter().all(|b| (-0.25..=1.0).contains(&b.gain)));
        }
        assert!(EqPreset::from_name("dubstep").is_none());
    }

    #[test]
    fn test_bands_from_gains_clamps() {
        let bands = bands_from_gains(&[2.0, -1.0, 0.1]);
        assert_eq!(
            bands,
            vec![
                Band { band: 0, gain: 1.0 },
                Band { band: 1, gain: -0.25 },
                Band { band: 2, gain: 0.1 },
            ]
        );
    }
}
