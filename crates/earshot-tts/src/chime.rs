//! Chime sequences and PCM tone synthesis.
//!
//! Tones are rendered to a 22.05 kHz mono 16-bit WAV with a short fade on
//! both ends so the pings do not click in the operator's earphones.

const SAMPLE_RATE: u32 = 22_050;
const FADE_MS: u64 = 5;

/// One chime step: (frequency Hz, duration ms, trailing gap ms).
pub type ChimeStep = (f32, u64, u64);

/// Chime styles by name. Unknown names yield `None` (callers no-op).
pub fn chime_steps(style: &str) -> Option<&'static [ChimeStep]> {
    match style {
        // Single high ping on selection.
        "select" => Some(&[(1320.0, 80, 0)]),
        // Two descending tones.
        "undo" => Some(&[(880.0, 90, 40), (660.0, 120, 0)]),
        // Low double buzz.
        "error" => Some(&[(330.0, 120, 60), (262.0, 180, 0)]),
        // Ascending pair.
        "success" => Some(&[(660.0, 90, 40), (990.0, 120, 0)]),
        _ => None,
    }
}

/// Render a sine tone as complete WAV bytes.
pub fn tone_wav_bytes(freq_hz: f32, dur_ms: u64) -> Vec<u8> {
    let n_samples = (SAMPLE_RATE as u64 * dur_ms / 1000) as usize;
    let fade_samples = ((SAMPLE_RATE as u64 * FADE_MS / 1000) as usize).min(n_samples / 2);

    let mut pcm = Vec::with_capacity(n_samples * 2);
    for i in 0..n_samples {
        let t = i as f32 / SAMPLE_RATE as f32;
        let mut amp = (t * freq_hz * 2.0 * std::f32::consts::PI).sin() * 0.35;
        if fade_samples > 0 {
            if i < fade_samples {
                amp *= i as f32 / fade_samples as f32;
            } else if i >= n_samples - fade_samples {
                amp *= (n_samples - i) as f32 / fade_samples as f32;
            }
        }
        let sample = (amp * i16::MAX as f32) as i16;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }

    let mut wav = Vec::with_capacity(44 + pcm.len());
    let data_len = pcm.len() as u32;
    let byte_rate = SAMPLE_RATE * 2;

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(&pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_styles_have_steps() {
        for style in ["select", "undo", "error", "success"] {
            assert!(chime_steps(style).is_some(), "missing chime: {style}");
        }
    }

    #[test]
    fn unknown_style_is_none() {
        assert!(chime_steps("fanfare").is_none());
        assert!(chime_steps("").is_none());
    }

    #[test]
    fn undo_descends_and_success_ascends() {
        let undo = chime_steps("undo").unwrap();
        assert!(undo[0].0 > undo[1].0);
        let success = chime_steps("success").unwrap();
        assert!(success[0].0 < success[1].0);
    }

    #[test]
    fn tone_wav_has_valid_header_and_length() {
        let wav = tone_wav_bytes(440.0, 100);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        let expected_samples = (SAMPLE_RATE as u64 * 100 / 1000) as usize;
        assert_eq!(wav.len(), 44 + expected_samples * 2);

        let data_len = u32::from_le_bytes(wav[40..44].try_into().unwrap());
        assert_eq!(data_len as usize, expected_samples * 2);
    }

    #[test]
    fn tone_starts_and_ends_silent() {
        let wav = tone_wav_bytes(440.0, 100);
        let first = i16::from_le_bytes(wav[44..46].try_into().unwrap());
        let last = i16::from_le_bytes(wav[wav.len() - 2..].try_into().unwrap());
        assert_eq!(first, 0);
        assert!(last.abs() < 1000);
    }
}
