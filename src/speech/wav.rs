//! Minimal PCM16 WAV writer for the offline tone voice.

pub const SAMPLE_RATE: u32 = 16_000;
const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 0.1;

/// Spoken length estimate: about 300 characters per minute, never under one
/// second, rounded to hundredths.
pub fn estimate_duration_secs(text: &str) -> f64 {
    let chars = text.chars().count() as f64;
    let secs = chars / 300.0 * 60.0;
    ((secs * 100.0).round() / 100.0).max(1.0)
}

/// Whole minutes (at least one) of 16 kHz PCM16 audio in `len` bytes.
pub fn pcm_minutes(len: usize) -> i64 {
    let secs = len as f64 / (SAMPLE_RATE as f64 * 2.0);
    ((secs / 60.0).ceil() as i64).max(1)
}

/// Mono 16 kHz WAV holding a quiet 440 Hz tone whose length follows the text
/// length (`chars / 50` seconds, clamped to 1..=10).
pub fn tone_for_text(text: &str) -> Vec<u8> {
    let secs = (text.chars().count() as f64 / 50.0).clamp(1.0, 10.0);
    let num_samples = (SAMPLE_RATE as f64 * secs) as u32;
    tone(num_samples)
}

fn tone(num_samples: u32) -> Vec<u8> {
    let data_len = num_samples * 2;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    buf.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());

    for i in 0..num_samples {
        let t = i as f64 / SAMPLE_RATE as f64;
        let sample = (2.0 * std::f64::consts::PI * TONE_HZ * t).sin() * TONE_AMPLITUDE * 32767.0;
        buf.extend_from_slice(&(sample.round() as i16).to_le_bytes());
    }

    buf
}
