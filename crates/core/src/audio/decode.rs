use std::io::Cursor;

use hound::{SampleFormat, WavReader};

use crate::{Result, TriggerRigError};

/// A fully decoded asset, downmixed to mono.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_sec(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decodes a RIFF/WAVE byte buffer. Integer samples are scaled to `[-1, 1]`
/// and channels are averaged.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(TriggerRigError::decode("wav file declares no channels"));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let channels = usize::from(spec.channels);
    let samples: Vec<f32> = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    if samples.is_empty() {
        return Err(TriggerRigError::decode("wav file contains no samples"));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;

    use hound::{SampleFormat, WavSpec, WavWriter};

    /// A 16-bit WAV holding `frames` of a square wave at `hz`.
    pub fn square_wav(sample_rate: u32, channels: u16, frames: usize, hz: f64) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            let period = f64::from(sample_rate) / hz;
            for frame in 0..frames {
                let high = (frame as f64 % period) < period / 2.0;
                let value: i16 = if high { i16::MAX / 2 } else { -(i16::MAX / 2) };
                for _ in 0..channels {
                    writer.write_sample(value).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }
}
