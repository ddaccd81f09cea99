// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Capped diagnostic WAV dump.
//!
//! Writes the first few seconds of a session's PCM to disk so a deployment
//! can be checked for byte order and level problems. This is diagnostics
//! only, not a recording feature; failures are reported to the caller and
//! are expected to be logged and ignored.

use crate::SAMPLE_RATE;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Default dump length in seconds
pub const DEFAULT_DUMP_SECS: u32 = 5;

/// WAV writer that stops after a fixed number of samples.
pub struct WavDump {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    samples_left: u32,
}

impl WavDump {
    /// Create a dump file at `path` capped at `secs` seconds of audio.
    pub fn create(path: &Path, secs: u32) -> Result<Self, hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        Ok(Self {
            writer: Some(hound::WavWriter::create(path, spec)?),
            samples_left: secs * SAMPLE_RATE,
        })
    }

    /// Append little-endian PCM bytes. Once the cap is reached the file is
    /// finalized and further calls are no-ops.
    pub fn write(&mut self, pcm: &[u8]) -> Result<(), hound::Error> {
        let Some(writer) = &mut self.writer else {
            return Ok(());
        };

        for sample in pcm.chunks_exact(2) {
            if self.samples_left == 0 {
                break;
            }

            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
            self.samples_left -= 1;
        }

        if self.samples_left == 0 {
            self.finalize()?;
        }

        Ok(())
    }

    /// Flush the header and close the file.
    pub fn finalize(&mut self) -> Result<(), hound::Error> {
        match self.writer.take() {
            Some(writer) => writer.finalize(),
            None => Ok(()),
        }
    }
}
