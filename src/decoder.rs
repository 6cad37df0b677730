//! Audio decoding through Symphonia.
//!
//! The [`Decoder`] turns an [`AudioFile`] into `f32` samples for rodio. It
//! supports:
//! * AAC in ADTS framing or an MP4 container
//! * FLAC
//! * MP3
//! * WAV
//!
//! When the file extension names one of these formats, only the matching
//! demuxer and codec are registered. Anything else is probed against all
//! of them.

use std::time::Duration;

use rodio::source::SeekError;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{CodecRegistry, DecoderOptions},
        errors::Error as SymphoniaError,
        formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
        io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
        meta::MetadataOptions,
        probe::{Hint, Probe},
    },
    default::{
        codecs::{AacDecoder, FlacDecoder, MpaDecoder, PcmDecoder},
        formats::{AdtsReader, FlacReader, IsoMp4Reader, MpaReader, WavReader},
    },
};

use crate::{
    audio_file::{AudioFile, BUFFER_LEN},
    error::{Error, Result},
};

/// Sample rate assumed when a stream does not declare one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Channel count assumed when a stream does not declare one.
pub const DEFAULT_CHANNELS: u16 = 2;

/// Maximum number of consecutive corrupted packets to skip before giving up.
const MAX_RETRIES: usize = 3;

pub struct Decoder {
    demuxer: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,

    /// Reusable sample buffer to minimize allocations.
    buffer: Option<SampleBuffer<f32>>,

    /// Current position in the sample buffer.
    position: usize,

    channels: u16,
    sample_rate: u32,
    total_duration: Option<Duration>,
    total_samples: Option<usize>,
}

impl Decoder {
    /// Opens `file`, using `extension` (such as `"mp3"`) to narrow down the
    /// format.
    ///
    /// # Errors
    ///
    /// Returns an error if the format cannot be detected, has no audio
    /// track, or its codec cannot be initialized.
    pub fn new(file: AudioFile, extension: Option<&str>) -> Result<Self> {
        // Twice the buffer length to allow for Symphonia's read-ahead
        // behavior, and the 64 KiB minimum it asserts for its ring buffer.
        let buffer_len = usize::max(64 * 1024, BUFFER_LEN * 2);
        let stream =
            MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions { buffer_len });
        let byte_len = stream.byte_len();

        let mut hint = Hint::new();
        let mut codecs = CodecRegistry::default();
        let mut probes = Probe::default();
        let extension = extension.map(str::to_ascii_lowercase);
        let known = match extension.as_deref() {
            Some("aac" | "adts") => {
                codecs.register_all::<AacDecoder>();
                probes.register_all::<AdtsReader>();
                true
            }
            Some("flac") => {
                codecs.register_all::<FlacDecoder>();
                probes.register_all::<FlacReader>();
                true
            }
            Some("mp3") => {
                codecs.register_all::<MpaDecoder>();
                probes.register_all::<MpaReader>();
                true
            }
            Some("m4a" | "mp4") => {
                // MP4 can hold many codecs, but most likely AAC.
                codecs.register_all::<AacDecoder>();
                probes.register_all::<IsoMp4Reader>();
                true
            }
            Some("wav") => {
                codecs.register_all::<PcmDecoder>();
                probes.register_all::<WavReader>();
                true
            }
            _ => false,
        };
        if let Some(extension) = &extension {
            hint.with_extension(extension);
        }
        let (codecs, probe) = if known {
            (&codecs, &probes)
        } else {
            (
                symphonia::default::get_codecs(),
                symphonia::default::get_probe(),
            )
        };

        let demuxer = probe
            .format(
                &hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )?
            .format;
        let default_track = demuxer
            .default_track()
            .ok_or(Error::not_found("default track not found"))?;

        let decoder = codecs.make(&default_track.codec_params, &DecoderOptions::default())?;

        // The decoder may know more than the container did.
        let codec_params = decoder.codec_params();
        let sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = codec_params.channels.map_or(DEFAULT_CHANNELS, |channels| {
            u16::try_from(channels.count()).unwrap_or(u16::MAX)
        });

        let total_duration = codec_params
            .time_base
            .zip(codec_params.n_frames)
            .map(|(time_base, frames)| time_base.calc_time(frames).into());
        let total_samples = codec_params.n_frames.and_then(|frames| {
            frames
                .checked_mul(channels.into())
                .and_then(|samples| usize::try_from(samples).ok())
        });

        trace!("decoding {channels} channels at {sample_rate} Hz, {byte_len:?} bytes");

        Ok(Self {
            demuxer,
            decoder,
            buffer: None,
            position: 0,
            channels,
            sample_rate,
            total_duration,
            total_samples,
        })
    }
}

impl rodio::Source for Decoder {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.buffer.as_ref().map(SampleBuffer::len)
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.total_duration
    }

    fn try_seek(&mut self, pos: Duration) -> std::result::Result<(), SeekError> {
        self.demuxer
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    // `track_id: None` implies the default track
                    track_id: None,
                    time: pos.into(),
                },
            )
            .map_err(|e| {
                SeekError::SymphoniaDecoder(rodio::decoder::symphonia::SeekError::BaseSeek(e))
            })?;

        // Seeking is a demuxer operation, so the decoder cannot reliably
        // know when a seek took place. Reset it to avoid audio glitches.
        self.decoder.reset();
        self.buffer = None;

        Ok(())
    }
}

impl Iterator for Decoder {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self
            .buffer
            .as_ref()
            .is_none_or(|buffer| self.position >= buffer.len())
        {
            let mut skipped = 0;
            loop {
                if skipped > MAX_RETRIES {
                    error!("skipped too many packets, giving up");
                    return None;
                }

                match self.demuxer.next_packet() {
                    Ok(packet) => {
                        let decoded = self.decoder.decode(&packet).ok()?;
                        let buffer = match self.buffer.as_mut() {
                            Some(buffer) => buffer,
                            // The first packet is the largest, so allocate
                            // once and reuse.
                            None => self.buffer.insert(SampleBuffer::new(
                                decoded.capacity() as u64,
                                *decoded.spec(),
                            )),
                        };
                        buffer.copy_interleaved_ref(decoded);
                        self.position = 0;
                        break;
                    }

                    Err(SymphoniaError::IoError(e)) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            error!("{e}");
                        }
                        return None;
                    }
                    Err(SymphoniaError::DecodeError(e)) => {
                        warn!("skipping malformed packet: {e}");
                        skipped += 1;
                    }
                    Err(SymphoniaError::ResetRequired) => {
                        self.decoder.reset();
                    }
                    Err(e) => {
                        error!("{e}");
                        return None;
                    }
                }
            }
        }

        let sample = *self
            .buffer
            .as_ref()
            .and_then(|buf| buf.samples().get(self.position))?;
        self.position += 1;

        Some(sample)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.total_samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn garbage_is_rejected() {
        let file = AudioFile::from_bytes(Bytes::from_static(&[0u8; 4096]));
        assert!(Decoder::new(file, Some("mp3")).is_err());
    }

    #[test]
    fn decodes_pcm_wav() {
        // 4 frames of 16-bit stereo silence at 8 kHz.
        let samples = [0u8; 16];
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&2u16.to_le_bytes()); // channels
        wav.extend_from_slice(&8000u32.to_le_bytes());
        wav.extend_from_slice(&(8000u32 * 4).to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        wav.extend_from_slice(&samples);

        let decoder = Decoder::new(AudioFile::from_bytes(Bytes::from(wav)), Some("wav")).unwrap();
        assert_eq!(rodio::Source::channels(&decoder), 2);
        assert_eq!(rodio::Source::sample_rate(&decoder), 8000);
        assert_eq!(decoder.count(), 8);
    }
}
