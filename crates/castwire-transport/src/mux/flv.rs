//! FLV tag bodies for RTMP.
//!
//! AVC uses the legacy video tag. HEVC, AV1 and Opus use the Enhanced RTMP
//! extended headers, which carry a FourCC instead of a codec id.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use castwire_codec::nal::{
    filter_avc_parameter_sets, filter_hevc_parameter_sets, split_nal_units, to_length_prefixed,
};
use castwire_codec::{
    opus_head, strip_adts, AudioCodec, AudioInfo, MediaFrame, MediaKind, StreamInfo, VideoCodec,
    VideoInfo,
};
use rml_amf0::Amf0Value;
use tracing::trace;

use super::{MuxedPacket, Muxer, PacketKind, TimestampTracker};
use crate::error::MuxError;

const FRAME_TYPE_KEY: u8 = 1;
const FRAME_TYPE_INTER: u8 = 2;

const AVC_CODEC_ID: u8 = 7;
const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;

const EX_HEADER: u8 = 0x80;
const EX_SEQUENCE_START: u8 = 0;
const EX_CODED_FRAMES: u8 = 1;
const EX_CODED_FRAMES_X: u8 = 3;

const SOUND_FORMAT_G711_ALAW: u8 = 7;
const SOUND_FORMAT_G711_ULAW: u8 = 8;
const SOUND_FORMAT_AAC: u8 = 10;
const SOUND_FORMAT_EX_HEADER: u8 = 9;
const AAC_HEADER: u8 = 0xAF;
const AAC_SEQUENCE_HEADER: u8 = 0;
const AAC_RAW: u8 = 1;

fn video_fourcc(codec: VideoCodec) -> Option<&'static [u8; 4]> {
    match codec {
        VideoCodec::Avc => None,
        VideoCodec::Hevc => Some(b"hvc1"),
        VideoCodec::Av1 => Some(b"av01"),
    }
}

fn fourcc_number(fourcc: &[u8; 4]) -> f64 {
    u32::from_be_bytes(*fourcc) as f64
}

/// Muxer producing FLV tag bodies (without the FLV tag header).
pub struct FlvMuxer {
    info: StreamInfo,
    resend_config_on_keyframe: bool,
    timestamps: TimestampTracker,
    video_config_sent: bool,
    audio_config_sent: bool,
}

impl FlvMuxer {
    pub fn new(resend_config_on_keyframe: bool) -> Self {
        Self {
            info: StreamInfo::default(),
            resend_config_on_keyframe,
            timestamps: TimestampTracker::default(),
            video_config_sent: false,
            audio_config_sent: false,
        }
    }

    fn metadata(&self) -> Result<Bytes, MuxError> {
        let mut props = HashMap::new();
        props.insert("duration".to_string(), Amf0Value::Number(0.0));

        if let Some(video) = &self.info.video {
            let (width, height) = video.dimensions();
            let codec_id = match video_fourcc(video.codec) {
                Some(fourcc) => fourcc_number(fourcc),
                None => AVC_CODEC_ID as f64,
            };
            props.insert("width".to_string(), Amf0Value::Number(width as f64));
            props.insert("height".to_string(), Amf0Value::Number(height as f64));
            props.insert("videocodecid".to_string(), Amf0Value::Number(codec_id));
        }

        if let Some(audio) = &self.info.audio {
            let codec_id = match audio.codec {
                AudioCodec::Aac => SOUND_FORMAT_AAC as f64,
                AudioCodec::G711Alaw => SOUND_FORMAT_G711_ALAW as f64,
                AudioCodec::G711Ulaw => SOUND_FORMAT_G711_ULAW as f64,
                AudioCodec::Opus => fourcc_number(b"Opus"),
            };
            props.insert("audiocodecid".to_string(), Amf0Value::Number(codec_id));
            props.insert(
                "audiosamplerate".to_string(),
                Amf0Value::Number(audio.sample_rate as f64),
            );
            props.insert("audiosamplesize".to_string(), Amf0Value::Number(16.0));
            props.insert(
                "audiochannels".to_string(),
                Amf0Value::Number(audio.channels as f64),
            );
            props.insert("stereo".to_string(), Amf0Value::Boolean(audio.channels > 1));
        }

        props.insert(
            "encoder".to_string(),
            Amf0Value::Utf8String(concat!("castwire/", env!("CARGO_PKG_VERSION")).to_string()),
        );

        let values = vec![
            Amf0Value::Utf8String("@setDataFrame".to_string()),
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Object(props),
        ];
        rml_amf0::serialize(&values)
            .map(Bytes::from)
            .map_err(|e| MuxError::Metadata(format!("{:?}", e)))
    }

    fn configuration(&mut self, timestamp_ms: u32) -> Result<Vec<MuxedPacket>, MuxError> {
        let mut packets = vec![MuxedPacket::config(
            PacketKind::Metadata,
            timestamp_ms,
            self.metadata()?,
        )];
        if let Some(video) = &self.info.video {
            packets.push(video_config_packet(video, timestamp_ms));
            self.video_config_sent = true;
        }
        if let Some(audio) = &self.info.audio {
            if let Some(packet) = audio_config_packet(audio, timestamp_ms) {
                packets.push(packet);
            }
            self.audio_config_sent = true;
        }
        Ok(packets)
    }
}

fn video_config_packet(video: &VideoInfo, timestamp_ms: u32) -> MuxedPacket {
    let mut body = BytesMut::with_capacity(video.record_bytes.len() + 5);
    match video_fourcc(video.codec) {
        None => {
            body.put_u8(FRAME_TYPE_KEY << 4 | AVC_CODEC_ID);
            body.put_u8(AVC_SEQUENCE_HEADER);
            body.put_slice(&[0, 0, 0]);
        }
        Some(fourcc) => {
            body.put_u8(EX_HEADER | FRAME_TYPE_KEY << 4 | EX_SEQUENCE_START);
            body.put_slice(fourcc);
        }
    }
    body.put_slice(&video.record_bytes);
    MuxedPacket::config(PacketKind::VideoConfig, timestamp_ms, body.freeze())
}

fn audio_config_packet(audio: &AudioInfo, timestamp_ms: u32) -> Option<MuxedPacket> {
    let body = match audio.codec {
        AudioCodec::Aac => {
            let config = audio.aac_config()?.to_bytes();
            let mut body = BytesMut::with_capacity(4);
            body.put_u8(AAC_HEADER);
            body.put_u8(AAC_SEQUENCE_HEADER);
            body.put_slice(&config);
            body.freeze()
        }
        AudioCodec::Opus => {
            let head = opus_head(audio.channels, audio.sample_rate);
            let mut body = BytesMut::with_capacity(head.len() + 5);
            body.put_u8(SOUND_FORMAT_EX_HEADER << 4 | EX_SEQUENCE_START);
            body.put_slice(b"Opus");
            body.put_slice(&head);
            body.freeze()
        }
        // G.711 needs no sequence header.
        AudioCodec::G711Alaw | AudioCodec::G711Ulaw => return None,
    };
    Some(MuxedPacket::config(PacketKind::AudioConfig, timestamp_ms, body))
}

fn composition_time_ms(frame: &MediaFrame) -> i32 {
    (frame.composition_offset_us / 1000).clamp(-0x80_0000, 0x7F_FFFF) as i32
}

fn put_i24(body: &mut BytesMut, value: i32) {
    let raw = (value as u32) & 0x00FF_FFFF;
    body.put_slice(&raw.to_be_bytes()[1..]);
}

fn video_body(video: &VideoInfo, frame: &MediaFrame) -> Bytes {
    let frame_type = if frame.is_keyframe {
        FRAME_TYPE_KEY
    } else {
        FRAME_TYPE_INTER
    };
    let cts = composition_time_ms(frame);

    let payload = match video.codec {
        VideoCodec::Avc => {
            to_length_prefixed(&filter_avc_parameter_sets(split_nal_units(&frame.payload)))
        }
        VideoCodec::Hevc => {
            to_length_prefixed(&filter_hevc_parameter_sets(split_nal_units(&frame.payload)))
        }
        VideoCodec::Av1 => frame.payload.clone(),
    };

    let mut body = BytesMut::with_capacity(payload.len() + 8);
    match video.codec {
        VideoCodec::Avc => {
            body.put_u8(frame_type << 4 | AVC_CODEC_ID);
            body.put_u8(AVC_NALU);
            put_i24(&mut body, cts);
        }
        VideoCodec::Hevc => {
            let packet_type = if cts == 0 {
                EX_CODED_FRAMES_X
            } else {
                EX_CODED_FRAMES
            };
            body.put_u8(EX_HEADER | frame_type << 4 | packet_type);
            body.put_slice(b"hvc1");
            if packet_type == EX_CODED_FRAMES {
                put_i24(&mut body, cts);
            }
        }
        VideoCodec::Av1 => {
            body.put_u8(EX_HEADER | frame_type << 4 | EX_CODED_FRAMES);
            body.put_slice(b"av01");
        }
    }
    body.put_slice(&payload);
    body.freeze()
}

fn audio_body(audio: &AudioInfo, frame: &MediaFrame) -> Bytes {
    let mut body = BytesMut::with_capacity(frame.payload.len() + 5);
    match audio.codec {
        AudioCodec::Aac => {
            body.put_u8(AAC_HEADER);
            body.put_u8(AAC_RAW);
            body.put_slice(&strip_adts(&frame.payload));
        }
        AudioCodec::Opus => {
            body.put_u8(SOUND_FORMAT_EX_HEADER << 4 | EX_CODED_FRAMES);
            body.put_slice(b"Opus");
            body.put_slice(&frame.payload);
        }
        AudioCodec::G711Alaw | AudioCodec::G711Ulaw => {
            let format = if audio.codec == AudioCodec::G711Alaw {
                SOUND_FORMAT_G711_ALAW
            } else {
                SOUND_FORMAT_G711_ULAW
            };
            // 8 kHz mono, 16-bit flag set
            body.put_u8(format << 4 | 1 << 1);
            body.put_slice(&frame.payload);
        }
    }
    body.freeze()
}

impl Muxer for FlvMuxer {
    fn name(&self) -> &'static str {
        "FLV"
    }

    fn begin_stream(&mut self, info: &StreamInfo) -> Result<Vec<MuxedPacket>, MuxError> {
        self.info = info.clone();
        self.video_config_sent = false;
        self.audio_config_sent = false;
        self.configuration(0)
    }

    fn packetize(&mut self, frame: MediaFrame) -> Result<Vec<MuxedPacket>, MuxError> {
        self.timestamps.observe(frame.kind, frame.timestamp_us);
        let timestamp_ms = self.timestamps.relative_ms(frame.timestamp_us);
        let mut packets = Vec::with_capacity(2);

        let (kind, data) = match frame.kind {
            MediaKind::Video => {
                let video = self.info.video.as_ref().ok_or(MuxError::MissingConfig("video"))?;
                let resend = self.resend_config_on_keyframe && frame.is_keyframe;
                if !self.video_config_sent || resend {
                    packets.push(video_config_packet(video, timestamp_ms));
                    self.video_config_sent = true;
                }
                (
                    PacketKind::Video {
                        keyframe: frame.is_keyframe,
                    },
                    video_body(video, &frame),
                )
            }
            MediaKind::Audio => {
                let audio = self.info.audio.as_ref().ok_or(MuxError::MissingConfig("audio"))?;
                if !self.audio_config_sent {
                    packets.extend(audio_config_packet(audio, timestamp_ms));
                    self.audio_config_sent = true;
                }
                (PacketKind::Audio, audio_body(audio, &frame))
            }
        };

        trace!(?kind, timestamp_ms, len = data.len(), "FLV tag");
        packets.push(MuxedPacket {
            kind,
            timestamp_ms,
            source_timestamp_us: Some(frame.timestamp_us),
            data,
        });
        Ok(packets)
    }

    fn reconfigure(&mut self, info: &StreamInfo) -> Result<Vec<MuxedPacket>, MuxError> {
        self.info = info.clone();
        self.configuration(self.timestamps.last_ms())
    }

    fn timestamp_anomalies(&self) -> u64 {
        self.timestamps.anomalies()
    }
}
