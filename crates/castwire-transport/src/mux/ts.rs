//! MPEG-2 transport stream muxer for SRT.

use bytes::{BufMut, Bytes, BytesMut};
use castwire_codec::nal::{
    filter_avc_parameter_sets, filter_hevc_parameter_sets, split_nal_units, to_annex_b,
};
use castwire_codec::{
    adts_header, strip_adts, AudioCodec, AudioSpecificConfig, MediaFrame, MediaKind, StreamInfo,
    VideoCodec,
};
use tracing::{debug, trace};

use super::{MuxedPacket, Muxer, PacketKind, TimestampTracker};
use crate::error::MuxError;

pub const TS_PACKET_SIZE: usize = 188;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;

const PID_PAT: u16 = 0x0000;
const PID_PMT: u16 = 0x1000;
const PID_VIDEO: u16 = 0x0100;
const PID_AUDIO: u16 = 0x0101;

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;
const PROGRAM_NUMBER: u16 = 1;
const TRANSPORT_STREAM_ID: u16 = 1;

const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_H265: u8 = 0x24;
const STREAM_TYPE_AAC: u8 = 0x0F;
const STREAM_TYPE_PRIVATE: u8 = 0x06;

const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;
const STREAM_ID_PRIVATE_1: u8 = 0xBD;

/// Delay added to PTS/DTS so that PCR always leads them (0.7 s at 90 kHz).
const PTS_OFFSET: u64 = 63_000;

/// A PCR goes out once this much stream time (40 ms at 90 kHz) has passed,
/// keeping the gap to the next one under the 100 ms limit.
const PCR_INTERVAL_90K: u64 = 3_600;

const AVC_AUD: &[u8] = &[0x09, 0xF0];
const HEVC_AUD: &[u8] = &[0x46, 0x01, 0x50];

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

/// CRC-32/MPEG-2 over a PSI section.
pub(crate) fn crc32_mpeg2(data: &[u8]) -> u32 {
    data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
        let index = ((crc >> 24) ^ byte as u32) & 0xFF;
        (crc << 8) ^ CRC_TABLE[index as usize]
    })
}

struct VideoTrack {
    codec: VideoCodec,
    stream_type: u8,
    /// Parameter sets in Annex B form, sent ahead of every keyframe.
    parameter_sets: Bytes,
}

struct AudioTrack {
    codec: AudioCodec,
    channels: u8,
    aac_config: Option<AudioSpecificConfig>,
}

#[derive(Default)]
struct ContinuityCounters {
    pat: u8,
    pmt: u8,
    video: u8,
    audio: u8,
}

fn next_cc(counter: &mut u8) -> u8 {
    let cc = *counter;
    *counter = (cc + 1) & 0x0F;
    cc
}

/// Muxer producing 188-byte transport stream packets.
pub struct TsMuxer {
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    counters: ContinuityCounters,
    timestamps: TimestampTracker,
    pmt_version: u8,
    last_pcr_90k: Option<u64>,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            video: None,
            audio: None,
            counters: ContinuityCounters::default(),
            timestamps: TimestampTracker::default(),
            pmt_version: 0,
            last_pcr_90k: None,
        }
    }

    fn set_tracks(&mut self, info: &StreamInfo) -> Result<(), MuxError> {
        let video = match &info.video {
            Some(video) => {
                let stream_type = match video.codec {
                    VideoCodec::Avc => STREAM_TYPE_H264,
                    VideoCodec::Hevc => STREAM_TYPE_H265,
                    VideoCodec::Av1 => {
                        return Err(MuxError::UnsupportedCodec {
                            container: "MPEG-TS",
                            codec: video.codec.to_string(),
                        })
                    }
                };
                Some(VideoTrack {
                    codec: video.codec,
                    stream_type,
                    parameter_sets: to_annex_b(&video.record.parameter_sets()),
                })
            }
            None => None,
        };

        let audio = match &info.audio {
            Some(audio) => match audio.codec {
                AudioCodec::Aac | AudioCodec::Opus => Some(AudioTrack {
                    codec: audio.codec,
                    channels: audio.channels,
                    aac_config: audio.aac_config(),
                }),
                AudioCodec::G711Alaw | AudioCodec::G711Ulaw => {
                    return Err(MuxError::UnsupportedCodec {
                        container: "MPEG-TS",
                        codec: audio.codec.to_string(),
                    })
                }
            },
            None => None,
        };

        self.video = video;
        self.audio = audio;
        Ok(())
    }

    /// Claim a PCR slot at `dts_90k` if one is due (or forced).
    fn take_pcr(&mut self, dts_90k: u64, force: bool) -> Option<u64> {
        let due = match self.last_pcr_90k {
            None => true,
            Some(last) => dts_90k >= last + PCR_INTERVAL_90K,
        };
        if !(due || force) {
            return None;
        }
        self.last_pcr_90k = Some(dts_90k.max(self.last_pcr_90k.unwrap_or(0)));
        Some(dts_90k * 300)
    }

    fn pcr_pid(&self) -> u16 {
        if self.video.is_some() {
            PID_VIDEO
        } else {
            PID_AUDIO
        }
    }

    fn pat_section(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(4);
        body.put_u16(PROGRAM_NUMBER);
        body.put_u16(0xE000 | PID_PMT);
        psi_section(TABLE_ID_PAT, TRANSPORT_STREAM_ID, self.pmt_version, &body)
    }

    fn pmt_section(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(32);
        body.put_u16(0xE000 | self.pcr_pid());
        body.put_u16(0xF000); // no program descriptors

        if let Some(video) = &self.video {
            body.put_u8(video.stream_type);
            body.put_u16(0xE000 | PID_VIDEO);
            body.put_u16(0xF000);
        }

        if let Some(audio) = &self.audio {
            match audio.codec {
                AudioCodec::Opus => {
                    // registration descriptor "Opus" + DVB extension descriptor
                    let descriptors = [
                        0x05,
                        0x04,
                        b'O',
                        b'p',
                        b'u',
                        b's',
                        0x7F,
                        0x02,
                        0x80,
                        audio.channels,
                    ];
                    body.put_u8(STREAM_TYPE_PRIVATE);
                    body.put_u16(0xE000 | PID_AUDIO);
                    body.put_u16(0xF000 | descriptors.len() as u16);
                    body.put_slice(&descriptors);
                }
                _ => {
                    body.put_u8(STREAM_TYPE_AAC);
                    body.put_u16(0xE000 | PID_AUDIO);
                    body.put_u16(0xF000);
                }
            }
        }

        psi_section(TABLE_ID_PMT, PROGRAM_NUMBER, self.pmt_version, &body)
    }

    /// PAT and PMT, one TS packet each.
    fn program_tables(&mut self, timestamp_ms: u32) -> MuxedPacket {
        let mut out = BytesMut::with_capacity(TS_PACKET_SIZE * 2);
        let pat = self.pat_section();
        let pmt = self.pmt_section();
        write_section(&mut out, PID_PAT, next_cc(&mut self.counters.pat), &pat);
        write_section(&mut out, PID_PMT, next_cc(&mut self.counters.pmt), &pmt);
        MuxedPacket::config(PacketKind::Psi, timestamp_ms, out.freeze())
    }

    fn video_access_unit(&self, track: &VideoTrack, frame: &MediaFrame) -> Bytes {
        let units = split_nal_units(&frame.payload);
        let (aud, units) = match track.codec {
            VideoCodec::Hevc => (HEVC_AUD, filter_hevc_parameter_sets(units)),
            _ => (AVC_AUD, filter_avc_parameter_sets(units)),
        };
        let mut au = BytesMut::with_capacity(frame.payload.len() + track.parameter_sets.len() + 16);
        au.put_slice(&[0, 0, 0, 1]);
        au.put_slice(aud);
        if frame.is_keyframe {
            au.put_slice(&track.parameter_sets);
        }
        au.put_slice(&to_annex_b(&units));
        au.freeze()
    }

    fn audio_payload(&self, track: &AudioTrack, frame: &MediaFrame) -> Bytes {
        match (track.codec, &track.aac_config) {
            (AudioCodec::Aac, Some(config)) => {
                let raw = strip_adts(&frame.payload);
                let mut out = BytesMut::with_capacity(raw.len() + 7);
                out.put_slice(&adts_header(config, raw.len()));
                out.put_slice(&raw);
                out.freeze()
            }
            _ => {
                // Opus control header: prefix, no trim flags, then the AU size
                let mut out = BytesMut::with_capacity(frame.payload.len() + 8);
                out.put_u8(0x7F);
                out.put_u8(0xE0);
                let mut size = frame.payload.len();
                while size >= 255 {
                    out.put_u8(0xFF);
                    size -= 255;
                }
                out.put_u8(size as u8);
                out.put_slice(&frame.payload);
                out.freeze()
            }
        }
    }
}

fn psi_section(table_id: u8, id: u16, version: u8, body: &[u8]) -> BytesMut {
    let section_length = body.len() + 5 + 4;
    let mut section = BytesMut::with_capacity(section_length + 3);
    section.put_u8(table_id);
    section.put_u16(0xB000 | (section_length as u16 & 0x03FF));
    section.put_u16(id);
    section.put_u8(0xC1 | (version & 0x1F) << 1);
    section.put_u8(0); // section number
    section.put_u8(0); // last section number
    section.put_slice(body);
    let crc = crc32_mpeg2(&section);
    section.put_u32(crc);
    section
}

fn write_section(out: &mut BytesMut, pid: u16, cc: u8, section: &[u8]) {
    let start = out.len();
    out.put_u8(SYNC_BYTE);
    out.put_u16(0x4000 | pid);
    out.put_u8(0x10 | cc);
    out.put_u8(0); // pointer field
    out.put_slice(section);
    out.resize(start + TS_PACKET_SIZE, 0xFF);
}

fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        prefix << 4 | ((ts >> 29) as u8 & 0x0E) | 1,
        (ts >> 22) as u8,
        ((ts >> 14) as u8 & 0xFE) | 1,
        (ts >> 7) as u8,
        ((ts << 1) as u8 & 0xFE) | 1,
    ]
}

fn pes_packet(stream_id: u8, pts: u64, dts: Option<u64>, payload: &[u8], bounded: bool) -> BytesMut {
    let header_data_len = if dts.is_some() { 10 } else { 5 };
    let mut pes = BytesMut::with_capacity(payload.len() + 9 + header_data_len);
    pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);

    let length = 3 + header_data_len + payload.len();
    if bounded && length <= u16::MAX as usize {
        pes.put_u16(length as u16);
    } else {
        pes.put_u16(0);
    }

    pes.put_u8(0x80); // marker bits '10', not scrambled
    match dts {
        Some(dts) => {
            pes.put_u8(0xC0);
            pes.put_u8(header_data_len as u8);
            pes.put_slice(&encode_timestamp(0x3, pts));
            pes.put_slice(&encode_timestamp(0x1, dts));
        }
        None => {
            pes.put_u8(0x80);
            pes.put_u8(header_data_len as u8);
            pes.put_slice(&encode_timestamp(0x2, pts));
        }
    }
    pes.put_slice(payload);
    pes
}

fn encode_pcr(pcr: u64) -> [u8; 6] {
    let base = (pcr / 300) & 0x1_FFFF_FFFF;
    let ext = (pcr % 300) as u16;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        ((base & 1) as u8) << 7 | 0x7E | (ext >> 8) as u8,
        ext as u8,
    ]
}

/// An adaptation-only packet carrying just a PCR.
///
/// Such packets repeat the PID's last continuity counter.
fn write_pcr_packet(out: &mut BytesMut, pid: u16, counter: u8, pcr: u64) {
    const FIELD_LEN: usize = TS_PAYLOAD_SIZE - 1;
    out.put_u8(SYNC_BYTE);
    out.put_u16(pid & 0x1FFF);
    out.put_u8(0x20 | (counter.wrapping_sub(1) & 0x0F));
    out.put_u8(FIELD_LEN as u8);
    out.put_u8(0x10);
    out.put_slice(&encode_pcr(pcr));
    out.put_bytes(0xFF, FIELD_LEN - 7);
}

/// Split a PES packet into TS packets on `pid`.
fn write_pes(
    out: &mut BytesMut,
    pid: u16,
    counter: &mut u8,
    pes: &[u8],
    pcr: Option<u64>,
    random_access: bool,
) {
    let mut offset = 0;
    let mut first = true;

    while offset < pes.len() {
        let remaining = pes.len() - offset;
        let pcr_here = if first { pcr } else { None };
        let flagged = first && (pcr_here.is_some() || random_access);
        let fields_len = if flagged {
            1 + if pcr_here.is_some() { 6 } else { 0 }
        } else {
            0
        };
        let reserved = if fields_len > 0 { 1 + fields_len } else { 0 };
        let payload_len = remaining.min(TS_PAYLOAD_SIZE - reserved);
        let adaptation_len = TS_PAYLOAD_SIZE - payload_len;

        let pusi = if first { 0x4000 } else { 0 };
        let control = if adaptation_len > 0 { 0x30 } else { 0x10 };
        out.put_u8(SYNC_BYTE);
        out.put_u16(pusi | (pid & 0x1FFF));
        out.put_u8(control | next_cc(counter));

        if adaptation_len > 0 {
            let field_len = adaptation_len - 1;
            out.put_u8(field_len as u8);
            if field_len > 0 {
                let mut flags = 0u8;
                if flagged && random_access {
                    flags |= 0x40;
                }
                if pcr_here.is_some() {
                    flags |= 0x10;
                }
                out.put_u8(flags);
                let mut used = 1;
                if let Some(pcr) = pcr_here {
                    out.put_slice(&encode_pcr(pcr));
                    used += 6;
                }
                for _ in used..field_len {
                    out.put_u8(0xFF);
                }
            }
        }

        out.put_slice(&pes[offset..offset + payload_len]);
        offset += payload_len;
        first = false;
    }
}

impl Muxer for TsMuxer {
    fn name(&self) -> &'static str {
        "MPEG-TS"
    }

    fn begin_stream(&mut self, info: &StreamInfo) -> Result<Vec<MuxedPacket>, MuxError> {
        self.set_tracks(info)?;
        debug!(
            video = self.video.is_some(),
            audio = self.audio.is_some(),
            "Transport stream configured"
        );
        Ok(vec![self.program_tables(0)])
    }

    fn packetize(&mut self, frame: MediaFrame) -> Result<Vec<MuxedPacket>, MuxError> {
        self.timestamps.observe(frame.kind, frame.timestamp_us);
        let timestamp_ms = self.timestamps.relative_ms(frame.timestamp_us);
        let dts_90k = self.timestamps.relative_us(frame.timestamp_us) * 9 / 100;
        let pts_90k = self.timestamps.relative_us(frame.pts_us()) * 9 / 100;
        let dts = dts_90k + PTS_OFFSET;
        let pts = pts_90k + PTS_OFFSET;

        let mut packets = Vec::with_capacity(2);
        let mut out = BytesMut::new();

        let kind = match frame.kind {
            MediaKind::Video => {
                let track = self.video.as_ref().ok_or(MuxError::MissingConfig("video"))?;
                let au = self.video_access_unit(track, &frame);
                let pes = pes_packet(
                    STREAM_ID_VIDEO,
                    pts,
                    (pts != dts).then_some(dts),
                    &au,
                    false,
                );
                let frame_pcr = self.take_pcr(dts_90k, frame.is_keyframe);
                if frame.is_keyframe {
                    packets.push(self.program_tables(timestamp_ms));
                }
                write_pes(
                    &mut out,
                    PID_VIDEO,
                    &mut self.counters.video,
                    &pes,
                    frame_pcr,
                    frame.is_keyframe,
                );
                PacketKind::Video {
                    keyframe: frame.is_keyframe,
                }
            }
            MediaKind::Audio => {
                let track = self.audio.as_ref().ok_or(MuxError::MissingConfig("audio"))?;
                let payload = self.audio_payload(track, &frame);
                let stream_id = match track.codec {
                    AudioCodec::Opus => STREAM_ID_PRIVATE_1,
                    _ => STREAM_ID_AUDIO,
                };
                let pes = pes_packet(stream_id, pts, None, &payload, true);
                let audio_only = self.video.is_none();
                let pcr = self.take_pcr(dts_90k, false);
                let audio_pcr = match pcr {
                    Some(pcr) if !audio_only => {
                        // video owns the PCR PID but has gone quiet
                        write_pcr_packet(&mut out, PID_VIDEO, self.counters.video, pcr);
                        None
                    }
                    pcr => pcr,
                };
                write_pes(
                    &mut out,
                    PID_AUDIO,
                    &mut self.counters.audio,
                    &pes,
                    audio_pcr,
                    audio_only,
                );
                PacketKind::Audio
            }
        };

        trace!(?kind, pts, packets = out.len() / TS_PACKET_SIZE, "TS frame");
        packets.push(MuxedPacket {
            kind,
            timestamp_ms,
            source_timestamp_us: Some(frame.timestamp_us),
            data: out.freeze(),
        });
        Ok(packets)
    }

    fn reconfigure(&mut self, info: &StreamInfo) -> Result<Vec<MuxedPacket>, MuxError> {
        self.set_tracks(info)?;
        self.pmt_version = (self.pmt_version + 1) & 0x1F;
        Ok(vec![self.program_tables(self.timestamps.last_ms())])
    }

    fn timestamp_anomalies(&self) -> u64 {
        self.timestamps.anomalies()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castwire_codec::{AudioInfo, VideoInfo};
    use pretty_assertions::assert_eq;

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01, 0x40, 0x16, 0xE4];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn avc_aac() -> StreamInfo {
        StreamInfo {
            video: Some(
                VideoInfo::new(
                    VideoCodec::Avc,
                    &[Bytes::from_static(SPS), Bytes::from_static(PPS)],
                )
                .unwrap(),
            ),
            audio: Some(AudioInfo::new(AudioCodec::Aac, 44100, 2).unwrap()),
        }
    }

    fn pid(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[1], packet[2]]) & 0x1FFF
    }

    #[test]
    fn test_crc32_mpeg2() {
        assert_eq!(crc32_mpeg2(&[0x01, 0x01]), 0xD66F_B816);
    }

    #[test]
    fn test_pat_bytes() {
        let mut muxer = TsMuxer::new();
        let packets = muxer.begin_stream(&avc_aac()).unwrap();
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(data.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(
            &data[..21],
            &[
                0x47, 0x40, 0x00, 0x10, 0x00, // header, pointer
                0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00, //
                0x2A, 0xB1, 0x04, 0xB2,
            ]
        );
        assert!(data[21..TS_PACKET_SIZE].iter().all(|b| *b == 0xFF));

        let pmt = &data[TS_PACKET_SIZE..];
        assert_eq!(pid(pmt), PID_PMT);
        // PCR PID, then H.264 on 0x100 and AAC on 0x101
        assert_eq!(&pmt[13..15], &[0xE1, 0x00]);
        assert_eq!(&pmt[17..22], &[0x1B, 0xE1, 0x00, 0xF0, 0x00]);
        assert_eq!(&pmt[22..27], &[0x0F, 0xE1, 0x01, 0xF0, 0x00]);
        let section_len = (u16::from_be_bytes([pmt[6], pmt[7]]) & 0x3FF) as usize;
        let crc = crc32_mpeg2(&pmt[5..5 + 3 + section_len - 4]);
        assert_eq!(
            &pmt[5 + 3 + section_len - 4..5 + 3 + section_len],
            &crc.to_be_bytes()
        );
    }

    #[test]
    fn test_config_before_every_keyframe() {
        let mut muxer = TsMuxer::new();
        let mut kinds = vec![];
        for packet in muxer.begin_stream(&avc_aac()).unwrap() {
            kinds.push(packet.kind);
        }
        let feed = [(0, true), (33_333, false), (66_666, false), (100_000, true)];
        for (ts, key) in feed {
            let frame = MediaFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]), ts, key);
            for packet in muxer.packetize(frame).unwrap() {
                kinds.push(packet.kind);
            }
        }
        assert_eq!(
            kinds,
            vec![
                PacketKind::Psi,
                PacketKind::Psi,
                PacketKind::Video { keyframe: true },
                PacketKind::Video { keyframe: false },
                PacketKind::Video { keyframe: false },
                PacketKind::Psi,
                PacketKind::Video { keyframe: true },
            ]
        );
    }

    #[test]
    fn test_keyframe_pes() {
        let mut muxer = TsMuxer::new();
        muxer.begin_stream(&avc_aac()).unwrap();
        let frame = MediaFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]), 5_000_000, true);
        let packets = muxer.packetize(frame).unwrap();
        let ts = &packets[1].data;
        assert_eq!(ts.len(), TS_PACKET_SIZE);
        assert_eq!(&ts[..4], &[0x47, 0x41, 0x00, 0x30]);
        // adaptation field: random access + PCR, PCR zero at the first frame
        assert_eq!(ts[5], 0x50);
        assert_eq!(&ts[6..12], &[0, 0, 0, 0, 0x7E, 0]);

        let pes_start = 4 + 1 + ts[4] as usize;
        let pes = &ts[pes_start..];
        assert_eq!(&pes[..4], &[0, 0, 1, 0xE0]);
        assert_eq!(&pes[6..9], &[0x80, 0x80, 5]);
        assert_eq!(&pes[9..14], &encode_timestamp(0x2, PTS_OFFSET));
        // AUD, SPS, PPS, then the slice
        assert_eq!(&pes[14..20], &[0, 0, 0, 1, 0x09, 0xF0]);
        assert_eq!(&pes[20..24], &[0, 0, 0, 1]);
        assert_eq!(&pes[24..24 + SPS.len()], SPS);
        assert_eq!(&pes[pes.len() - 6..], &[0, 0, 0, 1, 0x65, 0x88]);
    }

    /// PCR values (27 MHz) carried on `pid`, in order.
    fn pcrs(data: &[u8], pid_filter: u16) -> Vec<u64> {
        data.chunks(TS_PACKET_SIZE)
            .filter(|p| pid(p) == pid_filter && p[3] & 0x20 != 0 && p[4] >= 7 && p[5] & 0x10 != 0)
            .map(|p| {
                let base = (p[6] as u64) << 25
                    | (p[7] as u64) << 17
                    | (p[8] as u64) << 9
                    | (p[9] as u64) << 1
                    | (p[10] as u64) >> 7;
                let ext = ((p[10] as u64 & 1) << 8) | p[11] as u64;
                base * 300 + ext
            })
            .collect()
    }

    fn assert_pcr_spacing(values: &[u64]) {
        const LIMIT_27MHZ: u64 = 100 * 27_000;
        for pair in values.windows(2) {
            assert!(pair[1] > pair[0], "PCR went backwards: {:?}", pair);
            assert!(
                pair[1] - pair[0] <= LIMIT_27MHZ,
                "PCR gap of {} ms",
                (pair[1] - pair[0]) / 27_000
            );
        }
    }

    #[test]
    fn test_pcr_spacing_across_long_gop() {
        let mut muxer = TsMuxer::new();
        muxer.begin_stream(&avc_aac()).unwrap();
        let mut stream = BytesMut::new();
        for n in 0..180u64 {
            let frame = MediaFrame::video(
                Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A]),
                n * 33_333,
                n == 0,
            );
            for packet in muxer.packetize(frame).unwrap() {
                stream.extend_from_slice(&packet.data);
            }
        }

        let values = pcrs(&stream, PID_VIDEO);
        assert_eq!(values[0], 0);
        // six seconds of delta frames
        assert!(values.len() >= 60, "only {} PCRs", values.len());
        assert_pcr_spacing(&values);
    }

    #[test]
    fn test_audio_carries_pcr_while_video_is_sparse() {
        let mut muxer = TsMuxer::new();
        muxer.begin_stream(&avc_aac()).unwrap();
        let mut stream = BytesMut::new();
        let mut feed = vec![];
        for n in 0..4u64 {
            feed.push(MediaFrame::video(
                Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A]),
                n * 500_000,
                n == 0,
            ));
        }
        for n in 0..94u64 {
            feed.push(MediaFrame::audio(Bytes::from_static(&[0x21, 0x10]), n * 21_333));
        }
        feed.sort_by_key(|frame| frame.timestamp_us);
        for frame in feed {
            for packet in muxer.packetize(frame).unwrap() {
                stream.extend_from_slice(&packet.data);
            }
        }

        let values = pcrs(&stream, PID_VIDEO);
        assert!(values.len() >= 20, "only {} PCRs", values.len());
        assert_pcr_spacing(&values);
        assert!(pcrs(&stream, PID_AUDIO).is_empty());

        let pcr_only = stream
            .chunks(TS_PACKET_SIZE)
            .filter(|p| pid(p) == PID_VIDEO && p[3] & 0x30 == 0x20)
            .count();
        assert!(pcr_only > 0);
    }

    #[test]
    fn test_large_frame_spans_packets() {
        let mut muxer = TsMuxer::new();
        muxer.begin_stream(&avc_aac()).unwrap();
        let mut payload = vec![0, 0, 0, 1, 0x41];
        payload.extend(std::iter::repeat(0xAB).take(1000));
        let frame = MediaFrame::video(payload, 0, false);
        let data = muxer.packetize(frame).unwrap().pop().unwrap().data;
        assert_eq!(data.len() % TS_PACKET_SIZE, 0);
        let counters: Vec<u8> = data
            .chunks(TS_PACKET_SIZE)
            .map(|p| {
                assert_eq!(p[0], SYNC_BYTE);
                assert_eq!(pid(p), PID_VIDEO);
                p[3] & 0x0F
            })
            .collect();
        let expected: Vec<u8> = (0..counters.len() as u8).collect();
        assert_eq!(counters, expected);
    }

    #[test]
    fn test_aac_gets_adts() {
        let mut muxer = TsMuxer::new();
        muxer.begin_stream(&avc_aac()).unwrap();
        let data = muxer
            .packetize(MediaFrame::audio(Bytes::from_static(&[0x21, 0x10]), 0))
            .unwrap()
            .pop()
            .unwrap()
            .data;
        // a PCR-only packet on the video PID leads the first audio frame
        assert_eq!(data.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(pid(&data), PID_VIDEO);
        let data = data.slice(TS_PACKET_SIZE..);
        assert_eq!(pid(&data), PID_AUDIO);
        let pes_start = 4 + 1 + data[4] as usize;
        let pes = &data[pes_start..];
        assert_eq!(&pes[..6], &[0, 0, 1, 0xC0, 0x00, 0x11]);
        assert_eq!(&pes[14..16], &[0xFF, 0xF1]);
        assert_eq!(&pes[21..23], &[0x21, 0x10]);
    }

    #[test]
    fn test_unsupported_codecs() {
        let info = StreamInfo {
            video: None,
            audio: Some(AudioInfo::new(AudioCodec::G711Ulaw, 8000, 1).unwrap()),
        };
        assert!(matches!(
            TsMuxer::new().begin_stream(&info),
            Err(MuxError::UnsupportedCodec { .. })
        ));
    }

    #[test]
    fn test_reconfigure_bumps_version() {
        let mut muxer = TsMuxer::new();
        muxer.begin_stream(&avc_aac()).unwrap();
        let packets = muxer.reconfigure(&avc_aac()).unwrap();
        let pat = &packets[0].data;
        assert_eq!(pat[10], 0xC3);
        assert_eq!(pat[3] & 0x0F, 1);
    }
}
