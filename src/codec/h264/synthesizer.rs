// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes SPS, PPS, SEI and slice NAL units from their parsed representation.
//!
//! The slice writer only emits the header fields known to [`SliceHeader`], followed by opaque
//! slice data, so the output is suitable for anything that looks at the stream structure (demuxing,
//! decode order analysis) but not for a conforming decoder.

use std::io::Write;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Profile;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::TimingInfo;
use crate::Resolution;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.writer.write_trailing_bits()?;
        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(
        ref_idc: u8,
        sps: &'n Sps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps as u8)?;
        s.seq_parameter_set_data()?;
        s.rbsp_trailing_bits()
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // H.264 E.1.1, only the timing information is ever signalled.
        self.u(1, /* aspect_ratio_info_present_flag */ false)?;
        self.u(1, /* overscan_info_present_flag */ false)?;
        self.u(1, /* video_signal_type_present_flag */ false)?;
        self.u(1, /* chroma_loc_info_present_flag */ false)?;

        match self.nalu.timing_info {
            Some(timing) => {
                self.u(1, /* timing_info_present_flag */ true)?;
                self.u(32, timing.num_units_in_tick)?;
                self.u(32, timing.time_scale)?;
                self.u(1, timing.fixed_frame_rate_flag)?;
            }
            None => self.u(1, /* timing_info_present_flag */ false)?,
        }

        self.u(1, /* nal_hrd_parameters_present_flag */ false)?;
        self.u(1, /* vcl_hrd_parameters_present_flag */ false)?;
        self.u(1, /* pic_struct_present_flag */ false)?;
        self.u(1, /* bitstream_restriction_flag */ false)?;

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1
        let sps = self.nalu;

        self.u(8, sps.profile_idc)?;
        self.u(8, sps.constraint_flags)?;
        self.u(8, sps.level_idc)?;
        self.ue(sps.seq_parameter_set_id)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            self.ue(sps.chroma_format_idc)?;

            if sps.chroma_format_idc == 3 {
                self.u(1, sps.separate_colour_plane_flag)?;
            }

            self.ue(sps.bit_depth_luma_minus8)?;
            self.ue(sps.bit_depth_chroma_minus8)?;
            self.u(1, sps.qpprime_y_zero_transform_bypass_flag)?;
            self.u(1, sps.seq_scaling_matrix_present_flag)?;

            if sps.seq_scaling_matrix_present_flag {
                let scaling_list_count = if sps.chroma_format_idc != 3 {
                    8
                } else {
                    12
                };

                // Scaling lists aren't kept by the parser, so none is ever written.
                for _ in 0..scaling_list_count {
                    self.u(1, /* seq_scaling_list_present_flag */ false)?;
                }
            }
        }

        self.ue(sps.log2_max_frame_num_minus4)?;
        self.ue(sps.pic_order_cnt_type)?;

        match sps.pic_order_cnt_type {
            0 => self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?,
            1 => {
                self.u(1, sps.delta_pic_order_always_zero_flag)?;
                self.se(sps.offset_for_non_ref_pic)?;
                self.se(sps.offset_for_top_to_bottom_field)?;

                let cycle_len = u32::try_from(sps.offset_for_ref_frame.len())
                    .map_err(|_| SynthesizerError::Unsupported)?;
                self.ue(cycle_len)?;

                for &offset in &sps.offset_for_ref_frame {
                    self.se(offset)?;
                }
            }
            _ => (),
        }

        self.ue(sps.max_num_ref_frames)?;
        self.u(1, sps.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(sps.pic_width_in_mbs_minus1)?;
        self.ue(sps.pic_height_in_map_units_minus1)?;
        self.u(1, sps.frame_mbs_only_flag)?;
        if !sps.frame_mbs_only_flag {
            self.u(1, sps.mb_adaptive_frame_field_flag)?;
        }
        self.u(1, sps.direct_8x8_inference_flag)?;

        self.u(1, sps.frame_cropping_flag)?;
        if sps.frame_cropping_flag {
            for offset in [
                sps.frame_crop_left_offset,
                sps.frame_crop_right_offset,
                sps.frame_crop_top_offset,
                sps.frame_crop_bottom_offset,
            ] {
                self.ue(offset)?;
            }
        }

        self.u(1, sps.vui_parameters_present_flag)?;
        if sps.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(
        ref_idc: u8,
        pps: &'n Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps as u8)?;
        s.pic_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        let pps = self.nalu;

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.u(1, pps.entropy_coding_mode_flag)?;
        self.u(1, pps.bottom_field_pic_order_in_frame_present_flag)?;

        self.ue(pps.num_slice_groups_minus1)?;
        if pps.num_slice_groups_minus1 > 0 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, pps.weighted_pred_flag)?;
        self.u(2, pps.weighted_bipred_idc)?;
        self.se(pps.pic_init_qp_minus26)?;
        self.se(pps.pic_init_qs_minus26)?;
        self.se(pps.chroma_qp_index_offset)?;
        self.u(1, pps.deblocking_filter_control_present_flag)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.redundant_pic_cnt_present_flag)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice NAL unit made of `header` and `slice_data`. The NAL unit type is derived
    /// from `idr`.
    pub fn synthesize(
        ref_idc: u8,
        idr: bool,
        header: &'n SliceHeader,
        pps: &Pps,
        slice_data: &[u8],
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: header,
        };

        let type_ = if idr {
            NaluType::SliceIdr
        } else {
            NaluType::Slice
        };

        s.writer.write_header(ref_idc, type_ as u8)?;
        s.slice_header(idr, pps)?;
        for byte in slice_data {
            s.u(8, *byte)?;
        }
        s.rbsp_trailing_bits()
    }

    fn slice_header(&mut self, idr: bool, pps: &Pps) -> SynthesizerResult<()> {
        // H.264 7.3.3, up to the picture order count syntax.
        let sps = &pps.sps;

        self.ue(self.nalu.first_mb_in_slice)?;
        self.ue(self.nalu.slice_type as u8)?;
        self.ue(self.nalu.pic_parameter_set_id)?;

        if sps.separate_colour_plane_flag {
            self.u(2, self.nalu.colour_plane_id)?;
        }

        self.u(
            usize::from(sps.log2_max_frame_num_minus4) + 4,
            self.nalu.frame_num,
        )?;

        if !sps.frame_mbs_only_flag {
            self.u(1, self.nalu.field_pic_flag)?;
            if self.nalu.field_pic_flag {
                self.u(1, self.nalu.bottom_field_flag)?;
            }
        }

        if idr {
            self.ue(self.nalu.idr_pic_id)?;
        }

        if sps.pic_order_cnt_type == 0 {
            self.u(
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                self.nalu.pic_order_cnt_lsb,
            )?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !self.nalu.field_pic_flag {
                self.se(self.nalu.delta_pic_order_cnt_bottom)?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            self.se(self.nalu.delta_pic_order_cnt[0])?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !self.nalu.field_pic_flag {
                self.se(self.nalu.delta_pic_order_cnt[1])?;
            }
        }

        Ok(())
    }
}

/// Writes an access unit delimiter NAL unit.
pub fn write_aud<W: Write>(primary_pic_type: u8, writer: W) -> SynthesizerResult<()> {
    let mut writer = NaluWriter::new(writer, true);
    writer.write_header(0, NaluType::AuDelimiter as u8)?;
    writer.write_u(3, primary_pic_type)?;
    writer.write_trailing_bits()?;
    Ok(())
}

/// Writes a SEI NAL unit with a single `user_data_unregistered` message.
pub fn write_sei_user_data<W: Write>(
    uuid: &[u8; 16],
    data: &[u8],
    writer: W,
) -> SynthesizerResult<()> {
    const USER_DATA_UNREGISTERED: u8 = 5;

    let mut writer = NaluWriter::new(writer, true);
    writer.write_header(0, NaluType::Sei as u8)?;
    writer.write_u(8, USER_DATA_UNREGISTERED)?;

    let mut payload_size = uuid.len() + data.len();
    while payload_size >= 0xff {
        writer.write_u(8, 0xffu8)?;
        payload_size -= 0xff;
    }
    writer.write_u(8, payload_size as u8)?;

    for byte in uuid.iter().chain(data) {
        writer.write_u(8, *byte)?;
    }
    writer.write_trailing_bits()?;

    Ok(())
}

/// Decode-order description of one picture produced by [`StreamBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureDesc {
    pub idr: bool,
    pub ref_idc: u8,
    pub frame_num: u16,
    pub pic_order_cnt_lsb: u16,
}

/// Builds complete Annex B streams made of parameter sets and one single-slice picture per
/// frame.
///
/// By default the stream is an IDR followed by P pictures with incrementing `frame_num` and
/// `pic_order_cnt_lsb` advancing by 2, at 64x48.
#[derive(Clone, Debug)]
pub struct StreamBuilder {
    num_frames: usize,
    resolution: Resolution,
    timing_info: Option<TimingInfo>,
    idr_interval: usize,
    gaps_allowed: bool,
    with_aud: bool,
    with_sei: bool,
    pictures: Option<Vec<PictureDesc>>,
}

impl StreamBuilder {
    const LOG2_MAX_FRAME_NUM_MINUS4: u8 = 0;
    const LOG2_MAX_POC_LSB_MINUS4: u8 = 4;

    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            resolution: Resolution::from((64, 48)),
            timing_info: None,
            idr_interval: 0,
            gaps_allowed: false,
            with_aud: false,
            with_sei: false,
            pictures: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::from((width, height));
        self
    }

    /// Signals `time_scale / (2 * num_units_in_tick)` frames per second in the VUI.
    pub fn with_timing(mut self, num_units_in_tick: u32, time_scale: u32) -> Self {
        self.timing_info = Some(TimingInfo {
            num_units_in_tick,
            time_scale,
            fixed_frame_rate_flag: true,
        });
        self
    }

    /// Inserts an IDR picture, preceded by the parameter sets, every `interval` frames. `0`
    /// means only the first picture is an IDR.
    pub fn with_idr_interval(mut self, interval: usize) -> Self {
        self.idr_interval = interval;
        self
    }

    pub fn with_gaps_allowed(mut self, allowed: bool) -> Self {
        self.gaps_allowed = allowed;
        self
    }

    pub fn with_aud(mut self, enabled: bool) -> Self {
        self.with_aud = enabled;
        self
    }

    pub fn with_sei(mut self, enabled: bool) -> Self {
        self.with_sei = enabled;
        self
    }

    /// Uses an explicit list of pictures instead of the default decode order.
    pub fn with_pictures(mut self, pictures: Vec<PictureDesc>) -> Self {
        self.num_frames = pictures.len();
        self.pictures = Some(pictures);
        self
    }

    pub fn max_frame_num(&self) -> u16 {
        1 << (Self::LOG2_MAX_FRAME_NUM_MINUS4 + 4)
    }

    fn default_pictures(&self) -> Vec<PictureDesc> {
        let max_frame_num = usize::from(self.max_frame_num());
        let max_poc_lsb = 1usize << (Self::LOG2_MAX_POC_LSB_MINUS4 + 4);
        let mut last_idr = 0;

        (0..self.num_frames)
            .map(|i| {
                let idr = i == 0 || (self.idr_interval > 0 && i % self.idr_interval == 0);
                if idr {
                    last_idr = i;
                }
                let distance = i - last_idr;

                PictureDesc {
                    idr,
                    ref_idc: if idr { 3 } else { 1 },
                    frame_num: (distance % max_frame_num) as u16,
                    pic_order_cnt_lsb: ((2 * distance) % max_poc_lsb) as u16,
                }
            })
            .collect()
    }

    pub fn sps(&self) -> Sps {
        let width_in_mbs = (self.resolution.width + 15) / 16;
        let height_in_mbs = (self.resolution.height + 15) / 16;
        let crop_right = (width_in_mbs * 16 - self.resolution.width) / 2;
        let crop_bottom = (height_in_mbs * 16 - self.resolution.height) / 2;

        Sps {
            profile_idc: Profile::High as u8,
            level_idc: 40,
            chroma_format_idc: 1,
            log2_max_frame_num_minus4: Self::LOG2_MAX_FRAME_NUM_MINUS4,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: Self::LOG2_MAX_POC_LSB_MINUS4,
            max_num_ref_frames: 1,
            gaps_in_frame_num_value_allowed_flag: self.gaps_allowed,
            pic_width_in_mbs_minus1: width_in_mbs.saturating_sub(1),
            pic_height_in_map_units_minus1: height_in_mbs.saturating_sub(1),
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: true,
            frame_cropping_flag: crop_right != 0 || crop_bottom != 0,
            frame_crop_right_offset: crop_right,
            frame_crop_bottom_offset: crop_bottom,
            vui_parameters_present_flag: self.timing_info.is_some(),
            timing_info: self.timing_info,
            ..Default::default()
        }
    }

    pub fn pps(&self, sps: Arc<Sps>) -> Pps {
        Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: true,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            sps,
        }
    }

    /// Writes the stream, returning the access units separately.
    pub fn build_access_units(&self) -> SynthesizerResult<Vec<Vec<u8>>> {
        let sps = Arc::new(self.sps());
        let pps = self.pps(Arc::clone(&sps));
        let pictures = match &self.pictures {
            Some(pictures) => pictures.clone(),
            None => self.default_pictures(),
        };

        let mut units = Vec::with_capacity(pictures.len());
        let mut idr_pic_id = 0u16;

        for (i, picture) in pictures.iter().enumerate() {
            let mut au = Vec::new();

            if self.with_aud {
                write_aud(if picture.idr { 0 } else { 1 }, &mut au)?;
            }

            if picture.idr {
                Synthesizer::<Sps, _>::synthesize(3, &sps, &mut au, true)?;
                Synthesizer::<Pps, _>::synthesize(3, &pps, &mut au, true)?;
            }

            if self.with_sei {
                write_sei_user_data(&[0xa5; 16], &(i as u32).to_be_bytes(), &mut au)?;
            }

            let header = SliceHeader {
                slice_type: if picture.idr { SliceType::I } else { SliceType::P },
                pic_parameter_set_id: pps.pic_parameter_set_id,
                frame_num: picture.frame_num,
                idr_pic_id,
                pic_order_cnt_lsb: picture.pic_order_cnt_lsb,
                ..Default::default()
            };

            // Opaque slice data, unique per picture and containing zero runs that need
            // emulation prevention.
            let index = (i as u32).to_be_bytes();
            let slice_data = [
                0x88, index[0], index[1], index[2], index[3], 0x00, 0x00, 0x01, 0x5a,
            ];

            Synthesizer::<SliceHeader, _>::synthesize(
                picture.ref_idc,
                picture.idr,
                &header,
                &pps,
                &slice_data,
                &mut au,
                true,
            )?;

            if picture.idr {
                idr_pic_id = idr_pic_id.wrapping_add(1);
            }

            units.push(au);
        }

        Ok(units)
    }

    /// Writes the whole stream into a single buffer.
    pub fn build(&self) -> SynthesizerResult<Vec<u8>> {
        Ok(self.build_access_units()?.concat())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::parser::Nalu;
    use crate::codec::h264::parser::Parser;

    #[test]
    fn synthesize_sps() {
        let sps = Sps {
            profile_idc: Profile::Main as u8,
            level_idc: 31,
            seq_parameter_set_id: 3,
            chroma_format_idc: 1,
            log2_max_frame_num_minus4: 2,
            pic_order_cnt_type: 2,
            max_num_ref_frames: 4,
            pic_width_in_mbs_minus1: 79,
            pic_height_in_map_units_minus1: 44,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: true,
            vui_parameters_present_flag: true,
            timing_info: Some(TimingInfo {
                num_units_in_tick: 1001,
                time_scale: 60000,
                fixed_frame_rate_flag: true,
            }),
            ..Default::default()
        };

        let mut buf = Vec::<u8>::new();
        Synthesizer::<Sps, _>::synthesize(3, &sps, &mut buf, true).unwrap();

        let mut cursor = Cursor::new(&buf[..]);
        let nalu = Nalu::next(&mut cursor).unwrap().unwrap();
        let mut parser = Parser::default();
        let parsed = parser.parse_sps(&nalu).unwrap();

        assert_eq!(**parsed, sps);
        assert_eq!(parsed.coded_resolution(), Resolution::from((1280, 720)));
    }

    #[test]
    fn synthesize_pps_and_slice() {
        let builder = StreamBuilder::new(1);
        let sps = Arc::new(builder.sps());
        let pps = builder.pps(Arc::clone(&sps));
        let header = SliceHeader {
            slice_type: SliceType::P,
            frame_num: 5,
            pic_order_cnt_lsb: 10,
            ..Default::default()
        };

        let mut buf = Vec::<u8>::new();
        Synthesizer::<Sps, _>::synthesize(3, &sps, &mut buf, true).unwrap();
        Synthesizer::<Pps, _>::synthesize(3, &pps, &mut buf, true).unwrap();
        Synthesizer::<SliceHeader, _>::synthesize(2, false, &header, &pps, &[0; 8], &mut buf, true)
            .unwrap();

        let mut cursor = Cursor::new(&buf[..]);
        let mut parser = Parser::default();

        let nalu = Nalu::next(&mut cursor).unwrap().unwrap();
        parser.parse_sps(&nalu).unwrap();
        let nalu = Nalu::next(&mut cursor).unwrap().unwrap();
        assert_eq!(**parser.parse_pps(&nalu).unwrap(), pps);

        let nalu = Nalu::next(&mut cursor).unwrap().unwrap();
        assert_eq!(nalu.header.ref_idc, 2);
        assert_eq!(nalu.header.type_, NaluType::Slice);
        let slice = parser.parse_slice_header(nalu).unwrap();
        assert_eq!(slice.header, header);

        assert!(Nalu::next(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn access_units_start_with_delimiter() {
        let units = StreamBuilder::new(3)
            .with_aud(true)
            .with_sei(true)
            .with_idr_interval(2)
            .build_access_units()
            .unwrap();
        assert_eq!(units.len(), 3);

        let types = |au: &[u8]| {
            let mut cursor = Cursor::new(au);
            let mut types = vec![];
            while let Some(nalu) = Nalu::next(&mut cursor).unwrap() {
                types.push(nalu.header.type_);
            }
            types
        };

        let idr = vec![
            NaluType::AuDelimiter,
            NaluType::Sps,
            NaluType::Pps,
            NaluType::Sei,
            NaluType::SliceIdr,
        ];
        assert_eq!(types(&units[0]), idr);
        assert_eq!(
            types(&units[1]),
            vec![NaluType::AuDelimiter, NaluType::Sei, NaluType::Slice]
        );
        assert_eq!(types(&units[2]), idr);
    }
}
