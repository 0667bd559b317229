// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The subset of H.264 syntax needed to locate NAL units, describe a stream and check the decode
//! order of its pictures. Macroblock-layer syntax is never parsed.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::Rational;
use crate::Resolution;

const MAX_PPS_COUNT: u16 = 256;
const MAX_SPS_COUNT: u8 = 32;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
const DPB_MAX_SIZE: u32 = 16;

/// Extended Sample Aspect Ratio - H.264 Table E-1
pub(super) const EXTENDED_SAR: u8 = 255;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether this NAL unit carries coded slice data of the primary picture.
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> anyhow::Result<Self> {
        if byte & 0x80 != 0 {
            return Err(anyhow!("Broken Data: forbidden_zero_bit is set"));
        }

        let type_ = NaluType::n(byte & 0x1f)
            .with_context(|| format!("Unsupported NAL unit type {}", byte & 0x1f))?;
        let ref_idc = (byte & 0x60) >> 5;
        let idr_pic_flag = matches!(type_, NaluType::SliceIdr);

        Ok(NaluHeader {
            ref_idc,
            type_,
            idr_pic_flag,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    /// Size of the header in bytes.
    pub fn len(&self) -> usize {
        1
    }
}

/// An Annex B NAL unit borrowed from the buffer it was found in.
#[derive(Clone, Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The buffer holding this NAL unit, possibly shared with the rest of its access unit.
    pub data: &'a [u8],
    /// Size of the NAL unit, header included, start code and trailing zeros excluded.
    pub size: usize,
    /// Offset of the NAL unit header in `data`.
    pub offset: usize,
    /// Offset of the start code (including a leading `zero_byte`) in `data`.
    pub sc_offset: usize,
}

/// Returns the offset of the next `00 00 01` pattern at or after `offset`.
pub fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
    data.get(offset..)?
        .windows(3)
        .position(|window| window == [0x00, 0x00, 0x01])
        .map(|pos| offset + pos)
}

impl<'a> Nalu<'a> {
    /// Finds the next NAL unit after the cursor position and moves the cursor past it.
    ///
    /// Returns `Ok(None)` once no start code is left. If the header of the unit is invalid an
    /// error is returned, but the cursor is still moved so iteration can resume with the next
    /// unit.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> anyhow::Result<Option<Nalu<'a>>> {
        let data = *cursor.get_ref();
        let pos = usize::try_from(cursor.position())?;

        let Some(sc) = find_start_code(data, pos) else {
            cursor.set_position(u64::try_from(data.len())?);
            return Ok(None);
        };

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        let sc_offset = if sc > 0 && data[sc - 1] == 0x00 {
            sc - 1
        } else {
            sc
        };

        let offset = sc + 3;
        let mut end = find_start_code(data, offset).unwrap_or(data.len());
        cursor.set_position(u64::try_from(end)?);

        // Discard trailing_zero_8bits
        while end > offset && data[end - 1] == 0x00 {
            end -= 1;
        }

        if end == offset {
            return Err(anyhow!("Broken Data: empty NAL unit at offset {}", sc_offset));
        }

        let header = NaluHeader::parse(data[offset])?;
        let size = if header.is_end() { 1 } else { end - offset };

        Ok(Some(Nalu {
            header,
            data,
            size,
            offset,
            sc_offset,
        }))
    }

    /// Returns the payload of this unit, past its header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.offset + self.header.len()..self.offset + self.size]
    }
}

impl AsRef<[u8]> for Nalu<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

/// Timing information of the VUI, E.1.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,

    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    /// `None` if the VUI is absent or carries no timing information.
    pub timing_info: Option<TimingInfo>,
}

impl Sps {
    /// MaxFrameNum, (7-10).
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// MaxPicOrderCntLsb, (7-11).
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// Coded width in luma samples.
    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    /// Coded height in luma samples.
    pub fn height(&self) -> u32 {
        (2 - u32::from(self.frame_mbs_only_flag)) * (self.pic_height_in_map_units_minus1 + 1) * 16
    }

    fn chroma_array_type(&self) -> u8 {
        if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }

    fn crop_unit_x_y(&self) -> (u32, u32) {
        let field_factor = 2 - u32::from(self.frame_mbs_only_flag);
        match self.chroma_array_type() {
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        }
    }

    pub fn coded_resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }

    /// Resolution of the picture after applying the cropping window.
    pub fn visible_resolution(&self) -> Resolution {
        if !self.frame_cropping_flag {
            return self.coded_resolution();
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();
        Resolution {
            width: self.width().saturating_sub(
                (self.frame_crop_left_offset + self.frame_crop_right_offset) * crop_unit_x,
            ),
            height: self.height().saturating_sub(
                (self.frame_crop_top_offset + self.frame_crop_bottom_offset) * crop_unit_y,
            ),
        }
    }

    /// Frame rate signalled in the VUI, `time_scale / (2 * num_units_in_tick)`.
    pub fn frame_rate(&self) -> Option<Rational> {
        let timing = self.timing_info?;
        let den = timing.num_units_in_tick.checked_mul(2)?;
        let rate = Rational::new(timing.time_scale, den);

        if rate.is_degenerate() {
            None
        } else {
            Some(rate)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    /// The SPS referenced by this PPS.
    pub sps: Arc<Sps>,
}

/// The leading fields of a slice header, up to the picture order count syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
}

/// A slice header together with the NAL unit it was parsed from.
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
    /// The PPS that was active for this slice.
    pub pps: Arc<Pps>,
}

fn read_ue_max<U: TryFrom<u32>>(r: &mut BitReader, max: u32) -> anyhow::Result<U> {
    let value = r.read_ue::<u32>()?;
    if value > max {
        return Err(anyhow!("Value out of bounds: expected at most {}, got {}", max, value));
    }

    U::try_from(value).map_err(|_| anyhow!("Conversion error"))
}

fn read_se_bounded<U: TryFrom<i32>>(r: &mut BitReader, min: i32, max: i32) -> anyhow::Result<U> {
    let value = r.read_se::<i32>()?;
    if !(min..=max).contains(&value) {
        return Err(anyhow!(
            "Value out of bounds: expected {} - {}, got {}",
            min,
            max,
            value
        ));
    }

    U::try_from(value).map_err(|_| anyhow!("Conversion error"))
}

/// Store of the parameter sets seen so far in a stream.
#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Arc<Sps>>,
    active_ppses: BTreeMap<u8, Arc<Pps>>,
}

impl Parser {
    /// Reads and discards a scaling list, 7.3.2.1.1.1.
    fn skip_scaling_list(r: &mut BitReader, size: usize) -> anyhow::Result<()> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;

        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale = read_se_bounded::<i32>(r, -128, 127)?;
                next_scale = (last_scale + delta_scale + 256) % 256;
            }

            if next_scale != 0 {
                last_scale = next_scale;
            }
        }

        Ok(())
    }

    fn skip_sps_scaling_lists(r: &mut BitReader, sps: &Sps) -> anyhow::Result<()> {
        let num_lists = if sps.chroma_format_idc != 3 { 8 } else { 12 };

        for i in 0..num_lists {
            let seq_scaling_list_present_flag = r.read_bit()?;
            if seq_scaling_list_present_flag {
                Parser::skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
            }
        }

        Ok(())
    }

    /// Parses the VUI up to and including its timing information, E.1.1.
    fn parse_vui(r: &mut BitReader, sps: &mut Sps) -> anyhow::Result<()> {
        let aspect_ratio_info_present_flag = r.read_bit()?;
        if aspect_ratio_info_present_flag {
            let aspect_ratio_idc: u8 = r.read_u(8)?;
            if aspect_ratio_idc == EXTENDED_SAR {
                // sar_width and sar_height
                r.read_u32(16)?;
                r.read_u32(16)?;
            }
        }

        let overscan_info_present_flag = r.read_bit()?;
        if overscan_info_present_flag {
            r.read_bit()?;
        }

        let video_signal_type_present_flag = r.read_bit()?;
        if video_signal_type_present_flag {
            // video_format and video_full_range_flag
            r.read_u32(4)?;
            let colour_description_present_flag = r.read_bit()?;
            if colour_description_present_flag {
                r.read_u32(24)?;
            }
        }

        let chroma_loc_info_present_flag = r.read_bit()?;
        if chroma_loc_info_present_flag {
            read_ue_max::<u32>(r, 5)?;
            read_ue_max::<u32>(r, 5)?;
        }

        let timing_info_present_flag = r.read_bit()?;
        if timing_info_present_flag {
            let num_units_in_tick = r.read_u32(32)?;
            let time_scale = r.read_u32(32)?;
            let fixed_frame_rate_flag = r.read_bit()?;

            if num_units_in_tick == 0 || time_scale == 0 {
                log::warn!(
                    "Ignoring VUI timing info {}/{}",
                    time_scale,
                    num_units_in_tick
                );
            } else {
                sps.timing_info = Some(TimingInfo {
                    num_units_in_tick,
                    time_scale,
                    fixed_frame_rate_flag,
                });
            }
        }

        // The remaining VUI fields (HRD, bitstream restriction) aren't needed.
        Ok(())
    }

    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Arc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            ));
        }

        let mut r = BitReader::new_rbsp(nalu.payload());
        let mut sps = Sps {
            profile_idc: r.read_u(8)?,
            constraint_flags: r.read_u(8)?,
            level_idc: r.read_u(8)?,
            seq_parameter_set_id: read_ue_max(&mut r, MAX_SPS_COUNT as u32 - 1)?,
            ..Default::default()
        };

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = read_ue_max(&mut r, 3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = read_ue_max(&mut r, 6)?;
            sps.bit_depth_chroma_minus8 = read_ue_max(&mut r, 6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                Parser::skip_sps_scaling_lists(&mut r, &sps)?;
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = read_ue_max(&mut r, 12)?;
        sps.pic_order_cnt_type = read_ue_max(&mut r, 2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = read_ue_max(&mut r, 12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            let num_ref_frames_in_pic_order_cnt_cycle: u32 = read_ue_max(&mut r, 254)?;

            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                sps.offset_for_ref_frame.push(r.read_se()?);
            }
        }

        sps.max_num_ref_frames = read_ue_max(&mut r, DPB_MAX_SIZE)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // Validate that cropping info is valid.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .ok_or(anyhow!("Invalid frame crop width"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .ok_or(anyhow!("Invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps)?;
        }

        let key = sps.seq_parameter_set_id;
        let sps = Arc::new(sps);
        self.active_spses.remove(&key);
        Ok(self.active_spses.entry(key).or_insert(sps))
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Arc<Pps>> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            ));
        }

        let mut r = BitReader::new_rbsp(nalu.payload());
        let pic_parameter_set_id = read_ue_max(&mut r, MAX_PPS_COUNT as u32 - 1)?;
        let seq_parameter_set_id = read_ue_max(&mut r, MAX_SPS_COUNT as u32 - 1)?;
        let sps = self.get_sps(seq_parameter_set_id).context(
            "Broken stream: stream references a SPS that has not been successfully parsed",
        )?;

        let entropy_coding_mode_flag = r.read_bit()?;
        let bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        let num_slice_groups_minus1 = read_ue_max(&mut r, 7)?;

        if num_slice_groups_minus1 > 0 {
            return Err(anyhow!("Stream contain unsupported/unimplemented NALs"));
        }

        let num_ref_idx_l0_default_active_minus1 = read_ue_max(&mut r, 31)?;
        let num_ref_idx_l1_default_active_minus1 = read_ue_max(&mut r, 31)?;
        let weighted_pred_flag = r.read_bit()?;
        let weighted_bipred_idc = r.read_u(2)?;

        let qp_bd_offset_y = i32::from(6 * sps.bit_depth_luma_minus8);
        let pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag,
            bottom_field_pic_order_in_frame_present_flag,
            num_slice_groups_minus1,
            num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1,
            weighted_pred_flag,
            weighted_bipred_idc,
            pic_init_qp_minus26: read_se_bounded(&mut r, -(26 + qp_bd_offset_y), 25)?,
            pic_init_qs_minus26: read_se_bounded(&mut r, -26, 25)?,
            chroma_qp_index_offset: read_se_bounded(&mut r, -12, 12)?,
            deblocking_filter_control_present_flag: r.read_bit()?,
            constrained_intra_pred_flag: r.read_bit()?,
            redundant_pic_cnt_present_flag: r.read_bit()?,
            sps: Arc::clone(sps),
        };

        let key = pps.pic_parameter_set_id;
        self.active_ppses.remove(&key);
        Ok(self.active_ppses.entry(key).or_insert(Arc::new(pps)))
    }

    /// Parses the slice header up to its picture order count fields.
    pub fn parse_slice_header<'a>(&self, nalu: Nalu<'a>) -> anyhow::Result<Slice<'a>> {
        if !nalu.header.type_.is_vcl() {
            return Err(anyhow!(
                "Invalid NALU type: {:?} is not a slice NALU",
                nalu.header.type_
            ));
        }

        let mut r = BitReader::new_rbsp(nalu.payload());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = read_ue_max::<u8>(&mut r, 9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = read_ue_max(&mut r, MAX_PPS_COUNT as u32 - 1)?;

        let pps = self.get_pps(header.pic_parameter_set_id).context(
            "Broken stream: slice references PPS that has not been successfully parsed.",
        )?;

        let sps = &pps.sps;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_u(2)?;
        }

        header.frame_num = r.read_u(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = read_ue_max(&mut r, 0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_u(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        Ok(Slice {
            header,
            nalu,
            pps: Arc::clone(pps),
        })
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Arc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Arc<Pps>> {
        self.active_ppses.get(&pps_id)
    }

    /// Forgets every parameter set seen so far.
    pub fn reset(&mut self) {
        self.active_spses.clear();
        self.active_ppses.clear();
    }
}
