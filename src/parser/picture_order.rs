// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::parser::Analysis;

/// What is remembered of the previous picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PictureSummary {
    frame_num: u32,
    pic_order_cnt: i64,
    is_reference: bool,
    /// `Some(bottom_field_flag)` for field pictures.
    field: Option<bool>,
}

/// Picture order count of the current picture and the intermediate values carried over to the
/// next one.
#[derive(Clone, Copy, Debug)]
struct OrderCount {
    pic_order_cnt: i64,
    pic_order_cnt_msb: i64,
    frame_num_offset: i64,
}

/// Running decode order state of a stream, checked against and updated by every picture.
#[derive(Debug, Default)]
pub struct PictureOrderState {
    prev: Option<PictureSummary>,
    prev_ref_frame_num: u32,
    prev_pic_order_cnt_msb: i64,
    prev_pic_order_cnt_lsb: i64,
    prev_frame_num: u32,
    prev_frame_num_offset: i64,
}

impl PictureOrderState {
    /// Checks the picture starting with `slice` against the pictures seen so far, then records
    /// it.
    pub fn check(&mut self, slice: &Slice) -> Analysis {
        let sps = &slice.pps.sps;
        let idr = slice.nalu.header.idr_pic_flag;
        let is_reference = slice.nalu.header.ref_idc != 0;
        let frame_num = u32::from(slice.header.frame_num);
        let field = slice
            .header
            .field_pic_flag
            .then_some(slice.header.bottom_field_flag);

        let order = self.order_count(slice, sps);

        let second_field = match (self.prev, field) {
            (Some(prev), Some(bottom)) => {
                prev.frame_num == frame_num && prev.field == Some(!bottom)
            }
            _ => false,
        };

        let verdict = match self.prev {
            _ if idr => {
                if frame_num != 0 {
                    Analysis::OrderError
                } else {
                    Analysis::Ok
                }
            }
            None => Analysis::OrderError,
            Some(prev)
                if !second_field
                    && prev.frame_num == frame_num
                    && prev.pic_order_cnt == order.pic_order_cnt =>
            {
                Analysis::RepeatWarning
            }
            Some(_) => {
                if frame_num == (self.prev_ref_frame_num + 1) % sps.max_frame_num()
                    || (second_field && frame_num == self.prev_ref_frame_num)
                {
                    Analysis::Ok
                } else if sps.gaps_in_frame_num_value_allowed_flag {
                    Analysis::RepeatWarning
                } else {
                    Analysis::OrderError
                }
            }
        };

        if is_reference {
            self.prev_ref_frame_num = frame_num;
            self.prev_pic_order_cnt_msb = order.pic_order_cnt_msb;
            self.prev_pic_order_cnt_lsb = i64::from(slice.header.pic_order_cnt_lsb);
        }
        self.prev_frame_num = frame_num;
        self.prev_frame_num_offset = order.frame_num_offset;
        self.prev = Some(PictureSummary {
            frame_num,
            pic_order_cnt: order.pic_order_cnt,
            is_reference,
            field,
        });

        verdict
    }

    /// Derives the picture order count of the picture, 8.2.1.
    fn order_count(&self, slice: &Slice, sps: &Sps) -> OrderCount {
        let header = &slice.header;
        let idr = slice.nalu.header.idr_pic_flag;
        let is_reference = slice.nalu.header.ref_idc != 0;
        let frame_num = i64::from(header.frame_num);
        let field = header.field_pic_flag.then_some(header.bottom_field_flag);

        let frame_num_offset = if idr {
            0
        } else if self.prev_frame_num > u32::from(header.frame_num) {
            self.prev_frame_num_offset + i64::from(sps.max_frame_num())
        } else {
            self.prev_frame_num_offset
        };

        match sps.pic_order_cnt_type {
            0 => {
                let max_lsb = i64::from(sps.max_pic_order_cnt_lsb());
                let lsb = i64::from(header.pic_order_cnt_lsb);
                let (prev_msb, prev_lsb) = if idr {
                    (0, 0)
                } else {
                    (self.prev_pic_order_cnt_msb, self.prev_pic_order_cnt_lsb)
                };

                let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                    prev_msb + max_lsb
                } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                    prev_msb - max_lsb
                } else {
                    prev_msb
                };

                let top = msb + lsb;
                let pic_order_cnt = match field {
                    None => top.min(top + i64::from(header.delta_pic_order_cnt_bottom)),
                    // Both fields use msb + lsb.
                    Some(_) => top,
                };

                OrderCount {
                    pic_order_cnt,
                    pic_order_cnt_msb: msb,
                    frame_num_offset,
                }
            }

            1 => {
                let cycle: Vec<i64> = sps.offset_for_ref_frame.iter().map(|&o| o.into()).collect();
                let cycle_len = cycle.len() as i64;

                let mut abs_frame_num = if cycle_len != 0 {
                    frame_num_offset + frame_num
                } else {
                    0
                };
                if !is_reference && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected = 0;
                if abs_frame_num > 0 {
                    let cycle_cnt = (abs_frame_num - 1) / cycle_len;
                    let frame_num_in_cycle = ((abs_frame_num - 1) % cycle_len) as usize;
                    let expected_delta_per_cycle: i64 = cycle.iter().sum();

                    expected = cycle_cnt * expected_delta_per_cycle
                        + cycle[..=frame_num_in_cycle].iter().sum::<i64>();
                }
                if !is_reference {
                    expected += i64::from(sps.offset_for_non_ref_pic);
                }

                let delta = header.delta_pic_order_cnt.map(i64::from);
                let top_to_bottom = i64::from(sps.offset_for_top_to_bottom_field);
                let pic_order_cnt = match field {
                    None => {
                        let top = expected + delta[0];
                        top.min(top + top_to_bottom + delta[1])
                    }
                    Some(false) => expected + delta[0],
                    Some(true) => expected + top_to_bottom + delta[0],
                };

                OrderCount {
                    pic_order_cnt,
                    pic_order_cnt_msb: 0,
                    frame_num_offset,
                }
            }

            _ => {
                let pic_order_cnt = if idr {
                    0
                } else if is_reference {
                    2 * (frame_num_offset + frame_num)
                } else {
                    2 * (frame_num_offset + frame_num) - 1
                };

                OrderCount {
                    pic_order_cnt,
                    pic_order_cnt_msb: 0,
                    frame_num_offset,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::codec::h264::parser::Nalu;
    use crate::codec::h264::parser::NaluHeader;
    use crate::codec::h264::parser::NaluType;
    use crate::codec::h264::parser::Pps;
    use crate::codec::h264::parser::SliceHeader;
    use crate::codec::h264::synthesizer::StreamBuilder;

    const DUMMY_NALU: [u8; 4] = [0x00, 0x00, 0x01, 0x41];

    fn slice<'a>(
        pps: &Arc<Pps>,
        idr: bool,
        ref_idc: u8,
        header: SliceHeader,
        data: &'a [u8],
    ) -> Slice<'a> {
        let mut nalu = Nalu::next(&mut Cursor::new(data)).unwrap().unwrap();
        nalu.header = NaluHeader {
            ref_idc,
            type_: if idr {
                NaluType::SliceIdr
            } else {
                NaluType::Slice
            },
            idr_pic_flag: idr,
        };

        Slice {
            header,
            nalu,
            pps: Arc::clone(pps),
        }
    }

    fn pps_with(modify: impl FnOnce(&mut Sps)) -> Arc<Pps> {
        let builder = StreamBuilder::new(1);
        let mut sps = builder.sps();
        modify(&mut sps);
        Arc::new(builder.pps(Arc::new(sps)))
    }

    #[test]
    fn poc_type_2_sequence() {
        let pps = pps_with(|sps| sps.pic_order_cnt_type = 2);
        let mut state = PictureOrderState::default();

        let frame = |frame_num| SliceHeader {
            frame_num,
            ..Default::default()
        };

        assert_eq!(state.check(&slice(&pps, true, 3, frame(0), &DUMMY_NALU)), Analysis::Ok);
        assert_eq!(state.check(&slice(&pps, false, 1, frame(1), &DUMMY_NALU)), Analysis::Ok);
        // Non-reference picture: POC 2 * 2 - 1.
        assert_eq!(state.check(&slice(&pps, false, 0, frame(2), &DUMMY_NALU)), Analysis::Ok);
        assert_eq!(state.prev.unwrap().pic_order_cnt, 3);
        // Same frame_num, same POC.
        assert_eq!(
            state.check(&slice(&pps, false, 0, frame(2), &DUMMY_NALU)),
            Analysis::RepeatWarning
        );
        assert_eq!(state.check(&slice(&pps, false, 1, frame(2), &DUMMY_NALU)), Analysis::Ok);
        assert_eq!(state.prev.unwrap().pic_order_cnt, 4);
    }

    #[test]
    fn poc_type_2_frame_num_wrap() {
        let pps = pps_with(|sps| sps.pic_order_cnt_type = 2);
        let mut state = PictureOrderState::default();

        for frame_num in 0..16u16 {
            let header = SliceHeader {
                frame_num,
                ..Default::default()
            };
            let verdict = state.check(&slice(&pps, frame_num == 0, 1, header, &DUMMY_NALU));
            assert_eq!(verdict, Analysis::Ok);
        }

        let header = SliceHeader::default();
        assert_eq!(state.check(&slice(&pps, false, 1, header, &DUMMY_NALU)), Analysis::Ok);
        // FrameNumOffset grew by MaxFrameNum.
        assert_eq!(state.prev.unwrap().pic_order_cnt, 32);
    }

    #[test]
    fn poc_type_0_msb_wrap() {
        let pps = pps_with(|_| ());
        let mut state = PictureOrderState::default();

        let max_lsb = pps.sps.max_pic_order_cnt_lsb() as u16;
        let mut expected = 0i64;
        let mut lsb = 0u16;
        for frame_num in 0..40u16 {
            let header = SliceHeader {
                frame_num: frame_num % 16,
                pic_order_cnt_lsb: lsb,
                ..Default::default()
            };

            let verdict = state.check(&slice(&pps, frame_num == 0, 1, header, &DUMMY_NALU));
            assert_eq!(verdict, Analysis::Ok);
            assert_eq!(state.prev.unwrap().pic_order_cnt, expected);

            lsb = (lsb + 10) % max_lsb;
            expected += 10;
        }
    }

    #[test]
    fn poc_type_1_cycle() {
        let pps = pps_with(|sps| {
            sps.pic_order_cnt_type = 1;
            sps.offset_for_ref_frame = vec![2, 4];
            sps.offset_for_non_ref_pic = -1;
        });
        let mut state = PictureOrderState::default();
        let frame = |frame_num| SliceHeader {
            frame_num,
            ..Default::default()
        };

        state.check(&slice(&pps, true, 3, frame(0), &DUMMY_NALU));
        assert_eq!(state.prev.unwrap().pic_order_cnt, 0);

        state.check(&slice(&pps, false, 1, frame(1), &DUMMY_NALU));
        assert_eq!(state.prev.unwrap().pic_order_cnt, 2);

        state.check(&slice(&pps, false, 1, frame(2), &DUMMY_NALU));
        assert_eq!(state.prev.unwrap().pic_order_cnt, 6);

        // absFrameNum 3 - 1 for a non-reference picture, plus offset_for_non_ref_pic.
        let verdict = state.check(&slice(&pps, false, 0, frame(3), &DUMMY_NALU));
        assert_eq!(verdict, Analysis::Ok);
        assert_eq!(state.prev.unwrap().pic_order_cnt, 5);
    }

    #[test]
    fn fields_of_a_pair() {
        let pps = pps_with(|sps| {
            sps.pic_order_cnt_type = 2;
            sps.frame_mbs_only_flag = false;
        });
        let mut state = PictureOrderState::default();
        let field = |frame_num, bottom| SliceHeader {
            frame_num,
            field_pic_flag: true,
            bottom_field_flag: bottom,
            ..Default::default()
        };

        assert_eq!(state.check(&slice(&pps, true, 3, field(0, false), &DUMMY_NALU)), Analysis::Ok);
        assert_eq!(state.check(&slice(&pps, true, 3, field(0, true), &DUMMY_NALU)), Analysis::Ok);
        assert_eq!(state.check(&slice(&pps, false, 1, field(1, false), &DUMMY_NALU)), Analysis::Ok);
        // Both fields have the same POC in type 2, yet this isn't a repeat.
        assert_eq!(state.check(&slice(&pps, false, 1, field(1, true), &DUMMY_NALU)), Analysis::Ok);
        // A third field with the same frame_num is.
        assert_eq!(
            state.check(&slice(&pps, false, 1, field(1, true), &DUMMY_NALU)),
            Analysis::RepeatWarning
        );
    }

    #[test]
    fn idr_with_non_zero_frame_num() {
        let pps = pps_with(|_| ());
        let mut state = PictureOrderState::default();
        let header = SliceHeader {
            frame_num: 3,
            ..Default::default()
        };

        assert_eq!(
            state.check(&slice(&pps, true, 3, header, &DUMMY_NALU)),
            Analysis::OrderError
        );
    }
}
