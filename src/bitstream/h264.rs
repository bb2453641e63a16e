// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 NAL unit inspection.

use crate::bitstream::{ColorAspects, NalBitReader, NalIterator};

const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;

fn nal_type(unit: &[u8]) -> Option<u8> {
    unit.first().map(|b| b & 0x1f)
}

/// Whether the stream contains an IDR NAL unit.
pub fn locate_idr(data: &[u8]) -> bool {
    NalIterator::new(data).any(|unit| nal_type(unit) == Some(NAL_TYPE_IDR))
}

/// Finds the first SPS NAL unit and parses color aspects from its VUI
/// parameters. Returns `None` if no SPS is present or the SPS carries no
/// color description.
pub fn parse_color_aspects(data: &[u8]) -> Option<ColorAspects> {
    let sps = NalIterator::new(data).find(|unit| nal_type(unit) == Some(NAL_TYPE_SPS))?;
    parse_sps_color_aspects(&sps[1..])
}

/// Parses an SPS RBSP (NAL header already removed) up to the VUI color
/// description fields.
fn parse_sps_color_aspects(rbsp: &[u8]) -> Option<ColorAspects> {
    let mut r = NalBitReader::new(rbsp);

    let profile_idc = r.read_bits(8)?;
    r.skip_bits(8)?; // constraint_set flags + reserved_zero bits
    r.skip_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.skip_bits(1)?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present_flag
            let num_lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..num_lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.skip_bits(1)?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let num_ref_frames_in_cycle = r.read_ue()?;
        for _ in 0..num_ref_frames_in_cycle {
            r.read_se()?; // offset_for_ref_frame
        }
    }
    r.read_ue()?; // max_num_ref_frames
    r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
    r.read_ue()?; // pic_width_in_mbs_minus1
    r.read_ue()?; // pic_height_in_map_units_minus1
    if r.read_bit()? == 0 {
        // frame_mbs_only_flag
        r.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip_bits(1)?; // direct_8x8_inference_flag
    if r.read_bit()? == 1 {
        // frame_cropping_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }

    if r.read_bit()? != 1 {
        // vui_parameters_present_flag
        return None;
    }
    if r.read_bit()? == 1 {
        // aspect_ratio_info_present_flag
        const EXTENDED_SAR: u32 = 255;
        if r.read_bits(8)? == EXTENDED_SAR {
            r.skip_bits(32)?; // sar_width + sar_height
        }
    }
    if r.read_bit()? == 1 {
        r.skip_bits(1)?; // overscan_appropriate_flag
    }
    if r.read_bit()? != 1 {
        // video_signal_type_present_flag
        return None;
    }
    r.skip_bits(3)?; // video_format
    let full_range = r.read_bit()? == 1;
    if r.read_bit()? != 1 {
        // colour_description_present_flag
        return None;
    }
    let primaries = r.read_bits(8)?;
    let transfer = r.read_bits(8)?;
    let coeffs = r.read_bits(8)?;
    Some(ColorAspects { primaries, transfer, coeffs, full_range })
}

fn skip_scaling_list(r: &mut NalBitReader, size: u32) -> Option<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = r.read_se()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Baseline SPS with VUI video_signal_type carrying a BT.709 color
    // description (primaries/transfer/coeffs all 1), full range off.
    const SPS_BT709: [u8; 17] = [
        0x00, 0x00, 0x00, 0x01, 0x67, // start code + SPS header
        0x42, 0xc0, 0x1e, // profile 66, constraints, level 30
        0xab, // sps_id, log2_max_frame_num, poc_type 0, log2_max_poc
        0x40, 0xf0, 0x28, // ref frames, gaps, mb width/height
        0xd3, // frame_mbs_only, direct_8x8, vui_present, signal_type
        0x50, 0x10, 0x10, 0x18, // video_format 5, color description
    ];

    #[test]
    fn idr_detection() {
        let idr = [0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
        let non_idr = [0x00, 0x00, 0x01, 0x41, 0x9a, 0x02];
        assert!(locate_idr(&idr));
        assert!(!locate_idr(&non_idr));
        assert!(!locate_idr(&[]));
    }

    #[test]
    fn idr_after_parameter_sets() {
        let stream = [
            0x00, 0x00, 0x01, 0x67, 0x42, 0xc0, 0x1e, // SPS
            0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80, // PPS
            0x00, 0x00, 0x01, 0x65, 0x88, // IDR slice
        ];
        assert!(locate_idr(&stream));
    }

    #[test]
    fn sps_without_vui_has_no_aspects() {
        // vui_parameters_present_flag = 0 right after the size fields.
        let sps = [0x00, 0x00, 0x01, 0x67, 0x42, 0xc0, 0x1e, 0xab, 0x40, 0xf0, 0x28, 0xc0];
        assert_eq!(parse_color_aspects(&sps), None);
    }

    #[test]
    fn vui_color_description() {
        let aspects = parse_color_aspects(&SPS_BT709);
        assert_eq!(
            aspects,
            Some(ColorAspects { primaries: 1, transfer: 1, coeffs: 1, full_range: false })
        );
    }

    #[test]
    fn truncated_sps_is_rejected() {
        assert_eq!(parse_color_aspects(&SPS_BT709[..8]), None);
    }
}
