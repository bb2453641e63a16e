// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HEVC NAL unit inspection.
//!
//! The SPS layout gives no way to jump straight to the VUI parameters, so
//! color aspect extraction parses the whole SPS header, including the
//! short-term reference picture sets, and discards everything but the
//! color description.

use crate::bitstream::{ColorAspects, NalBitReader, NalIterator};

const NAL_TYPE_IDR_W_RADL: u8 = 19;
const NAL_TYPE_IDR_N_LP: u8 = 20;
const NAL_TYPE_SPS: u8 = 33;

const MAX_SHORT_TERM_REF_PIC_SETS: usize = 64;

fn nal_type(unit: &[u8]) -> Option<u8> {
    // forbidden_zero_bit(1), nal_unit_type(6), layer/temporal ids follow.
    unit.first().map(|b| (b & 0x7e) >> 1)
}

/// Whether the stream contains an IDR NAL unit.
pub fn locate_idr(data: &[u8]) -> bool {
    NalIterator::new(data)
        .any(|unit| matches!(nal_type(unit), Some(NAL_TYPE_IDR_W_RADL | NAL_TYPE_IDR_N_LP)))
}

/// Finds the first SPS NAL unit and parses color aspects from its VUI
/// parameters.
pub fn parse_color_aspects(data: &[u8]) -> Option<ColorAspects> {
    let sps = NalIterator::new(data).find(|unit| nal_type(unit) == Some(NAL_TYPE_SPS))?;
    // The HEVC NAL header is two bytes.
    if sps.len() <= 2 {
        return None;
    }
    parse_sps_color_aspects(&sps[2..])
}

#[derive(Clone, Default)]
struct StRefPicSet {
    delta_poc_s0: Vec<i32>,
    delta_poc_s1: Vec<i32>,
}

impl StRefPicSet {
    fn num_delta_pocs(&self) -> usize {
        self.delta_poc_s0.len() + self.delta_poc_s1.len()
    }
}

fn skip_profile_tier_level(r: &mut NalBitReader, max_sublayers_minus1: u32) -> Option<()> {
    // general_profile_space(2), general_tier_flag(1), general_profile_idc(5),
    // compatibility flags(32), source/constraint flags(4),
    // reserved compatibility flags(43), general_inbld_flag(1),
    // general_level_idc(8).
    r.skip_bits(96)?;
    if max_sublayers_minus1 > 6 {
        return None;
    }
    let mut profile_present = [false; 6];
    let mut level_present = [false; 6];
    for i in 0..max_sublayers_minus1 as usize {
        profile_present[i] = r.read_bit()? == 1;
        level_present[i] = r.read_bit()? == 1;
    }
    if max_sublayers_minus1 > 0 {
        r.skip_bits(2 * (8 - max_sublayers_minus1))?; // reserved_zero_2bits
    }
    for i in 0..max_sublayers_minus1 as usize {
        if profile_present[i] {
            r.skip_bits(88)?; // sub-layer profile, mirrors the general layout
        }
        if level_present[i] {
            r.skip_bits(8)?; // sub_layer_level_idc
        }
    }
    Some(())
}

fn skip_scaling_list_data(r: &mut NalBitReader) -> Option<()> {
    for size_id in 0..4 {
        let mut matrix_id = 0;
        while matrix_id < 6 {
            if r.read_bit()? == 1 {
                // scaling_list_pred_mode_flag
                if size_id > 1 {
                    r.read_se()?; // scaling_list_dc_coef_minus8
                }
                let coef_num = 64.min(1 << (4 + (size_id << 1)));
                for _ in 0..coef_num {
                    r.read_se()?; // scaling_list_delta_coef
                }
            } else {
                r.read_ue()?; // scaling_list_pred_matrix_id_delta
            }
            matrix_id += if size_id == 3 { 3 } else { 1 };
        }
    }
    Some(())
}

/// Parses one `st_ref_pic_set()`. Earlier sets must be passed in because a
/// set may be coded as a delta against a previous one.
fn parse_st_ref_pic_set(
    r: &mut NalBitReader,
    st_rps_idx: usize,
    all_sets: &[StRefPicSet],
) -> Option<StRefPicSet> {
    let inter_pred = st_rps_idx != 0 && r.read_bit()? == 1;
    let mut set = StRefPicSet::default();
    if inter_pred {
        // The SPS only ever codes a delta against the immediately
        // preceding set; delta_idx_minus1 appears in slice headers alone.
        let ref_set = &all_sets[st_rps_idx - 1];
        let delta_rps_sign = r.read_bit()?;
        let abs_delta_rps_minus1 = r.read_ue()?;
        let delta_rps = (1 - 2 * delta_rps_sign as i32) * (abs_delta_rps_minus1 as i32 + 1);
        let mut use_delta = [true; MAX_SHORT_TERM_REF_PIC_SETS + 1];
        for flag in use_delta.iter_mut().take(ref_set.num_delta_pocs() + 1) {
            if r.read_bit()? == 0 {
                // used_by_curr_pic_flag
                *flag = r.read_bit()? == 1;
            }
        }
        let num_negative = ref_set.delta_poc_s0.len();
        for (j, &poc) in ref_set.delta_poc_s1.iter().enumerate().rev() {
            let d_poc = poc + delta_rps;
            if d_poc < 0 && use_delta[num_negative + j] {
                set.delta_poc_s0.push(d_poc);
            }
        }
        if delta_rps < 0 && use_delta[ref_set.num_delta_pocs()] {
            set.delta_poc_s0.push(delta_rps);
        }
        for (j, &poc) in ref_set.delta_poc_s0.iter().enumerate() {
            let d_poc = poc + delta_rps;
            if d_poc < 0 && use_delta[j] {
                set.delta_poc_s0.push(d_poc);
            }
        }
        for (j, &poc) in ref_set.delta_poc_s0.iter().enumerate().rev() {
            let d_poc = poc + delta_rps;
            if d_poc > 0 && use_delta[j] {
                set.delta_poc_s1.push(d_poc);
            }
        }
        if delta_rps > 0 && use_delta[ref_set.num_delta_pocs()] {
            set.delta_poc_s1.push(delta_rps);
        }
        for (j, &poc) in ref_set.delta_poc_s1.iter().enumerate() {
            let d_poc = poc + delta_rps;
            if d_poc > 0 && use_delta[num_negative + j] {
                set.delta_poc_s1.push(d_poc);
            }
        }
    } else {
        let num_negative = r.read_ue()? as usize;
        let num_positive = r.read_ue()? as usize;
        if num_negative > MAX_SHORT_TERM_REF_PIC_SETS || num_positive > MAX_SHORT_TERM_REF_PIC_SETS
        {
            return None;
        }
        let mut poc = 0i32;
        for _ in 0..num_negative {
            poc -= r.read_ue()? as i32 + 1; // delta_poc_s0_minus1
            set.delta_poc_s0.push(poc);
            r.skip_bits(1)?; // used_by_curr_pic_s0_flag
        }
        poc = 0;
        for _ in 0..num_positive {
            poc += r.read_ue()? as i32 + 1; // delta_poc_s1_minus1
            set.delta_poc_s1.push(poc);
            r.skip_bits(1)?; // used_by_curr_pic_s1_flag
        }
    }
    if set.num_delta_pocs() > MAX_SHORT_TERM_REF_PIC_SETS {
        return None;
    }
    Some(set)
}

fn parse_sps_color_aspects(rbsp: &[u8]) -> Option<ColorAspects> {
    let mut r = NalBitReader::new(rbsp);

    r.skip_bits(4)?; // sps_video_parameter_set_id
    let max_sublayers_minus1 = r.read_bits(3)?;
    r.skip_bits(1)?; // sps_temporal_id_nesting_flag
    skip_profile_tier_level(&mut r, max_sublayers_minus1)?;

    r.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc == 3 {
        r.skip_bits(1)?; // separate_colour_plane_flag
    }
    r.read_ue()?; // pic_width_in_luma_samples
    r.read_ue()?; // pic_height_in_luma_samples
    if r.read_bit()? == 1 {
        // conformance_window_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    r.read_ue()?; // bit_depth_luma_minus8
    r.read_ue()?; // bit_depth_chroma_minus8
    let log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;

    let ordering_info_present = r.read_bit()? == 1;
    let first_sublayer = if ordering_info_present { 0 } else { max_sublayers_minus1 };
    for _ in first_sublayer..=max_sublayers_minus1 {
        r.read_ue()?; // sps_max_dec_pic_buffering_minus1
        r.read_ue()?; // sps_max_num_reorder_pics
        r.read_ue()?; // sps_max_latency_increase_plus1
    }
    r.read_ue()?; // log2_min_luma_coding_block_size_minus3
    r.read_ue()?; // log2_diff_max_min_luma_coding_block_size
    r.read_ue()?; // log2_min_luma_transform_block_size_minus2
    r.read_ue()?; // log2_diff_max_min_luma_transform_block_size
    r.read_ue()?; // max_transform_hierarchy_depth_inter
    r.read_ue()?; // max_transform_hierarchy_depth_intra
    if r.read_bit()? == 1 {
        // scaling_list_enabled_flag
        if r.read_bit()? == 1 {
            // sps_scaling_list_data_present_flag
            skip_scaling_list_data(&mut r)?;
        }
    }
    r.skip_bits(2)?; // amp_enabled_flag, sample_adaptive_offset_enabled_flag
    if r.read_bit()? == 1 {
        // pcm_enabled_flag
        r.skip_bits(8)?; // pcm sample bit depths
        r.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        r.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        r.skip_bits(1)?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_ref_pic_sets = r.read_ue()? as usize;
    if num_short_term_ref_pic_sets > MAX_SHORT_TERM_REF_PIC_SETS {
        return None;
    }
    let mut ref_pic_sets = Vec::with_capacity(num_short_term_ref_pic_sets);
    for i in 0..num_short_term_ref_pic_sets {
        let set = parse_st_ref_pic_set(&mut r, i, &ref_pic_sets)?;
        ref_pic_sets.push(set);
    }

    if r.read_bit()? == 1 {
        // long_term_ref_pics_present_flag
        let num_long_term = r.read_ue()?;
        for _ in 0..num_long_term {
            r.skip_bits(log2_max_pic_order_cnt_lsb_minus4 + 4)?; // lt_ref_pic_poc_lsb_sps
            r.skip_bits(1)?; // used_by_curr_pic_lt_sps_flag
        }
    }
    r.skip_bits(2)?; // sps_temporal_mvp_enabled, strong_intra_smoothing_enabled

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
