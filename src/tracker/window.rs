//! Temporal memory window selection.
//!
//! Each tracked frame attends over a bounded window: the conditioning
//! frames (capped and chosen nearest-first when a cap is set) plus up to
//! `num_maskmem - 1` previous non-conditioning frames taken along a stride
//! pattern, with the immediately previous frame always eligible. Object
//! pointers from recent frames are gathered separately.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::Result;
use crate::session::outputs::FrameOutput;

/// Conditioning frames chosen for one step, plus the leftovers that can
/// still back-fill stride slots and the pointer walk.
pub(crate) struct MemoryWindow<'a> {
    /// `(slot, output)` pairs; slot 0 marks conditioning entries, slots
    /// `1..num_maskmem` the strided previous frames from nearest-oldest to
    /// most recent.
    pub entries: Vec<(usize, &'a FrameOutput)>,
    pub selected_cond: BTreeMap<usize, &'a FrameOutput>,
    /// Conditioning outputs the attention cap left out; they still serve
    /// as ordinary memory.
    pub unselected_cond: BTreeMap<usize, &'a FrameOutput>,
}

/// Split conditioning outputs into at most `max_cond_frames` frames closest
/// to `frame_idx` and the rest. The nearest frame on each side is always
/// kept; remaining picks go by distance, ties to the earlier frame.
pub(crate) fn select_closest_cond_frames(
    frame_idx: usize,
    cond_outputs: &BTreeMap<usize, FrameOutput>,
    max_cond_frames: Option<usize>,
) -> (
    BTreeMap<usize, &FrameOutput>,
    BTreeMap<usize, &FrameOutput>,
) {
    let all = || cond_outputs.iter().map(|(t, o)| (*t, o)).collect();
    let max = match max_cond_frames {
        None => return (all(), BTreeMap::new()),
        Some(max) if cond_outputs.len() <= max => return (all(), BTreeMap::new()),
        Some(max) => max,
    };

    let mut selected: BTreeMap<usize, &FrameOutput> = BTreeMap::new();
    if let Some((t, o)) = cond_outputs.range(..frame_idx).next_back() {
        selected.insert(*t, o);
    }
    if let Some((t, o)) = cond_outputs.range(frame_idx..).next() {
        selected.insert(*t, o);
    }
    let mut remaining: Vec<usize> = cond_outputs
        .keys()
        .filter(|t| !selected.contains_key(t))
        .copied()
        .collect();
    remaining.sort_by_key(|t| (t.abs_diff(frame_idx), *t));
    for t in remaining
        .into_iter()
        .take(max.saturating_sub(selected.len()))
    {
        if let Some(o) = cond_outputs.get(&t) {
            selected.insert(t, o);
        }
    }

    let unselected = cond_outputs
        .iter()
        .filter(|(t, _)| !selected.contains_key(t))
        .map(|(t, o)| (*t, o))
        .collect();
    (selected, unselected)
}

/// Frame feeding memory slot `t_rel` steps behind `frame_idx` along the
/// stride pattern. `t_rel == 1` is always the adjacent frame; farther slots
/// snap to stride multiples so the window stays stable as tracking
/// advances. `None` when the pattern leaves the video.
pub(crate) fn stride_frame_index(
    frame_idx: usize,
    t_rel: usize,
    stride: usize,
    reverse: bool,
) -> Option<usize> {
    let idx = frame_idx as i64;
    let r = stride as i64;
    let t = t_rel as i64;
    let prev = if t == 1 {
        if reverse {
            idx + 1
        } else {
            idx - 1
        }
    } else if reverse {
        let base = (idx + 2 + r - 1).div_euclid(r) * r;
        base + (t - 2) * r
    } else {
        let base = (idx - 2).div_euclid(r) * r;
        base - (t - 2) * r
    };
    usize::try_from(prev).ok()
}

pub(crate) fn build_memory_window<'a>(
    frame_idx: usize,
    cond: &'a BTreeMap<usize, FrameOutput>,
    non_cond: &'a BTreeMap<usize, FrameOutput>,
    num_maskmem: usize,
    stride: usize,
    max_cond_frames: Option<usize>,
    reverse: bool,
) -> MemoryWindow<'a> {
    let (selected_cond, unselected_cond) =
        select_closest_cond_frames(frame_idx, cond, max_cond_frames);

    let mut entries: Vec<(usize, &FrameOutput)> =
        selected_cond.values().map(|o| (0, *o)).collect();
    for t_pos in 1..num_maskmem {
        let t_rel = num_maskmem - t_pos;
        let Some(prev_idx) = stride_frame_index(frame_idx, t_rel, stride, reverse) else {
            continue;
        };
        // a conditioning frame that fell outside the attention cap can
        // still serve as ordinary memory
        let out = non_cond
            .get(&prev_idx)
            .or_else(|| unselected_cond.get(&prev_idx).copied());
        if let Some(out) = out {
            entries.push((t_pos, out));
        }
    }
    MemoryWindow {
        entries,
        selected_cond,
        unselected_cond,
    }
}

/// Object pointers attended alongside spatial memory: pointers of the
/// selected conditioning frames (optionally restricted to the temporal
/// past) and of up to `max_obj_ptrs - 1` preceding tracked frames, where
/// conditioning frames outside the attention cap count as tracked. Returns
/// temporal offsets and the pointers they belong to.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gather_object_pointers<'a>(
    frame_idx: usize,
    selected_cond: &BTreeMap<usize, &'a FrameOutput>,
    unselected_cond: &BTreeMap<usize, &'a FrameOutput>,
    non_cond: &'a BTreeMap<usize, FrameOutput>,
    num_frames: usize,
    max_obj_ptrs: usize,
    only_past: bool,
    signed: bool,
    reverse: bool,
) -> (Vec<i64>, Vec<&'a Tensor>) {
    let max_ptrs = num_frames.min(max_obj_ptrs);
    let mut offsets = Vec::new();
    let mut pointers = Vec::new();

    for (&t, out) in selected_cond {
        if only_past {
            let in_past = if reverse { t >= frame_idx } else { t <= frame_idx };
            if !in_past {
                continue;
            }
        }
        let offset = if signed {
            if reverse {
                t as i64 - frame_idx as i64
            } else {
                frame_idx as i64 - t as i64
            }
        } else {
            frame_idx.abs_diff(t) as i64
        };
        offsets.push(offset);
        pointers.push(&out.obj_ptr);
    }

    for t_diff in 1..max_ptrs {
        let t = if reverse {
            frame_idx + t_diff
        } else {
            match frame_idx.checked_sub(t_diff) {
                Some(t) => t,
                None => break,
            }
        };
        if t >= num_frames {
            break;
        }
        let out = non_cond
            .get(&t)
            .or_else(|| unselected_cond.get(&t).copied());
        if let Some(out) = out {
            offsets.push(t_diff as i64);
            pointers.push(&out.obj_ptr);
        }
    }
    (offsets, pointers)
}

/// 1D sine/cosine positional embedding of `positions` (a float vector) into
/// `dim` channels: the first half sines, the second half cosines.
pub(crate) fn sine_position_encoding(
    positions: &Tensor,
    dim: usize,
    temperature: f32,
) -> Result<Tensor> {
    let device = positions.device();
    let pe_dim = dim / 2;
    let dim_t: Vec<f32> = (0..pe_dim)
        .map(|i| temperature.powf(2.0 * (i / 2) as f32 / pe_dim as f32))
        .collect();
    let dim_t = Tensor::from_vec(dim_t, pe_dim, device)?;
    let pos = positions.unsqueeze(1)?.broadcast_div(&dim_t)?;
    Ok(Tensor::cat(&[pos.sin()?, pos.cos()?], 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn output(value: f32) -> FrameOutput {
        let dev = Device::Cpu;
        FrameOutput {
            pred_masks: Tensor::full(value, (1, 1, 2, 2), &dev).unwrap(),
            obj_ptr: Tensor::full(value, (1, 4), &dev).unwrap(),
            object_score_logits: Tensor::full(10.0f32, (1, 1), &dev).unwrap(),
            maskmem: None,
        }
    }

    fn map(frames: &[usize]) -> BTreeMap<usize, FrameOutput> {
        frames.iter().map(|&t| (t, output(t as f32))).collect()
    }

    #[test]
    fn uncapped_selection_keeps_everything() {
        let cond = map(&[0, 5, 9]);
        let (selected, unselected) = select_closest_cond_frames(7, &cond, None);
        assert_eq!(selected.len(), 3);
        assert!(unselected.is_empty());
    }

    #[test]
    fn capped_selection_keeps_both_neighbors_then_nearest() {
        let cond = map(&[0, 4, 8, 12, 20]);
        let (selected, unselected) = select_closest_cond_frames(9, &cond, Some(3));
        let picked: Vec<usize> = selected.keys().copied().collect();
        // 8 (just before), 12 (at/after), then 4 by distance
        assert_eq!(picked, vec![4, 8, 12]);
        assert_eq!(unselected.keys().copied().collect::<Vec<_>>(), vec![0, 20]);
    }

    #[test]
    fn distance_ties_prefer_the_earlier_frame() {
        let cond = map(&[2, 6, 10, 14]);
        // 2 and 14 are both 6 away from frame 8; the earlier one wins
        let (selected, _) = select_closest_cond_frames(8, &cond, Some(3));
        let picked: Vec<usize> = selected.keys().copied().collect();
        assert_eq!(picked, vec![2, 6, 10]);
    }

    #[test]
    fn stride_one_window_is_contiguous() {
        // num_maskmem = 7 tracking forward at frame 10: slots cover 4..=9
        let frames: Vec<Option<usize>> = (1..7)
            .rev()
            .map(|t_rel| stride_frame_index(10, t_rel, 1, false))
            .collect();
        assert_eq!(
            frames,
            vec![Some(4), Some(5), Some(6), Some(7), Some(8), Some(9)]
        );
    }

    #[test]
    fn wider_stride_snaps_to_multiples() {
        assert_eq!(stride_frame_index(10, 1, 2, false), Some(9));
        assert_eq!(stride_frame_index(10, 2, 2, false), Some(8));
        assert_eq!(stride_frame_index(10, 3, 2, false), Some(6));
        assert_eq!(stride_frame_index(10, 6, 2, false), Some(0));
    }

    #[test]
    fn reverse_window_mirrors_forward() {
        assert_eq!(stride_frame_index(10, 1, 2, true), Some(11));
        assert_eq!(stride_frame_index(10, 2, 2, true), Some(12));
        assert_eq!(stride_frame_index(10, 3, 2, true), Some(14));
    }

    #[test]
    fn window_never_leaves_the_video() {
        assert_eq!(stride_frame_index(0, 1, 1, false), None);
        assert_eq!(stride_frame_index(1, 2, 1, false), None);
        assert_eq!(stride_frame_index(1, 1, 1, false), Some(0));
    }

    #[test]
    fn window_entries_tag_cond_frames_with_slot_zero() {
        let cond = map(&[0]);
        let non_cond = map(&[7, 8, 9]);
        let window = build_memory_window(10, &cond, &non_cond, 7, 1, None, false);
        let slots: Vec<(usize, f32)> = window
            .entries
            .iter()
            .map(|(slot, o)| {
                let v = o.pred_masks.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
                (*slot, v)
            })
            .collect();
        assert_eq!(slots, vec![(0, 0.0), (4, 7.0), (5, 8.0), (6, 9.0)]);
    }

    #[test]
    fn unselected_cond_frames_backfill_stride_slots() {
        let cond = map(&[0, 8, 9, 10, 11]);
        let non_cond = map(&[]);
        let window = build_memory_window(12, &cond, &non_cond, 7, 1, Some(2), false);
        // 11 and 10 are selected as conditioning; 8 and 9 reappear as
        // regular window entries
        let cond_slots: Vec<usize> = window.selected_cond.keys().copied().collect();
        assert_eq!(cond_slots, vec![10, 11]);
        let strided: Vec<usize> = window
            .entries
            .iter()
            .filter(|(slot, _)| *slot > 0)
            .map(|(slot, _)| *slot)
            .collect();
        assert_eq!(strided, vec![3, 4]);
    }

    #[test]
    fn pointer_gathering_walks_backwards_and_stops_at_zero() {
        let cond = map(&[0]);
        let non_cond = map(&[1, 2, 3]);
        let (selected, unselected) = select_closest_cond_frames(4, &cond, None);
        let (offsets, pointers) = gather_object_pointers(
            4, &selected, &unselected, &non_cond, 30, 16, false, false, false,
        );
        assert_eq!(offsets, vec![4, 1, 2, 3]);
        assert_eq!(pointers.len(), 4);
    }

    #[test]
    fn capped_out_cond_pointers_rejoin_the_backward_walk() {
        let cond = map(&[0, 1, 2, 3]);
        let non_cond = map(&[]);
        let (selected, unselected) = select_closest_cond_frames(4, &cond, Some(2));
        assert_eq!(unselected.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        let (offsets, pointers) = gather_object_pointers(
            4, &selected, &unselected, &non_cond, 30, 16, false, false, false,
        );
        // 2 and 3 attend as conditioning pointers; 1 and 0 come back
        // through the walk instead of being dropped
        assert_eq!(offsets, vec![2, 1, 3, 4]);
        assert_eq!(pointers.len(), 4);
    }

    #[test]
    fn pointer_gathering_can_exclude_the_future() {
        let cond = map(&[0, 9]);
        let non_cond = map(&[]);
        let (selected, unselected) = select_closest_cond_frames(5, &cond, None);
        let (offsets, _) = gather_object_pointers(
            5, &selected, &unselected, &non_cond, 30, 16, true, false, false,
        );
        assert_eq!(offsets, vec![5]);
        let (offsets, _) = gather_object_pointers(
            5, &selected, &unselected, &non_cond, 30, 16, true, false, true,
        );
        assert_eq!(offsets, vec![4]);
    }

    #[test]
    fn signed_offsets_keep_direction() {
        let cond = map(&[3, 9]);
        let non_cond = map(&[]);
        let (selected, unselected) = select_closest_cond_frames(5, &cond, None);
        let (offsets, _) = gather_object_pointers(
            5, &selected, &unselected, &non_cond, 30, 16, false, true, false,
        );
        assert_eq!(offsets, vec![2, -4]);
    }

    #[test]
    fn sine_encoding_shape_and_zero_position() {
        let pos = Tensor::from_vec(vec![0.0f32, 1.0], 2, &Device::Cpu).unwrap();
        let pe = sine_position_encoding(&pos, 8, 10000.0).unwrap();
        assert_eq!(pe.dims(), &[2, 8]);
        let row0 = pe.get(0).unwrap().to_vec1::<f32>().unwrap();
        for v in &row0[..4] {
            assert!(v.abs() < 1e-6);
        }
        for v in &row0[4..] {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }
}
