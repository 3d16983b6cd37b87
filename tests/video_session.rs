mod common;

use candle_core::{DType, Device, Tensor};
use common::{StubModel, IMG};
use vostrack::{
    BoxPrompt, Error, FrameMasks, PointLabel, Session, TensorFrames, TrackerConfig, VideoTracker,
    NO_OBJ_SCORE,
};

const NATIVE: (usize, usize) = (128, 96);

fn video(num_frames: usize) -> Box<TensorFrames> {
    let frames = Tensor::zeros((num_frames, 3, IMG, IMG), DType::F32, &Device::Cpu).unwrap();
    Box::new(TensorFrames::new(frames, NATIVE).unwrap())
}

fn tracker(config: TrackerConfig) -> VideoTracker<StubModel> {
    VideoTracker::new(StubModel::new(), config).unwrap()
}

fn base_config() -> TrackerConfig {
    TrackerConfig {
        directly_add_no_mem_embed: true,
        ..TrackerConfig::default()
    }
}

fn click(
    tracker: &VideoTracker<StubModel>,
    session: &mut Session,
    frame: usize,
    obj: usize,
    positive: bool,
) -> FrameMasks {
    let label = if positive {
        PointLabel::Positive
    } else {
        PointLabel::Negative
    };
    tracker
        .add_points_or_box(
            session,
            frame,
            obj,
            &[(64.0, 48.0)],
            &[label],
            None,
            false,
            true,
        )
        .unwrap()
}

fn run(
    tracker: &VideoTracker<StubModel>,
    session: &mut Session,
    start: Option<usize>,
    max: Option<usize>,
    reverse: bool,
) -> Vec<FrameMasks> {
    tracker
        .propagate(session, start, max, reverse)
        .unwrap()
        .collect::<vostrack::Result<Vec<_>>>()
        .unwrap()
}

fn mask_value(frame: &FrameMasks, slot: usize) -> f32 {
    frame.masks[slot]
        .mask
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()[0]
}

#[test]
fn click_then_propagate_tracks_every_frame() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(20), false).unwrap();
    assert_eq!(tracker.model().extract_calls.get(), 1);

    let preview = click(&tracker, &mut session, 0, 1, true);
    assert_eq!(preview.frame_idx, 0);
    assert_eq!(preview.masks.len(), 1);
    assert_eq!(preview.masks[0].object_id, 1);
    assert_eq!(preview.masks[0].mask.dims(), &[96, 128]);
    assert!(mask_value(&preview, 0) > 0.0);

    let results = run(&tracker, &mut session, None, None, false);
    assert_eq!(results.len(), 20);
    for (t, frame) in results.iter().enumerate() {
        assert_eq!(frame.frame_idx, t);
        assert_eq!(frame.masks.len(), 1);
        assert!(mask_value(frame, 0) > 0.0, "object lost at frame {t}");
    }
    assert_eq!(session.cond_frames(), vec![0]);
    assert_eq!(session.non_cond_frames().len(), 19);
    assert!(session.is_tracked(13));

    // one backbone pass per frame, one decode per tracked frame plus the
    // click, and memory fusion only on frames that had memory to attend
    assert_eq!(tracker.model().extract_calls.get(), 20);
    assert_eq!(tracker.model().decode_calls.get(), 20);
    assert_eq!(tracker.model().fuse_calls.get(), 19);
}

#[test]
fn box_prompt_on_frame_zero_tracks_forward() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(10), false).unwrap();
    let b = BoxPrompt {
        x0: 32.0,
        y0: 24.0,
        x1: 96.0,
        y1: 72.0,
    };
    tracker
        .add_points_or_box(&mut session, 0, 1, &[], &[], Some(b), true, true)
        .unwrap();

    let results = run(&tracker, &mut session, None, None, false);
    assert_eq!(results.len(), 10);
    for (t, frame) in results.iter().enumerate() {
        assert_eq!(frame.frame_idx, t);
        assert_eq!(frame.masks[0].mask.dims(), &[96, 128]);
        assert!(mask_value(frame, 0) > 0.0);
    }
}

#[test]
fn consolidation_fills_missing_objects_with_sentinels() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(6), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);
    // object 2 arrives as a mask prompt on a later frame
    let mut data = vec![0.0f32; IMG * IMG];
    for v in data.iter_mut().take(IMG * IMG / 2) {
        *v = 1.0;
    }
    let mask = Tensor::from_vec(data, (IMG, IMG), &Device::Cpu).unwrap();
    let preview = tracker.add_mask(&mut session, 3, 2, &mask).unwrap();

    // object 1 has no output on frame 3 yet, so its row is the sentinel
    assert_eq!(preview.masks.len(), 2);
    assert_eq!(preview.masks[0].object_id, 1);
    assert_eq!(preview.masks[1].object_id, 2);
    assert!((mask_value(&preview, 0) - NO_OBJ_SCORE).abs() < 1.0);
    assert!(mask_value(&preview, 1) > 0.0);

    let results = run(&tracker, &mut session, None, None, false);
    // frame 3 is served from the conditioning bank, sentinel intact
    assert!((mask_value(&results[3], 0) - NO_OBJ_SCORE).abs() < 1.0);
    assert!(mask_value(&results[3], 1) > 0.0);
    // on the other frames both objects ride their own memory
    for t in [1, 2, 4, 5] {
        assert!(mask_value(&results[t], 0) > 0.0, "object 1 lost at frame {t}");
        assert!(mask_value(&results[t], 1) > 0.0, "object 2 lost at frame {t}");
    }
}

#[test]
fn objects_keep_independent_state_through_propagation() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(6), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);
    // a purely negative prompt: object 2 is marked absent
    click(&tracker, &mut session, 0, 2, false);

    let results = run(&tracker, &mut session, None, None, false);
    for frame in &results {
        assert!(mask_value(frame, 0) > 0.0);
        assert!(mask_value(frame, 1) < 0.0);
    }
}

#[test]
fn multimask_decoding_selects_the_best_iou_slot() {
    let mut config = base_config();
    config.multimask_output_in_sam = true;
    let tracker = tracker(config);
    let mut session = tracker.init_session(video(4), false).unwrap();

    // slots decode at 8/9/10 and slot 1 carries the best predicted iou
    let preview = click(&tracker, &mut session, 0, 1, true);
    assert!((mask_value(&preview, 0) - 9.0).abs() < 1e-3);
}

#[test]
fn new_objects_are_rejected_once_tracking_starts() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(5), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);
    run(&tracker, &mut session, None, None, false);
    assert!(session.tracking_started());

    let err = tracker.add_points_or_box(
        &mut session,
        2,
        7,
        &[(10.0, 10.0)],
        &[PointLabel::Positive],
        None,
        false,
        true,
    );
    assert!(matches!(err, Err(Error::InvalidState(_))));

    // corrections to known objects are still welcome
    click(&tracker, &mut session, 2, 1, true);

    tracker.reset_session(&mut session);
    assert!(!session.tracking_started());
    assert!(session.cond_frames().is_empty());
    tracker
        .add_points_or_box(
            &mut session,
            0,
            7,
            &[(10.0, 10.0)],
            &[PointLabel::Positive],
            None,
            false,
            true,
        )
        .unwrap();
    assert_eq!(session.object_ids(), &[7]);
}

#[test]
fn repeat_propagation_reuses_the_bank() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(8), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);
    let first = run(&tracker, &mut session, None, None, false);
    let decodes = tracker.model().decode_calls.get();
    let extracts = tracker.model().extract_calls.get();

    let second = run(&tracker, &mut session, None, None, false);
    assert_eq!(second.len(), first.len());
    assert_eq!(tracker.model().decode_calls.get(), decodes);
    assert_eq!(tracker.model().extract_calls.get(), extracts);
    assert!(second.iter().all(|f| mask_value(f, 0) > 0.0));
}

#[test]
fn corrections_invalidate_nearby_memory() {
    let mut config = base_config();
    config.clear_non_cond_mem_around_input = true;
    let tracker = tracker(config);
    let mut session = tracker.init_session(video(21), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);
    run(&tracker, &mut session, None, None, false);
    let decodes = tracker.model().decode_calls.get();

    // a correction on frame 7 wipes non-conditioning memory within the
    // window radius (7 slots at stride 1); re-propagation recomputes
    // exactly frames 1..=14 and reuses the rest
    click(&tracker, &mut session, 7, 1, true);
    let results = run(&tracker, &mut session, None, None, false);
    assert_eq!(results.len(), 21);
    assert_eq!(tracker.model().decode_calls.get() - decodes, 1 + 14);
    assert_eq!(session.non_cond_frames().len(), 20);
    assert!(session.prompted_frames().contains(&7));
}

#[test]
fn reverse_propagation_walks_backward() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(10), false).unwrap();
    click(&tracker, &mut session, 5, 1, true);

    let results = run(&tracker, &mut session, None, None, true);
    let visited: Vec<usize> = results.iter().map(|f| f.frame_idx).collect();
    assert_eq!(visited, vec![5, 4, 3, 2, 1, 0]);
    assert!(results.iter().all(|f| mask_value(f, 0) > 0.0));
    assert!(!session.is_tracked(6));
}

#[test]
fn reverse_from_frame_zero_yields_nothing() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(4), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);

    let results = run(&tracker, &mut session, None, None, true);
    assert!(results.is_empty());
    // the prompt was still consolidated
    assert_eq!(session.cond_frames(), vec![0]);
}

#[test]
fn propagation_is_bounded_by_max_frames() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(10), false).unwrap();
    click(&tracker, &mut session, 2, 1, true);

    let results = run(&tracker, &mut session, Some(2), Some(3), false);
    let visited: Vec<usize> = results.iter().map(|f| f.frame_idx).collect();
    assert_eq!(visited, vec![2, 3, 4, 5]);
    assert!(!session.is_tracked(1));
    assert!(!session.is_tracked(6));
}

#[test]
fn propagation_without_prompts_is_rejected() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(4), false).unwrap();
    let err = tracker.propagate(&mut session, None, None, false).map(|_| ());
    assert!(matches!(err, Err(Error::InvalidState(_))));
}

#[test]
fn mask_prompts_pass_straight_through() {
    let mut config = base_config();
    config.use_mask_input_as_output_without_sam = true;
    let tracker = tracker(config);
    let frames = Tensor::zeros((3, 3, IMG, IMG), DType::F32, &Device::Cpu).unwrap();
    let source = Box::new(TensorFrames::new(frames, (IMG, IMG)).unwrap());
    let mut session = tracker.init_session(source, false).unwrap();

    // left half object, right half background
    let mut data = vec![0.0f32; IMG * IMG];
    for y in 0..IMG {
        for x in 0..IMG / 2 {
            data[y * IMG + x] = 1.0;
        }
    }
    let mask = Tensor::from_vec(data, (IMG, IMG), &Device::Cpu).unwrap();
    let preview = tracker.add_mask(&mut session, 0, 1, &mask).unwrap();

    let v = preview.masks[0]
        .mask
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    // mask scores scale to +10 inside and -10 outside
    assert!((v[0] - 10.0).abs() < 1e-3);
    assert!((v[IMG - 1] + 10.0).abs() < 1e-3);
    assert!(v[IMG / 2 - 8] > 0.0);
}

#[test]
fn negative_presence_scores_blank_the_mask() {
    let mut config = base_config();
    config.pred_obj_scores = true;
    let tracker = tracker(config);
    let mut session = tracker.init_session(video(3), false).unwrap();

    tracker.model().score_logit.set(-5.0);
    let preview = click(&tracker, &mut session, 0, 1, true);
    assert!(mask_value(&preview, 0) < -1000.0);
}

#[test]
fn object_pointer_memory_path_propagates() {
    let mut config = base_config();
    config.use_obj_ptrs_in_encoder = true;
    let tracker = tracker(config);
    let mut session = tracker.init_session(video(8), false).unwrap();
    click(&tracker, &mut session, 0, 1, true);

    let results = run(&tracker, &mut session, None, None, false);
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|f| mask_value(f, 0) > 0.0));
}

#[test]
fn cpu_offload_is_transparent() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(4), true).unwrap();
    click(&tracker, &mut session, 0, 1, true);
    let results = run(&tracker, &mut session, None, None, false);
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|f| mask_value(f, 0) > 0.0));
}

#[test]
fn malformed_prompts_are_rejected() {
    let tracker = tracker(base_config());
    let mut session = tracker.init_session(video(4), false).unwrap();

    // arity mismatch
    let err =
        tracker.add_points_or_box(&mut session, 0, 1, &[(1.0, 1.0)], &[], None, false, true);
    assert!(matches!(err, Err(Error::InvalidArgument(_))));

    // no points and no box
    let err = tracker.add_points_or_box(&mut session, 0, 1, &[], &[], None, true, true);
    assert!(matches!(err, Err(Error::InvalidArgument(_))));

    // a box must clear earlier clicks
    let b = BoxPrompt {
        x0: 1.0,
        y0: 1.0,
        x1: 20.0,
        y1: 20.0,
    };
    let err = tracker.add_points_or_box(&mut session, 0, 1, &[], &[], Some(b), false, true);
    assert!(matches!(err, Err(Error::InvalidArgument(_))));

    // frame out of range
    let err = tracker.add_points_or_box(
        &mut session,
        9,
        1,
        &[(1.0, 1.0)],
        &[PointLabel::Positive],
        None,
        false,
        true,
    );
    assert!(matches!(err, Err(Error::InvalidArgument(_))));

    // mask prompts must be two-dimensional
    let bad = Tensor::zeros((1, 8, 8), DType::F32, &Device::Cpu).unwrap();
    let err = tracker.add_mask(&mut session, 0, 1, &bad);
    assert!(matches!(err, Err(Error::InvalidArgument(_))));

    // ids are registered before prompt validation, matching the
    // interactive flow where an object exists as soon as it is named
    assert_eq!(session.object_ids(), &[1]);
}
