//! VariableDelay left/right behaviour: silence insertion, ramped audio
//! removal, animator latency compensation and clock puller gating.

mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use helpers::*;
use millrace_common::jiffies;
use millrace_pipeline::element::DelayObserver;
use millrace_pipeline::msg::Msg;
use millrace_pipeline::ramp::{Direction, RAMP_MAX, RAMP_MIN};
use millrace_pipeline::{UpstreamElement, VariableDelayLeft, VariableDelayRight};

const PER_SAMPLE: u32 = 1280; // 44.1kHz

#[test]
fn left_inserts_silence_for_a_delay_increase() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![
        mode("receiver"),
        decoded_stream(1, handler),
        Msg::Delay {
            remaining_jiffies: 0,
            total_jiffies: jiffies::from_ms(60),
        },
        pcm(&f, 441, 0),
    ]);
    let mut left = VariableDelayLeft::new(
        f,
        Box::new(upstream),
        jiffies::from_ms(5),
        jiffies::from_ms(10),
    );
    let observer = Arc::new(RecordingDelayObserver::default());
    left.set_observer(observer.clone());

    assert_eq!(left.pull().kind_name(), "Mode");
    assert_eq!(left.pull().kind_name(), "DecodedStream");

    // Left keeps total minus the downstream reservation and forwards the
    // reservation as the remaining delay.
    match left.pull() {
        Msg::Delay {
            remaining_jiffies,
            total_jiffies,
        } => {
            assert_eq!(remaining_jiffies, jiffies::from_ms(10));
            assert_eq!(total_jiffies, jiffies::from_ms(60));
        }
        other => panic!("expected Delay, got {other:?}"),
    }

    // 50ms of silence arrives in sub-2ms slices, only once audio has
    // been seen on the new stream.
    let mut silence = 0u32;
    let audio = loop {
        match left.pull() {
            Msg::Silence(s) => {
                assert!(s.size_jiffies() <= jiffies::from_ms(2));
                silence += s.size_jiffies();
            }
            Msg::AudioPcm(a) => break a,
            other => panic!("expected silence or audio, got {other:?}"),
        }
    };
    assert_eq!(silence, jiffies::from_ms(50));
    assert_eq!(
        observer.notifications.lock().unwrap().as_slice(),
        &[jiffies::from_ms(50)]
    );
    assert_eq!(audio.track_offset, Some(0));
    assert!(!audio.ramp().is_enabled());
}

#[test]
fn left_removes_audio_for_a_delay_decrease_with_ramps() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![
        mode("receiver"),
        decoded_stream(1, handler),
        Msg::Delay {
            remaining_jiffies: 0,
            total_jiffies: jiffies::from_ms(10),
        },
        pcm(&f, 441, 0),
        Msg::Delay {
            remaining_jiffies: 0,
            total_jiffies: jiffies::from_ms(5),
        },
        pcm(&f, 882, 441),
    ]);
    let mut left = VariableDelayLeft::new(f, Box::new(upstream), jiffies::from_ms(5), 0);
    let observer = Arc::new(RecordingDelayObserver::default());
    left.set_observer(observer.clone());

    left.pull(); // Mode
    left.pull(); // DecodedStream
    left.pull(); // Delay
    loop {
        // 10ms of inserted silence, then the first audio.
        if let Msg::AudioPcm(_) = left.pull() {
            break;
        }
    }

    // Delay drops by 5ms: ramp down, discard 5ms, ramp back up.
    assert_eq!(left.pull().kind_name(), "Delay");

    let down_head = expect_pcm(left.pull());
    assert_eq!(down_head.size_jiffies(), 220 * PER_SAMPLE);
    assert_eq!(down_head.ramp().direction(), Direction::Down);
    assert_eq!(down_head.ramp().start(), RAMP_MAX);

    let down_tail = expect_pcm(left.pull());
    assert_eq!(down_tail.size_jiffies(), PER_SAMPLE);
    assert_eq!(down_tail.ramp().end(), RAMP_MIN);

    // The stream is re-announced past the discarded span: 441 played
    // before the change, 221 ramped down, 221 discarded.
    match left.pull() {
        Msg::DecodedStream(info) => assert_eq!(info.sample_start, 883),
        other => panic!("expected DecodedStream, got {other:?}"),
    }

    let up_head = expect_pcm(left.pull());
    assert_eq!(up_head.size_jiffies(), 220 * PER_SAMPLE);
    assert_eq!(up_head.ramp().direction(), Direction::Up);
    assert_eq!(up_head.ramp().start(), RAMP_MIN);
    assert_eq!(up_head.track_offset, Some(883));

    let up_tail = expect_pcm(left.pull());
    assert_eq!(up_tail.size_jiffies(), PER_SAMPLE);
    assert_eq!(up_tail.ramp().end(), RAMP_MAX);

    let running = expect_pcm(left.pull());
    assert_eq!(running.size_jiffies(), 219 * PER_SAMPLE);
    assert!(!running.ramp().is_enabled());

    assert_eq!(
        observer.notifications.lock().unwrap().as_slice(),
        &[jiffies::from_ms(10), jiffies::from_ms(5)]
    );
}

#[test]
fn right_subtracts_animator_latency_and_gates_the_clock_puller() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let puller = Arc::new(CountingPuller::default());
    let upstream = ScriptedUpstream::new(vec![
        mode_with_puller("receiver", puller.clone()),
        decoded_stream(1, handler),
        Msg::Delay {
            remaining_jiffies: jiffies::from_ms(100),
            total_jiffies: jiffies::from_ms(100),
        },
        pcm(&f, 441, 0),
    ]);
    let mut right = VariableDelayRight::new(
        f,
        Box::new(upstream),
        jiffies::from_ms(5),
        jiffies::from_ms(10),
    );
    right.set_animator(Arc::new(FixedAnimator {
        latency_jiffies: jiffies::from_ms(20),
        block_words: 16,
    }));

    assert_eq!(right.pull().kind_name(), "Mode");
    // Stream start enforces the minimum delay, which counts as a pending
    // adjustment and stops the clock puller.
    assert_eq!(right.pull().kind_name(), "DecodedStream");
    assert!(puller.stops.load(Ordering::Acquire) >= 1);

    // 100ms requested minus 20ms the animator already contributes.
    match right.pull() {
        Msg::Delay {
            remaining_jiffies,
            total_jiffies,
        } => {
            assert_eq!(remaining_jiffies, jiffies::from_ms(80));
            assert_eq!(total_jiffies, jiffies::from_ms(100));
        }
        other => panic!("expected Delay, got {other:?}"),
    }
    assert_eq!(puller.starts.load(Ordering::Acquire), 0);

    let mut silence = 0u32;
    loop {
        match right.pull() {
            Msg::Silence(s) => silence += s.size_jiffies(),
            Msg::AudioPcm(_) => break,
            other => panic!("expected silence or audio, got {other:?}"),
        }
    }
    assert_eq!(silence, jiffies::from_ms(80));
    // The puller restarts once the delay is fully in effect.
    assert_eq!(puller.starts.load(Ordering::Acquire), 1);

    // Left's applied notification re-starts it only while no adjustment
    // is pending.
    right.observer().notify_delay_applied(jiffies::from_ms(50));
    assert_eq!(puller.starts.load(Ordering::Acquire), 2);
}

#[test]
fn silence_absorbs_a_ramp_down_for_free() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let mut gap = jiffies::from_ms(10);
    let gap_msg = f.silence(&mut gap, 44_100, 16, 2);
    let upstream = ScriptedUpstream::new(vec![
        mode("receiver"),
        decoded_stream(1, handler),
        Msg::Delay {
            remaining_jiffies: 0,
            total_jiffies: jiffies::from_ms(10),
        },
        pcm(&f, 441, 0),
        Msg::Delay {
            remaining_jiffies: 0,
            total_jiffies: jiffies::from_ms(5),
        },
        gap_msg,
        pcm(&f, 441, 441),
        Msg::Quit,
    ]);
    let mut left = VariableDelayLeft::new(f, Box::new(upstream), jiffies::from_ms(5), 0);
    let observer = Arc::new(RecordingDelayObserver::default());
    left.set_observer(observer.clone());

    left.pull(); // Mode
    left.pull(); // DecodedStream
    left.pull(); // Delay
    loop {
        if let Msg::AudioPcm(_) = left.pull() {
            break;
        }
    }
    assert_eq!(left.pull().kind_name(), "Delay");

    // Already silent, so no audible ramp down is needed.
    let gap_out = expect_silence(left.pull());
    assert!(!gap_out.ramp().is_enabled());

    // The pending 5ms removal is taken out of the next audio, then the
    // stream resumes with a ramp up from the new position.
    match left.pull() {
        Msg::DecodedStream(info) => assert_eq!(info.sample_start, 662),
        other => panic!("expected DecodedStream, got {other:?}"),
    }
    let up = expect_pcm(left.pull());
    assert_eq!(up.ramp().direction(), Direction::Up);
    assert_eq!(up.size_jiffies(), 220 * PER_SAMPLE);
    assert_eq!(up.track_offset, Some(662));

    assert_eq!(left.pull().kind_name(), "Quit");
    assert_eq!(
        observer.notifications.lock().unwrap().as_slice(),
        &[jiffies::from_ms(10), jiffies::from_ms(5)]
    );
}
