//! Rewinder buffering, replay, throttling and handler interposition.

mod helpers;

use std::sync::Arc;

use helpers::*;
use millrace_pipeline::msg::Msg;
use millrace_pipeline::Rewinder;

#[test]
fn rewind_replays_the_buffered_stream_start() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![
        mode("radio"),
        encoded_stream(1, handler.clone()),
        f.audio_encoded(b"aaaa"),
        f.audio_encoded(b"bbbb"),
    ]);
    let mut rewinder = Rewinder::new(f, Box::new(upstream), 16);

    // Mode arrives before any stream, so it is not retained.
    assert_eq!(rewinder.pull().unwrap().kind_name(), "Mode");
    let reissued = match rewinder.pull().unwrap() {
        Msg::EncodedStream(info) => info,
        other => panic!("expected EncodedStream, got {other:?}"),
    };
    assert_eq!(reissued.stream_id, 1);
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"aaaa");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"bbbb");

    rewinder.rewind();
    assert_eq!(rewinder.pull().unwrap().kind_name(), "EncodedStream");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"aaaa");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"bbbb");

    // A second rewind still has everything.
    rewinder.rewind();
    assert_eq!(rewinder.pull().unwrap().kind_name(), "EncodedStream");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"aaaa");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"bbbb");
}

#[test]
fn reissued_stream_handler_delegates_upstream() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![encoded_stream(7, handler.clone())]);
    let mut rewinder = Rewinder::new(f, Box::new(upstream), 16);

    let reissued = match rewinder.pull().unwrap() {
        Msg::EncodedStream(info) => info,
        other => panic!("expected EncodedStream, got {other:?}"),
    };
    assert_eq!(reissued.stream_handler.try_stop(7), 0);
    assert_eq!(reissued.stream_handler.try_seek(7, 1234), 0);
    reissued.stream_handler.notify_starving("radio", 7, true);

    assert_eq!(handler.stop_calls.lock().unwrap().as_slice(), &[7]);
    assert_eq!(handler.seek_calls.lock().unwrap().as_slice(), &[(7, 1234)]);
    assert_eq!(
        handler.starving_events.lock().unwrap().as_slice(),
        &[("radio".to_string(), 7, true)]
    );
}

#[test]
fn holds_off_upstream_once_the_retained_cap_is_reached() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![
        encoded_stream(1, handler),
        f.audio_encoded(b"aaaa"),
        f.audio_encoded(b"bbbb"),
        f.audio_encoded(b"cccc"),
    ]);
    let mut rewinder = Rewinder::new(f, Box::new(upstream), 2);

    rewinder.pull().unwrap();
    rewinder.pull().unwrap();
    rewinder.pull().unwrap();

    // Two encoded-audio messages retained; no more upstream pulls until
    // recognition resolves.
    assert!(rewinder.pull().is_none());
    assert!(rewinder.pull().is_none());

    rewinder.stop();
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"cccc");
}

#[test]
fn buffering_restarts_at_the_next_segment_boundary() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![
        encoded_stream(1, handler),
        f.audio_encoded(b"aaaa"),
        f.audio_encoded(b"bbbb"),
        Msg::StreamSegment {
            id: "segment-2".to_string(),
        },
        f.audio_encoded(b"cccc"),
    ]);
    let mut rewinder = Rewinder::new(f, Box::new(upstream), 16);

    rewinder.pull().unwrap(); // stream
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"aaaa");
    rewinder.stop();

    // Not retained after the stop.
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"bbbb");

    // The segment boundary re-arms buffering.
    assert_eq!(rewinder.pull().unwrap().kind_name(), "StreamSegment");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"cccc");

    rewinder.rewind();
    assert_eq!(rewinder.pull().unwrap().kind_name(), "StreamSegment");
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"cccc");
}

#[test]
fn control_messages_pass_without_being_retained() {
    let f = factory();
    let handler = Arc::new(RecordingHandler::default());
    let upstream = ScriptedUpstream::new(vec![
        encoded_stream(1, handler),
        Msg::StreamInterrupted,
        f.audio_encoded(b"aaaa"),
    ]);
    let mut rewinder = Rewinder::new(f, Box::new(upstream), 16);

    rewinder.pull().unwrap();
    assert_eq!(rewinder.pull().unwrap().kind_name(), "StreamInterrupted");
    rewinder.pull().unwrap();

    rewinder.rewind();
    assert_eq!(rewinder.pull().unwrap().kind_name(), "EncodedStream");
    // StreamInterrupted was not part of the replay.
    assert_eq!(encoded_bytes(rewinder.pull().unwrap()), b"aaaa");
}
