mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{corrupt, frame, ScriptedLine};
use rtu_sniff::{
    api::{FlumeRecordSink, SnifferBuilder},
    core::{
        CaptureEvent, CaptureOptions, LineLease, LiveCapture, OutputRecord, RecordEvent,
        RecordFilter, TimeDisplay,
    },
    protocol::{modbus::MessageKind, LinkConfig},
};

fn fast_options() -> CaptureOptions {
    CaptureOptions {
        drain_interval: Duration::from_millis(5),
        sweep_interval: Duration::from_millis(20),
        startup_crc_grace: None,
        ..CaptureOptions::default()
    }
}

/// Mirror the ordered output from the event stream.
fn apply(records: &mut Vec<OutputRecord>, event: &RecordEvent) {
    match event {
        RecordEvent::Inserted { position, record } => records.insert(*position, record.clone()),
        RecordEvent::Updated { position, record } => records[*position] = record.clone(),
    }
}

fn collect(capture: &LiveCapture) -> (Vec<OutputRecord>, Vec<CaptureEvent>) {
    let rx = capture.events();
    tokio_test::block_on(async move {
        let mut records = Vec::new();
        let mut others = Vec::new();
        while let Ok(event) = rx.recv_async().await {
            match event {
                CaptureEvent::Record(change) => apply(&mut records, &change),
                CaptureEvent::Stopped { .. } => {
                    others.push(event);
                    break;
                }
                other => others.push(other),
            }
        }
        (records, others)
    })
}

#[test]
fn test_pipeline_correlates_sniffed_traffic() {
    let line = ScriptedLine::new(
        "capture-pipeline",
        vec![
            frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]),
            frame(&[0x01, 0x03, 0x02, 0x00, 0x0A]),
            frame(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x05]),
            frame(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x05]),
            frame(&[0x01, 0x03, 0x02, 0x00, 0x0A]),
        ],
    );
    let capture = LiveCapture::start(line, LinkConfig::default(), fast_options()).unwrap();
    let (records, others) = collect(&capture);

    let kinds: Vec<_> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Request,
            MessageKind::Response,
        ]
    );
    assert_eq!(records[1].counter, 2);
    assert_eq!(records[1].request, Some(records[0].id));
    assert_eq!(records[3].request, Some(records[2].id));
    assert!(matches!(records[3].time, TimeDisplay::SinceRequest { .. }));
    assert!(records.iter().all(|r| r.crc_valid));

    assert_eq!(
        others,
        vec![
            CaptureEvent::SourceClosed {
                line: "capture-pipeline".into(),
                reason: Some("byte source closed".into()),
            },
            CaptureEvent::Stopped { dropped_frames: 0 },
        ]
    );
    capture.join();
    assert!(!LineLease::is_held("capture-pipeline"));
}

#[test]
fn test_startup_grace_drops_invalid_frames() {
    let line = ScriptedLine::new(
        "capture-grace",
        vec![
            corrupt(frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01])),
            frame(&[0x02, 0x03, 0x00, 0x00, 0x00, 0x01]),
        ],
    );
    let options = CaptureOptions {
        startup_crc_grace: Some(Duration::from_secs(5)),
        ..fast_options()
    };
    let capture = LiveCapture::start(line, LinkConfig::default(), options).unwrap();
    let (records, _) = collect(&capture);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, 2);
}

#[test]
fn test_invalid_frames_kept_without_grace() {
    let line = ScriptedLine::new(
        "capture-no-grace",
        vec![corrupt(frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]))],
    );
    let capture = LiveCapture::start(line, LinkConfig::default(), fast_options()).unwrap();
    let (records, _) = collect(&capture);

    assert_eq!(records.len(), 1);
    assert!(!records[0].crc_valid);
}

#[test]
fn test_unmatched_response_is_flushed_when_the_source_ends() {
    let line = ScriptedLine::new(
        "capture-flush",
        vec![
            frame(&[0x02, 0x04, 0x00, 0x00, 0x00, 0x01]),
            frame(&[0x07, 0x03, 0x02, 0x12, 0x34]),
        ],
    );
    let capture = LiveCapture::start(line, LinkConfig::default(), fast_options()).unwrap();
    let (records, _) = collect(&capture);

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].address, 7);
    assert_eq!(records[1].kind, MessageKind::Response);
    assert_eq!(records[1].request, None);
}

#[test]
fn test_stop_ends_an_idle_capture() {
    let line = ScriptedLine::new(
        "capture-stop",
        vec![frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01])],
    )
    .hold_open();
    let capture = LiveCapture::start(line, LinkConfig::default(), fast_options()).unwrap();
    assert!(LiveCapture::start(
        ScriptedLine::new("capture-stop", Vec::new()),
        LinkConfig::default(),
        fast_options()
    )
    .is_err());

    let control = capture.control();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        control.stop();
    });
    let (records, others) = collect(&capture);
    stopper.join().unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(
        others[0],
        CaptureEvent::SourceClosed {
            line: "capture-stop".into(),
            reason: None,
        }
    );
}

#[test]
fn test_clear_resets_the_session() {
    let line = ScriptedLine::new("capture-clear", Vec::new()).hold_open();
    let capture = LiveCapture::start(line, LinkConfig::default(), fast_options()).unwrap();
    let bus = capture.bus();
    assert!(bus.request_clear());

    let event = bus.event_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event, CaptureEvent::Cleared);
    capture.join();
}

#[test]
fn test_full_decoded_queue_drops_newest_frames() {
    let frames: Vec<Vec<u8>> = (1..=20u8)
        .map(|address| frame(&[address, 0x03, 0x00, 0x00, 0x00, 0x01]))
        .collect();
    let line = ScriptedLine::new("capture-backpressure", frames);
    let options = CaptureOptions {
        decoded_queue_capacity: 1,
        drain_interval: Duration::from_millis(300),
        ..fast_options()
    };
    let capture = LiveCapture::start(line, LinkConfig::default(), options).unwrap();
    let (records, others) = collect(&capture);

    let dropped = match others.last() {
        Some(CaptureEvent::Stopped { dropped_frames }) => *dropped_frames,
        other => panic!("unexpected final event: {other:?}"),
    };
    assert!(dropped > 0);
    assert_eq!(records.len() as u64 + dropped, 20);

    // the oldest frame always gets through, later ones are what is lost
    let addresses: Vec<u8> = records.iter().map(|r| r.address).collect();
    assert_eq!(addresses[0], 1);
    assert!(addresses.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_sniffer_filters_before_sinks() {
    let line = ScriptedLine::new(
        "sniffer-filter",
        vec![
            frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]),
            frame(&[0x01, 0x83, 0x02]),
            corrupt(frame(&[0x01, 0x83, 0x03])),
        ],
    );
    let (sink, rx) = FlumeRecordSink::new();
    let sniffer = SnifferBuilder::new()
        .with_capture_options(fast_options())
        .with_filter(RecordFilter {
            crc_ok_only: true,
            errors_only: true,
        })
        .add_sink(Arc::new(sink))
        .build_with_source(line)
        .unwrap();

    let dropped = sniffer.run();
    assert_eq!(dropped, 0);

    let records: Vec<OutputRecord> = rx
        .try_iter()
        .filter_map(|event| match event {
            CaptureEvent::Record(change) => Some(change.record().clone()),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].function, 0x83);
    assert!(records[0].crc_valid);
}
