//! End-to-end sessions: simulated driver, ring buffer, writer thread and
//! live taps running together.

mod common;

use common::{commit_every_block, manual_flush, plain_channels};
use daq_log::channel::{ChannelDescriptor, ConfigError, ScaleTransform};
use daq_log::data::live_tap::LiveUpdate;
use daq_log::error::FaultKind;
use daq_log::hardware::mock::SimulatedDaq;
use daq_log::pipeline::{Pipeline, PipelineSettings};
use daq_log::session::Session;
use daq_log::storage::{LogReader, LogWriter, ReadRange};
use daq_log::DaqError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const RATE: f64 = 2000.0;
const PER_BLOCK: usize = 20;

fn paced_source(session: &Session) -> SimulatedDaq {
    SimulatedDaq::new(Arc::clone(session.channels()), RATE, PER_BLOCK).paced(true)
}

fn assert_contiguous(values: &[f64], offset: f64) {
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, i as f64 + offset, "gap at sample {i}");
    }
}

#[test]
fn session_logs_every_acquired_sample() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.dqlog");
    let session = Session::start(plain_channels(&["ai0", "ai1"]), RATE);
    let source = paced_source(&session);
    let writer = LogWriter::create(&path, commit_every_block()).unwrap();

    let running = Pipeline::start(PipelineSettings::default(), source, writer, session).unwrap();
    thread::sleep(Duration::from_millis(250));
    assert!(!running.has_stopped());
    let summary = running.stop().unwrap();

    assert!(summary.blocks_acquired > 0);
    assert_eq!(summary.writer_dropped_blocks, 0);
    assert!(summary.writer_gaps.is_empty());
    assert_eq!(
        summary.committed_samples,
        summary.blocks_acquired * PER_BLOCK as u64
    );
    assert_eq!(summary.segments, 1);
    assert_eq!(summary.path, path);

    let handle = LogReader::open(&path).unwrap();
    assert!(handle.is_indexed());
    let ai0 = handle
        .read_channel("ai0", ReadRange::All)
        .unwrap()
        .values()
        .unwrap();
    let ai1 = handle
        .read_channel("ai1", ReadRange::All)
        .unwrap()
        .values()
        .unwrap();
    assert_eq!(ai0.len() as u64, summary.committed_samples);
    assert_contiguous(&ai0, 0.0);
    assert_contiguous(&ai1, 1000.0);
}

#[test]
fn reconfiguration_opens_a_new_segment() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reconfigure.dqlog");
    let session = Session::start(plain_channels(&["ai0", "ai1"]), RATE);
    let source = paced_source(&session);
    let writer = LogWriter::create(&path, manual_flush()).unwrap();

    let mut running =
        Pipeline::start(PipelineSettings::default(), source, writer, session).unwrap();
    thread::sleep(Duration::from_millis(100));
    let set = running.reconfigure(plain_channels(&["ai0", "ai2"])).unwrap();
    assert_eq!(set.len(), 2);
    assert!(running.reconfigure(Vec::new()).is_err());
    let duplicate = vec![
        ChannelDescriptor::new("ai0", "X"),
        ChannelDescriptor::new("ai1", "X"),
    ];
    assert!(matches!(
        running.reconfigure(duplicate),
        Err(DaqError::Config(ConfigError::DuplicateDisplayName(name))) if name == "X"
    ));
    assert_eq!(running.session().channels().generation(), set.generation());
    thread::sleep(Duration::from_millis(100));
    let summary = running.stop().unwrap();
    assert_eq!(summary.segments, 2);

    let handle = LogReader::open(&path).unwrap();
    let names: Vec<String> = handle
        .list_channels()
        .into_iter()
        .map(|c| c.display_name)
        .collect();
    assert_eq!(names, vec!["ai0", "ai1", "ai2"]);
    let first = handle.segments()[0].sample_count;
    assert_eq!(handle.total_samples("ai1"), first);
    assert_eq!(handle.total_samples("ai2"), summary.committed_samples - first);

    // the driver's sample counter runs on across the channel change
    let ai0 = handle
        .read_channel("ai0", ReadRange::All)
        .unwrap()
        .values()
        .unwrap();
    assert_contiguous(&ai0, 0.0);
    let ai2 = handle
        .read_channel("ai2", ReadRange::All)
        .unwrap()
        .values()
        .unwrap();
    assert_eq!(ai2[0], first as f64 + 1000.0);
}

#[test]
fn live_tap_sees_scaled_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.dqlog");
    let session = Session::start(
        vec![
            ChannelDescriptor::new("ai0", "Raw"),
            ChannelDescriptor::new("ai1", "Scaled")
                .with_unit("bar")
                .with_scale(ScaleTransform::Linear {
                    gain: 0.5,
                    offset: -500.0,
                }),
        ],
        RATE,
    );
    let source = paced_source(&session);
    let writer = LogWriter::create(&path, manual_flush()).unwrap();
    let running = Pipeline::start(PipelineSettings::default(), source, writer, session).unwrap();

    let mut tap = running.tap("display");
    let deadline = Instant::now() + Duration::from_secs(5);
    let frame = loop {
        match tap.poll() {
            LiveUpdate::Frame(frame) => break frame,
            LiveUpdate::NoNewData => {
                assert!(Instant::now() < deadline, "no live frame arrived");
                thread::sleep(Duration::from_millis(5));
            }
        }
    };
    running.stop().unwrap();

    assert_eq!(frame.dropped_before, 0);
    let raw = frame.channel("Raw").unwrap();
    let scaled = frame.channel("Scaled").unwrap();
    assert_eq!(raw.samples.len(), PER_BLOCK);
    assert_eq!(scaled.unit, "bar");
    for ((t_raw, r), (t_scaled, s)) in raw.samples.iter().zip(&scaled.samples) {
        assert_eq!(t_raw, t_scaled);
        // ai1 carries raw + 1000
        assert_eq!(*s, 0.5 * (r + 1000.0) - 500.0);
    }
    assert!((frame.timestamp - raw.samples[0].0).abs() < 1e-12);
}

#[test]
fn driver_fault_aborts_and_keeps_the_file_readable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fault.dqlog");
    let session = Session::start(plain_channels(&["ai0"]), RATE);
    let source = SimulatedDaq::new(Arc::clone(session.channels()), RATE, 10).fail_after(7);
    let writer = LogWriter::create(&path, manual_flush()).unwrap();
    let running = Pipeline::start(PipelineSettings::default(), source, writer, session).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !running.has_stopped() {
        assert!(Instant::now() < deadline, "producer did not stop");
        thread::sleep(Duration::from_millis(5));
    }
    let err = running.stop().unwrap_err();
    assert!(err.is_session_fatal());
    match err {
        DaqError::SessionAborted {
            kind,
            durable_samples,
            ..
        } => {
            assert_eq!(kind, FaultKind::Driver);
            assert_eq!(durable_samples, 70);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let handle = LogReader::open(&path).unwrap();
    assert!(handle.is_indexed());
    assert_eq!(handle.total_samples("ai0"), 70);
}
