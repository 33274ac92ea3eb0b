//! Integration tests for writing and reading `.dqlog` files.
//!
//! These tests exercise the complete storage path: channel resolution, the
//! writer's segment handling, and the reader's scaling, range selection and
//! channel reconciliation.

mod common;

use common::{block, commit_every_block, manual_flush, plain_channels, ramp};
use daq_log::channel::{
    ChannelConfig, ChannelDescriptor, ChannelRegistry, InMemoryScaleStore, ScaleTransform,
};
use daq_log::hardware::mock::SimulatedDaq;
use daq_log::session::Session;
use daq_log::storage::{LogReader, LogWriter, ReadRange};
use std::sync::Arc;
use tempfile::tempdir;

fn values(handle: &daq_log::storage::LogHandle, name: &str) -> Vec<f64> {
    handle
        .read_channel(name, ReadRange::All)
        .unwrap()
        .values()
        .unwrap()
}

#[test]
fn temp_and_pressure_scenario() {
    let store = InMemoryScaleStore::new().with_scale(
        "temp_cal",
        ScaleTransform::Linear {
            gain: 2.0,
            offset: 1.0,
        },
    );
    let registry = ChannelRegistry::new(Arc::new(SimulatedDaq::catalog(2)), Arc::new(store));
    let channels = registry
        .resolve(&[
            ChannelConfig::new("ai0", "Temp").with_scale("temp_cal"),
            ChannelConfig::new("ai1", "Pressure"),
        ])
        .unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("scenario.dqlog");
    let session = Session::start(channels, 1.0);
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    writer
        .write_block(&block(
            session.channels(),
            0.0,
            1.0,
            vec![vec![1.0, 2.0], vec![10.0, 20.0]],
        ))
        .unwrap();
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    let names: Vec<String> = handle
        .list_channels()
        .into_iter()
        .map(|c| c.display_name)
        .collect();
    assert_eq!(names, vec!["Temp", "Pressure"]);
    assert_eq!(values(&handle, "Temp"), vec![3.0, 5.0]);
    assert_eq!(values(&handle, "Pressure"), vec![10.0, 20.0]);

    let timestamps: Vec<f64> = handle
        .read_channel("Temp", ReadRange::All)
        .unwrap()
        .map(|s| s.unwrap().timestamp)
        .collect();
    assert_eq!(timestamps, vec![0.0, 1.0]);
}

#[test]
fn every_transform_round_trips_through_the_file() {
    let descriptors = vec![
        ChannelDescriptor::new("ai0", "linear").with_scale(ScaleTransform::Linear {
            gain: -0.5,
            offset: 4.0,
        }),
        ChannelDescriptor::new("ai1", "poly").with_scale(ScaleTransform::Polynomial {
            coefficients: vec![1.0, 2.0, 3.0],
        }),
        ChannelDescriptor::new("ai2", "table").with_scale(ScaleTransform::Table {
            breakpoints: vec![(0.0, 0.0), (10.0, 100.0)],
        }),
    ];
    let raw = vec![-1.0, 0.0, 2.0, 5.0, 20.0];

    let dir = tempdir().unwrap();
    let path = dir.path().join("transforms.dqlog");
    let session = Session::start(descriptors.clone(), 10.0);
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    writer
        .write_block(&block(
            session.channels(),
            0.0,
            10.0,
            vec![raw.clone(), raw.clone(), raw.clone()],
        ))
        .unwrap();
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    for descriptor in &descriptors {
        let expected: Vec<f64> = raw.iter().map(|&x| descriptor.scale.apply(x)).collect();
        assert_eq!(values(&handle, &descriptor.display_name), expected);
    }
    assert_eq!(values(&handle, "poly"), vec![2.0, 1.0, 17.0, 86.0, 1241.0]);
    assert_eq!(values(&handle, "table"), vec![0.0, 0.0, 20.0, 50.0, 100.0]);

    let stored = handle.list_channels();
    assert_eq!(stored, descriptors);
}

#[test]
fn reads_are_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idempotent.dqlog");
    let session = Session::start(plain_channels(&["ai0", "ai1"]), 100.0);
    let mut writer = LogWriter::create(&path, commit_every_block()).unwrap();
    writer.start_session(&session).unwrap();
    for i in 0..10 {
        writer.write_block(&ramp(session.channels(), i * 25, 25, 100.0)).unwrap();
    }
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    let first = values(&handle, "ai1");
    let second = values(&handle, "ai1");
    assert_eq!(first.len(), 250);
    assert_eq!(first, second);

    // an unfinished stream does not disturb a fresh one
    let mut partial = handle.read_channel("ai1", ReadRange::All).unwrap();
    let _ = partial.next();
    assert_eq!(values(&handle, "ai1"), first);

    let reopened = LogReader::open(&path).unwrap();
    assert_eq!(values(&reopened, "ai1"), first);
}

#[test]
fn sample_ranges_span_records_and_segments() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ranges.dqlog");
    let mut session = Session::start(plain_channels(&["ai0"]), 10.0);
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    writer.write_block(&ramp(session.channels(), 0, 5, 10.0)).unwrap();
    writer.write_block(&ramp(session.channels(), 5, 5, 10.0)).unwrap();
    session
        .reconfigure(plain_channels(&["ai0", "ai1"]))
        .unwrap();
    writer.write_block(&ramp(session.channels(), 10, 5, 10.0)).unwrap();
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    assert_eq!(handle.segments().len(), 2);
    let middle = handle
        .read_channel("ai0", ReadRange::Samples(3..12))
        .unwrap()
        .values()
        .unwrap();
    assert_eq!(middle, (3..12).map(f64::from).collect::<Vec<_>>());

    let late = handle
        .read_channel("ai0", ReadRange::Seconds { start: 1.2, end: 10.0 })
        .unwrap()
        .values()
        .unwrap();
    assert_eq!(late, vec![12.0, 13.0, 14.0]);

    let empty = handle
        .read_channel("ai0", ReadRange::Samples(100..200))
        .unwrap()
        .values()
        .unwrap();
    assert!(empty.is_empty());
}

#[test]
fn channel_change_mid_session_yields_union() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("union.dqlog");
    let mut session = Session::start(
        vec![
            ChannelDescriptor::new("ai0", "A"),
            ChannelDescriptor::new("ai1", "B"),
        ],
        10.0,
    );
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    writer.write_block(&ramp(session.channels(), 0, 4, 10.0)).unwrap();

    session.reconfigure(vec![
        ChannelDescriptor::new("ai1", "B").with_unit("kPa"),
        ChannelDescriptor::new("ai2", "C"),
    ])
    .unwrap();
    writer.write_block(&ramp(session.channels(), 4, 4, 10.0)).unwrap();
    let summary = writer.close().unwrap();
    assert_eq!(summary.segments, 2);

    let handle = LogReader::open(&path).unwrap();
    let channels = handle.list_channels();
    let names: Vec<&str> = channels.iter().map(|c| c.display_name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    // most recent segment wins
    assert_eq!(channels[1].unit, "kPa");

    assert_eq!(handle.total_samples("A"), 4);
    assert_eq!(handle.total_samples("B"), 8);
    assert_eq!(handle.total_samples("C"), 4);
    // B moved from position 1 to position 0 between segments
    assert_eq!(
        values(&handle, "B"),
        vec![1000.0, 1001.0, 1002.0, 1003.0, 4.0, 5.0, 6.0, 7.0]
    );
    assert_eq!(values(&handle, "C"), vec![1004.0, 1005.0, 1006.0, 1007.0]);
}

#[test]
fn append_continues_an_existing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("append.dqlog");

    let first = Session::start(plain_channels(&["ai0"]), 10.0);
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&first).unwrap();
    writer.write_block(&ramp(first.channels(), 0, 3, 10.0)).unwrap();
    writer.close().unwrap();

    let second = Session::start(plain_channels(&["ai0"]), 10.0);
    let mut writer = LogWriter::append(&path, manual_flush()).unwrap();
    assert_eq!(writer.committed_samples(), 3);
    writer.start_session(&second).unwrap();
    writer.write_block(&ramp(second.channels(), 0, 2, 10.0)).unwrap();
    let summary = writer.close().unwrap();
    assert_eq!(summary.segments, 2);
    assert_eq!(summary.committed_samples, 5);

    let handle = LogReader::open(&path).unwrap();
    assert!(handle.is_indexed());
    let sessions: Vec<_> = handle
        .segments()
        .iter()
        .map(|s| s.metadata.session_id)
        .collect();
    assert_eq!(sessions, vec![first.id(), second.id()]);
    assert_eq!(values(&handle, "ai0"), vec![0.0, 1.0, 2.0, 0.0, 1.0]);
}

#[test]
fn stored_names_are_reconciled_by_physical_id() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("renamed.dqlog");
    let session = Session::start(
        vec![
            ChannelDescriptor::new("ai0", "Temp"),
            ChannelDescriptor::new("ai1", "Pressure"),
        ],
        10.0,
    );
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    writer.write_block(&ramp(session.channels(), 0, 2, 10.0)).unwrap();
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    let configured = vec![
        ChannelDescriptor::new("ai0", "Inlet Temp"),
        ChannelDescriptor::new("ai1", "Pressure"),
    ];
    let discrepancies = handle.reconcile(&configured);
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].physical_id, "ai0");
    assert_eq!(discrepancies[0].stored_name, "Temp");
    assert_eq!(discrepancies[0].configured_name, "Inlet Temp");

    // the stored data stays reachable through the physical channel
    let by_id = handle
        .read_channel_by_physical_id("ai0", ReadRange::All)
        .unwrap()
        .values()
        .unwrap();
    assert_eq!(by_id, vec![0.0, 1.0]);
    assert!(handle.read_channel("Inlet Temp", ReadRange::All).is_err());
}

#[test]
fn duplicate_display_names_are_rejected_before_logging() {
    let registry = ChannelRegistry::new(
        Arc::new(SimulatedDaq::catalog(4)),
        Arc::new(InMemoryScaleStore::new()),
    );
    let err = registry
        .resolve(&[
            ChannelConfig::new("ai0", "Temp"),
            ChannelConfig::new("ai1", "Temp"),
        ])
        .unwrap_err();
    assert_eq!(
        err,
        daq_log::channel::ConfigError::DuplicateDisplayName("Temp".into())
    );
}

#[test]
fn recalibration_applies_per_segment() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("recal.dqlog");
    let calibrated = |gain| {
        vec![ChannelDescriptor::new("ai0", "Temp").with_scale(ScaleTransform::Linear {
            gain,
            offset: 0.0,
        })]
    };
    let mut session = Session::start(calibrated(1.0), 10.0);
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    writer.write_block(&ramp(session.channels(), 0, 2, 10.0)).unwrap();
    session.reconfigure(calibrated(10.0)).unwrap();
    writer.write_block(&ramp(session.channels(), 2, 2, 10.0)).unwrap();
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    assert_eq!(handle.segments().len(), 2);
    assert_eq!(values(&handle, "Temp"), vec![0.0, 1.0, 20.0, 30.0]);
}

#[test]
fn time_ranges_include_samples_on_the_start_boundary() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("boundary.dqlog");
    let session = Session::start(plain_channels(&["ai0"]), 10.0);
    let mut writer = LogWriter::create(&path, manual_flush()).unwrap();
    writer.start_session(&session).unwrap();
    for i in 0..4 {
        writer.write_block(&ramp(session.channels(), i * 8, 8, 10.0)).unwrap();
    }
    writer.close().unwrap();

    let handle = LogReader::open(&path).unwrap();
    let all: Vec<_> = handle
        .read_channel("ai0", ReadRange::All)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    let starts = [0.3, 0.7, 1.1, 1.7, 2.3, 2.9, 3.1]
        .into_iter()
        .chain((0..32).map(|k| k as f64 * 0.1));
    for start in starts {
        for end in [1.1, 2.3, 10.0] {
            let expected: Vec<f64> = all
                .iter()
                .filter(|s| s.timestamp >= start && s.timestamp < end)
                .map(|s| s.value)
                .collect();
            let got = handle
                .read_channel("ai0", ReadRange::Seconds { start, end })
                .unwrap()
                .values()
                .unwrap();
            assert_eq!(got, expected, "range {start}..{end}");
        }
    }
    let from_1_1 = handle
        .read_channel("ai0", ReadRange::Seconds { start: 1.1, end: 10.0 })
        .unwrap()
        .values()
        .unwrap();
    assert_eq!(from_1_1.len(), 21);
    assert_eq!(from_1_1[0], 11.0);
}
