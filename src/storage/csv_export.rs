//! CSV export of a log file.
//!
//! One column per channel from [`LogHandle::list_channels`], preceded by a
//! `Time` column in seconds since session start. Segments are exported in
//! file order; channels absent from a segment are left empty.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use super::reader::LogHandle;
use crate::error::{AppResult, DaqError};

fn export_error(err: csv::Error) -> DaqError {
    DaqError::Export(err.to_string())
}

/// Write the scaled contents of `handle` as CSV. Returns the number of rows.
pub fn export_csv<W: Write>(handle: &LogHandle, out: W) -> AppResult<u64> {
    let channels = handle.list_channels();
    let mut writer = csv::Writer::from_writer(out);

    let mut header = Vec::with_capacity(channels.len() + 1);
    header.push("Time".to_string());
    header.extend(channels.iter().map(|c| c.display_name.clone()));
    writer.write_record(&header).map_err(export_error)?;

    let mut rows = 0u64;
    for segment in handle.segments() {
        let mut columns: Vec<_> = channels
            .iter()
            .map(|c| {
                segment
                    .metadata
                    .channel_position(&c.display_name)
                    .map(|position| handle.segment_channel(segment, position))
            })
            .collect();

        loop {
            let mut time = None;
            let mut row = Vec::with_capacity(channels.len() + 1);
            row.push(String::new());
            for column in columns.iter_mut() {
                match column.as_mut().and_then(Iterator::next) {
                    Some(sample) => {
                        let sample = sample?;
                        time.get_or_insert(sample.timestamp);
                        row.push(sample.value.to_string());
                    }
                    None => row.push(String::new()),
                }
            }
            let Some(time) = time else { break };
            row[0] = time.to_string();
            writer.write_record(&row).map_err(export_error)?;
            rows += 1;
        }
    }

    writer
        .flush()
        .map_err(|e| DaqError::Export(e.to_string()))?;
    Ok(rows)
}

/// Export to a file at `path`.
pub fn export_csv_file(handle: &LogHandle, path: impl AsRef<Path>) -> AppResult<u64> {
    let path = path.as_ref();
    let rows = export_csv(handle, File::create(path)?)?;
    tracing::info!(
        source = %handle.path().display(),
        target = %path.display(),
        rows,
        "Exported log to CSV"
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDescriptor, ScaleTransform};
    use crate::measurement_types::SampleBlock;
    use crate::session::Session;
    use crate::storage::{LogReader, LogWriter, WriterOptions};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn exports_time_and_scaled_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dqlog");
        let mut session = Session::start(
            vec![ChannelDescriptor::new("ai0", "Temp").with_scale(ScaleTransform::Linear {
                gain: 2.0,
                offset: 1.0,
            })],
            1.0,
        );
        let mut writer = LogWriter::create(&path, WriterOptions::default()).unwrap();
        writer.start_session(&session).unwrap();
        let block = SampleBlock::new(
            Duration::ZERO,
            1.0,
            Arc::clone(session.channels()),
            vec![vec![1.0, 2.0]],
        )
        .unwrap();
        writer.write_block(&block).unwrap();

        let channels = session.reconfigure(vec![
            ChannelDescriptor::new("ai0", "Temp"),
            ChannelDescriptor::new("ai1", "Pressure"),
        ])
        .unwrap();
        let block = SampleBlock::new(
            Duration::from_secs(2),
            1.0,
            channels,
            vec![vec![7.0], vec![10.0]],
        )
        .unwrap();
        writer.write_block(&block).unwrap();
        writer.close().unwrap();

        let handle = LogReader::open(&path).unwrap();
        let mut out = Vec::new();
        assert_eq!(export_csv(&handle, &mut out).unwrap(), 3);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Time,Temp,Pressure\n0,3,\n1,5,\n2,7,10\n");
    }
}
