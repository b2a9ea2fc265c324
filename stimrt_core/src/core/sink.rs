//! Durable sink boundary
//!
//! The runtime never persists anything itself. While recording is on, each
//! process forwards the new records of its flagged attributes to a sink
//! created for the recording folder.

use crate::attribute::RawAttribute;
use crate::error::StimResult;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// External storage for recorded attributes.
///
/// `append` is never called concurrently for the same dataset path.
pub trait DurableSink: Send {
    /// Called once per recording start; returns the dataset path
    fn create_dataset(
        &mut self,
        routine: &str,
        attribute: &str,
        shape: &[usize],
        dtype: &str,
    ) -> StimResult<String>;

    fn append(&mut self, path: &str, value: &[u8], timestamp: f64) -> StimResult<()>;

    fn close(&mut self) -> StimResult<()> {
        Ok(())
    }
}

/// Builds a sink for `(recording folder, process name)`
pub type SinkFactory = Arc<dyn Fn(&Path, &str) -> StimResult<Box<dyn DurableSink>> + Send + Sync>;

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl DurableSink for NullSink {
    fn create_dataset(&mut self, routine: &str, attribute: &str, _: &[usize], _: &str) -> StimResult<String> {
        Ok(format!("{}/{}", routine, attribute))
    }

    fn append(&mut self, _path: &str, _value: &[u8], _timestamp: f64) -> StimResult<()> {
        Ok(())
    }
}

pub fn null_sink_factory() -> SinkFactory {
    Arc::new(|_: &Path, _: &str| Ok(Box::new(NullSink) as Box<dyn DurableSink>))
}

/// Dataset captured by a [`MemorySink`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub records: Vec<(f64, Vec<u8>)>,
}

/// In-memory sink; clones share the captured datasets
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    folder: PathBuf,
    datasets: Arc<Mutex<BTreeMap<String, Dataset>>>,
    closed: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(&self, path: &str) -> Option<Dataset> {
        self.datasets.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.datasets.lock().keys().cloned().collect()
    }

    pub fn close_count(&self) -> usize {
        *self.closed.lock()
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Factory handing out handles that all write into this sink
    pub fn factory(&self) -> SinkFactory {
        let sink = self.clone();
        Arc::new(move |folder: &Path, _: &str| {
            let mut handle = sink.clone();
            handle.folder = folder.to_path_buf();
            Ok(Box::new(handle) as Box<dyn DurableSink>)
        })
    }
}

impl DurableSink for MemorySink {
    fn create_dataset(&mut self, routine: &str, attribute: &str, shape: &[usize], dtype: &str) -> StimResult<String> {
        let path = format!("{}/{}", routine, attribute);
        self.datasets.lock().insert(
            path.clone(),
            Dataset {
                shape: shape.to_vec(),
                dtype: dtype.to_string(),
                records: Vec::new(),
            },
        );
        Ok(path)
    }

    fn append(&mut self, path: &str, value: &[u8], timestamp: f64) -> StimResult<()> {
        self.datasets
            .lock()
            .entry(path.to_string())
            .or_default()
            .records
            .push((timestamp, value.to_vec()));
        Ok(())
    }

    fn close(&mut self) -> StimResult<()> {
        *self.closed.lock() += 1;
        Ok(())
    }
}

struct Tracked {
    routine: String,
    attribute: RawAttribute,
    path: String,
    next_index: u64,
}

/// Forwards new attribute records to the sink while recording is active
pub struct Recorder {
    process: String,
    factory: SinkFactory,
    flagged: Vec<(String, RawAttribute)>,
    sink: Option<Box<dyn DurableSink>>,
    tracked: Vec<Tracked>,
    generation: u64,
    /// Generation whose start failed; not retried until the generation changes
    failed_generation: Option<u64>,
    forwarded: u64,
}

impl Recorder {
    /// `flagged` holds `(routine, attribute)` pairs selected for capture
    pub fn new(process: impl Into<String>, factory: SinkFactory, flagged: Vec<(String, RawAttribute)>) -> Self {
        Self {
            process: process.into(),
            factory,
            flagged,
            sink: None,
            tracked: Vec::new(),
            generation: 0,
            failed_generation: None,
            forwarded: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.sink.is_some()
    }

    /// Records forwarded since creation
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Bring the recorder in line with the shared recording flag, then forward
    pub fn sync(&mut self, active: bool, generation: u64, folder: &str) -> StimResult<()> {
        if active && (self.sink.is_none() || generation != self.generation) {
            if self.sink.is_none() && self.failed_generation == Some(generation) {
                return Ok(());
            }
            self.stop()?;
            if let Err(e) = self.start(generation, Path::new(folder)) {
                self.failed_generation = Some(generation);
                return Err(e);
            }
            self.failed_generation = None;
        } else if !active && self.sink.is_some() {
            self.stop()?;
        }
        self.forward()
    }

    fn start(&mut self, generation: u64, folder: &Path) -> StimResult<()> {
        let mut sink = (self.factory)(folder, &self.process)?;
        let mut tracked = Vec::with_capacity(self.flagged.len());
        for (routine, attribute) in &self.flagged {
            let path = sink.create_dataset(
                routine,
                attribute.name(),
                &attribute.shape(),
                attribute.dtype_name(),
            )?;
            tracked.push(Tracked {
                routine: routine.clone(),
                attribute: attribute.clone(),
                path,
                next_index: attribute.write_index(),
            });
        }
        log::debug!(
            "{}: recording {} attribute(s) into {}",
            self.process,
            tracked.len(),
            folder.display()
        );
        self.sink = Some(sink);
        self.tracked = tracked;
        self.generation = generation;
        Ok(())
    }

    /// Forward every record written since the last call
    pub fn forward(&mut self) -> StimResult<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        for tracked in &mut self.tracked {
            let (records, next, skipped) = tracked.attribute.read_since(tracked.next_index)?;
            if skipped > 0 {
                log::warn!(
                    "{}: {}.{} lost {} record(s) before they could be recorded",
                    self.process,
                    tracked.routine,
                    tracked.attribute.name(),
                    skipped
                );
            }
            for record in &records {
                sink.append(&tracked.path, &record.bytes, record.time)?;
                tracked.next_index = record.index + 1;
                self.forwarded += 1;
            }
            tracked.next_index = tracked.next_index.max(next);
        }
        Ok(())
    }

    pub fn stop(&mut self) -> StimResult<()> {
        if let Some(mut sink) = self.sink.take() {
            self.tracked.clear();
            sink.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{ArrayAttribute, AttributeSpec, Dtype, LogicalClock, RingCore};

    #[test]
    fn test_recorder_forwards_only_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let core = Arc::new(
            RingCore::create(dir.path(), &AttributeSpec::scalar("phase", Dtype::F64, 4)).unwrap(),
        );
        let attr = ArrayAttribute::<f64>::new(Arc::clone(&core), LogicalClock::new()).unwrap();
        let sink = MemorySink::new();
        let mut recorder = Recorder::new(
            "display",
            sink.factory(),
            vec![("Grating".to_string(), RawAttribute::new(core))],
        );

        attr.write_at(&[0.0], 0.0).unwrap();
        recorder.sync(false, 0, "").unwrap();
        assert!(!recorder.is_recording());

        recorder.sync(true, 1, "/tmp/rec").unwrap();
        assert_eq!(sink.paths(), vec!["Grating/phase".to_string()]);
        attr.write_at(&[1.0], 1.0).unwrap();
        attr.write_at(&[2.0], 2.0).unwrap();
        recorder.sync(true, 1, "/tmp/rec").unwrap();

        let dataset = sink.dataset("Grating/phase").unwrap();
        assert_eq!(dataset.dtype, "f64");
        assert_eq!(dataset.records.len(), 2);
        assert_eq!(dataset.records[1].0, 2.0);
        assert_eq!(dataset.records[1].1, 2.0f64.to_ne_bytes().to_vec());

        recorder.sync(false, 1, "").unwrap();
        attr.write_at(&[3.0], 3.0).unwrap();
        recorder.sync(false, 1, "").unwrap();
        assert_eq!(sink.dataset("Grating/phase").unwrap().records.len(), 2);
        assert_eq!(sink.close_count(), 1);
        assert_eq!(recorder.forwarded(), 2);
    }

    /// Fails the `fail_at`-th append once, then delegates to a MemorySink
    struct FlakySink {
        inner: MemorySink,
        appends: usize,
        fail_at: usize,
    }

    impl DurableSink for FlakySink {
        fn create_dataset(&mut self, routine: &str, attribute: &str, shape: &[usize], dtype: &str) -> StimResult<String> {
            self.inner.create_dataset(routine, attribute, shape, dtype)
        }

        fn append(&mut self, path: &str, value: &[u8], timestamp: f64) -> StimResult<()> {
            self.appends += 1;
            if self.appends == self.fail_at {
                return Err(crate::error::StimError::Internal("disk full".into()));
            }
            self.inner.append(path, value, timestamp)
        }
    }

    fn scalar_ring(dir: &Path) -> (ArrayAttribute<f64>, RawAttribute) {
        let core = Arc::new(
            RingCore::create(dir, &AttributeSpec::scalar("phase", Dtype::F64, 8)).unwrap(),
        );
        let attr = ArrayAttribute::<f64>::new(Arc::clone(&core), LogicalClock::new()).unwrap();
        (attr, RawAttribute::new(core))
    }

    #[test]
    fn test_failed_append_is_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let (attr, raw) = scalar_ring(dir.path());
        let memory = MemorySink::new();
        let inner = memory.clone();
        let factory: SinkFactory = Arc::new(move |_: &Path, _: &str| {
            Ok(Box::new(FlakySink {
                inner: inner.clone(),
                appends: 0,
                fail_at: 2,
            }) as Box<dyn DurableSink>)
        });
        let mut recorder = Recorder::new("display", factory, vec![("Grating".to_string(), raw)]);

        recorder.sync(true, 1, "/tmp/rec").unwrap();
        attr.write_at(&[1.0], 1.0).unwrap();
        attr.write_at(&[2.0], 2.0).unwrap();
        assert!(recorder.sync(true, 1, "/tmp/rec").is_err());
        recorder.sync(true, 1, "/tmp/rec").unwrap();

        let times: Vec<f64> = memory
            .dataset("Grating/phase")
            .unwrap()
            .records
            .iter()
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(times, vec![1.0, 2.0]);
        assert_eq!(recorder.forwarded(), 2);
    }

    #[test]
    fn test_failed_start_waits_for_next_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (_attr, raw) = scalar_ring(dir.path());
        let attempts = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&attempts);
        let factory: SinkFactory = Arc::new(move |_: &Path, _: &str| {
            let mut attempts = counter.lock();
            *attempts += 1;
            if *attempts == 1 {
                Err(crate::error::StimError::Internal("folder vanished".into()))
            } else {
                Ok(Box::new(NullSink) as Box<dyn DurableSink>)
            }
        });
        let mut recorder = Recorder::new("display", factory, vec![("Grating".to_string(), raw)]);

        assert!(recorder.sync(true, 1, "/tmp/rec").is_err());
        recorder.sync(true, 1, "/tmp/rec").unwrap();
        recorder.sync(true, 1, "/tmp/rec").unwrap();
        assert!(!recorder.is_recording());
        assert_eq!(*attempts.lock(), 1);

        recorder.sync(true, 2, "/tmp/rec").unwrap();
        assert!(recorder.is_recording());
        assert_eq!(*attempts.lock(), 2);
    }
}
