//! Ready-made routines, participants and a file sink
//!
//! Enough to run a session from a config file without writing code:
//! `SineWave` and `PhaseMarker` produce attributes, `AutoStart` lets a gui
//! participant kick off a protocol, and `JsonlSink` writes recordings to
//! disk as JSON lines.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stimrt_core::attribute::{ArrayAttribute, AttributeSpec, Dtype, ObjectAttribute};
use stimrt_core::communication::RpcCall;
use stimrt_core::config::{Role, CONTROLLER_NAME};
use stimrt_core::core::{
    AttributeSetup, Catalog, DurableSink, ExposedTable, Participant, ProcessContext,
    ProcessState, Routine, RoutineContext, SinkFactory, TickInputs,
};
use stimrt_core::error::{StimError, StimResult};
use stimrt_core::registry::Registry;

pub const SINE_ATTRIBUTE: &str = "sine";
pub const PHASE_MARKER_ATTRIBUTE: &str = "phase_marker";

/// Writes `sin(2*pi*f*t)` every tick
pub struct SineWave {
    frequency: f64,
    output: Option<ArrayAttribute<f64>>,
}

impl Default for SineWave {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            output: None,
        }
    }
}

impl Routine for SineWave {
    fn name(&self) -> &str {
        "SineWave"
    }

    fn setup(&self, setup: &mut AttributeSetup) -> StimResult<()> {
        setup.declare(AttributeSpec::scalar(SINE_ATTRIBUTE, Dtype::F64, 4096))
    }

    fn initialize(&mut self, registry: &Registry) -> StimResult<()> {
        self.output = Some(registry.array(SINE_ATTRIBUTE)?);
        Ok(())
    }

    fn main(&mut self, ctx: &mut RoutineContext<'_>) -> StimResult<()> {
        let value = (std::f64::consts::TAU * self.frequency * ctx.time).sin();
        if let Some(output) = &self.output {
            output.write_scalar(value)?;
        }
        Ok(())
    }

    fn recorded_attributes(&self) -> Vec<String> {
        vec![SINE_ATTRIBUTE.to_string()]
    }

    fn expose(table: &mut ExposedTable<Self>) {
        table.register("set_frequency", |routine, call| {
            let frequency: f64 = call.get_arg(0)?;
            if !frequency.is_finite() || frequency < 0.0 {
                return Err(StimError::InvalidInput(format!(
                    "frequency must be a non-negative number, got {}",
                    frequency
                )));
            }
            routine.frequency = frequency;
            Ok(json!(frequency))
        });
        table.register("frequency", |routine, _| Ok(json!(routine.frequency)));
    }
}

/// Where the process stands in the protocol, as seen by one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMark {
    pub protocol: String,
    pub phase: Option<usize>,
    pub state: ProcessState,
}

/// Records every change of the process state together with the cursor
#[derive(Default)]
pub struct PhaseMarker {
    last: Option<PhaseMark>,
    output: Option<ObjectAttribute<PhaseMark>>,
}

impl Routine for PhaseMarker {
    fn name(&self) -> &str {
        "PhaseMarker"
    }

    fn setup(&self, setup: &mut AttributeSetup) -> StimResult<()> {
        setup.declare(AttributeSpec::object(PHASE_MARKER_ATTRIBUTE, 256, 256))
    }

    fn initialize(&mut self, registry: &Registry) -> StimResult<()> {
        self.output = Some(registry.object(PHASE_MARKER_ATTRIBUTE)?);
        Ok(())
    }

    fn main(&mut self, ctx: &mut RoutineContext<'_>) -> StimResult<()> {
        let mark = PhaseMark {
            protocol: ctx.cursor.protocol.clone(),
            phase: ctx.cursor.phase_index,
            state: ctx.state,
        };
        if self.last.as_ref() == Some(&mark) {
            return Ok(());
        }
        if let Some(output) = &self.output {
            output.write(&mark)?;
        }
        self.last = Some(mark);
        Ok(())
    }

    fn recorded_attributes(&self) -> Vec<String> {
        vec![PHASE_MARKER_ATTRIBUTE.to_string()]
    }
}

/// Asks the Controller to start the protocol named by the `autostart`
/// property, `autostart_delay_s` seconds after the first tick.
#[derive(Debug, Default)]
pub struct AutoStart {
    first_tick: Option<f64>,
    requested: bool,
}

impl Participant for AutoStart {
    fn main(&mut self, ctx: &mut ProcessContext, _inputs: &mut TickInputs) -> StimResult<()> {
        if self.requested {
            return Ok(());
        }
        let Some(protocol) = ctx.params().get::<String>("autostart") else {
            return Ok(());
        };
        let first = *self.first_tick.get_or_insert(ctx.time());
        let delay = ctx.params().get_f64("autostart_delay_s", 1.0);
        if ctx.time() - first < delay {
            return Ok(());
        }
        self.requested = true;
        ctx.log_info(&format!("requesting protocol '{}'", protocol));
        ctx.call(RpcCall::new(CONTROLLER_NAME, "start_protocol").arg(protocol)?)
    }

    fn cleanup_protocol(&mut self, ctx: &mut ProcessContext) -> StimResult<()> {
        ctx.log_info("protocol finished");
        Ok(())
    }
}

/// Sink writing one `.jsonl` file per dataset under
/// `<folder>/<process>/<routine>.<attribute>.jsonl`.
///
/// Each dataset starts with a header line describing shape and dtype,
/// followed by one `{"time", "value"}` line per record.
pub struct JsonlSink {
    dir: PathBuf,
    files: HashMap<String, BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(folder: &Path, process: &str) -> StimResult<Self> {
        let dir = folder.join(process);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: HashMap::new(),
        })
    }

    pub fn factory() -> SinkFactory {
        Arc::new(|folder: &Path, process: &str| {
            Ok(Box::new(JsonlSink::create(folder, process)?) as Box<dyn DurableSink>)
        })
    }

    fn write_line(&mut self, path: &str, line: &Value) -> StimResult<()> {
        let file = self
            .files
            .get_mut(path)
            .ok_or_else(|| StimError::InvalidInput(format!("unknown dataset '{}'", path)))?;
        serde_json::to_writer(&mut *file, line)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

impl DurableSink for JsonlSink {
    fn create_dataset(&mut self, routine: &str, attribute: &str, shape: &[usize], dtype: &str) -> StimResult<String> {
        let path = format!("{}.{}", routine, attribute);
        let file = File::create(self.dir.join(format!("{}.jsonl", path)))?;
        self.files.insert(path.clone(), BufWriter::new(file));
        self.write_line(
            &path,
            &json!({ "routine": routine, "attribute": attribute, "shape": shape, "dtype": dtype }),
        )?;
        Ok(path)
    }

    fn append(&mut self, path: &str, value: &[u8], timestamp: f64) -> StimResult<()> {
        self.write_line(path, &json!({ "time": timestamp, "value": value }))
    }

    fn close(&mut self) -> StimResult<()> {
        for (_, mut file) in self.files.drain() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Catalog with every built-in routine, `AutoStart` for gui participants and
/// the JSON lines sink
pub fn catalog() -> StimResult<Catalog> {
    let mut catalog = Catalog::new();
    catalog.register_routine(SineWave::default)?;
    catalog.register_routine(PhaseMarker::default)?;
    catalog
        .register_role(Role::Gui, |_| AutoStart::default())
        .with_sink(JsonlSink::factory());
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stimrt_core::core::{RoutineEntry, RoutineSlot};

    #[test]
    fn test_catalog_contents() {
        let catalog = catalog().unwrap();
        let names: Vec<&str> = catalog.routine_names().collect();
        assert_eq!(names, vec!["PhaseMarker", "SineWave"]);
    }

    #[test]
    fn test_sine_wave_frequency_rpc() {
        let mut entry = RoutineEntry::new(SineWave::default()).unwrap();
        let call = RpcCall::new("display", "SineWave.set_frequency").arg(2.0).unwrap();
        assert_eq!(entry.invoke("set_frequency", &call).unwrap(), json!(2.0));
        let bad = RpcCall::new("display", "SineWave.set_frequency").arg(-1.0).unwrap();
        assert!(entry.invoke("set_frequency", &bad).is_err());
        assert_eq!(entry.invoke("frequency", &call).unwrap(), json!(2.0));
    }

    #[test]
    fn test_jsonl_sink_writes_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path(), "display").unwrap();
        let path = sink.create_dataset("SineWave", "sine", &[1], "f64").unwrap();
        sink.append(&path, &1.5f64.to_ne_bytes(), 0.25).unwrap();
        sink.close().unwrap();

        let text = fs::read_to_string(dir.path().join("display").join("SineWave.sine.jsonl")).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["dtype"], json!("f64"));
        assert_eq!(lines[1]["time"], json!(0.25));
        assert_eq!(lines[1]["value"].as_array().unwrap().len(), 8);
        assert!(sink.append(&path, &[0], 1.0).is_err());
    }
}
