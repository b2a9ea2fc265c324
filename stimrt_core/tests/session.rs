use approx::assert_relative_eq;
use std::path::Path;
use std::time::Duration;
use stimrt_core::attribute::{ArrayAttribute, AttributeSpec, Dtype};
use stimrt_core::core::{MemorySink, ProcessState};
use stimrt_core::scheduling::{now, sleep_until, ThreadSpawner};
use stimrt_core::{
    AttributeSetup, Catalog, Controller, ParticipantSpec, Phase, Protocol, Registry, Role, Routine,
    RoutineContext, StimConfig, StimResult,
};

/// Counts its own ticks into the `ticks` attribute
#[derive(Default)]
struct TickCounter {
    ticks: i64,
    output: Option<ArrayAttribute<i64>>,
}

impl Routine for TickCounter {
    fn name(&self) -> &str {
        "TickCounter"
    }

    fn setup(&self, setup: &mut AttributeSetup) -> StimResult<()> {
        setup.declare(AttributeSpec::scalar("ticks", Dtype::I64, 1024))
    }

    fn initialize(&mut self, registry: &Registry) -> StimResult<()> {
        self.output = Some(registry.array("ticks")?);
        Ok(())
    }

    fn main(&mut self, _ctx: &mut RoutineContext<'_>) -> StimResult<()> {
        self.ticks += 1;
        if let Some(output) = &self.output {
            output.write_scalar(self.ticks)?;
        }
        Ok(())
    }

    fn recorded_attributes(&self) -> Vec<String> {
        vec!["ticks".to_string()]
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &Path, participants: &[&str]) -> StimConfig {
    let mut config = StimConfig::default();
    config.session.root = dir.to_path_buf();
    config.controller.min_sleep_s = Some(0.0005);
    config.controller.phase_start_delay_s = 0.01;
    config.controller.shutdown_timeout_s = 2.0;
    config.controller.echo_logs = false;
    for name in participants {
        config
            .participants
            .push(ParticipantSpec::new(*name, Role::Worker).with_interval_ms(1.0));
    }
    config.protocols.push(Protocol::new(
        "three_phase",
        vec![Phase::new(0.02), Phase::new(0.01), Phase::new(0.02)],
    ));
    config
}

fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.register_routine(TickCounter::default).unwrap();
    catalog
}

fn start_session(config: StimConfig, catalog: &Catalog) -> anyhow::Result<Controller> {
    let mut controller = Controller::new(config, catalog)?;
    controller.launch(&ThreadSpawner::new(catalog.clone()))?;
    controller.wait_for_participants(Duration::from_secs(5))?;
    Ok(controller)
}

#[test]
fn protocol_runs_to_completion_and_returns_to_idle() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let catalog = catalog();
    let mut controller = start_session(config(dir.path(), &["display", "camera", "daq"]), &catalog)?;
    assert!(controller
        .participant_states()
        .iter()
        .all(|(_, s)| *s == ProcessState::Idle));

    let started = now();
    controller.run_protocol("three_phase", Duration::from_secs(10))?;
    assert!(now() - started >= 0.05);

    assert_eq!(controller.state(), ProcessState::Idle);
    let cursor = controller.shared().cursor();
    assert!(!cursor.is_active());
    assert_eq!(cursor.phase_index, None);
    assert_eq!(cursor.generation, 1);
    for (name, state) in controller.participant_states() {
        assert_eq!(state, ProcessState::Idle, "{} did not return to IDLE", name);
    }

    // A second run reuses the same session
    controller.run_protocol("three_phase", Duration::from_secs(10))?;
    assert_eq!(controller.shared().cursor().generation, 2);

    let session_dir = controller.registry().session_dir().to_path_buf();
    controller.shutdown()?;
    assert!(controller
        .participant_states()
        .iter()
        .all(|(_, s)| *s == ProcessState::Stopped));
    assert!(!session_dir.exists());
    Ok(())
}

#[test]
fn protocol_without_participants_finishes() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let mut controller = Controller::new(config(dir.path(), &[]), &Catalog::new())?;
    controller.run_protocol("three_phase", Duration::from_secs(5))?;
    assert_eq!(controller.state(), ProcessState::Idle);

    let cursor = controller.shared().cursor();
    assert!(!cursor.is_active());
    assert_relative_eq!(cursor.phase_stop - cursor.phase_start, 0.02, epsilon = 1e-9);
    Ok(())
}

#[test]
fn abort_from_rpc_returns_everyone_to_idle() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let mut config = config(dir.path(), &["display"]);
    config
        .protocols
        .push(Protocol::new("long", vec![Phase::new(30.0)]));
    let mut controller = start_session(config, &Catalog::new())?;

    controller.start_protocol("long")?;
    assert!(controller.start_protocol("three_phase").is_err());
    let deadline = now() + 5.0;
    while controller.state() != ProcessState::Running && now() < deadline {
        controller.tick(now())?;
        sleep_until(now() + 0.001, 0.0005);
    }
    assert_eq!(controller.state(), ProcessState::Running);

    controller.abort_protocol();
    let deadline = now() + 5.0;
    while controller.scheduler().is_active() && now() < deadline {
        controller.tick(now())?;
        sleep_until(now() + 0.001, 0.0005);
    }
    assert!(controller.scheduler().was_aborted());
    assert_eq!(controller.state(), ProcessState::Idle);
    assert_eq!(controller.participant_states()[0].1, ProcessState::Idle);
    controller.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_is_idempotent_with_live_participants() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let mut config = config(dir.path(), &["display", "camera"]);
    config.session.cleanup_on_exit = false;
    let catalog = catalog();
    let mut controller = start_session(config, &catalog)?;
    let session_dir = controller.registry().session_dir().to_path_buf();

    controller.shutdown()?;
    controller.shutdown()?;
    assert!(controller.is_stopped());
    assert!(!controller.tick(now())?);
    assert_eq!(controller.shared().state(0)?, ProcessState::Stopped);
    assert!(controller.shared().shutdown_requested());
    assert!(session_dir.exists());
    Ok(())
}

#[test]
fn recording_forwards_flagged_attributes_to_the_sink() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let recordings = dir.path().join("recordings");
    std::fs::create_dir_all(&recordings)?;

    let sink = MemorySink::new();
    let mut catalog = catalog();
    catalog.with_sink(sink.factory());
    let mut config = config(dir.path(), &["daq"]);
    config.participants[0].routines.push("TickCounter".to_string());
    let mut controller = start_session(config, &catalog)?;

    // The folder must exist before recording can start
    controller.set_recording_folder(&dir.path().join("missing").to_string_lossy())?;
    assert!(controller.start_recording().is_err());
    assert!(!controller.shared().recording_active());

    controller.set_recording_folder(&recordings.to_string_lossy())?;
    controller.start_recording()?;
    let deadline = now() + 0.1;
    while now() < deadline {
        controller.tick(now())?;
        sleep_until(now() + 0.001, 0.0005);
    }
    controller.stop_recording();
    controller.shutdown()?;

    let dataset = sink
        .dataset("TickCounter/ticks")
        .expect("ticks dataset created");
    assert_eq!(dataset.dtype, "i64");
    assert!(!dataset.records.is_empty());
    let values: Vec<i64> = dataset
        .records
        .iter()
        .map(|(_, bytes)| i64::from_ne_bytes(bytes[..8].try_into().unwrap()))
        .collect();
    assert!(values.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(sink.close_count() >= 1);
    Ok(())
}
