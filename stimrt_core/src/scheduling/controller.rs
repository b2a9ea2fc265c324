//! The Controller process
//!
//! Owns the session: it runs routine setup, creates every shared region,
//! starts the participants, relays their messages, sequences protocols and
//! coordinates shutdown.

use crate::communication::{ChannelEnd, Message, RpcCall};
use crate::config::{StimConfig, CONTROLLER_NAME};
use crate::core::catalog::Catalog;
use crate::core::log_buffer::{LogRecord, SharedLogQueue};
use crate::core::routine::AttributeSetup;
use crate::core::state::{ProcessState, SharedState};
use crate::error::{StimError, StimResult};
use crate::protocol::ProtocolLibrary;
use crate::registry::Registry;
use crate::scheduling::scheduler::{ProtocolScheduler, SchedulerConfig, SchedulerEvent};
use crate::scheduling::spawner::{ParticipantHandle, Spawner};
use crate::scheduling::timing::{self, measure_min_sleep, now, sleep_until, Ticker};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Controller {
    config: StimConfig,
    registry: Registry,
    shared: SharedState,
    logs: SharedLogQueue,
    /// Controller ends of the participant channels, by slot
    channels: BTreeMap<usize, ChannelEnd>,
    handles: BTreeMap<usize, Box<dyn ParticipantHandle>>,
    protocols: ProtocolLibrary,
    scheduler: ProtocolScheduler,
    interrupt: Arc<AtomicBool>,
    min_sleep: f64,
    shutdown_requested: bool,
    stopped: bool,
}

impl Controller {
    /// Run routine setup for every participant and create the session
    pub fn new(config: StimConfig, catalog: &Catalog) -> StimResult<Self> {
        config.validate()?;
        let protocols = config.protocol_library()?;
        let names: Vec<String> = config.participants.iter().map(|p| p.name.clone()).collect();
        let mut registry = Registry::new(config.session_dir(), &names, config.session.queue_bytes)?;

        for participant in &config.participants {
            for routine_name in &participant.routines {
                let routine = catalog.routine(routine_name)?;
                let mut setup = AttributeSetup::new(routine_name.as_str());
                routine.setup(&mut setup)?;
                for spec in setup.into_specs() {
                    registry.declare(&participant.name, routine_name, spec)?;
                }
            }
        }

        let handles = registry.create_session()?;
        let shared = handles.shared;
        shared.set_pid(0, std::process::id())?;
        shared.set_state(0, ProcessState::Idle)?;
        if let Some(folder) = &config.recording.folder {
            shared.set_recording_folder(&folder.to_string_lossy())?;
        }

        let min_sleep = config
            .controller
            .min_sleep_s
            .unwrap_or_else(|| measure_min_sleep(20));
        let scheduler = ProtocolScheduler::new(SchedulerConfig {
            phase_start_delay: config.controller.phase_start_delay_s,
            ready_timeout: config.controller.ready_timeout_s,
        });

        let mut controller = Self {
            registry,
            shared,
            logs: handles.logs,
            channels: handles.channels,
            handles: BTreeMap::new(),
            protocols,
            scheduler,
            interrupt: Arc::new(AtomicBool::new(false)),
            min_sleep,
            shutdown_requested: false,
            stopped: false,
            config,
        };
        if controller.config.recording.start_on_launch {
            if let Err(e) = controller.start_recording() {
                log::error!("recording not started: {}", e);
            }
        }
        Ok(controller)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn scheduler(&self) -> &ProtocolScheduler {
        &self.scheduler
    }

    pub fn state(&self) -> ProcessState {
        self.scheduler.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Name and state of every participant, in slot order
    pub fn participant_states(&self) -> Vec<(String, ProcessState)> {
        self.registry
            .participants()
            .iter()
            .enumerate()
            .skip(1)
            .map(|(slot, name)| {
                (
                    name.clone(),
                    self.shared.state(slot).unwrap_or(ProcessState::Na),
                )
            })
            .collect()
    }

    /// Flag checked once per tick; set it to request shutdown
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Route SIGINT/SIGTERM to the interrupt flag
    pub fn install_interrupt_handler(&self) -> StimResult<()> {
        timing::install_interrupt_handler(self.interrupt_flag())
    }

    /// Start every configured participant
    pub fn launch(&mut self, spawner: &dyn Spawner) -> StimResult<()> {
        for spec in &self.config.participants {
            let slot = self.registry.slot_of(&spec.name)?;
            let handle = spawner.spawn(spec, &self.config, &self.registry)?;
            self.handles.insert(slot, handle);
        }
        log::info!("launched {} participant(s)", self.handles.len());
        Ok(())
    }

    /// Tick until every participant has left STARTING
    pub fn wait_for_participants(&mut self, timeout: Duration) -> StimResult<()> {
        let deadline = now() + timeout.as_secs_f64();
        loop {
            self.tick(now())?;
            let starting: Vec<String> = self
                .participant_states()
                .into_iter()
                .filter(|(_, s)| matches!(s, ProcessState::Na | ProcessState::Starting))
                .map(|(name, _)| name)
                .collect();
            if starting.is_empty() {
                return Ok(());
            }
            if now() > deadline {
                return Err(StimError::Internal(format!(
                    "participants not ready after {:?}: {}",
                    timeout,
                    starting.join(", ")
                )));
            }
            self.pause();
        }
    }

    /// Tick loop until shutdown is requested, then shut down
    pub fn run(&mut self) -> StimResult<()> {
        let interval = Duration::from_secs_f64(self.config.controller.tick_interval_ms.max(0.0) / 1000.0);
        let mut ticker = Ticker::new(interval, self.min_sleep);
        while self.tick(now())? {
            if self.scheduler.is_waiting() {
                self.pause();
                ticker.reset();
            } else {
                ticker.wait();
            }
        }
        self.shutdown()
    }

    /// Start `protocol` and tick until it has finished
    pub fn run_protocol(&mut self, protocol: &str, timeout: Duration) -> StimResult<()> {
        self.start_protocol(protocol)?;
        let deadline = now() + timeout.as_secs_f64();
        while self.scheduler.is_active() {
            if !self.tick(now())? {
                return Err(StimError::protocol("shutdown requested during protocol"));
            }
            if now() > deadline {
                self.abort_protocol();
                return Err(StimError::protocol(format!(
                    "'{}' did not finish within {:?}",
                    protocol, timeout
                )));
            }
            self.pause();
        }
        Ok(())
    }

    fn pause(&self) {
        let floor = self.config.controller.readiness_poll_ms.max(0.0) / 1000.0;
        let interval = self.config.controller.tick_interval_ms.max(0.0) / 1000.0;
        sleep_until(now() + floor.max(interval), self.min_sleep);
    }

    /// One Controller iteration; `false` once shutdown has been requested
    pub fn tick(&mut self, time: f64) -> StimResult<bool> {
        if self.stopped {
            return Ok(false);
        }
        self.drain_logs();
        if self.interrupt.load(Ordering::SeqCst) {
            log::info!("interrupt received, shutting down");
            self.shutdown_requested = true;
        }
        if self.shutdown_requested {
            self.shared.request_shutdown();
            return Ok(false);
        }

        self.relay_messages();
        self.reap_participants();

        let live: Vec<ProcessState> = self
            .shared
            .states()
            .into_iter()
            .skip(1)
            .filter(|s| s.is_live())
            .collect();
        if let Some(event) = self.scheduler.step(time, &live) {
            self.apply_event(event);
        }
        self.publish()?;
        self.shared.beat(0, time)?;
        Ok(true)
    }

    fn drain_logs(&self) {
        for record in self.logs.drain() {
            self.emit(&record);
        }
    }

    fn emit(&self, record: &LogRecord) {
        if self.config.controller.echo_logs {
            println!("{}", record.render());
        } else {
            log::log!(target: "stimrt::participant", record.level(), "[{}] {}", record.process, record.message);
        }
    }

    fn relay_messages(&mut self) {
        let mut inbound = Vec::new();
        for (slot, channel) in &self.channels {
            for message in channel.drain() {
                inbound.push((*slot, message));
            }
        }
        for (slot, message) in inbound {
            self.route(slot, message);
        }
    }

    fn route(&mut self, from: usize, message: Message) {
        match message {
            Message::Rpc(call) if call.target == CONTROLLER_NAME => match self.invoke(&call) {
                Ok(value) => {
                    if let Some(reply) = call.reply(CONTROLLER_NAME, value) {
                        self.forward(reply);
                    }
                }
                Err(e) => log::error!("rpc {} from {}: {}", call.function, call.sender, e),
            },
            Message::Rpc(call) => self.forward(call),
            Message::Shutdown => {
                let name = self.registry.participants().get(from).cloned().unwrap_or_default();
                log::info!("{} requested session shutdown", name);
                self.shutdown_requested = true;
            }
            Message::SetProperty { name, .. } => {
                log::warn!("controller has no property '{}'", name);
            }
        }
    }

    /// Deliver an RPC to its target's inbound channel
    fn forward(&self, call: RpcCall) {
        if let Err(e) = self.send_to(&call.target.clone(), &Message::Rpc(call)) {
            log::error!("{}", e);
        }
    }

    /// Send a message to a participant by name
    pub fn send_to(&self, target: &str, message: &Message) -> StimResult<()> {
        let slot = self.registry.slot_of(target)?;
        let channel = self
            .channels
            .get(&slot)
            .ok_or_else(|| StimError::Rpc(format!("no channel to '{}'", target)))?;
        channel
            .send(message)
            .map_err(|e| StimError::Rpc(format!("send to '{}' failed: {}", target, e)))
    }

    /// Functions reachable by RPC with target `controller`
    pub fn invoke(&mut self, call: &RpcCall) -> StimResult<Value> {
        match call.function.as_str() {
            "ping" => Ok(json!(CONTROLLER_NAME)),
            "start_protocol" => {
                let name: String = call.get_arg(0)?;
                self.start_protocol(&name)?;
                Ok(Value::Null)
            }
            "abort_protocol" => {
                self.abort_protocol();
                Ok(Value::Null)
            }
            "start_recording" => {
                self.start_recording()?;
                Ok(Value::Null)
            }
            "stop_recording" => {
                self.stop_recording();
                Ok(Value::Null)
            }
            "set_recording_folder" => {
                let folder: String = call.get_arg(0)?;
                self.set_recording_folder(&folder)?;
                Ok(Value::Null)
            }
            "status" => Ok(self.status()),
            _ => Err(StimError::UnknownFunction(format!(
                "{}.{}",
                CONTROLLER_NAME, call.function
            ))),
        }
    }

    pub fn status(&self) -> Value {
        let participants: BTreeMap<String, String> = self
            .participant_states()
            .into_iter()
            .map(|(name, state)| (name, state.to_string()))
            .collect();
        json!({
            "state": self.scheduler.state().to_string(),
            "protocol": self.scheduler.protocol().map(|p| p.name.clone()),
            "phase": self.scheduler.phase_index(),
            "recording": self.shared.recording_active(),
            "participants": participants,
            "dropped_logs": self.logs.dropped(),
        })
    }

    /// Begin a protocol from the library
    pub fn start_protocol(&mut self, name: &str) -> StimResult<()> {
        let starting: Vec<String> = self
            .participant_states()
            .into_iter()
            .filter(|(_, s)| *s == ProcessState::Starting)
            .map(|(n, _)| n)
            .collect();
        if !starting.is_empty() {
            return Err(StimError::protocol(format!(
                "participants still starting: {}",
                starting.join(", ")
            )));
        }
        let protocol = self
            .protocols
            .get(name)
            .cloned()
            .ok_or_else(|| StimError::protocol(format!("unknown protocol '{}'", name)))?;
        let phases = protocol.phases.len();
        let total = protocol.total_duration();
        self.scheduler.start(protocol, now())?;
        self.shared.begin_protocol(name);
        self.publish()?;
        log::info!("protocol '{}' started: {} phase(s), {:.3} s", name, phases, total);
        Ok(())
    }

    pub fn abort_protocol(&mut self) {
        if !self.scheduler.is_active() {
            return;
        }
        log::warn!("aborting protocol");
        if let Some(event) = self.scheduler.abort(now()) {
            self.apply_event(event);
        }
        if let Err(e) = self.publish() {
            log::error!("publishing abort: {}", e);
        }
    }

    /// Turn recording on; the folder must exist
    pub fn start_recording(&mut self) -> StimResult<()> {
        let folder = self.shared.recording_folder();
        if folder.is_empty() || !Path::new(&folder).is_dir() {
            let err = StimError::RecordingFolderMissing(folder.into());
            log::error!("{}", err);
            return Err(err);
        }
        self.shared.set_recording(true);
        log::info!("recording into {}", folder);
        Ok(())
    }

    pub fn stop_recording(&mut self) {
        if self.shared.recording_active() {
            self.shared.set_recording(false);
            log::info!("recording stopped");
        }
    }

    pub fn set_recording_folder(&mut self, folder: &str) -> StimResult<()> {
        self.shared.set_recording_folder(folder)?;
        log::info!("recording folder set to {}", folder);
        Ok(())
    }

    fn apply_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::PhasePrepared { index } => log::debug!("preparing phase {}", index),
            SchedulerEvent::PhaseStarted { index, start, stop } => {
                log::info!("phase {} runs {:.4} -> {:.4}", index, start, stop)
            }
            SchedulerEvent::PhaseEnded { index } => log::debug!("phase {} ended", index),
            SchedulerEvent::ProtocolEnding { aborted } => {
                log::debug!("protocol ending (aborted: {})", aborted)
            }
            SchedulerEvent::ProtocolFinished { protocol } => {
                self.shared.clear_protocol();
                log::info!("protocol '{}' finished", protocol);
            }
            SchedulerEvent::ReadyTimeout { waited } => {
                let waiting: Vec<String> = self
                    .participant_states()
                    .into_iter()
                    .map(|(name, state)| format!("{}={}", name, state))
                    .collect();
                log::error!(
                    "participants not ready after {:.3} s, aborting protocol ({})",
                    waited,
                    waiting.join(", ")
                );
            }
        }
    }

    /// Cursor first, then the state that makes participants act on it
    fn publish(&self) -> StimResult<()> {
        if self.scheduler.is_active() {
            if let Some(index) = self.scheduler.phase_index() {
                self.shared.set_phase_index(index);
            }
            let (start, stop) = self.scheduler.phase_window();
            self.shared.set_phase_window(start, stop);
        }
        self.shared.set_state(0, self.scheduler.state())
    }

    /// Participants whose thread or process is gone count as STOPPED
    fn reap_participants(&mut self) {
        for (slot, handle) in self.handles.iter_mut() {
            if !handle.is_finished() {
                continue;
            }
            let state = self.shared.state(*slot).unwrap_or(ProcessState::Na);
            if state != ProcessState::Stopped {
                let name = &self.registry.participants()[*slot];
                log::warn!("{} exited in state {}, marking it STOPPED", name, state);
                if let Err(e) = self.shared.set_state(*slot, ProcessState::Stopped) {
                    log::error!("{}", e);
                }
            }
        }
    }

    fn all_stopped(&self) -> bool {
        self.participant_states()
            .iter()
            .all(|(_, s)| matches!(s, ProcessState::Stopped | ProcessState::Na))
    }

    /// Stop every participant, then release the session. Safe to call twice.
    pub fn shutdown(&mut self) -> StimResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        log::info!("shutting down session");

        self.abort_protocol();
        self.shared.request_shutdown();
        for (slot, channel) in &self.channels {
            if let Err(e) = channel.send(&Message::Shutdown) {
                log::debug!("shutdown to slot {}: {}", slot, e);
            }
        }

        let deadline = now() + self.config.controller.shutdown_timeout_s.max(0.0);
        loop {
            self.drain_logs();
            self.reap_participants();
            if self.all_stopped() || now() > deadline {
                break;
            }
            sleep_until(now() + 0.001, self.min_sleep);
        }

        for (slot, name) in self.registry.participants().iter().enumerate().skip(1) {
            let state = self.shared.state(slot).unwrap_or(ProcessState::Na);
            if matches!(state, ProcessState::Stopped | ProcessState::Na) {
                continue;
            }
            log::warn!("{} did not stop in time ({}), forcing STOPPED", name, state);
            if let Some(handle) = self.handles.get_mut(&slot) {
                if let Err(e) = handle.kill() {
                    log::error!("killing {}: {}", name, e);
                }
            }
            self.shared.set_state(slot, ProcessState::Stopped)?;
        }

        for (slot, mut handle) in std::mem::take(&mut self.handles) {
            if !handle.is_finished() {
                continue;
            }
            if let Err(e) = handle.join() {
                log::error!("participant in slot {}: {}", slot, e);
            }
        }
        self.drain_logs();
        self.shared.set_state(0, ProcessState::Stopped)?;

        if self.config.session.cleanup_on_exit {
            self.registry.teardown()?;
        }
        log::info!("session stopped");
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("shutdown on drop: {}", e);
        }
    }
}
