//! Participant process core
//!
//! Every participant runs the same loop: drain its inbound channel, follow
//! the Controller through the protocol state machine, run its own `main`
//! and its routines, forward recorded attributes, publish a heartbeat.

use crate::communication::{ChannelEnd, Message, RpcCall};
use crate::config::{ParticipantSpec, RecordingConfig, StimConfig};
use crate::core::catalog::Catalog;
use crate::core::log_buffer::SharedLogQueue;
use crate::core::routine::{RoutineContext, RoutineSet, TickInputs};
use crate::core::sink::{Recorder, SinkFactory};
use crate::core::state::{ProcessState, ProtocolCursor, SharedState};
use crate::error::{StimError, StimResult};
use crate::params::Params;
use crate::protocol::{Phase, Protocol, ProtocolLibrary};
use crate::registry::Registry;
use crate::scheduling::timing::{measure_min_sleep, now, Ticker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State transitions followed in a single tick at most
const MAX_TRANSITIONS_PER_TICK: usize = 6;

/// Per-process counters, served by the built-in `stats` function
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub ticks: u64,
    pub messages: u64,
    pub routine_errors: u64,
    pub rpc_errors: u64,
    pub hook_errors: u64,
    pub last_tick_ms: f64,
    pub max_tick_ms: f64,
}

/// What a participant sees of its own process
pub struct ProcessContext {
    name: String,
    slot: usize,
    time: f64,
    state: ProcessState,
    registry: Registry,
    shared: SharedState,
    channel: ChannelEnd,
    logs: SharedLogQueue,
    params: Params,
    protocols: ProtocolLibrary,
}

impl ProcessContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Logical time of the current tick
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn protocols(&self) -> &ProtocolLibrary {
        &self.protocols
    }

    pub fn cursor(&self) -> ProtocolCursor {
        self.shared.cursor()
    }

    pub fn controller_state(&self) -> ProcessState {
        self.shared.state(0).unwrap_or(ProcessState::Na)
    }

    /// Send an RPC; the Controller routes it to `call.target`
    pub fn call(&self, call: RpcCall) -> StimResult<()> {
        let call = call.from_sender(self.name.as_str());
        self.channel.send(&Message::Rpc(call))
    }

    pub fn log_info(&self, message: &str) {
        self.logs.emit(&self.name, log::Level::Info, message);
    }

    pub fn log_warning(&self, message: &str) {
        self.logs.emit(&self.name, log::Level::Warn, message);
    }

    pub fn log_error(&self, message: &str) {
        self.logs.emit(&self.name, log::Level::Error, message);
    }

    pub fn log_debug(&self, message: &str) {
        self.logs.emit(&self.name, log::Level::Debug, message);
    }

    fn set_state(&mut self, state: ProcessState) -> StimResult<()> {
        if self.state != state {
            log::debug!("{}: {} -> {}", self.name, self.state, state);
        }
        self.state = state;
        self.shared.set_state(self.slot, state)
    }
}

/// Behaviour specific to one participant.
///
/// Every hook has a no-op default; errors returned from protocol hooks are
/// logged and the state machine moves on.
pub trait Participant: Send {
    fn initialize(&mut self, _ctx: &mut ProcessContext) -> StimResult<()> {
        Ok(())
    }

    fn prepare_protocol(&mut self, _ctx: &mut ProcessContext, _protocol: &Protocol) -> StimResult<()> {
        Ok(())
    }

    fn prepare_phase(&mut self, _ctx: &mut ProcessContext, _index: usize, _phase: &Phase) -> StimResult<()> {
        Ok(())
    }

    fn start_phase(&mut self, _ctx: &mut ProcessContext, _index: usize) -> StimResult<()> {
        Ok(())
    }

    fn end_phase(&mut self, _ctx: &mut ProcessContext, _index: usize) -> StimResult<()> {
        Ok(())
    }

    fn cleanup_protocol(&mut self, _ctx: &mut ProcessContext) -> StimResult<()> {
        Ok(())
    }

    /// Per-tick work, before the routines run. Values put into `inputs`
    /// are visible to every routine of this tick.
    fn main(&mut self, _ctx: &mut ProcessContext, _inputs: &mut TickInputs) -> StimResult<()> {
        Ok(())
    }

    fn property_changed(&mut self, _ctx: &mut ProcessContext, _name: &str, _value: &Value) -> StimResult<()> {
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &mut ProcessContext) -> StimResult<()> {
        Ok(())
    }

    /// Functions this participant exposes by RPC
    fn invoke(&mut self, _ctx: &mut ProcessContext, call: &RpcCall) -> StimResult<Value> {
        Err(StimError::UnknownFunction(call.function.clone()))
    }
}

/// Participant without behaviour of its own; only runs its routines
#[derive(Debug, Default)]
pub struct IdleParticipant;

impl Participant for IdleParticipant {}

pub struct ProcessOptions {
    pub protocols: ProtocolLibrary,
    pub params: Params,
    pub sink: SinkFactory,
    pub recording: RecordingConfig,
}

pub struct ProcessCore {
    ctx: ProcessContext,
    participant: Box<dyn Participant>,
    routines: RoutineSet,
    inputs: TickInputs,
    recorder: Recorder,
    recording: RecordingConfig,
    sink: SinkFactory,
    metrics: ProcessMetrics,
    protocol: Option<Protocol>,
    phase: Option<usize>,
    shutdown_pending: bool,
    started: bool,
    stopped: bool,
}

impl ProcessCore {
    /// Attach to the session as `name` and publish STARTING
    pub fn new(
        name: &str,
        registry: Registry,
        participant: Box<dyn Participant>,
        routines: RoutineSet,
        options: ProcessOptions,
    ) -> StimResult<Self> {
        let slot = registry.slot_of(name)?;
        if slot == 0 {
            return Err(StimError::InvalidInput(format!(
                "'{}' is reserved for the controller",
                name
            )));
        }
        let shared = registry.shared_state()?;
        let channel = registry.participant_channel(name)?;
        let logs = registry.log_queue()?;
        shared.set_pid(slot, std::process::id())?;

        let mut ctx = ProcessContext {
            name: name.to_string(),
            slot,
            time: now(),
            state: ProcessState::Na,
            registry,
            shared,
            channel,
            logs,
            params: options.params,
            protocols: options.protocols,
        };
        ctx.set_state(ProcessState::Starting)?;

        Ok(Self {
            recorder: Recorder::new(name, Arc::clone(&options.sink), Vec::new()),
            ctx,
            participant,
            routines,
            inputs: TickInputs::new(),
            recording: options.recording,
            sink: options.sink,
            metrics: ProcessMetrics::default(),
            protocol: None,
            phase: None,
            shutdown_pending: false,
            started: false,
            stopped: false,
        })
    }

    /// Build the core of participant `spec` from the session config
    pub fn from_config(
        spec: &ParticipantSpec,
        config: &StimConfig,
        registry: Registry,
        catalog: &Catalog,
    ) -> StimResult<Self> {
        let routines = catalog.routine_set(&spec.routines)?;
        let options = ProcessOptions {
            protocols: config.protocol_library()?,
            params: Params::from_map(spec.properties.clone()),
            sink: catalog.sink(),
            recording: config.recording.clone(),
        };
        Self::new(&spec.name, registry, catalog.participant(spec), routines, options)
    }

    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    pub fn state(&self) -> ProcessState {
        self.ctx.state
    }

    pub fn metrics(&self) -> &ProcessMetrics {
        &self.metrics
    }

    pub fn routines(&self) -> &RoutineSet {
        &self.routines
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Initialize routines and participant, then publish IDLE
    pub fn start(&mut self) -> StimResult<()> {
        if self.started {
            return Ok(());
        }
        for routine in self.routines.iter_mut() {
            let name = routine.name().to_string();
            routine
                .initialize(&self.ctx.registry)
                .map_err(|e| StimError::routine(name, e.to_string()))?;
        }
        self.participant.initialize(&mut self.ctx)?;

        let mut flagged = Vec::new();
        for routine in self.routines.iter() {
            for attribute in routine.recorded_attributes() {
                if self.recording.includes(&attribute) {
                    flagged.push((routine.name().to_string(), self.ctx.registry.raw(&attribute)?));
                }
            }
        }
        let flagged_count = flagged.len();
        self.recorder = Recorder::new(self.ctx.name.as_str(), Arc::clone(&self.sink), flagged);

        self.started = true;
        self.ctx.set_state(ProcessState::Idle)?;
        self.ctx.log_info(&format!(
            "started: {} routine(s), {} recorded attribute(s)",
            self.routines.len(),
            flagged_count
        ));
        Ok(())
    }

    /// Tick loop until shutdown; the process is STOPPED on return
    pub fn run(&mut self, interval: Duration, min_sleep: Option<f64>) -> StimResult<()> {
        let result = self.run_loop(interval, min_sleep);
        if let Err(e) = &result {
            self.ctx.log_error(&format!("fatal: {}", e));
            if let Err(shutdown_err) = self.shutdown() {
                log::error!("{}: shutdown after failure: {}", self.ctx.name, shutdown_err);
            }
        }
        result
    }

    fn run_loop(&mut self, interval: Duration, min_sleep: Option<f64>) -> StimResult<()> {
        self.start()?;
        let min_sleep = min_sleep.unwrap_or_else(|| measure_min_sleep(10));
        let mut ticker = Ticker::new(interval, min_sleep);
        while self.tick(now())? {
            ticker.wait();
        }
        Ok(())
    }

    /// One iteration of the loop; `false` once the process has stopped.
    ///
    /// Every queued message is applied first. When one of them (or the shared
    /// flag) asks for shutdown the iteration ends there: the protocol is not
    /// advanced, routines do not run and no heartbeat is written.
    pub fn tick(&mut self, time: f64) -> StimResult<bool> {
        if self.stopped {
            return Ok(false);
        }
        let tick_start = Instant::now();
        self.ctx.time = time;
        self.ctx.registry.clock().set(time);

        for message in self.ctx.channel.drain() {
            self.handle_message(message);
        }
        if self.shutdown_pending || self.ctx.shared.shutdown_requested() {
            self.shutdown()?;
            return Ok(false);
        }

        self.advance_protocol(time)?;
        self.run_main(time)?;
        self.sync_recording();
        self.ctx.shared.beat(self.ctx.slot, time)?;

        let elapsed_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.ticks += 1;
        self.metrics.last_tick_ms = elapsed_ms;
        self.metrics.max_tick_ms = self.metrics.max_tick_ms.max(elapsed_ms);
        Ok(true)
    }

    /// Apply one inbound message. RPC failures are logged, never raised.
    pub fn handle_message(&mut self, message: Message) {
        self.metrics.messages += 1;
        match message {
            Message::Rpc(call) => {
                let result = match catch_unwind(AssertUnwindSafe(|| self.dispatch(&call))) {
                    Ok(result) => result,
                    Err(panic) => Err(StimError::Rpc(format!(
                        "{} panicked: {}",
                        call.function,
                        panic_message(panic.as_ref())
                    ))),
                };
                match result {
                    Ok(value) => {
                        if let Some(reply) = call.reply(&self.ctx.name, value) {
                            if let Err(e) = self.ctx.channel.send(&Message::Rpc(reply)) {
                                self.ctx.log_error(&format!("reply to {} failed: {}", call.sender, e));
                            }
                        }
                    }
                    Err(e) => {
                        self.metrics.rpc_errors += 1;
                        self.ctx
                            .log_error(&format!("rpc {} from {}: {}", call.function, call.sender, e));
                    }
                }
            }
            Message::SetProperty { name, value } => {
                if let Err(e) = self.set_property(&name, value) {
                    self.ctx.log_error(&format!("set_property {}: {}", name, e));
                }
            }
            Message::Shutdown => self.shutdown_pending = true,
        }
    }

    fn dispatch(&mut self, call: &RpcCall) -> StimResult<Value> {
        match call.function.as_str() {
            "ping" => Ok(Value::String(self.ctx.name.clone())),
            "stats" => Ok(serde_json::to_value(&self.metrics)?),
            "set_property" => {
                let name: String = call.get_arg(0)?;
                let value: Value = call.get_arg(1)?;
                self.set_property(&name, value)?;
                Ok(Value::Null)
            }
            qualified if qualified.contains('.') => self.routines.invoke(qualified, call),
            _ => self.participant.invoke(&mut self.ctx, call),
        }
    }

    fn set_property(&mut self, name: &str, value: Value) -> StimResult<()> {
        self.ctx.params.set(name, &value)?;
        self.participant.property_changed(&mut self.ctx, name, &value)
    }

    /// Follow the Controller's state, several transitions per tick if due
    fn advance_protocol(&mut self, time: f64) -> StimResult<()> {
        for _ in 0..MAX_TRANSITIONS_PER_TICK {
            if !self.step_protocol(time)? {
                break;
            }
        }
        Ok(())
    }

    fn step_protocol(&mut self, time: f64) -> StimResult<bool> {
        use ProcessState::*;

        let controller = self.ctx.controller_state();
        let cursor = self.ctx.cursor();
        match (self.ctx.state, controller) {
            (Idle, PrepareProtocol) => {
                self.ctx.set_state(PrepareProtocol)?;
                self.protocol = self.ctx.protocols.get(&cursor.protocol).cloned();
                self.phase = None;
                match self.protocol.clone() {
                    Some(protocol) => {
                        self.call_hook("prepare_protocol", |p, ctx| p.prepare_protocol(ctx, &protocol))?
                    }
                    None => self
                        .ctx
                        .log_error(&format!("unknown protocol '{}'", cursor.protocol)),
                }
                self.ctx.set_state(WaitForPhase)?;
            }
            (WaitForPhase, PreparePhase) => {
                self.ctx.set_state(PreparePhase)?;
                self.phase = cursor.phase_index;
                let phase = self
                    .protocol
                    .as_ref()
                    .zip(cursor.phase_index)
                    .and_then(|(protocol, index)| protocol.phase(index).cloned().map(|p| (index, p)));
                if let Some((index, phase)) = phase {
                    self.call_hook("prepare_phase", |p, ctx| p.prepare_phase(ctx, index, &phase))?;
                }
                self.ctx.set_state(Ready)?;
            }
            (Ready, Running) if cursor.phase_start <= time => {
                self.ctx.set_state(Running)?;
                if let Some(index) = self.phase {
                    self.call_hook("start_phase", |p, ctx| p.start_phase(ctx, index))?;
                }
            }
            (Running, _) if time >= cursor.phase_stop => {
                self.ctx.set_state(PhaseEnd)?;
                if let Some(index) = self.phase {
                    self.call_hook("end_phase", |p, ctx| p.end_phase(ctx, index))?;
                }
            }
            (PhaseEnd, PreparePhase) => self.ctx.set_state(WaitForPhase)?,
            // The phase we prepared for ran out before this process ticked again
            (Ready, PhaseEnd) | (Ready, PreparePhase)
                if controller == PhaseEnd || cursor.phase_index != self.phase =>
            {
                self.ctx.log_warning(&format!(
                    "missed phase {:?} while READY, catching up",
                    self.phase
                ));
                self.ctx.set_state(PhaseEnd)?;
            }
            (PrepareProtocol | WaitForPhase | PreparePhase | Ready | PhaseEnd, ProtocolEnd | Idle) => {
                self.finish_protocol()?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn finish_protocol(&mut self) -> StimResult<()> {
        self.call_hook("cleanup_protocol", |p, ctx| p.cleanup_protocol(ctx))?;
        self.protocol = None;
        self.phase = None;
        self.ctx.set_state(ProcessState::Idle)
    }

    /// Run a participant hook; only fatal errors escape
    fn call_hook<F>(&mut self, hook: &str, f: F) -> StimResult<()>
    where
        F: FnOnce(&mut Box<dyn Participant>, &mut ProcessContext) -> StimResult<()>,
    {
        let participant = &mut self.participant;
        let ctx = &mut self.ctx;
        let result = catch_unwind(AssertUnwindSafe(|| f(participant, ctx)));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => {
                self.metrics.hook_errors += 1;
                self.ctx.log_error(&format!("{} failed: {}", hook, e));
                Ok(())
            }
            Err(panic) => {
                self.metrics.hook_errors += 1;
                self.ctx
                    .log_error(&format!("{} panicked: {}", hook, panic_message(panic.as_ref())));
                Ok(())
            }
        }
    }

    fn run_main(&mut self, time: f64) -> StimResult<()> {
        self.inputs.clear();
        let participant = self.participant.as_mut();
        let ctx = &mut self.ctx;
        let inputs = &mut self.inputs;
        match catch_unwind(AssertUnwindSafe(|| participant.main(ctx, inputs))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                self.metrics.routine_errors += 1;
                self.ctx.log_error(&format!("main failed: {}", e));
            }
            Err(panic) => {
                self.metrics.routine_errors += 1;
                self.ctx
                    .log_error(&format!("main panicked: {}", panic_message(panic.as_ref())));
            }
        }

        let cursor = self.ctx.cursor();
        for index in 0..self.routines.len() {
            let Some(routine) = self.routines.get_mut(index) else {
                break;
            };
            let name = routine.name().to_string();
            let mut routine_ctx = RoutineContext {
                time,
                process: &self.ctx.name,
                state: self.ctx.state,
                cursor: &cursor,
                inputs: &self.inputs,
                registry: &self.ctx.registry,
            };
            let result = catch_unwind(AssertUnwindSafe(|| routine.main(&mut routine_ctx)));
            match result {
                Ok(Ok(())) => self.routines.advance_time(index, time),
                Ok(Err(e)) if e.is_fatal() => return Err(StimError::routine(name, e.to_string())),
                Ok(Err(e)) => {
                    self.metrics.routine_errors += 1;
                    self.ctx.log_error(&format!("{}.main failed: {}", name, e));
                }
                Err(panic) => {
                    self.metrics.routine_errors += 1;
                    self.ctx.log_error(&format!(
                        "{}.main panicked: {}",
                        name,
                        panic_message(panic.as_ref())
                    ));
                }
            }
        }
        Ok(())
    }

    fn sync_recording(&mut self) {
        let active = self.ctx.shared.recording_active();
        let generation = self.ctx.shared.recording_generation();
        let folder = if active {
            self.ctx.shared.recording_folder()
        } else {
            String::new()
        };
        if let Err(e) = self.recorder.sync(active, generation, &folder) {
            self.ctx.log_error(&format!("recording: {}", e));
        }
    }

    /// Stop the process. Safe to call more than once.
    pub fn shutdown(&mut self) -> StimResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // Whatever arrived before the shutdown still gets served
        for message in self.ctx.channel.drain() {
            if !matches!(message, Message::Shutdown) {
                self.handle_message(message);
            }
        }
        if self.protocol.is_some() {
            self.call_hook("cleanup_protocol", |p, ctx| p.cleanup_protocol(ctx))?;
            self.protocol = None;
        }
        self.call_hook("shutdown", |p, ctx| p.shutdown(ctx))?;
        if let Err(e) = self.recorder.stop() {
            self.ctx.log_error(&format!("closing recording: {}", e));
        }
        self.ctx.channel.close_receiving();
        self.ctx.set_state(ProcessState::Stopped)?;
        self.ctx.log_info(&format!("stopped after {} ticks", self.metrics.ticks));
        Ok(())
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Entry point of one participant, in its own thread or process
pub fn run_participant(
    spec: &ParticipantSpec,
    config: &StimConfig,
    registry: Registry,
    catalog: &Catalog,
) -> StimResult<ProcessMetrics> {
    let mut core = ProcessCore::from_config(spec, config, registry, catalog)?;
    let interval = Duration::from_secs_f64(spec.interval_ms.max(0.0) / 1000.0);
    core.run(interval, config.controller.min_sleep_s)?;
    Ok(core.metrics().clone())
}
