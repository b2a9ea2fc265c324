//! Protocol sequencing on the Controller side.
//!
//! `ProtocolScheduler` holds no handles: it is fed the current time and the
//! states of the live participants and answers with at most one event per
//! step. The Controller publishes its cursor and state to shared memory.

use crate::core::state::ProcessState;
use crate::error::{StimError, StimResult};
use crate::protocol::Protocol;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Delay between "all READY" and the phase start, in seconds
    pub phase_start_delay: f64,
    /// Abort when participants take longer than this to become ready
    pub ready_timeout: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            phase_start_delay: 0.1,
            ready_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    PhasePrepared { index: usize },
    PhaseStarted { index: usize, start: f64, stop: f64 },
    PhaseEnded { index: usize },
    ProtocolEnding { aborted: bool },
    ProtocolFinished { protocol: String },
    ReadyTimeout { waited: f64 },
}

#[derive(Debug, Clone)]
pub struct ProtocolScheduler {
    config: SchedulerConfig,
    state: ProcessState,
    protocol: Option<Protocol>,
    phase_index: Option<usize>,
    phase_start: f64,
    phase_stop: f64,
    generation: u64,
    waiting_since: f64,
    aborted: bool,
}

impl ProtocolScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: ProcessState::Idle,
            protocol: None,
            phase_index: None,
            phase_start: 0.0,
            phase_stop: 0.0,
            generation: 0,
            waiting_since: 0.0,
            aborted: false,
        }
    }

    /// Controller state to publish
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != ProcessState::Idle
    }

    /// Waiting for participants to report readiness
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.state,
            ProcessState::PrepareProtocol | ProcessState::PreparePhase
        )
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    pub fn phase_index(&self) -> Option<usize> {
        self.phase_index
    }

    pub fn phase_window(&self) -> (f64, f64) {
        (self.phase_start, self.phase_stop)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    /// Begin `protocol`; rejected while another one is active
    pub fn start(&mut self, protocol: Protocol, now: f64) -> StimResult<()> {
        if self.is_active() {
            let active = self.protocol.as_ref().map(|p| p.name.as_str()).unwrap_or("");
            return Err(StimError::protocol(format!(
                "cannot start '{}' while '{}' is active",
                protocol.name, active
            )));
        }
        protocol.validate()?;
        self.protocol = Some(protocol);
        self.phase_index = None;
        self.phase_start = 0.0;
        self.phase_stop = 0.0;
        self.generation += 1;
        self.waiting_since = now;
        self.aborted = false;
        self.state = ProcessState::PrepareProtocol;
        Ok(())
    }

    /// Abort the active protocol.
    ///
    /// A running phase is cut short by moving its stop to `now`; otherwise
    /// the protocol goes straight to PROTOCOL_END.
    pub fn abort(&mut self, now: f64) -> Option<SchedulerEvent> {
        match self.state {
            ProcessState::Running => {
                self.aborted = true;
                self.phase_stop = self.phase_stop.min(now);
                None
            }
            ProcessState::PrepareProtocol | ProcessState::PreparePhase | ProcessState::PhaseEnd => {
                self.aborted = true;
                self.state = ProcessState::ProtocolEnd;
                Some(SchedulerEvent::ProtocolEnding { aborted: true })
            }
            _ => None,
        }
    }

    /// Advance by at most one transition.
    ///
    /// `participants` holds the states of the participants taking part in
    /// readiness checks (those past STARTING and not STOPPED).
    pub fn step(&mut self, now: f64, participants: &[ProcessState]) -> Option<SchedulerEvent> {
        let all = |state: ProcessState| participants.iter().all(|s| *s == state);
        match self.state {
            ProcessState::PrepareProtocol => {
                if all(ProcessState::WaitForPhase) {
                    Some(self.prepare_phase(0, now))
                } else {
                    self.check_ready_timeout(now)
                }
            }
            ProcessState::PreparePhase => {
                if all(ProcessState::Ready) {
                    let index = self.phase_index.unwrap_or(0);
                    let duration = self.current_duration();
                    self.phase_start = now + self.config.phase_start_delay;
                    self.phase_stop = self.phase_start + duration;
                    self.state = ProcessState::Running;
                    Some(SchedulerEvent::PhaseStarted {
                        index,
                        start: self.phase_start,
                        stop: self.phase_stop,
                    })
                } else {
                    self.check_ready_timeout(now)
                }
            }
            ProcessState::Running if now >= self.phase_stop => {
                self.state = ProcessState::PhaseEnd;
                self.waiting_since = now;
                Some(SchedulerEvent::PhaseEnded {
                    index: self.phase_index.unwrap_or(0),
                })
            }
            ProcessState::PhaseEnd => {
                let next = self.phase_index.map_or(0, |i| i + 1);
                let phases = self.protocol.as_ref().map_or(0, |p| p.phases.len());
                if !self.aborted && next < phases {
                    // Everyone must have left the finished phase before the next is prepared
                    let in_phase = participants
                        .iter()
                        .any(|s| matches!(s, ProcessState::Ready | ProcessState::Running));
                    if in_phase {
                        self.check_ready_timeout(now)
                    } else {
                        Some(self.prepare_phase(next, now))
                    }
                } else {
                    self.state = ProcessState::ProtocolEnd;
                    Some(SchedulerEvent::ProtocolEnding {
                        aborted: self.aborted,
                    })
                }
            }
            ProcessState::ProtocolEnd if all(ProcessState::Idle) => {
                let protocol = self.protocol.take().map(|p| p.name).unwrap_or_default();
                self.phase_index = None;
                self.state = ProcessState::Idle;
                Some(SchedulerEvent::ProtocolFinished { protocol })
            }
            _ => None,
        }
    }

    fn prepare_phase(&mut self, index: usize, now: f64) -> SchedulerEvent {
        self.phase_index = Some(index);
        self.waiting_since = now;
        self.state = ProcessState::PreparePhase;
        SchedulerEvent::PhasePrepared { index }
    }

    fn current_duration(&self) -> f64 {
        self.protocol
            .as_ref()
            .zip(self.phase_index)
            .and_then(|(p, i)| p.phase(i))
            .map_or(0.0, |phase| phase.duration)
    }

    fn check_ready_timeout(&mut self, now: f64) -> Option<SchedulerEvent> {
        let timeout = self.config.ready_timeout?;
        let waited = now - self.waiting_since;
        if waited <= timeout {
            return None;
        }
        self.aborted = true;
        self.state = ProcessState::ProtocolEnd;
        Some(SchedulerEvent::ReadyTimeout { waited })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Phase;
    use ProcessState::*;

    fn two_phase() -> Protocol {
        Protocol::new("two", vec![Phase::new(1.0), Phase::new(0.5)])
    }

    #[test]
    fn test_full_cycle_with_instant_participants() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig::default());
        scheduler.start(two_phase(), 0.0).unwrap();
        assert_eq!(scheduler.state(), PrepareProtocol);
        assert_eq!(scheduler.step(0.0, &[Idle]), None);

        assert_eq!(
            scheduler.step(0.0, &[WaitForPhase]),
            Some(SchedulerEvent::PhasePrepared { index: 0 })
        );
        let started = scheduler.step(0.0, &[Ready]);
        assert!(matches!(started, Some(SchedulerEvent::PhaseStarted { index: 0, .. })));
        let (start, stop) = scheduler.phase_window();
        assert!((start - 0.1).abs() < 1e-9);
        assert!((stop - 1.1).abs() < 1e-9);

        assert_eq!(scheduler.step(1.0, &[Running]), None);
        assert_eq!(
            scheduler.step(stop, &[Running]),
            Some(SchedulerEvent::PhaseEnded { index: 0 })
        );
        assert_eq!(
            scheduler.step(stop, &[PhaseEnd]),
            Some(SchedulerEvent::PhasePrepared { index: 1 })
        );
        scheduler.step(stop, &[Ready]);
        let (start, stop) = scheduler.phase_window();
        assert!(start >= 1.1);
        assert!((stop - start - 0.5).abs() < 1e-9);

        scheduler.step(stop, &[Running]);
        assert_eq!(
            scheduler.step(stop, &[PhaseEnd]),
            Some(SchedulerEvent::ProtocolEnding { aborted: false })
        );
        assert_eq!(scheduler.step(stop, &[PhaseEnd]), None);
        assert_eq!(
            scheduler.step(stop, &[Idle]),
            Some(SchedulerEvent::ProtocolFinished {
                protocol: "two".into()
            })
        );
        assert!(stop >= 1.6);
        assert!(!scheduler.is_active());
        assert!(scheduler.protocol().is_none());
    }

    #[test]
    fn test_next_phase_waits_for_stale_participants() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig::default());
        scheduler.start(two_phase(), 0.0).unwrap();
        scheduler.step(0.0, &[WaitForPhase, WaitForPhase]);
        scheduler.step(0.0, &[Ready, Ready]);
        let (_, stop) = scheduler.phase_window();
        scheduler.step(stop, &[Running, Ready]);
        assert_eq!(scheduler.state(), PhaseEnd);

        // One participant never saw phase 0 start and still reports READY
        assert_eq!(scheduler.step(stop, &[PhaseEnd, Ready]), None);
        assert_eq!(scheduler.state(), PhaseEnd);
        assert_eq!(
            scheduler.step(stop, &[PhaseEnd, PhaseEnd]),
            Some(SchedulerEvent::PhasePrepared { index: 1 })
        );
        assert_eq!(scheduler.step(stop, &[WaitForPhase, Ready]), None);
        assert_eq!(scheduler.state(), PreparePhase);
    }

    #[test]
    fn test_rejects_second_protocol() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig::default());
        scheduler.start(two_phase(), 0.0).unwrap();
        assert!(scheduler.start(two_phase(), 0.0).is_err());
        assert!(ProtocolScheduler::new(SchedulerConfig::default())
            .start(Protocol::new("empty", vec![]), 0.0)
            .is_err());
    }

    #[test]
    fn test_abort_running_phase() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig::default());
        scheduler.start(two_phase(), 0.0).unwrap();
        scheduler.step(0.0, &[WaitForPhase]);
        scheduler.step(0.0, &[Ready]);

        assert_eq!(scheduler.abort(0.5), None);
        assert_eq!(scheduler.phase_window().1, 0.5);
        assert_eq!(
            scheduler.step(0.5, &[Running]),
            Some(SchedulerEvent::PhaseEnded { index: 0 })
        );
        assert_eq!(
            scheduler.step(0.5, &[PhaseEnd]),
            Some(SchedulerEvent::ProtocolEnding { aborted: true })
        );
        assert!(scheduler.was_aborted());
    }

    #[test]
    fn test_abort_while_preparing() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig::default());
        scheduler.start(two_phase(), 0.0).unwrap();
        assert_eq!(
            scheduler.abort(0.0),
            Some(SchedulerEvent::ProtocolEnding { aborted: true })
        );
        assert_eq!(scheduler.state(), ProtocolEnd);
        assert_eq!(scheduler.abort(0.0), None);
    }

    #[test]
    fn test_ready_timeout_aborts() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig {
            phase_start_delay: 0.1,
            ready_timeout: Some(2.0),
        });
        scheduler.start(two_phase(), 0.0).unwrap();
        assert_eq!(scheduler.step(1.0, &[Idle]), None);
        assert!(matches!(
            scheduler.step(2.5, &[Idle]),
            Some(SchedulerEvent::ReadyTimeout { .. })
        ));
        assert_eq!(scheduler.state(), ProtocolEnd);
    }

    #[test]
    fn test_no_live_participants() {
        let mut scheduler = ProtocolScheduler::new(SchedulerConfig::default());
        scheduler.start(Protocol::new("one", vec![Phase::new(0.2)]), 0.0).unwrap();
        let mut events = 0;
        let mut t = 0.0;
        while scheduler.is_active() && t < 1.0 {
            if scheduler.step(t, &[]).is_some() {
                events += 1;
            }
            t += 0.05;
        }
        assert!(!scheduler.is_active());
        assert_eq!(events, 5);
    }
}
