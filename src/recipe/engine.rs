//! Timed recipe run engine.
//!
//! The run is modeled as a tagged state machine whose transitions are pure:
//! [`transition`] maps `(state, event)` to `(state, effects)`, and the engine
//! interprets the effects (setpoint writes into the device's write intent,
//! timer arming, activity lines). The timer task is the only asynchronous
//! piece; everything decision-shaped is testable without time.
//!
//! The engine never touches the transport. Setpoints land in the
//! [`crate::device::WriteIntent`] and ride out on the next dispatch cycle.

use crate::device::{Limits, RotationLimits, SharedDevice, SharedIntent};
use crate::measurement::ActivityLog;
use crate::recipe::step::{expand, parse_table, ExpandedStep};
use crate::recipe::RecipeError;
use crate::config::RecipeConfig;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator pressed stop
    User,
    /// Device-level safety stop
    Safety,
    /// Control mode switched (e.g. into or out of external control)
    ModeSwitch,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::User => write!(f, "user stop"),
            StopReason::Safety => write!(f, "safety stop"),
            StopReason::ModeSwitch => write!(f, "control mode switch"),
        }
    }
}

/// Run lifecycle: Idle → Running → (Completed | Aborted).
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running {
        steps: Vec<ExpandedStep>,
        index: usize,
    },
    Completed,
    Aborted {
        reason: String,
    },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running { .. })
    }
}

/// Events driving the state machine.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Start { steps: Vec<ExpandedStep> },
    TimerElapsed,
    Stop { reason: StopReason },
}

/// Effects the engine interprets after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write this value into the device's write intent
    WriteSetpoint { value: f64 },
    /// Issue a prioritized stop ahead of the next setpoint; reversing a
    /// directional axis without stopping first is unsafe on the hardware
    PriorityStop,
    /// Arm the one-shot run timer
    ArmTimer { duration_secs: f64 },
    /// Stop the run timer
    StopTimer,
    /// Operator-visible activity line
    Announce(String),
}

/// Pure state transition. Events that make no sense in the current state
/// (a timer firing while idle, a stop when nothing runs) are no-ops.
pub fn transition(state: RunState, event: RunEvent) -> (RunState, Vec<Effect>) {
    match (state, event) {
        (RunState::Running { steps, index }, RunEvent::TimerElapsed) => {
            let next = index + 1;
            if next >= steps.len() {
                (
                    RunState::Completed,
                    vec![
                        Effect::StopTimer,
                        Effect::Announce("recipe completed".into()),
                    ],
                )
            } else {
                let mut effects = Vec::new();
                let reversal = match (steps[index].direction, steps[next].direction) {
                    (Some(a), Some(b)) => a != b,
                    _ => false,
                };
                if reversal {
                    effects.push(Effect::PriorityStop);
                    effects.push(Effect::Announce(format!(
                        "direction reversal ahead of step {}, prioritized stop issued",
                        steps[next].source_step
                    )));
                }
                effects.push(Effect::WriteSetpoint {
                    value: steps[next].value,
                });
                effects.push(Effect::ArmTimer {
                    duration_secs: steps[next].duration_secs,
                });
                (RunState::Running { steps, index: next }, effects)
            }
        }
        (RunState::Running { .. }, RunEvent::Stop { reason }) => (
            RunState::Aborted {
                reason: reason.to_string(),
            },
            vec![
                Effect::StopTimer,
                Effect::Announce(format!("recipe aborted ({reason})")),
            ],
        ),
        // Restarting is allowed from any terminal state; the engine rejects
        // Start while Running before it ever becomes an event.
        (state, RunEvent::Start { steps }) if !state.is_running() && !steps.is_empty() => {
            let total = steps.len();
            let effects = vec![
                Effect::Announce(format!("recipe started ({total} setpoints)")),
                Effect::WriteSetpoint {
                    value: steps[0].value,
                },
                Effect::ArmTimer {
                    duration_secs: steps[0].duration_secs,
                },
            ];
            (RunState::Running { steps, index: 0 }, effects)
        }
        (state, _) => (state, Vec::new()),
    }
}

/// Every expanded value must sit inside the active limit pair; the first
/// violation aborts the whole start attempt naming the offending step.
pub fn validate_limits(steps: &[ExpandedStep], limits: Limits) -> Result<(), RecipeError> {
    for (i, step) in steps.iter().enumerate() {
        if step.value < limits.lower || step.value > limits.upper {
            return Err(RecipeError::ValueOutOfLimits {
                step: i + 1,
                value: step.value,
                lower: limits.lower,
                upper: limits.upper,
            });
        }
    }
    Ok(())
}

/// Walk speed×time into cumulative angular displacement and require it to
/// stay inside the configured travel limits. Skipped entirely for continuous
/// rotation.
pub fn validate_rotation(
    steps: &[ExpandedStep],
    rotation: &RotationLimits,
    start_position: f64,
) -> Result<(), RecipeError> {
    if rotation.continuous {
        return Ok(());
    }
    let mut position = start_position;
    for (i, step) in steps.iter().enumerate() {
        let sign = step.direction.map_or(1.0, |d| d.sign());
        position += sign * step.value * step.duration_secs;
        if position < rotation.min_angle || position > rotation.max_angle {
            return Err(RecipeError::PositionOutOfRange {
                step: i + 1,
                position,
                min: rotation.min_angle,
                max: rotation.max_angle,
            });
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-device recipe engine.
pub struct RecipeEngine {
    device: SharedDevice,
    intent: SharedIntent,
    activity: Arc<dyn ActivityLog>,
    config: RecipeConfig,
    device_id: String,
    state: Mutex<RunState>,
    stop_timer: Mutex<Option<watch::Sender<bool>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RecipeEngine {
    pub fn new(
        device: SharedDevice,
        intent: SharedIntent,
        activity: Arc<dyn ActivityLog>,
        config: RecipeConfig,
    ) -> Self {
        let device_id = lock(&device).id().to_string();
        Self {
            device,
            intent,
            activity,
            config,
            device_id,
            state: Mutex::new(RunState::Idle),
            stop_timer: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Snapshot of the current run state.
    pub fn state(&self) -> RunState {
        lock(&self.state).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_running()
    }

    /// Start the configured recipe.
    ///
    /// The full table is parsed, expanded and validated against the device's
    /// *current* limits before anything is armed; the first expanded value is
    /// written immediately and the one-shot timer armed for its duration.
    pub fn start(self: &Arc<Self>) -> Result<(), RecipeError> {
        if self.config.steps.is_empty() {
            return Err(RecipeError::NoRecipeSelected);
        }
        let steps = parse_table(&self.config.steps)?;
        if steps.is_empty() {
            return Err(RecipeError::NoRecipeSelected);
        }

        // Snapshot device state for validation.
        let (start_value, limits, rotation, rotation_start) = {
            let device = lock(&self.device);
            let rotation = device.rotation().cloned();
            let rotation_start = rotation
                .as_ref()
                .and_then(|r| r.position_name.as_deref())
                .and_then(|name| device.value(name))
                .unwrap_or(0.0);
            (
                device.value(&self.config.feedback),
                device.active_limits(),
                rotation,
                rotation_start,
            )
        };

        let expanded = expand(&steps, start_value)?;
        validate_limits(&expanded, limits)?;
        if let Some(rotation) = &rotation {
            validate_rotation(&expanded, rotation, rotation_start)?;
        }

        let armed = {
            let mut state = lock(&self.state);
            if state.is_running() {
                return Err(RecipeError::AlreadyRunning);
            }
            let current = std::mem::replace(&mut *state, RunState::Idle);
            let (next, effects) = transition(current, RunEvent::Start { steps: expanded });
            *state = next;
            self.run_effects(effects)
        };

        info!("{}: recipe started", self.device_id);
        self.spawn_timer(armed);
        Ok(())
    }

    /// Stop a running recipe; no-op when nothing runs.
    pub fn stop(&self, reason: StopReason) {
        if let Some(stop) = lock(&self.stop_timer).take() {
            let _ = stop.send(true);
        }
        let was_running = self.is_running();
        self.apply(RunEvent::Stop { reason });
        if was_running {
            warn!("{}: recipe stopped ({reason})", self.device_id);
        }
    }

    /// Apply one event and interpret its effects; returns the newly armed
    /// timer duration, if any.
    fn apply(&self, event: RunEvent) -> Option<Duration> {
        let effects = {
            let mut state = lock(&self.state);
            let current = std::mem::replace(&mut *state, RunState::Idle);
            let (next, effects) = transition(current, event);
            *state = next;
            effects
        };
        self.run_effects(effects)
    }

    fn run_effects(&self, effects: Vec<Effect>) -> Option<Duration> {
        let mut armed = None;
        for effect in effects {
            match effect {
                Effect::WriteSetpoint { value } => {
                    debug!("{}: recipe setpoint {} = {}", self.device_id, self.config.setpoint, value);
                    lock(&self.intent).request(&self.config.setpoint, value);
                }
                Effect::PriorityStop => {
                    lock(&self.intent).request_priority_stop();
                }
                Effect::ArmTimer { duration_secs } => {
                    armed = Some(Duration::from_secs_f64(duration_secs));
                }
                Effect::StopTimer => {
                    armed = None;
                }
                Effect::Announce(line) => {
                    self.activity.append(&format!("{}: {line}", self.device_id));
                }
            }
        }
        armed
    }

    fn spawn_timer(self: &Arc<Self>, first: Option<Duration>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *lock(&self.stop_timer) = Some(stop_tx);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut next = first;
            while let Some(duration) = next {
                tokio::select! {
                    () = tokio::time::sleep(duration) => {
                        next = engine.apply(RunEvent::TimerElapsed);
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        *lock(&self.timer) = Some(handle);
    }
}
