//! Routines: per-tick computations bundled with the attributes they produce
//!
//! A routine declares its attributes during setup (in the Controller, before
//! any participant starts), attaches to them in its own process, and then
//! runs `main()` once per tick. Functions registered in `expose` are
//! reachable by RPC as `RoutineName.function`.

use crate::attribute::AttributeSpec;
use crate::communication::RpcCall;
use crate::core::state::{ProcessState, ProtocolCursor};
use crate::error::{StimError, StimResult};
use crate::registry::Registry;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Collects the attribute declarations of one routine
#[derive(Debug)]
pub struct AttributeSetup {
    routine: String,
    specs: Vec<AttributeSpec>,
}

impl AttributeSetup {
    pub fn new(routine: impl Into<String>) -> Self {
        Self {
            routine: routine.into(),
            specs: Vec::new(),
        }
    }

    pub fn routine(&self) -> &str {
        &self.routine
    }

    pub fn declare(&mut self, spec: AttributeSpec) -> StimResult<()> {
        spec.validate()?;
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(StimError::InvalidInput(format!(
                "routine '{}' declares attribute '{}' twice",
                self.routine, spec.name
            )));
        }
        self.specs.push(spec);
        Ok(())
    }

    pub fn into_specs(self) -> Vec<AttributeSpec> {
        self.specs
    }
}

/// Values handed from the participant to its routines for one tick
#[derive(Default)]
pub struct TickInputs {
    values: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl TickInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        let boxed = self.values.remove(&TypeId::of::<T>())?;
        boxed.downcast().ok().map(|b| *b)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a routine sees during one tick
pub struct RoutineContext<'a> {
    /// Logical time of this tick (seconds, monotonic clock)
    pub time: f64,
    pub process: &'a str,
    pub state: ProcessState,
    pub cursor: &'a ProtocolCursor,
    pub inputs: &'a TickInputs,
    pub registry: &'a Registry,
}

pub type ExposedFn<R> = Box<dyn Fn(&mut R, &RpcCall) -> StimResult<Value> + Send>;

/// Functions a routine makes reachable by RPC
pub struct ExposedTable<R> {
    entries: HashMap<String, ExposedFn<R>>,
    duplicate: Option<String>,
}

impl<R> ExposedTable<R> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            duplicate: None,
        }
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&mut R, &RpcCall) -> StimResult<Value> + Send + 'static,
    {
        if self.entries.insert(name.to_string(), Box::new(function)).is_some() {
            self.duplicate.get_or_insert_with(|| name.to_string());
        }
    }
}

/// A unit of per-tick computation owned by one participant
pub trait Routine: Send + 'static {
    fn name(&self) -> &str;

    /// Declare the attributes this routine produces
    fn setup(&self, _setup: &mut AttributeSetup) -> StimResult<()> {
        Ok(())
    }

    /// Attach attribute handles inside the owning process
    fn initialize(&mut self, _registry: &Registry) -> StimResult<()> {
        Ok(())
    }

    /// One tick of work. Must not block.
    fn main(&mut self, ctx: &mut RoutineContext<'_>) -> StimResult<()>;

    /// Attributes forwarded to the durable sink while recording
    fn recorded_attributes(&self) -> Vec<String> {
        Vec::new()
    }

    fn expose(_table: &mut ExposedTable<Self>)
    where
        Self: Sized,
    {
    }
}

/// Object-safe view of a routine and its exposed functions
pub trait RoutineSlot: Send {
    fn name(&self) -> &str;
    fn setup(&self, setup: &mut AttributeSetup) -> StimResult<()>;
    fn initialize(&mut self, registry: &Registry) -> StimResult<()>;
    fn main(&mut self, ctx: &mut RoutineContext<'_>) -> StimResult<()>;
    fn recorded_attributes(&self) -> Vec<String>;
    fn exposed_names(&self) -> Vec<String>;
    fn invoke(&mut self, function: &str, call: &RpcCall) -> StimResult<Value>;
}

pub struct RoutineEntry<R: Routine> {
    routine: R,
    exposed: HashMap<String, ExposedFn<R>>,
}

impl<R: Routine> RoutineEntry<R> {
    pub fn new(routine: R) -> StimResult<Self> {
        let mut table = ExposedTable::new();
        R::expose(&mut table);
        if let Some(name) = table.duplicate {
            return Err(StimError::DuplicateFunction(format!(
                "{}.{}",
                routine.name(),
                name
            )));
        }
        Ok(Self {
            routine,
            exposed: table.entries,
        })
    }

    pub fn routine(&self) -> &R {
        &self.routine
    }
}

impl<R: Routine> RoutineSlot for RoutineEntry<R> {
    fn name(&self) -> &str {
        self.routine.name()
    }

    fn setup(&self, setup: &mut AttributeSetup) -> StimResult<()> {
        self.routine.setup(setup)
    }

    fn initialize(&mut self, registry: &Registry) -> StimResult<()> {
        self.routine.initialize(registry)
    }

    fn main(&mut self, ctx: &mut RoutineContext<'_>) -> StimResult<()> {
        self.routine.main(ctx)
    }

    fn recorded_attributes(&self) -> Vec<String> {
        self.routine.recorded_attributes()
    }

    fn exposed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exposed.keys().cloned().collect();
        names.sort();
        names
    }

    fn invoke(&mut self, function: &str, call: &RpcCall) -> StimResult<Value> {
        let exposed = self.exposed.get(function).ok_or_else(|| {
            StimError::UnknownFunction(format!("{}.{}", self.routine.name(), function))
        })?;
        exposed(&mut self.routine, call)
    }
}

/// The routines of one process, in execution order
#[derive(Default)]
pub struct RoutineSet {
    routines: Vec<Box<dyn RoutineSlot>>,
    /// Time of each routine's last completed tick
    time_cursor: Vec<f64>,
}

impl RoutineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a routine; routine names and qualified function names stay unique
    pub fn add(&mut self, routine: Box<dyn RoutineSlot>) -> StimResult<()> {
        if self.routines.iter().any(|r| r.name() == routine.name()) {
            return Err(StimError::DuplicateFunction(format!(
                "routine '{}' registered twice",
                routine.name()
            )));
        }
        self.routines.push(routine);
        self.time_cursor.push(f64::NEG_INFINITY);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.routines.iter().map(|r| r.name()).collect()
    }

    /// Every exposed function as `Routine.function`
    pub fn qualified_names(&self) -> Vec<String> {
        self.routines
            .iter()
            .flat_map(|r| {
                let routine = r.name().to_string();
                r.exposed_names()
                    .into_iter()
                    .map(move |f| format!("{}.{}", routine, f))
            })
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn RoutineSlot>> {
        self.routines.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn RoutineSlot> {
        self.routines.iter().map(|r| r.as_ref())
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Box<dyn RoutineSlot>> {
        self.routines.get_mut(index)
    }

    pub(crate) fn advance_time(&mut self, index: usize, time: f64) {
        if let Some(cursor) = self.time_cursor.get_mut(index) {
            *cursor = time;
        }
    }

    pub fn last_tick(&self, routine: &str) -> Option<f64> {
        let index = self.routines.iter().position(|r| r.name() == routine)?;
        let time = self.time_cursor[index];
        time.is_finite().then_some(time)
    }

    /// Dispatch `Routine.function`
    pub fn invoke(&mut self, qualified: &str, call: &RpcCall) -> StimResult<Value> {
        let (routine, function) = qualified
            .split_once('.')
            .ok_or_else(|| StimError::UnknownFunction(qualified.to_string()))?;
        let slot = self
            .routines
            .iter_mut()
            .find(|r| r.name() == routine)
            .ok_or_else(|| StimError::UnknownFunction(qualified.to_string()))?;
        slot.invoke(function, call)
    }
}
