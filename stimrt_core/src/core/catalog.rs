use crate::config::{ParticipantSpec, Role};
use crate::core::process::{IdleParticipant, Participant};
use crate::core::routine::{Routine, RoutineEntry, RoutineSet, RoutineSlot};
use crate::core::sink::{null_sink_factory, SinkFactory};
use crate::error::{StimError, StimResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type RoutineFactory = Arc<dyn Fn() -> StimResult<Box<dyn RoutineSlot>> + Send + Sync>;
pub type ParticipantFactory = Arc<dyn Fn(&ParticipantSpec) -> Box<dyn Participant> + Send + Sync>;

/// Everything a binary links in: routine types, participant behaviours and
/// the durable sink.
///
/// The same catalog is built in the Controller (to run routine setup) and in
/// every participant process (to instantiate its routines).
#[derive(Clone)]
pub struct Catalog {
    routines: BTreeMap<String, RoutineFactory>,
    by_name: HashMap<String, ParticipantFactory>,
    by_role: HashMap<Role, ParticipantFactory>,
    sink: SinkFactory,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            routines: BTreeMap::new(),
            by_name: HashMap::new(),
            by_role: HashMap::new(),
            sink: null_sink_factory(),
        }
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a routine type under the name its instances report
    pub fn register_routine<R, F>(&mut self, factory: F) -> StimResult<&mut Self>
    where
        R: Routine,
        F: Fn() -> R + Send + Sync + 'static,
    {
        // Build once up front so duplicate exposures surface at registration
        let probe = RoutineEntry::new(factory())?;
        let name = probe.routine().name().to_string();
        if self.routines.contains_key(&name) {
            return Err(StimError::DuplicateFunction(format!(
                "routine '{}' registered twice",
                name
            )));
        }
        self.routines.insert(
            name,
            Arc::new(move || Ok(Box::new(RoutineEntry::new(factory())?) as Box<dyn RoutineSlot>)),
        );
        Ok(self)
    }

    /// Behaviour for one named participant
    pub fn register_participant<P, F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        P: Participant + 'static,
        F: Fn(&ParticipantSpec) -> P + Send + Sync + 'static,
    {
        self.by_name.insert(
            name.to_string(),
            Arc::new(move |spec| Box::new(factory(spec)) as Box<dyn Participant>),
        );
        self
    }

    /// Behaviour for every participant of a role without a named entry
    pub fn register_role<P, F>(&mut self, role: Role, factory: F) -> &mut Self
    where
        P: Participant + 'static,
        F: Fn(&ParticipantSpec) -> P + Send + Sync + 'static,
    {
        self.by_role.insert(
            role,
            Arc::new(move |spec| Box::new(factory(spec)) as Box<dyn Participant>),
        );
        self
    }

    pub fn with_sink(&mut self, sink: SinkFactory) -> &mut Self {
        self.sink = sink;
        self
    }

    pub fn routine_names(&self) -> impl Iterator<Item = &str> {
        self.routines.keys().map(String::as_str)
    }

    pub fn has_routine(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    pub fn routine(&self, name: &str) -> StimResult<Box<dyn RoutineSlot>> {
        let factory = self
            .routines
            .get(name)
            .ok_or_else(|| StimError::config(format!("unknown routine '{}'", name)))?;
        factory()
    }

    /// Instantiate the routines of one participant, in configured order
    pub fn routine_set(&self, names: &[String]) -> StimResult<RoutineSet> {
        let mut set = RoutineSet::new();
        for name in names {
            set.add(self.routine(name)?)?;
        }
        Ok(set)
    }

    pub fn participant(&self, spec: &ParticipantSpec) -> Box<dyn Participant> {
        if let Some(factory) = self.by_name.get(&spec.name) {
            return factory(spec);
        }
        if let Some(factory) = self.by_role.get(&spec.role) {
            return factory(spec);
        }
        Box::new(IdleParticipant)
    }

    pub fn sink(&self) -> SinkFactory {
        Arc::clone(&self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::routine::RoutineContext;

    struct Noop;

    impl Routine for Noop {
        fn name(&self) -> &str {
            "Noop"
        }

        fn main(&mut self, _ctx: &mut RoutineContext<'_>) -> StimResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_routine_registration() {
        let mut catalog = Catalog::new();
        catalog.register_routine(|| Noop).unwrap();
        assert!(catalog.register_routine(|| Noop).is_err());
        assert!(catalog.has_routine("Noop"));

        let set = catalog.routine_set(&["Noop".to_string()]).unwrap();
        assert_eq!(set.names(), vec!["Noop"]);
        assert!(matches!(
            catalog.routine_set(&["Missing".to_string()]),
            Err(StimError::Config(_))
        ));
        assert!(catalog
            .routine_set(&["Noop".to_string(), "Noop".to_string()])
            .is_err());
    }
}
