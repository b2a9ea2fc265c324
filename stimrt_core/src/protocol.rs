//! Stimulation protocols: ordered lists of timed phases
//!
//! The Controller drives a protocol; participants only mirror it through the
//! shared cursor and look up phase details in their own copy of the library.

use crate::error::{StimError, StimResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One timed segment of a protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Seconds
    pub duration: f64,
    /// Opaque descriptor for the display participant
    #[serde(default)]
    pub visual: Option<String>,
    /// Opaque descriptor for the io participant
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl Phase {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            visual: None,
            action: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_visual(mut self, visual: impl Into<String>) -> Self {
        self.visual = Some(visual.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl Protocol {
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            name: name.into(),
            phases,
        }
    }

    pub fn validate(&self) -> StimResult<()> {
        if self.name.trim().is_empty() {
            return Err(StimError::protocol("protocol name is empty"));
        }
        if self.phases.is_empty() {
            return Err(StimError::protocol(format!(
                "protocol '{}' has no phases",
                self.name
            )));
        }
        for (i, phase) in self.phases.iter().enumerate() {
            if !phase.duration.is_finite() || phase.duration <= 0.0 {
                return Err(StimError::protocol(format!(
                    "protocol '{}' phase {}: duration must be positive, got {}",
                    self.name, i, phase.duration
                )));
            }
        }
        Ok(())
    }

    pub fn total_duration(&self) -> f64 {
        self.phases.iter().map(|p| p.duration).sum()
    }

    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }
}

/// Protocols available to a session, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolLibrary {
    protocols: BTreeMap<String, Protocol>,
}

impl ProtocolLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validated protocol; names must be unique
    pub fn insert(&mut self, protocol: Protocol) -> StimResult<()> {
        protocol.validate()?;
        if self.protocols.contains_key(&protocol.name) {
            return Err(StimError::protocol(format!(
                "protocol '{}' is defined twice",
                protocol.name
            )));
        }
        self.protocols.insert(protocol.name.clone(), protocol);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Protocol> {
        self.protocols.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    pub fn validate(&self) -> StimResult<()> {
        for (key, protocol) in &self.protocols {
            if key != &protocol.name {
                return Err(StimError::protocol(format!(
                    "protocol stored as '{}' is named '{}'",
                    key, protocol.name
                )));
            }
            protocol.validate()?;
        }
        Ok(())
    }

    pub fn from_list(protocols: Vec<Protocol>) -> StimResult<Self> {
        let mut library = Self::new();
        for protocol in protocols {
            library.insert(protocol)?;
        }
        Ok(library)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_phase() -> Protocol {
        Protocol::new(
            "gratings",
            vec![
                Phase::new(1.0).with_visual("grating").with_parameter("angle", 45),
                Phase::new(0.5).with_visual("blank"),
            ],
        )
    }

    #[test]
    fn test_total_duration() {
        let protocol = two_phase();
        protocol.validate().unwrap();
        assert_eq!(protocol.total_duration(), 1.5);
        assert_eq!(protocol.phase(0).unwrap().parameters["angle"], 45);
        assert!(protocol.phase(2).is_none());
    }

    #[test]
    fn test_validation() {
        assert!(Protocol::new("empty", vec![]).validate().is_err());
        assert!(Protocol::new("zero", vec![Phase::new(0.0)]).validate().is_err());
        assert!(Protocol::new("nan", vec![Phase::new(f64::NAN)]).validate().is_err());
        assert!(Protocol::new(" ", vec![Phase::new(1.0)]).validate().is_err());
    }

    #[test]
    fn test_library_rejects_duplicates() {
        let mut library = ProtocolLibrary::new();
        library.insert(two_phase()).unwrap();
        assert!(library.insert(two_phase()).is_err());
        assert_eq!(library.names().collect::<Vec<_>>(), vec!["gratings"]);
    }

    #[test]
    fn test_library_yaml() {
        let yaml = r#"
gratings:
  name: gratings
  phases:
    - duration: 1.0
      visual: grating
      parameters: { angle: 90 }
    - duration: 0.5
"#;
        let library: ProtocolLibrary = serde_yaml::from_str(yaml).unwrap();
        library.validate().unwrap();
        let protocol = library.get("gratings").unwrap();
        assert_eq!(protocol.phases.len(), 2);
        assert_eq!(protocol.phases[1].visual, None);
    }
}
