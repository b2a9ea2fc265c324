use crate::error::{StimError, StimResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of signal carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Rpc,
    SetProperty,
    Shutdown,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Rpc => write!(f, "rpc"),
            Signal::SetProperty => write!(f, "set_property"),
            Signal::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Remote procedure call addressed to a process by name.
///
/// `function` is either a process-level name (`ping`) or a qualified
/// routine callback (`Routine.function`). When `callback` is set, the
/// callee sends its result back to `sender` as a call to that function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub target: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub callback: Option<String>,
}

impl RpcCall {
    pub fn new(target: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            sender: String::new(),
            callback: None,
        }
    }

    pub fn arg(mut self, value: impl Serialize) -> StimResult<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> StimResult<Self> {
        self.kwargs.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn with_callback(mut self, function: impl Into<String>) -> Self {
        self.callback = Some(function.into());
        self
    }

    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Positional argument `index` decoded as `T`
    pub fn get_arg<T: DeserializeOwned>(&self, index: usize) -> StimResult<T> {
        let value = self.args.get(index).ok_or_else(|| {
            StimError::Rpc(format!(
                "{}: missing positional argument {}",
                self.function, index
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            StimError::Rpc(format!("{}: argument {}: {}", self.function, index, e))
        })
    }

    /// Keyword argument `name` decoded as `T`, if present
    pub fn get_kwarg<T: DeserializeOwned>(&self, name: &str) -> StimResult<Option<T>> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    StimError::Rpc(format!("{}: keyword '{}': {}", self.function, name, e))
                })
            })
            .transpose()
    }

    /// Reply carrying `result` to the caller's callback, if one was named
    pub fn reply(&self, from: &str, result: Value) -> Option<RpcCall> {
        self.callback.as_ref().map(|callback| RpcCall {
            target: self.sender.clone(),
            function: callback.clone(),
            args: vec![result],
            kwargs: BTreeMap::new(),
            sender: from.to_string(),
            callback: None,
        })
    }
}

/// Frame exchanged over participant channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Message {
    Rpc(RpcCall),
    SetProperty { name: String, value: Value },
    Shutdown,
}

impl Message {
    pub fn signal(&self) -> Signal {
        match self {
            Message::Rpc(_) => Signal::Rpc,
            Message::SetProperty { .. } => Signal::SetProperty,
            Message::Shutdown => Signal::Shutdown,
        }
    }

    pub fn encode(&self) -> StimResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> StimResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_is_tagged() {
        let msg = Message::SetProperty {
            name: "contrast".into(),
            value: json!(0.5),
        };
        let text = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(text.contains("\"signal\":\"set_property\""));
        assert_eq!(Message::decode(text.as_bytes()).unwrap(), msg);

        let shutdown = Message::decode(br#"{"signal":"shutdown"}"#).unwrap();
        assert_eq!(shutdown.signal(), Signal::Shutdown);
    }

    #[test]
    fn test_rpc_arguments() {
        let call = RpcCall::new("display", "Grating.set_frequency")
            .arg(2.5)
            .unwrap()
            .kwarg("phase", 0.25)
            .unwrap();
        assert_eq!(call.get_arg::<f64>(0).unwrap(), 2.5);
        assert!(call.get_arg::<f64>(1).is_err());
        assert_eq!(call.get_kwarg::<f64>("phase").unwrap(), Some(0.25));
        assert_eq!(call.get_kwarg::<f64>("missing").unwrap(), None);
        assert!(call.get_arg::<String>(0).is_err());
    }

    #[test]
    fn test_reply_only_with_callback() {
        let call = RpcCall::new("camera", "ping").from_sender("gui");
        assert!(call.reply("camera", json!("camera")).is_none());

        let reply = call
            .with_callback("on_pong")
            .reply("camera", json!("camera"))
            .unwrap();
        assert_eq!(reply.target, "gui");
        assert_eq!(reply.function, "on_pong");
        assert_eq!(reply.sender, "camera");
        assert_eq!(reply.args, vec![json!("camera")]);
    }
}
