//! Call argument shapes.
//!
//! The bridge takes positional and keyword arguments as an explicit
//! [`CallArguments`] value. Thin host-side shims that only speak in flat argument
//! lists encode keyword arguments as a trailing object tagged with
//! [`KWARGS_MARKER`]; [`CallArguments::from_wire`] decodes that form.

use crate::errors::BridgeError;
use crate::handles::Handle;
use crate::value::HostValue;
use indexmap::IndexMap;

/// Reserved key marking a trailing object as keyword arguments
pub const KWARGS_MARKER: &str = "__kwargs";

/// Positional and keyword arguments for one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArguments {
    pub positional: Vec<HostValue>,
    pub keyword: IndexMap<String, HostValue>,
}

impl CallArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(positional: Vec<HostValue>) -> Self {
        Self {
            positional,
            keyword: IndexMap::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<HostValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Decode a flat wire argument list.
    ///
    /// An object whose marker key is `true` carries keyword arguments. It may
    /// appear once, as the last element; the marker is stripped. Objects without
    /// the marker stay positional mapping arguments.
    pub fn from_wire(mut args: Vec<HostValue>) -> Result<Self, BridgeError> {
        let marked: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, value)| is_keyword_object(value))
            .map(|(index, _)| index)
            .collect();

        match marked.as_slice() {
            [] => Ok(Self::positional(args)),
            [index] if *index + 1 == args.len() => {
                let keyword = match args.pop() {
                    Some(HostValue::Object(mut map)) => {
                        map.shift_remove(KWARGS_MARKER);
                        map
                    }
                    _ => IndexMap::new(),
                };
                Ok(Self {
                    positional: args,
                    keyword,
                })
            }
            _ => Err(BridgeError::Argument(
                "Keyword arguments must be passed once, as the last argument".to_string(),
            )),
        }
    }

    /// Encode into the flat wire form accepted by [`CallArguments::from_wire`]
    pub fn into_wire(self) -> Vec<HostValue> {
        let mut args = self.positional;
        if !self.keyword.is_empty() {
            let mut keyword = self.keyword;
            keyword.insert(KWARGS_MARKER.to_string(), HostValue::Bool(true));
            args.push(HostValue::Object(keyword));
        }
        args
    }
}

fn is_keyword_object(value: &HostValue) -> bool {
    matches!(value, HostValue::Object(map) if map.get(KWARGS_MARKER) == Some(&HostValue::Bool(true)))
}

/// A `[handle, member, ...args]` list as received from a host shim
#[derive(Debug, Clone, PartialEq)]
pub struct WireCall {
    pub handle: Handle,
    pub member: String,
    pub arguments: CallArguments,
}

impl WireCall {
    /// Validate the call shape before anything reaches the interpreter.
    ///
    /// The target may be a handle or its textual token; anything else, or a
    /// non-text member name, is rejected as wrong argument types.
    pub fn parse(args: Vec<HostValue>) -> Result<Self, BridgeError> {
        let mut args = args.into_iter();

        let handle = match args.next() {
            Some(HostValue::Handle(handle)) => handle,
            Some(HostValue::String(token)) => token.parse()?,
            _ => return Err(BridgeError::WrongArguments),
        };
        let member = match args.next() {
            Some(HostValue::String(member)) => member,
            _ => return Err(BridgeError::WrongArguments),
        };
        let arguments = CallArguments::from_wire(args.collect())?;

        Ok(Self {
            handle,
            member,
            arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::ModuleHandle;
    use crate::value::HostFunctionRef;

    fn kwargs(pairs: &[(&str, HostValue)]) -> HostValue {
        let mut map: IndexMap<String, HostValue> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        map.insert(KWARGS_MARKER.to_string(), HostValue::Bool(true));
        HostValue::Object(map)
    }

    #[test]
    fn test_trailing_marker_becomes_keywords() {
        let args = CallArguments::from_wire(vec![
            HostValue::Int(1),
            kwargs(&[("value", HostValue::Int(2))]),
        ])
        .unwrap();

        assert_eq!(args.positional, vec![HostValue::Int(1)]);
        assert_eq!(args.keyword.len(), 1);
        assert_eq!(args.keyword["value"], HostValue::Int(2));
        assert!(!args.keyword.contains_key(KWARGS_MARKER));
    }

    #[test]
    fn test_unmarked_object_stays_positional() {
        let object = HostValue::object([("value", HostValue::Int(2))]);
        let args = CallArguments::from_wire(vec![object.clone()]).unwrap();
        assert_eq!(args.positional, vec![object]);
        assert!(args.keyword.is_empty());
    }

    #[test]
    fn test_false_marker_is_not_keywords() {
        let object = HostValue::object([(KWARGS_MARKER, HostValue::Bool(false))]);
        let args = CallArguments::from_wire(vec![object]).unwrap();
        assert_eq!(args.positional.len(), 1);
    }

    #[test]
    fn test_marker_must_be_last_and_single() {
        let not_last = CallArguments::from_wire(vec![
            kwargs(&[("a", HostValue::Int(1))]),
            HostValue::Int(2),
        ]);
        assert!(matches!(not_last, Err(BridgeError::Argument(_))));

        let twice = CallArguments::from_wire(vec![
            kwargs(&[("a", HostValue::Int(1))]),
            kwargs(&[("b", HostValue::Int(2))]),
        ]);
        assert!(matches!(twice, Err(BridgeError::Argument(_))));
    }

    #[test]
    fn test_wire_roundtrip() {
        let args = CallArguments::new().arg(3).kwarg("value", 2);
        let decoded = CallArguments::from_wire(args.clone().into_wire()).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_wire_call_parse() {
        let handle = Handle::from(ModuleHandle::from_raw(7));
        let call = WireCall::parse(vec![
            HostValue::String(handle.to_string()),
            HostValue::from("multiply"),
            HostValue::Int(2),
        ])
        .unwrap();

        assert_eq!(call.handle, handle);
        assert_eq!(call.member, "multiply");
        assert_eq!(call.arguments.positional, vec![HostValue::Int(2)]);
    }

    #[test]
    fn test_wire_call_wrong_shapes() {
        let function = HostValue::Function(HostFunctionRef::from_fn(|_| Ok(HostValue::Null)));
        assert!(matches!(
            WireCall::parse(vec![function]),
            Err(BridgeError::WrongArguments)
        ));
        assert!(matches!(
            WireCall::parse(vec![HostValue::Int(1), HostValue::from("f")]),
            Err(BridgeError::WrongArguments)
        ));
        assert!(matches!(
            WireCall::parse(vec![HostValue::from("test"), HostValue::from("error")]),
            Err(BridgeError::InvalidHandle(_))
        ));
    }
}
