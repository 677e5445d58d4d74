//! Dispatch of inbound `{type, data}` envelopes to registered handlers

use crate::error::RouteError;
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

type Handler<C> = Box<dyn Fn(&mut C, Value) -> Result<(), RouteError> + Send>;

/// Result of dispatching one raw frame
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    /// No handler registered for this type; the message was dropped
    Unknown(String),
    /// Envelope or payload could not be decoded; the message was dropped
    Rejected(RouteError),
}

/// Maps envelope types to handlers operating on a context `C`
///
/// Dispatch never panics on bad input: malformed envelopes are logged as
/// errors, unknown types as warnings, and both are dropped.
pub struct MessageRouter<C> {
    handlers: HashMap<String, Handler<C>>,
}

impl<C> Default for MessageRouter<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> MessageRouter<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler receiving the raw `data` value; replaces any
    /// earlier handler for the same type
    pub fn register<F>(&mut self, msg_type: &str, handler: F)
    where
        F: Fn(&mut C, Value) -> Result<(), RouteError> + Send + 'static,
    {
        self.handlers.insert(msg_type.to_string(), Box::new(handler));
    }

    /// Registers a handler whose payload is decoded into `P` first
    pub fn register_typed<P, F>(&mut self, msg_type: &str, handler: F)
    where
        P: DeserializeOwned + 'static,
        F: Fn(&mut C, P) + Send + 'static,
    {
        let name = msg_type.to_string();
        self.register(msg_type, move |ctx, data| {
            let payload = serde_json::from_value::<P>(data).map_err(|source| RouteError::Payload {
                msg_type: name.clone(),
                source,
            })?;
            handler(ctx, payload);
            Ok(())
        });
    }

    pub fn handles(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }

    pub fn dispatch(&self, ctx: &mut C, raw: &str) -> Dispatch {
        let (msg_type, data) = match parse_envelope(raw) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Dropping message: {}", e);
                return Dispatch::Rejected(e);
            }
        };

        let Some(handler) = self.handlers.get(&msg_type) else {
            warn!("No handler for message type `{}`", msg_type);
            return Dispatch::Unknown(msg_type);
        };

        match handler(ctx, data) {
            Ok(()) => Dispatch::Handled,
            Err(e) => {
                error!("Dropping message: {}", e);
                Dispatch::Rejected(e)
            }
        }
    }
}

fn parse_envelope(raw: &str) -> Result<(String, Value), RouteError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| RouteError::MalformedEnvelope(format!("not JSON: {}", e)))?;

    let Value::Object(mut fields) = value else {
        return Err(RouteError::MalformedEnvelope("not an object".to_string()));
    };

    let msg_type = match fields.remove("type") {
        Some(Value::String(msg_type)) => msg_type,
        Some(_) => return Err(RouteError::MalformedEnvelope("`type` is not a string".to_string())),
        None => return Err(RouteError::MalformedEnvelope("missing `type`".to_string())),
    };

    let data = fields
        .remove("data")
        .ok_or_else(|| RouteError::MalformedEnvelope(format!("`{}` has no `data`", msg_type)))?;

    Ok((msg_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ErrorPayload;

    #[derive(Default)]
    struct Recorder {
        errors: Vec<String>,
        raw: Vec<Value>,
    }

    fn router() -> MessageRouter<Recorder> {
        let mut router = MessageRouter::new();
        router.register_typed("error", |ctx: &mut Recorder, payload: ErrorPayload| {
            ctx.errors.push(payload.message);
        });
        router.register("echo", |ctx: &mut Recorder, data| {
            ctx.raw.push(data);
            Ok(())
        });
        router
    }

    #[test]
    fn test_dispatch_typed_handler() {
        let router = router();
        let mut ctx = Recorder::default();

        let outcome = router.dispatch(&mut ctx, r#"{"type":"error","data":{"message":"nope"}}"#);

        assert!(matches!(outcome, Dispatch::Handled));
        assert_eq!(ctx.errors, vec!["nope".to_string()]);
    }

    #[test]
    fn test_dispatch_raw_handler() {
        let router = router();
        let mut ctx = Recorder::default();

        router.dispatch(&mut ctx, r#"{"type":"echo","data":[1,2,3]}"#);

        assert_eq!(ctx.raw, vec![serde_json::json!([1, 2, 3])]);
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let router = router();
        let mut ctx = Recorder::default();

        let outcome = router.dispatch(&mut ctx, r#"{"type":"weather","data":{}}"#);

        match outcome {
            Dispatch::Unknown(msg_type) => assert_eq!(msg_type, "weather"),
            other => panic!("Unexpected outcome: {:?}", other),
        }
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn test_malformed_envelopes_are_rejected() {
        let router = router();
        let mut ctx = Recorder::default();

        for raw in [
            "not json at all",
            "[1,2]",
            r#"{"data":{"message":"x"}}"#,
            r#"{"type":7,"data":{}}"#,
            r#"{"type":"error"}"#,
        ] {
            let outcome = router.dispatch(&mut ctx, raw);
            assert!(
                matches!(outcome, Dispatch::Rejected(RouteError::MalformedEnvelope(_))),
                "expected malformed envelope for {}",
                raw
            );
        }
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn test_bad_payload_does_not_reach_handler() {
        let router = router();
        let mut ctx = Recorder::default();

        let outcome = router.dispatch(&mut ctx, r#"{"type":"error","data":{"msg":"wrong field"}}"#);

        match outcome {
            Dispatch::Rejected(RouteError::Payload { msg_type, .. }) => assert_eq!(msg_type, "error"),
            other => panic!("Unexpected outcome: {:?}", other),
        }
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn test_register_replaces_existing_handler() {
        let mut router = router();
        router.register("error", |_ctx: &mut Recorder, _data| Ok(()));
        let mut ctx = Recorder::default();

        router.dispatch(&mut ctx, r#"{"type":"error","data":{"message":"ignored"}}"#);

        assert!(router.handles("error"));
        assert!(!router.handles("weather"));
        assert!(ctx.errors.is_empty());
    }
}
