//! Endpoint Registry
//!
//! A [`BackendInterface`] names every endpoint a port pair agrees on: its kind,
//! the schemas of its payloads and its serialization mode. The server side also
//! attaches handlers. Both ports validate payloads against the same
//! definitions, so one interface value is normally shared by client and server.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut backend = BackendInterface::new();
//! backend.add(Endpoint::rpc("echo").parameter(Schema::of::<Echo>()).returns(Schema::of::<Echo>()))?;
//! backend.on_rpc("echo", |_ctx, parameter| async move { Ok(parameter) })?;
//! ```

use crate::auth::RequestContext;
use crate::channel::Channel;
use crate::error::{PortError, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use signals::{Signal, Subscribable};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use wire::{apply_patches, Patch, SerializationMode, WriteTag};

type Validator = Arc<dyn Fn(&Value, SerializationMode) -> std::result::Result<(), String> + Send + Sync>;

/// Shape check for one payload position
#[derive(Clone)]
pub struct Schema {
    name: String,
    validate: Validator,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Schema({})", self.name)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl Schema {
    /// Accept every payload
    pub fn any() -> Self {
        Self {
            name: "any".to_string(),
            validate: Arc::new(|_, _| Ok(())),
        }
    }

    /// Accept payloads that decode into `T` under the endpoint's mode
    pub fn of<T: DeserializeOwned + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>().to_string(),
            validate: Arc::new(|value, mode| {
                mode.decode::<T>(value.clone())
                    .map(|_| ())
                    .map_err(|e| match std::error::Error::source(&e) {
                        Some(source) => format!("{}: {}", e, source),
                        None => e.to_string(),
                    })
            }),
        }
    }

    pub fn custom(
        name: impl Into<String>,
        validate: impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            validate: Arc::new(move |value, _| validate(value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn validate(&self, value: &Value, mode: SerializationMode) -> std::result::Result<(), String> {
        (self.validate)(value, mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Rpc,
    Channel,
    Signal,
    WritableSignal,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rpc => "rpc",
            Self::Channel => "channel",
            Self::Signal => "signal",
            Self::WritableSignal => "writable signal",
        };
        f.write_str(name)
    }
}

/// One endpoint definition
///
/// `to_client` covers RPC results, server-to-client channel messages and
/// signal values. `to_server` covers client-to-server channel messages.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub kind: EndpointKind,
    pub parameter: Schema,
    pub to_client: Schema,
    pub to_server: Schema,
    pub mode: SerializationMode,
}

impl Endpoint {
    fn new(name: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parameter: Schema::any(),
            to_client: Schema::any(),
            to_server: Schema::any(),
            mode: SerializationMode::Raw,
        }
    }

    pub fn rpc(name: impl Into<String>) -> Self {
        Self::new(name, EndpointKind::Rpc)
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Self::new(name, EndpointKind::Channel)
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self::new(name, EndpointKind::Signal)
    }

    pub fn writable_signal(name: impl Into<String>) -> Self {
        Self::new(name, EndpointKind::WritableSignal)
    }

    /// Schema of the call parameter or creation parameter
    pub fn parameter(mut self, schema: Schema) -> Self {
        self.parameter = schema;
        self
    }

    /// Schema of RPC results
    pub fn returns(mut self, schema: Schema) -> Self {
        self.to_client = schema;
        self
    }

    /// Schema of signal values
    pub fn value(mut self, schema: Schema) -> Self {
        self.to_client = schema;
        self
    }

    pub fn to_client(mut self, schema: Schema) -> Self {
        self.to_client = schema;
        self
    }

    pub fn to_server(mut self, schema: Schema) -> Self {
        self.to_server = schema;
        self
    }

    pub fn mode(mut self, mode: SerializationMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn check_parameter(&self, value: &Value) -> Result<()> {
        self.parameter
            .validate(value, self.mode)
            .map_err(|message| PortError::validation(&self.name, "parameter", message))
    }

    pub(crate) fn check_to_client(&self, value: &Value) -> Result<()> {
        self.to_client
            .validate(value, self.mode)
            .map_err(|message| PortError::validation(&self.name, "server payload", message))
    }

    pub(crate) fn check_to_server(&self, value: &Value) -> Result<()> {
        self.to_server
            .validate(value, self.mode)
            .map_err(|message| PortError::validation(&self.name, "client payload", message))
    }
}

/// Applies a batch of patches from a client write
pub type SignalWriter = Arc<dyn Fn(Vec<Patch>, Vec<WriteTag>) -> anyhow::Result<()> + Send + Sync>;

/// What a writable-signal handler hands back: a value to replicate and a way to
/// apply client writes to it
#[derive(Clone)]
pub struct WritableSignalSource {
    pub signal: Arc<dyn Subscribable<Value>>,
    pub write: SignalWriter,
}

impl WritableSignalSource {
    pub fn new(
        signal: Arc<dyn Subscribable<Value>>,
        write: impl Fn(Vec<Patch>, Vec<WriteTag>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            signal,
            write: Arc::new(write),
        }
    }

    /// Serve a plain signal, applying client patches to it directly
    pub fn from_signal(signal: Signal<Value>) -> Self {
        let target = signal.clone();
        Self::new(Arc::new(signal), move |patches, tags| {
            target.try_update(
                move |current| {
                    let next = apply_patches(current, &patches)?;
                    Ok::<_, anyhow::Error>((next, patches))
                },
                tags,
            )
        })
    }
}

pub type RpcHandler =
    Arc<dyn Fn(RequestContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type ChannelHandler = Arc<
    dyn Fn(RequestContext, Value, Arc<Channel>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;
pub type SignalHandler = Arc<
    dyn Fn(RequestContext, Value) -> BoxFuture<'static, anyhow::Result<Arc<dyn Subscribable<Value>>>>
        + Send
        + Sync,
>;
pub type WritableSignalHandler = Arc<
    dyn Fn(RequestContext, Value) -> BoxFuture<'static, anyhow::Result<WritableSignalSource>> + Send + Sync,
>;

#[derive(Clone)]
pub enum Handler {
    Rpc(RpcHandler),
    Channel(ChannelHandler),
    Signal(SignalHandler),
    WritableSignal(WritableSignalHandler),
}

impl Handler {
    fn kind(&self) -> EndpointKind {
        match self {
            Self::Rpc(_) => EndpointKind::Rpc,
            Self::Channel(_) => EndpointKind::Channel,
            Self::Signal(_) => EndpointKind::Signal,
            Self::WritableSignal(_) => EndpointKind::WritableSignal,
        }
    }
}

struct Registered {
    endpoint: Endpoint,
    handler: Option<Handler>,
}

/// Endpoint table shared by a client and server port
#[derive(Default)]
pub struct BackendInterface {
    endpoints: HashMap<String, Registered>,
}

impl BackendInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint definition; names are unique across all kinds
    pub fn add(&mut self, endpoint: Endpoint) -> Result<&mut Self> {
        if self.endpoints.contains_key(&endpoint.name) {
            return Err(PortError::DuplicateEndpoint {
                endpoint: endpoint.name,
            });
        }
        self.endpoints.insert(
            endpoint.name.clone(),
            Registered {
                endpoint,
                handler: None,
            },
        );
        Ok(self)
    }

    pub fn on_rpc<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.attach(
            name,
            Handler::Rpc(Arc::new(move |ctx, parameter| Box::pin(handler(ctx, parameter)))),
        )
    }

    pub fn on_channel<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(RequestContext, Value, Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(
            name,
            Handler::Channel(Arc::new(move |ctx, parameter, channel| {
                Box::pin(handler(ctx, parameter, channel))
            })),
        )
    }

    pub fn on_signal<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Subscribable<Value>>>> + Send + 'static,
    {
        self.attach(
            name,
            Handler::Signal(Arc::new(move |ctx, parameter| Box::pin(handler(ctx, parameter)))),
        )
    }

    pub fn on_writable_signal<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WritableSignalSource>> + Send + 'static,
    {
        self.attach(
            name,
            Handler::WritableSignal(Arc::new(move |ctx, parameter| {
                Box::pin(handler(ctx, parameter))
            })),
        )
    }

    fn attach(&mut self, name: &str, handler: Handler) -> Result<&mut Self> {
        let registered = self
            .endpoints
            .get_mut(name)
            .ok_or_else(|| PortError::UnknownEndpoint {
                endpoint: name.to_string(),
            })?;
        if registered.endpoint.kind != handler.kind() {
            return Err(PortError::WrongEndpointKind {
                endpoint: name.to_string(),
                expected: handler.kind().to_string(),
                actual: registered.endpoint.kind.to_string(),
            });
        }
        if registered.handler.is_some() {
            return Err(PortError::DuplicateEndpoint {
                endpoint: name.to_string(),
            });
        }
        registered.handler = Some(handler);
        Ok(self)
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name).map(|registered| &registered.endpoint)
    }

    /// Definition of `name`, which must be of `kind`
    pub fn expect(&self, name: &str, kind: EndpointKind) -> Result<&Endpoint> {
        let endpoint = self.endpoint(name).ok_or_else(|| PortError::UnknownEndpoint {
            endpoint: name.to_string(),
        })?;
        if endpoint.kind != kind {
            return Err(PortError::WrongEndpointKind {
                endpoint: name.to_string(),
                expected: kind.to_string(),
                actual: endpoint.kind.to_string(),
            });
        }
        Ok(endpoint)
    }

    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.endpoints
            .get(name)
            .and_then(|registered| registered.handler.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Echo {
        x: i64,
    }

    #[test]
    fn test_duplicate_names_rejected_across_kinds() {
        let mut backend = BackendInterface::new();
        backend.add(Endpoint::rpc("echo")).unwrap();
        let err = backend.add(Endpoint::signal("echo")).err().unwrap();
        assert_eq!(
            err,
            PortError::DuplicateEndpoint {
                endpoint: "echo".to_string()
            }
        );
    }

    #[test]
    fn test_handler_must_match_kind() {
        let mut backend = BackendInterface::new();
        backend.add(Endpoint::channel("stream")).unwrap();
        let err = backend
            .on_rpc("stream", |_, parameter| async move { Ok(parameter) })
            .err()
            .unwrap();
        assert!(matches!(err, PortError::WrongEndpointKind { .. }));
        assert!(backend.on_rpc("missing", |_, p| async move { Ok(p) }).is_err());
        assert!(backend.handler("stream").is_none());
    }

    #[test]
    fn test_typed_schema_validation() {
        let endpoint = Endpoint::rpc("echo").parameter(Schema::of::<Echo>());
        assert!(endpoint.check_parameter(&json!({"x": 1})).is_ok());

        let err = endpoint.check_parameter(&json!({"y": 1})).unwrap_err();
        match err {
            PortError::Validation { endpoint, what, message } => {
                assert_eq!(endpoint, "echo");
                assert_eq!(what, "parameter");
                assert!(message.contains("x"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_extended_mode_schema_expects_wrapped_payload() {
        let endpoint = Endpoint::rpc("ratio")
            .parameter(Schema::of::<f64>())
            .mode(SerializationMode::Extended);
        let wrapped = SerializationMode::Extended.encode(&f64::NAN).unwrap();
        assert!(endpoint.check_parameter(&wrapped).is_ok());
        assert!(endpoint.check_parameter(&json!(1.5)).is_err());
    }

    #[test]
    fn test_writable_source_applies_patches_with_tags() {
        let signal = Signal::new(json!({"count": 0}));
        let source = WritableSignalSource::from_signal(signal.clone());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let _sub = signal.subscribe_full(move |_, _, tags| log.lock().push(tags.to_vec()));

        (source.write)(
            vec![Patch::replace(vec!["count".into()], json!(2))],
            vec!["t1".to_string()],
        )
        .unwrap();

        assert_eq!(signal.get(), json!({"count": 2}));
        assert_eq!(seen.lock().as_slice(), &[vec!["t1".to_string()]]);
        assert!((source.write)(vec![Patch::remove(vec!["missing".into()])], vec![]).is_err());
    }

    #[test]
    fn test_rejected_write_is_not_echoed() {
        let signal = Signal::new(json!({"count": 0}));
        let source = WritableSignalSource::from_signal(signal.clone());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let _sub = signal.subscribe_full(move |_, _, tags| log.lock().push(tags.to_vec()));

        let result = (source.write)(
            vec![Patch::remove(vec!["missing".into()])],
            vec!["lost".to_string()],
        );
        assert!(result.is_err());
        assert!(seen.lock().is_empty());
        assert_eq!(signal.get(), json!({"count": 0}));
    }

    #[test]
    fn test_concurrent_writes_both_land() {
        let signal = Signal::new(json!({"seed": true}));
        let source = WritableSignalSource::from_signal(signal.clone());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let _slow = signal.subscribe(move |value| {
            if value.get("a").is_some() && value.get("b").is_none() {
                let _ = entered_tx.send(());
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        });

        let first = source.clone();
        let a = std::thread::spawn(move || {
            (first.write)(vec![Patch::add(vec!["a".into()], json!(1))], vec!["a".into()])
        });
        entered_rx.recv().unwrap();
        let second = source.clone();
        let b = std::thread::spawn(move || {
            (second.write)(vec![Patch::add(vec!["b".into()], json!(2))], vec!["b".into()])
        });

        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
        assert_eq!(signal.get(), json!({"a": 1, "b": 2, "seed": true}));
    }
}
