//! Component registry and call dispatcher.
//!
//! Components and their methods are registered explicitly at startup. The
//! registry is then frozen into a [`Dispatcher`] that resolves an inbound
//! [`Call`] to its handler, enforces the method's trust requirement and turns
//! the handler outcome into the envelope sent back to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;
use wolpertinger_protocol::{
    Call, Envelope, ErrorCode, ErrorMessage, FromValue, IntoValue, ProtocolError, Response,
    SessionKey, TrustLevel, TypeRegistry, Value,
};

use crate::connection::Connection;
use crate::session::SessionState;
use crate::transport::PeerId;

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send nothing back, even if the caller expects a response.
    NoResponse,
    /// Answer with a Response carrying this value.
    Value(Option<Value>),
}

impl Outcome {
    /// A response without a value.
    pub fn empty() -> Self {
        Outcome::Value(None)
    }

    /// A response carrying `value`.
    pub fn value(value: impl IntoValue) -> Self {
        Outcome::Value(Some(value.into_value()))
    }
}

/// Result returned by every method handler.
pub type HandlerResult = Result<Outcome, ErrorCode>;

/// Type-erased async method handler.
pub type Handler =
    Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, params| f(ctx, params).boxed())
}

/// Reads parameter `index` as `T`, mapping absence or a wrong kind to
/// [`ErrorCode::InvalidParameters`].
pub fn param<T: FromValue>(params: &[Value], index: usize) -> Result<T, ErrorCode> {
    let value = params
        .get(index)
        .cloned()
        .ok_or(ErrorCode::InvalidParameters)?;
    T::from_value(value).map_err(|_| ErrorCode::InvalidParameters)
}

/// Per-call context handed to a handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The peer that sent the call.
    pub peer: PeerId,
    /// Correlation id of the call.
    pub call_id: Uuid,
    /// Security state of the connection the call arrived on.
    pub session: Arc<SessionState>,
    epoch: u64,
    connection: Option<Weak<Connection>>,
}

impl CallContext {
    /// Creates a context for a call.
    pub fn new(peer: impl Into<PeerId>, call_id: Uuid, session: Arc<SessionState>) -> Self {
        Self {
            peer: peer.into(),
            call_id,
            epoch: session.epoch(),
            session,
            connection: None,
        }
    }

    /// Attaches the connection the call arrived on.
    pub fn with_connection(mut self, connection: Weak<Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// The connection the call arrived on, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    /// The caller's trust level at the time of the call.
    pub fn trust_level(&self) -> TrustLevel {
        self.session.trust_level()
    }

    /// Raises the caller's trust, unless the session was reset after the
    /// call arrived.
    pub(crate) fn escalate(&self, level: TrustLevel) -> Option<TrustLevel> {
        self.session.escalate_in(self.epoch, level)
    }

    /// Stores the agreed session key, unless the session was reset after the
    /// call arrived.
    pub(crate) fn set_session_key(&self, key: SessionKey) -> bool {
        self.session.set_session_key_in(self.epoch, key)
    }
}

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The (component, method) pair is already registered.
    #[error("method already registered: {component}.{method}")]
    DuplicateMethod {
        /// Component name.
        component: String,
        /// Method name.
        method: String,
    },

    /// A composite type could not be registered.
    #[error("type registration failed: {0}")]
    Type(#[from] ProtocolError),
}

/// One remotely invocable method.
#[derive(Clone)]
pub struct MethodDescriptor {
    name: String,
    required_trust: TrustLevel,
    handler: Handler,
}

impl MethodDescriptor {
    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minimum trust level a caller needs.
    pub fn required_trust(&self) -> TrustLevel {
        self.required_trust
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("required_trust", &self.required_trust)
            .finish_non_exhaustive()
    }
}

/// A named group of methods.
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl ComponentDescriptor {
    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Mutable registry used during startup.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    components: HashMap<String, ComponentDescriptor>,
    types: TypeRegistry,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as `component.method`, callable at `required_trust` or above.
    pub fn register(
        &mut self,
        component: &str,
        method: &str,
        required_trust: TrustLevel,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        let descriptor = self
            .components
            .entry(component.to_string())
            .or_insert_with(|| ComponentDescriptor {
                name: component.to_string(),
                methods: HashMap::new(),
            });

        if descriptor.methods.contains_key(method) {
            return Err(RegistryError::DuplicateMethod {
                component: component.to_string(),
                method: method.to_string(),
            });
        }

        descriptor.methods.insert(
            method.to_string(),
            MethodDescriptor {
                name: method.to_string(),
                required_trust,
                handler,
            },
        );
        debug!(component, method, required_trust = %required_trust, "Registered method");
        Ok(())
    }

    /// Registers a composite type that may appear in parameters or results.
    pub fn register_type<T>(&mut self, name: &str) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.types.register::<T>(name)?;
        Ok(())
    }

    /// Freezes the registry.
    pub fn into_dispatcher(self) -> Dispatcher {
        Dispatcher {
            components: self.components,
            types: Arc::new(self.types),
        }
    }
}

/// Immutable dispatch table shared by all connections.
#[derive(Debug)]
pub struct Dispatcher {
    components: HashMap<String, ComponentDescriptor>,
    types: Arc<TypeRegistry>,
}

impl Dispatcher {
    /// Looks up a component by name.
    pub fn component(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.components.get(name)
    }

    /// Registered component names, sorted.
    pub fn component_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.components.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Trust required by `component.method`, if it exists.
    pub fn required_trust(&self, component: &str, method: &str) -> Option<TrustLevel> {
        self.component(component)?
            .method(method)
            .map(MethodDescriptor::required_trust)
    }

    /// Composite types known to this node.
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Resolves and runs `call`, returning the envelope to send back, if any.
    pub async fn dispatch(&self, ctx: CallContext, call: Call) -> Option<Envelope> {
        let reply = self.execute(ctx, &call).await;

        if !call.response_expected {
            if let Err(code) = reply {
                warn!(
                    component = %call.component,
                    method = %call.method,
                    call_id = %call.call_id,
                    code = %code,
                    "Notification failed"
                );
            }
            return None;
        }

        match reply {
            Ok(Outcome::NoResponse) => None,
            Ok(Outcome::Value(value)) => Some(Envelope::Response(Response::for_call(&call, value))),
            Err(code) => Some(Envelope::Error(ErrorMessage::for_call(&call, code))),
        }
    }

    async fn execute(&self, ctx: CallContext, call: &Call) -> HandlerResult {
        let component = self.component(&call.component).ok_or_else(|| {
            debug!(component = %call.component, "Component not found");
            ErrorCode::ComponentNotFound
        })?;

        let method = component.method(&call.method).ok_or_else(|| {
            debug!(component = %call.component, method = %call.method, "Method not found");
            ErrorCode::MethodNotFound
        })?;

        let trust = ctx.trust_level();
        if !trust.permits(method.required_trust) {
            warn!(
                peer = %ctx.peer,
                component = %call.component,
                method = %call.method,
                trust = %trust,
                required = %method.required_trust,
                "Call rejected: insufficient trust"
            );
            return Err(ErrorCode::NotAuthorized);
        }

        for parameter in &call.parameters {
            if let Err(e) = self.types.validate(parameter) {
                debug!(error = %e, "Rejected call parameter");
                return Err(e.error_code());
            }
        }

        debug!(
            peer = %ctx.peer,
            component = %call.component,
            method = %call.method,
            call_id = %call.call_id,
            "Dispatching call"
        );

        let handler = Arc::clone(&method.handler);
        let parameters = call.parameters.clone();
        match AssertUnwindSafe(async move { handler(ctx, parameters).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    component = %call.component,
                    method = %call.method,
                    "Handler panicked"
                );
                Err(ErrorCode::UnspecifiedError)
            }
        }
    }
}
