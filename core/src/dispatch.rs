//! Handler registries and the dispatch resolver used by the execute stage.
//!
//! Two lookup strategies exist, selected by [`ProcessingMode`]:
//!
//! - **Request/response**: a [`RequestHandler`] registered for the exact
//!   `(request type, response type)` pair.
//! - **Transaction processor**: a [`TransactionProcessor`] registered for the
//!   request's concrete type.
//!
//! Both registries are built once at startup through explicit `register` calls and are
//! immutable afterwards. Keys are [`TypeId`]s, so a lookup is a hash probe plus a
//! downcast; nothing is discovered at runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! let handlers = HandlerRegistry::builder()
//!     .register::<CreditCommand, CreditResponse, _>(CreditHandler::new(accounts))
//!     .build()?;
//!
//! let resolver = DispatchResolver::new(ProcessingMode::RequestResponse, handlers, ProcessorRegistry::empty());
//! let outcome: Outcome<CreditResponse> = resolver.dispatch(&command, &ctx).await;
//! ```

use crate::context::PipelineContext;
use crate::event_bus::BoxFuture;
use crate::outcome::Outcome;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Process-wide handler lookup strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// Look up handlers by (request, response) type pair.
    #[default]
    RequestResponse,
    /// Look up processors by request type.
    TransactionProcessor,
}

impl ProcessingMode {
    /// Parse a configuration value (case-insensitive, `-`/`_` tolerated).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "requestresponse" => Some(Self::RequestResponse),
            "transactionprocessor" => Some(Self::TransactionProcessor),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestResponse => f.write_str("RequestResponse"),
            Self::TransactionProcessor => f.write_str("TransactionProcessor"),
        }
    }
}

/// Registry construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Two handlers were registered for the same type pair.
    #[error("duplicate handler registration for {request}→{response}")]
    DuplicateHandler {
        /// Request type name
        request: String,
        /// Response type name
        response: String,
    },

    /// Two processors were registered for the same request type.
    #[error("duplicate processor registration for {request}")]
    DuplicateProcessor {
        /// Request type name
        request: String,
    },
}

/// Unqualified name of a type: `my_app::commands::CreditCommand` → `CreditCommand`.
///
/// Generic arguments are shortened too: `alloc::vec::Vec<my_app::Line>` → `Vec<Line>`.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> String {
    shorten(std::any::type_name::<T>())
}

fn shorten(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for c in full.chars() {
        match c {
            '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&' => {
                out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
                segment.clear();
                out.push(c);
            },
            _ => segment.push(c),
        }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
    out
}

/// Handles one request type and produces one response type.
pub trait RequestHandler<Req, Resp>: Send + Sync {
    /// Handle the request.
    fn handle<'a>(&'a self, request: &'a Req, ctx: &'a PipelineContext) -> BoxFuture<'a, Outcome<Resp>>;
}

/// Processes one concrete request type.
pub trait TransactionProcessor<Req, Resp>: Send + Sync {
    /// Process the request.
    fn process<'a>(&'a self, request: &'a Req, ctx: &'a PipelineContext) -> BoxFuture<'a, Outcome<Resp>>;
}

/// Registration key, kept for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    /// Unqualified request type name
    pub request: String,
    /// Unqualified response type name
    pub response: String,
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.request, self.response)
    }
}

type ErasedEntry = Arc<dyn Any + Send + Sync>;

/// Immutable map from `(request, response)` type pairs to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(TypeId, TypeId), (HandlerKey, ErasedEntry)>,
}

impl HandlerRegistry {
    /// Start collecting registrations.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Registry with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Handler for the exact type pair, if registered.
    #[must_use]
    pub fn get<Req: 'static, Resp: 'static>(&self) -> Option<Arc<dyn RequestHandler<Req, Resp>>> {
        self.handlers
            .get(&(TypeId::of::<Req>(), TypeId::of::<Resp>()))
            .and_then(|(_, entry)| entry.downcast_ref::<Arc<dyn RequestHandler<Req, Resp>>>())
            .cloned()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type pairs, sorted for stable output.
    #[must_use]
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.handlers.values().map(|(key, _)| key.clone()).collect();
        keys.sort_by(|a, b| (&a.request, &a.response).cmp(&(&b.request, &b.response)));
        keys
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.keys()).finish()
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<(TypeId, TypeId), (HandlerKey, ErasedEntry)>,
    duplicates: Vec<HandlerKey>,
}

impl HandlerRegistryBuilder {
    /// Register `handler` for `Req → Resp`.
    #[must_use]
    pub fn register<Req, Resp, H>(mut self, handler: H) -> Self
    where
        Req: 'static,
        Resp: 'static,
        H: RequestHandler<Req, Resp> + 'static,
    {
        let key = HandlerKey {
            request: short_type_name::<Req>(),
            response: short_type_name::<Resp>(),
        };
        let handler: Arc<dyn RequestHandler<Req, Resp>> = Arc::new(handler);
        let entry: ErasedEntry = Arc::new(handler);

        if self
            .handlers
            .insert((TypeId::of::<Req>(), TypeId::of::<Resp>()), (key.clone(), entry))
            .is_some()
        {
            self.duplicates.push(key);
        }
        self
    }

    /// Freeze the registrations.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateHandler`] if any pair was registered twice.
    pub fn build(self) -> Result<HandlerRegistry, DispatchError> {
        if let Some(key) = self.duplicates.into_iter().next() {
            return Err(DispatchError::DuplicateHandler {
                request: key.request,
                response: key.response,
            });
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}

/// Immutable map from request types to processors.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<TypeId, (HandlerKey, TypeId, ErasedEntry)>,
}

impl ProcessorRegistry {
    /// Start collecting registrations.
    #[must_use]
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    /// Registry with no processors.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Processor for `Req`, if one is registered and it produces `Resp`.
    #[must_use]
    pub fn get<Req: 'static, Resp: 'static>(&self) -> Option<Arc<dyn TransactionProcessor<Req, Resp>>> {
        self.processors
            .get(&TypeId::of::<Req>())
            .filter(|(_, response, _)| *response == TypeId::of::<Resp>())
            .and_then(|(_, _, entry)| entry.downcast_ref::<Arc<dyn TransactionProcessor<Req, Resp>>>())
            .cloned()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Registered request types with the response each produces.
    #[must_use]
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.processors.values().map(|(key, _, _)| key.clone()).collect();
        keys.sort_by(|a, b| a.request.cmp(&b.request));
        keys
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry").field("processors", &self.keys()).finish()
    }
}

/// Builder for [`ProcessorRegistry`].
#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: HashMap<TypeId, (HandlerKey, TypeId, ErasedEntry)>,
    duplicates: Vec<String>,
}

impl ProcessorRegistryBuilder {
    /// Register `processor` for requests of type `Req`.
    #[must_use]
    pub fn register<Req, Resp, P>(mut self, processor: P) -> Self
    where
        Req: 'static,
        Resp: 'static,
        P: TransactionProcessor<Req, Resp> + 'static,
    {
        let key = HandlerKey {
            request: short_type_name::<Req>(),
            response: short_type_name::<Resp>(),
        };
        let processor: Arc<dyn TransactionProcessor<Req, Resp>> = Arc::new(processor);
        let entry: ErasedEntry = Arc::new(processor);

        let request = key.request.clone();
        if self
            .processors
            .insert(TypeId::of::<Req>(), (key, TypeId::of::<Resp>(), entry))
            .is_some()
        {
            self.duplicates.push(request);
        }
        self
    }

    /// Freeze the registrations.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateProcessor`] if a request type was registered twice.
    pub fn build(self) -> Result<ProcessorRegistry, DispatchError> {
        if let Some(request) = self.duplicates.into_iter().next() {
            return Err(DispatchError::DuplicateProcessor { request });
        }
        Ok(ProcessorRegistry {
            processors: self.processors,
        })
    }
}

/// Routes a request to its handler or processor according to the processing mode.
///
/// The mode is process-wide. A per-request-type override can be configured for
/// deployments that need both strategies side by side.
#[derive(Clone, Debug)]
pub struct DispatchResolver {
    mode: ProcessingMode,
    overrides: HashMap<TypeId, ProcessingMode>,
    handlers: Arc<HandlerRegistry>,
    processors: Arc<ProcessorRegistry>,
}

impl DispatchResolver {
    /// Create a resolver over the two registries.
    #[must_use]
    pub fn new(mode: ProcessingMode, handlers: HandlerRegistry, processors: ProcessorRegistry) -> Self {
        Self {
            mode,
            overrides: HashMap::new(),
            handlers: Arc::new(handlers),
            processors: Arc::new(processors),
        }
    }

    /// Dispatch requests of type `Req` with `mode` regardless of the global mode.
    #[must_use]
    pub fn with_mode_override<Req: 'static>(mut self, mode: ProcessingMode) -> Self {
        self.overrides.insert(TypeId::of::<Req>(), mode);
        self
    }

    /// The global mode.
    #[must_use]
    pub const fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// The mode that applies to `Req`.
    #[must_use]
    pub fn mode_for<Req: 'static>(&self) -> ProcessingMode {
        self.overrides
            .get(&TypeId::of::<Req>())
            .copied()
            .unwrap_or(self.mode)
    }

    /// Whether a handler or processor is registered for `Req → Resp` under the
    /// mode that applies to `Req`.
    #[must_use]
    pub fn has_route<Req: 'static, Resp: 'static>(&self) -> bool {
        match self.mode_for::<Req>() {
            ProcessingMode::RequestResponse => self.handlers.get::<Req, Resp>().is_some(),
            ProcessingMode::TransactionProcessor => self.processors.get::<Req, Resp>().is_some(),
        }
    }

    /// Look up the handler or processor for `Req → Resp` and invoke it.
    ///
    /// The handler's outcome is returned unchanged. A missing registration yields
    /// a failure naming both types.
    pub async fn dispatch<Req, Resp>(&self, request: &Req, ctx: &PipelineContext) -> Outcome<Resp>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        match self.mode_for::<Req>() {
            ProcessingMode::RequestResponse => {
                let Some(handler) = self.handlers.get::<Req, Resp>() else {
                    let message = format!(
                        "no handler registered for {}→{}",
                        short_type_name::<Req>(),
                        short_type_name::<Resp>()
                    );
                    tracing::error!(
                        correlation_id = %ctx.correlation_id(),
                        mode = %ProcessingMode::RequestResponse,
                        "{message}"
                    );
                    return Outcome::Failure(message);
                };
                handler.handle(request, ctx).await
            },
            ProcessingMode::TransactionProcessor => {
                let Some(processor) = self.processors.get::<Req, Resp>() else {
                    let message = format!(
                        "no processor registered for {}→{}",
                        short_type_name::<Req>(),
                        short_type_name::<Resp>()
                    );
                    tracing::error!(
                        correlation_id = %ctx.correlation_id(),
                        mode = %ProcessingMode::TransactionProcessor,
                        "{message}"
                    );
                    return Outcome::Failure(message);
                };
                processor.process(request, ctx).await
            },
        }
    }
}
