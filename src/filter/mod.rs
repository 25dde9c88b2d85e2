//! Filter subsystem.
//!
//! # Data Flow
//! ```text
//! Virtual cluster config (filters = [...])
//!     → factory.rs (FilterFactoryRegistry: type name → FilterFactory)
//!     → per accepted connection: FilterFactory::create_filter()
//!     → Filter (name + capability set of handler registrations)
//!     → dispatch walks the chain, looking handlers up by api key
//!
//! Handler invocation:
//!     (header, body, FilterContext) → Future<RequestFilterResult | ResponseFilterResult>
//! ```
//!
//! # Design Decisions
//! - A filter is a value, not a type hierarchy: handlers are registered per api key
//! - Filters not registered for a frame's (api key, version) are skipped transparently
//! - Handlers are `'static` futures so the dispatcher can run them concurrently
//! - Per-connection state lives in whatever the handler closures capture

pub mod builtin;
pub mod context;
pub mod factory;
pub mod result;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::frame::{ApiKey, RequestHeader, ResponseHeader};

pub use context::{ConnectionInfo, FilterContext, SaslIdentity};
pub use factory::{FilterFactory, FilterFactoryRegistry};
pub use result::{
    RequestDisposition, RequestFilterResult, RequestFilterResultBuilder, ResponseDisposition,
    ResponseFilterResult, ResponseFilterResultBuilder,
};

/// Versions matched when a registration does not narrow them.
pub const ALL_VERSIONS: RangeInclusive<i16> = 0..=i16::MAX;

/// Error type for filter invocations.
///
/// Any error returned by a handler is fatal for the connection it ran on.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("malformed filter result: {0}")]
    MalformedResult(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("self-sent request was dropped before reaching the upstream")]
    RequestDropped,

    #[error("response to a self-sent request was dropped")]
    ResponseDropped,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl FilterError {
    pub fn failed(message: impl Into<String>) -> Self {
        FilterError::Failed(message.into())
    }
}

pub type RequestFuture = BoxFuture<'static, Result<RequestFilterResult, FilterError>>;
pub type ResponseFuture = BoxFuture<'static, Result<ResponseFilterResult, FilterError>>;

/// Handles requests for the api keys it is registered against.
pub trait RequestHandler: Send + Sync {
    fn on_request(&self, header: RequestHeader, body: Bytes, ctx: FilterContext) -> RequestFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestHeader, Bytes, FilterContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RequestFilterResult, FilterError>> + Send + 'static,
{
    fn on_request(&self, header: RequestHeader, body: Bytes, ctx: FilterContext) -> RequestFuture {
        self(header, body, ctx).boxed()
    }
}

/// Handles responses for the api keys it is registered against.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, header: ResponseHeader, body: Bytes, ctx: FilterContext) -> ResponseFuture;
}

impl<F, Fut> ResponseHandler for F
where
    F: Fn(ResponseHeader, Bytes, FilterContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseFilterResult, FilterError>> + Send + 'static,
{
    fn on_response(&self, header: ResponseHeader, body: Bytes, ctx: FilterContext) -> ResponseFuture {
        self(header, body, ctx).boxed()
    }
}

struct Registration<H: ?Sized> {
    versions: RangeInclusive<i16>,
    handler: Arc<H>,
}

impl<H: ?Sized> Registration<H> {
    fn matches(&self, version: i16) -> bool {
        self.versions.contains(&version)
    }
}

/// Looks up the registration for `(api, version)`: api-specific first, then catch-all.
fn lookup<'a, H: ?Sized>(
    by_api: &'a HashMap<ApiKey, Registration<H>>,
    any: &'a Option<Registration<H>>,
    api: ApiKey,
    version: i16,
) -> Option<&'a Arc<H>> {
    by_api
        .get(&api)
        .filter(|r| r.matches(version))
        .or_else(|| any.as_ref().filter(|r| r.matches(version)))
        .map(|r| &r.handler)
}

/// A unit of policy: a name plus the handlers it opts into.
pub struct Filter {
    name: Arc<str>,
    requests: HashMap<ApiKey, Registration<dyn RequestHandler>>,
    any_request: Option<Registration<dyn RequestHandler>>,
    responses: HashMap<ApiKey, Registration<dyn ResponseHandler>>,
    any_response: Option<Registration<dyn ResponseHandler>>,
}

impl Filter {
    pub fn builder(name: impl Into<Arc<str>>) -> FilterBuilder {
        FilterBuilder {
            filter: Filter {
                name: name.into(),
                requests: HashMap::new(),
                any_request: None,
                responses: HashMap::new(),
                any_response: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn request_handler(&self, api: ApiKey, version: i16) -> Option<&Arc<dyn RequestHandler>> {
        lookup(&self.requests, &self.any_request, api, version)
    }

    pub fn response_handler(&self, api: ApiKey, version: i16) -> Option<&Arc<dyn ResponseHandler>> {
        lookup(&self.responses, &self.any_response, api, version)
    }

    pub fn handles_request(&self, api: ApiKey, version: i16) -> bool {
        self.request_handler(api, version).is_some()
    }

    pub fn handles_response(&self, api: ApiKey, version: i16) -> bool {
        self.response_handler(api, version).is_some()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("any_request", &self.any_request.is_some())
            .field("responses", &self.responses.keys().collect::<Vec<_>>())
            .field("any_response", &self.any_response.is_some())
            .finish()
    }
}

/// Builds a [`Filter`] from handler registrations.
pub struct FilterBuilder {
    filter: Filter,
}

impl FilterBuilder {
    /// Handle requests for `api` at every version.
    pub fn on_request<F, Fut>(self, api: ApiKey, handler: F) -> Self
    where
        F: Fn(RequestHeader, Bytes, FilterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestFilterResult, FilterError>> + Send + 'static,
    {
        self.on_request_versions(api, ALL_VERSIONS, handler)
    }

    /// Handle requests for `api` within `versions`.
    pub fn on_request_versions<F, Fut>(mut self, api: ApiKey, versions: RangeInclusive<i16>, handler: F) -> Self
    where
        F: Fn(RequestHeader, Bytes, FilterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestFilterResult, FilterError>> + Send + 'static,
    {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        self.filter.requests.insert(api, Registration { versions, handler });
        self
    }

    /// Handle every request the more specific registrations do not claim.
    pub fn on_any_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RequestHeader, Bytes, FilterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestFilterResult, FilterError>> + Send + 'static,
    {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        self.filter.any_request = Some(Registration {
            versions: ALL_VERSIONS,
            handler,
        });
        self
    }

    /// Handle responses for `api` at every version.
    pub fn on_response<F, Fut>(self, api: ApiKey, handler: F) -> Self
    where
        F: Fn(ResponseHeader, Bytes, FilterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseFilterResult, FilterError>> + Send + 'static,
    {
        self.on_response_versions(api, ALL_VERSIONS, handler)
    }

    pub fn on_response_versions<F, Fut>(mut self, api: ApiKey, versions: RangeInclusive<i16>, handler: F) -> Self
    where
        F: Fn(ResponseHeader, Bytes, FilterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseFilterResult, FilterError>> + Send + 'static,
    {
        let handler: Arc<dyn ResponseHandler> = Arc::new(handler);
        self.filter.responses.insert(api, Registration { versions, handler });
        self
    }

    pub fn on_any_response<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ResponseHeader, Bytes, FilterContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseFilterResult, FilterError>> + Send + 'static,
    {
        let handler: Arc<dyn ResponseHandler> = Arc::new(handler);
        self.filter.any_response = Some(Registration {
            versions: ALL_VERSIONS,
            handler,
        });
        self
    }

    pub fn build(self) -> Filter {
        self.filter
    }
}
