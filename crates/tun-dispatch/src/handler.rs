//! Handler contracts.
//!
//! [`CommandHandler`] is the object-safe surface the registry, executor and
//! middleware pipeline route through.  Concrete business handlers usually
//! implement the typed scaffold [`TypedCommandHandler`] instead and wrap it
//! in [`Typed`], which standardises request parsing, validation, pre/post
//! hooks and response construction.

use crate::context::CommandContext;
use crate::error::DispatchError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;
use tun_protocol::{CommandCategory, CommandResponse, CommandType};

/// Whether a command expects a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDirection {
    /// Fire-and-forget; errors are logged, the peer sees nothing.
    Oneway,
    /// Request/response; exactly one response per request.
    Duplex,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn command_type(&self) -> CommandType;
    fn direction(&self) -> CommandDirection;
    fn name(&self) -> &str;

    fn category(&self) -> CommandCategory {
        self.command_type().category()
    }

    /// Type descriptors for routing layers that must treat heterogeneous
    /// handlers uniformly.  `None` when the handler has no declared type
    /// (untyped handlers, or a typed handler over any JSON document).
    fn request_type(&self) -> Option<&'static str> {
        None
    }

    fn response_type(&self) -> Option<&'static str> {
        None
    }

    async fn handle(&self, ctx: &mut CommandContext) -> Result<CommandResponse, DispatchError>;
}

// ---------------------------------------------------------------------------
// Typed scaffold
// ---------------------------------------------------------------------------

/// Compile-time-typed handler scaffold.
///
/// `process_request` is the only mandatory hook.  The wrapper parses the
/// request body into `Request`, runs validate/pre/process/post in order and
/// serialises `Response` into the success envelope.
#[async_trait]
pub trait TypedCommandHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    fn command_type(&self) -> CommandType;
    fn name(&self) -> &str;

    fn direction(&self) -> CommandDirection {
        CommandDirection::Duplex
    }

    fn category(&self) -> CommandCategory {
        self.command_type().category()
    }

    async fn validate_request(
        &self,
        _ctx: &CommandContext,
        _request: &Self::Request,
    ) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn pre_process(&self, _ctx: &mut CommandContext) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn process_request(
        &self,
        ctx: &mut CommandContext,
        request: Self::Request,
    ) -> Result<Self::Response, DispatchError>;

    async fn post_process(
        &self,
        _ctx: &mut CommandContext,
        _response: &mut Self::Response,
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Adapter lifting a [`TypedCommandHandler`] into the object-safe
/// [`CommandHandler`] the registry stores.
pub struct Typed<H>(H);

impl<H: TypedCommandHandler> Typed<H> {
    pub fn new(handler: H) -> Self {
        Typed(handler)
    }
}

#[async_trait]
impl<H: TypedCommandHandler> CommandHandler for Typed<H> {
    fn command_type(&self) -> CommandType {
        self.0.command_type()
    }

    fn direction(&self) -> CommandDirection {
        self.0.direction()
    }

    fn name(&self) -> &str {
        self.0.name()
    }

    fn category(&self) -> CommandCategory {
        self.0.category()
    }

    // `serde_json::Value` is the "any JSON document" top type; handlers over
    // it advertise no declared type.
    fn request_type(&self) -> Option<&'static str> {
        if TypeId::of::<H::Request>() == TypeId::of::<serde_json::Value>() {
            None
        } else {
            Some(std::any::type_name::<H::Request>())
        }
    }

    fn response_type(&self) -> Option<&'static str> {
        if TypeId::of::<H::Response>() == TypeId::of::<serde_json::Value>() {
            None
        } else {
            Some(std::any::type_name::<H::Response>())
        }
    }

    async fn handle(&self, ctx: &mut CommandContext) -> Result<CommandResponse, DispatchError> {
        ctx.validate()?;
        let request: H::Request = parse_request(ctx)?;
        self.0.validate_request(ctx, &request).await?;
        self.0.pre_process(ctx).await?;
        let mut response = self.0.process_request(ctx, request).await?;
        self.0.post_process(ctx, &mut response).await?;
        create_success_response(&response, &ctx.request_id)
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parses the context's request body into `T`.  An empty body is invalid for
/// typed handlers; handlers taking no input should accept an empty struct.
pub fn parse_request<T: DeserializeOwned>(ctx: &CommandContext) -> Result<T, DispatchError> {
    if ctx.request_body.is_empty() {
        return Err(DispatchError::InvalidData("empty request body".to_owned()));
    }
    serde_json::from_str(&ctx.request_body)
        .map_err(|e| DispatchError::InvalidData(format!("malformed request body: {e}")))
}

/// Serialises `data` into a success envelope carrying `request_id`.
pub fn create_success_response<T: Serialize>(
    data: &T,
    request_id: &str,
) -> Result<CommandResponse, DispatchError> {
    let json = serde_json::to_string(data)
        .map_err(|e| DispatchError::InvalidData(format!("response serialization: {e}")))?;
    let mut response = CommandResponse::ok(Some(json));
    response.request_id = request_id.to_owned();
    Ok(response)
}

/// Wraps an error into a failure envelope carrying `request_id`.
pub fn create_error_response(error: &DispatchError, request_id: &str) -> CommandResponse {
    let mut response = CommandResponse::err(error.to_string());
    response.request_id = request_id.to_owned();
    response
}
