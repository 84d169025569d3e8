// tun-dispatch: Command dispatch core for the tunnel control plane.
//
// The session layer decodes frames and hands each command packet to this
// crate: the executor builds a per-execution context, runs the middleware
// pipeline around the registered handler, and routes duplex responses back
// through the session while correlating them with the awaiting caller.
//
// Seams are explicit: the session is consumed only through the
// `ConnectionRegistry`/`ResponseSink` traits, cancellation is an explicit
// token, and every in-flight duplex exchange lives in the `RpcCorrelator`.

pub mod client;
pub mod context;
pub mod correlator;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod ids;
pub mod middleware;
pub mod registry;
pub mod service;
pub mod session;

pub use client::{CommandClient, OnewayCommandClient};
pub use context::CommandContext;
pub use correlator::{DEFAULT_RPC_TIMEOUT, RpcCorrelator};
pub use error::DispatchError;
pub use events::{EventBus, ServiceEvent};
pub use executor::{CommandExecutor, ONEWAY_TIMEOUT};
pub use handler::{
    CommandDirection, CommandHandler, Typed, TypedCommandHandler, create_error_response,
    create_success_response, parse_request,
};
pub use middleware::{Middleware, MiddlewareResult, Next, run_pipeline};
pub use registry::CommandRegistry;
pub use service::{CommandService, ServiceStats};
pub use session::{ConnectionRegistry, PacketSink, ResponseSink, SessionResponseSink};
