//! Authorization broker - run privileged actions through an on-demand helper
//!
//! A client builds an [`Action`], asks for its [`AuthStatus`] and runs it as
//! an [`ExecuteJob`]. Depending on the policy backend's capabilities the job
//! either authorizes the caller itself or leaves that to the helper process,
//! which receives the request over a [`HelperTransport`].

pub mod action;
pub mod backend;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod helper;
pub mod job;
pub mod logging;
pub mod registry;
pub mod reply;
pub mod transport;

pub use action::{Action, AuthDetail, AuthStatus, DetailsMap, ExecutionMode, VariantMap};
pub use backend::{Capabilities, Capability, PolicyBackend};
pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use job::{ExecuteJob, JobEvent, JobResult, JobState, KillVerbosity};
pub use registry::BackendRegistry;
pub use reply::{ActionReply, ErrorCode, ReplyKind};
pub use transport::HelperTransport;
