//! Client for a recheck agent process.
//!
//! An agent is a single external process that accepts `check`, `cancel` and
//! `ping` requests on stdin and answers on stdout, one JSON document per line.
//! Many logical requests are multiplexed over that one stream by id.
//!
//! # Architecture
//!
//! - `Agent`: request/response correlation over one connection
//! - `StdioTransport`: process spawning and stdio handles
//! - `AgentConfig`: command line of the agent process
//!
//! # Example
//!
//! ```no_run
//! use recheck_agent::{Agent, AgentConfig};
//! use recheck_core::{CheckOptions, KeepAlive};
//!
//! # async fn example() -> Result<(), recheck_agent::AgentError> {
//! let config = AgentConfig::new("recheck").with_args(vec!["agent".to_string()]);
//! let agent = Agent::spawn(config, KeepAlive::new()).await?;
//!
//! let diagnostics = agent.check("^(a+)+$", "", CheckOptions::new()).await?;
//! println!("{:?}", diagnostics.status());
//!
//! agent.kill().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod lifecycle;
pub mod transport;
pub mod types;

pub use agent::{Agent, RequestHandle};
pub use lifecycle::{health_check, HealthStatus};
pub use transport::StdioTransport;
pub use types::{AgentConfig, AgentError};
