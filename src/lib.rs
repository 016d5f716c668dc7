//! Route Guard
//!
//! A route service that decides, per request, whether to forward to the URL in
//! the X-CF-Forwarded-Url header or answer 503. The decision is made from the
//! X-Forwarded-For chain against accept and deny CIDR lists, with an optional
//! deny-by-path override.

pub mod config;
pub mod engine;
pub mod error;
pub mod forwarded;
pub mod proxy;
pub mod rules;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{
    Config, DEFAULT_CONFIG_FILE, ListenConfig, RulesConfig, UpstreamConfig, load_config,
};
pub use engine::{Decision, DecisionEngine, Verdict};
pub use error::{RequestError, RuleError, TargetUrlFault};
pub use proxy::{RouteService, handle_connection, serve};
pub use rules::{MATCH_ALL_PATHS, RejectPaths, RuleSet, SubnetRule};
pub use tls::load_upstream_tls_config;
