//! Fabric path discovery for an SDN controller.
//!
//! Switches are colored so that no two neighbors share a color, and every
//! switch is programmed to punt packets carrying a neighbor's color to the
//! controller. A probe injected at its source's attachment point, tagged
//! with that switch's color, is therefore caught by whichever neighbor
//! receives it next. Each catch records a hop, the probe is re-emitted with
//! the catching switch's color, and the trace ends once the fabric has been
//! quiet for the idle timeout.
//!
//! - [`coloring`]: greedy coloring of the switch graph
//! - [`rules`]: per-switch tag rule programming
//! - [`injector`]: colored probe emission
//! - [`session`]: the per-attempt hop recording state machine
//! - [`registry`]: topology epoch and the coloring computed for it
//! - [`service`]: request entry point with restart-on-change
//! - [`rest_api`]: HTTP front-end
//! - [`sim`]: in-memory lab fabric implementing the controller seams

pub mod coloring;
pub mod config;
pub mod error;
pub mod fabric;
pub mod injector;
pub mod registry;
pub mod rest_api;
pub mod rules;
pub mod service;
pub mod session;
pub mod sim;

pub use config::{ForwardingMode, TraceConfig, TracerouteConfig};
pub use error::{Result, SwitchIoError, TraceError};
pub use registry::ConfigRegistry;
pub use service::{Collaborators, TraceReport, TraceService};
