//! plasma: a peer-to-peer property-graph query engine.
//!
//! Each peer owns a local property graph and answers declarative path
//! queries. A query lowers into a DAG of streaming operators executed as
//! cooperative tasks over channels; when a traversal lands on a proxy
//! node, the plan is cut at that point, shipped to the proxy's peer, and
//! the remote result stream is spliced back into the local dataflow.

pub mod builder;
pub mod config;
pub mod error;
pub mod exec;
pub mod expr;
pub mod graph;
pub mod model;
pub mod net;
pub mod peer;
pub mod plan;
pub mod planner;
pub mod subplan;
pub mod telemetry;
pub mod tuple;

pub use crate::builder::PathQueryBuilder;
pub use crate::config::PeerConfig;
pub use crate::error::{PlasmaError, Result};
pub use crate::exec::{records, ErrorEvent, QueryStream, ResultEvent, Row, Runtime};
pub use crate::graph::{EdgePredicate, GraphStore, MemoryGraph};
pub use crate::model::{Node, NodeId, PropValue};
pub use crate::net::{Connector, PeerUrl};
pub use crate::peer::Peer;
pub use crate::plan::{OpId, OpKind, Plan, ROOT_PARAM};
pub use crate::planner::{PathQuery, Planner, PlannerConfig};
