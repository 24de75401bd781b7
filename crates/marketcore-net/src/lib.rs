pub mod behaviour;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod identity;
pub mod log_layer;
pub mod node;
pub mod protocol;
pub mod pubsub;
pub mod reconnect;
pub mod router;
pub mod transport;

pub use behaviour::{NodeBehaviour, NodeBehaviourEvent};
pub use bootstrap::{BootstrapResolver, PassthroughResolver};
pub use config::NetConfig;
pub use error::NetError;
pub use identity::PeerIdentity;
pub use log_layer::LogEntry;
pub use node::{NetEvent, NetHandle, Node, Reachability};
pub use protocol::{codec::Ack, envelope::Envelope};
pub use reconnect::{PeerRecord, ReconnectState, ReconnectSupervisor, SupervisorMetrics};
pub use router::{DeliveryRole, Route};
