pub mod library;
pub mod node;
pub mod sort;
pub mod tree;

pub use library::{event_channel, Library};
pub use node::{Node, NodeId, NodeKind, PopulateState};
pub use tree::{LibraryModel, ModelEvent, NodeInfo};
