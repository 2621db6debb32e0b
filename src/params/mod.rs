pub mod holder;
pub mod sync;
pub mod tree;

pub use holder::{ChangeCallback, HolderError, HolderRegistry, ParameterHandle};
pub use sync::{Reconciliation, reconcile};
pub use tree::{ParameterNode, ParameterTree, TreeListener};
