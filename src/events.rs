use std::sync::Arc;

use crate::online_miner::OnlineMinerProcess;

/// Notifications emitted by a [`crate::managers::BaseManager`].
#[derive(Debug)]
pub enum ManagerEvent<T> {
    ObjectAdded(Arc<T>),
    ObjectRemoved(Arc<T>),
    ActiveChanged(Option<Arc<T>>),
    Cleared,
}

// Manual impl: the payload is shared, `T` itself need not be `Clone`.
impl<T> Clone for ManagerEvent<T> {
    fn clone(&self) -> Self {
        match self {
            Self::ObjectAdded(obj) => Self::ObjectAdded(Arc::clone(obj)),
            Self::ObjectRemoved(obj) => Self::ObjectRemoved(Arc::clone(obj)),
            Self::ActiveChanged(obj) => Self::ActiveChanged(obj.clone()),
            Self::Cleared => Self::Cleared,
        }
    }
}

/// Snapshot of the online miners currently running RefreshDB.
#[derive(Debug, Clone)]
pub struct MinersChanged(pub Vec<Arc<OnlineMinerProcess>>);

#[derive(Debug, Clone)]
pub struct SearchStringChanged(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetEvent {
    CountChanged(u32),
    OffsetChanged(u32),
}
