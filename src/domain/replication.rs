// ============================================================
// Layer 3 — Model Handle
// ============================================================
// The training loop either drives a model directly or through a
// data-parallel replication layer that partitions every batch
// across replicas and reduces per-replica losses to one scalar.
//
// Checkpoints must always address the single canonical parameter
// set, whichever way the model is wrapped, so the wrapping is an
// explicit enum with one accessor instead of a runtime check.

/// A model, optionally behind a replication wrapper.
#[derive(Debug, Clone)]
pub enum ModelHandle<M> {
    /// Single-copy execution.
    Unwrapped(M),
    /// Data-parallel execution over `replicas` batch shards.
    Replicated { model: M, replicas: usize },
}

impl<M> ModelHandle<M> {
    /// Wrap `model` for `replicas` shards; one replica means no wrapper.
    pub fn new(model: M, replicas: usize) -> Self {
        if replicas > 1 {
            Self::Replicated { model, replicas }
        } else {
            Self::Unwrapped(model)
        }
    }

    /// The canonical parameter-holding instance.
    pub fn canonical(&self) -> &M {
        match self {
            Self::Unwrapped(model)          => model,
            Self::Replicated { model, .. }  => model,
        }
    }

    pub fn canonical_mut(&mut self) -> &mut M {
        match self {
            Self::Unwrapped(model)          => model,
            Self::Replicated { model, .. }  => model,
        }
    }

    /// Number of shards each batch is partitioned into.
    pub fn replicas(&self) -> usize {
        match self {
            Self::Unwrapped(_)                 => 1,
            Self::Replicated { replicas, .. }  => *replicas,
        }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Self::Replicated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_replica_is_unwrapped() {
        let handle = ModelHandle::new("model", 1);
        assert!(!handle.is_replicated());
        assert_eq!(handle.replicas(), 1);
    }

    #[test]
    fn test_canonical_is_same_instance_either_way() {
        let mut handle = ModelHandle::new(vec![1.0f32, 2.0], 4);
        assert!(handle.is_replicated());
        assert_eq!(handle.replicas(), 4);

        handle.canonical_mut()[0] = 7.0;
        assert_eq!(handle.canonical(), &vec![7.0, 2.0]);
    }
}
