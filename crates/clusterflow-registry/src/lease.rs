//! In-process single-writer discipline per cluster name

use clusterflow_cloud::LockOperation as Operation;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

struct Active {
    operation: Operation,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Table {
    gates: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active: HashMap<String, Active>,
}

/// Who currently owns which cluster name
#[derive(Clone, Default)]
pub(crate) struct Leases {
    table: Arc<Mutex<Table>>,
}

impl Leases {
    /// Claim `name` if nobody holds it
    pub fn try_claim(&self, name: &str, operation: Operation) -> Option<Lease> {
        let mut table = self.lock();
        let gate = table.gates.entry(name.to_string()).or_default().clone();
        let guard = gate.try_lock_owned().ok()?;
        Some(self.register(&mut table, name, operation, guard))
    }

    /// Claim `name` for a delete. An in-flight create is cancelled and
    /// waited for; another delete makes this fail.
    pub async fn claim_preempting(&self, name: &str) -> Option<Lease> {
        if let Some(lease) = self.try_claim(name, Operation::Delete) {
            return Some(lease);
        }

        let gate = {
            let table = self.lock();
            let active = table.active.get(name)?;
            if active.operation != Operation::Create {
                return None;
            }
            tracing::info!("Cancelling in-flight create of {}", name);
            active.cancel.cancel();
            table.gates.get(name).cloned()?
        };

        let guard = gate.lock_owned().await;
        let mut table = self.lock();
        Some(self.register(&mut table, name, Operation::Delete, guard))
    }

    fn register(
        &self,
        table: &mut Table,
        name: &str,
        operation: Operation,
        guard: OwnedMutexGuard<()>,
    ) -> Lease {
        let cancel = CancellationToken::new();
        table.active.insert(
            name.to_string(),
            Active {
                operation,
                cancel: cancel.clone(),
            },
        );
        Lease {
            name: name.to_string(),
            cancel,
            table: self.table.clone(),
            guard,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive ownership of one cluster name; released on drop
pub(crate) struct Lease {
    name: String,
    cancel: CancellationToken,
    table: Arc<Mutex<Table>>,
    guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        table.active.remove(&self.name);

        // Drop the gate unless a delete is queued on it
        let idle = table.gates.get(&self.name).is_some_and(|gate| {
            Arc::ptr_eq(gate, OwnedMutexGuard::mutex(&self.guard)) && Arc::strong_count(gate) == 2
        });
        if idle {
            table.gates.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_refused() {
        let leases = Leases::default();
        let first = leases.try_claim("demo", Operation::Create);
        assert!(first.is_some());
        assert!(leases.try_claim("demo", Operation::Create).is_none());
        assert!(leases.try_claim("other", Operation::Create).is_some());

        drop(first);
        assert!(leases.try_claim("demo", Operation::Create).is_some());
    }

    #[tokio::test]
    async fn test_delete_preempts_create() {
        let leases = Leases::default();
        let create = leases.try_claim("demo", Operation::Create).unwrap();
        let cancel = create.cancellation();

        let holder = tokio::spawn(async move {
            cancel.cancelled().await;
            drop(create);
        });

        let delete = leases.claim_preempting("demo").await;
        assert!(delete.is_some());
        holder.await.unwrap();
        assert_eq!(leases.lock().gates.len(), 1);

        drop(delete);
        assert!(leases.lock().gates.is_empty());
    }

    #[test]
    fn test_released_names_are_forgotten() {
        let leases = Leases::default();
        for name in ["alpha", "beta", "gamma"] {
            let lease = leases.try_claim(name, Operation::Create).unwrap();
            drop(lease);
        }

        let table = leases.lock();
        assert!(table.gates.is_empty());
        assert!(table.active.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_delete_is_refused() {
        let leases = Leases::default();
        let _delete = leases.try_claim("demo", Operation::Delete).unwrap();
        assert!(leases.claim_preempting("demo").await.is_none());
    }
}
