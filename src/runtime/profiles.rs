use std::{
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rustc_hash::FxHashMap as HashMap;
use tokio::sync::OnceCell;

use crate::{driver::Program, tree::Signature};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanId;

/// Identifies a plan within one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    pub program: String,
    pub signature: Signature,
    /// Pinned variant, if any.
    pub label: Option<usize>,
}

/// A compiled, possibly tuned, program ready to launch.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: uid::Id<PlanId>,
    pub program: Program,
    /// Whether the variant was picked by benchmarking.
    pub tuned: bool,
    /// Benchmark time of the chosen variant.
    pub elapsed: Option<Duration>,
}

impl Plan {
    pub fn new(program: Program) -> Self {
        Self {
            id: uid::Id::new(),
            program,
            tuned: false,
            elapsed: None,
        }
    }
}

type Slot = Arc<OnceCell<Arc<Plan>>>;

/// The plan cache of one command queue.
///
/// At most one build runs per key; concurrent callers of the same key wait for it and share its plan.
#[derive(Debug, Default)]
pub struct Profiles {
    slots: RwLock<HashMap<ProfileKey, Slot>>,
    builds: AtomicUsize,
}

impl Profiles {
    /// Returns the cached plan for `key`, or runs `build` and caches its plan.
    ///
    /// With `force`, the cached plan is discarded and rebuilt. A failed build caches nothing.
    pub async fn get_or_build<F, Fut, E>(
        &self,
        key: &ProfileKey,
        force: bool,
        build: F,
    ) -> Result<Arc<Plan>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Plan, E>>,
    {
        let slot = {
            let mut slots = self.slots.write().expect("failed to lock profiles");
            match force {
                true => {
                    let slot = Slot::default();
                    slots.insert(key.clone(), slot.clone());
                    slot
                }
                false => slots.entry(key.clone()).or_default().clone(),
            }
        };

        let result = slot
            .get_or_try_init(|| async move {
                self.builds.fetch_add(1, Ordering::AcqRel);
                log::debug!("building plan {} for {}", key.program, key.signature);
                build().await.map(Arc::new)
            })
            .await
            .cloned();

        let mut slots = self.slots.write().expect("failed to lock profiles");
        match &result {
            Ok(_) => {
                // a waiter may finish the build after the first builder failed and dropped the slot
                slots.entry(key.clone()).or_insert(slot);
            }
            Err(_) => {
                if slots.get(key).is_some_and(|x| Arc::ptr_eq(x, &slot)) {
                    slots.remove(key);
                }
            }
        }
        result
    }

    pub fn get(&self, key: &ProfileKey) -> Option<Arc<Plan>> {
        let slots = self.slots.read().expect("failed to lock profiles");
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Stores `plan` under `key`, replacing any cached plan.
    pub fn insert(&self, key: ProfileKey, plan: Plan) {
        let slot = Arc::new(OnceCell::new_with(Some(Arc::new(plan))));
        let mut slots = self.slots.write().expect("failed to lock profiles");
        slots.insert(key, slot);
    }

    /// Number of cached plans.
    pub fn len(&self) -> usize {
        let slots = self.slots.read().expect("failed to lock profiles");
        slots.values().filter(|slot| slot.initialized()).count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.write().expect("failed to lock profiles").clear();
    }

    /// Number of builds started so far.
    #[inline]
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::{Plan, ProfileKey, Profiles};
    use crate::{
        driver::{Kernel, LaunchArgs, Program},
        tree::ExpressionTree,
    };

    #[derive(Debug, Clone)]
    struct Noop;

    impl Kernel for Noop {
        fn launch(&self, _args: &LaunchArgs) -> Result<(), String> {
            Ok(())
        }
    }

    fn plan(variant: usize) -> Plan {
        Plan::new(Program {
            name: "noop".into(),
            variant,
            types: vec![],
            source: "".into(),
            kernel: Box::new(Noop),
        })
    }

    fn key(label: Option<usize>) -> ProfileKey {
        ProfileKey {
            program: "noop".into(),
            signature: ExpressionTree::new().signature(),
            label,
        }
    }

    #[tokio::test]
    async fn test_cache() {
        let profiles = Profiles::default();
        let key = key(None);

        let x = profiles
            .get_or_build(&key, false, || async { Ok::<_, ()>(plan(0)) })
            .await
            .unwrap();
        let y = profiles
            .get_or_build(&key, false, || async { Ok::<_, ()>(plan(1)) })
            .await
            .unwrap();
        assert_eq!(x.id, y.id);
        assert_eq!(y.program.variant, 0);
        assert_eq!(profiles.builds(), 1);

        let z = profiles
            .get_or_build(&key, true, || async { Ok::<_, ()>(plan(1)) })
            .await
            .unwrap();
        assert_ne!(x.id, z.id);
        assert_eq!(profiles.get(&key).unwrap().id, z.id);
        assert_eq!(profiles.builds(), 2);
        assert_eq!(profiles.len(), 1);

        profiles.insert(self::key(Some(3)), plan(3));
        assert_eq!(profiles.len(), 2);
        assert!(profiles.get(&self::key(Some(4))).is_none());

        profiles.clear();
        assert!(profiles.is_empty());
    }

    #[tokio::test]
    async fn test_failure() {
        let profiles = Profiles::default();
        let key = key(None);

        let result = profiles
            .get_or_build(&key, false, || async { Err::<Plan, _>("broken") })
            .await;
        assert_eq!(result.unwrap_err(), "broken");
        assert!(profiles.get(&key).is_none());
        assert!(profiles.is_empty());

        let plan = profiles
            .get_or_build(&key, false, || async { Ok::<_, ()>(plan(0)) })
            .await
            .unwrap();
        assert_eq!(profiles.get(&key).unwrap().id, plan.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_build() {
        let profiles = Arc::new(Profiles::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles = (0..16)
            .map(|_| {
                let profiles = profiles.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let key = key(None);
                    profiles
                        .get_or_build(&key, false, || async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, ()>(plan(0))
                        })
                        .await
                        .unwrap()
                        .id
                })
            })
            .collect::<Vec<_>>();

        let mut ids = vec![];
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(profiles.len(), 1);
    }
}
