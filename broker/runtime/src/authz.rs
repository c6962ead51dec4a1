//! Authorization checks against the Kubernetes `SubjectAccessReview` API,
//! with a bounded TTL cache in front.

use crate::auth::{Error, UserInfo};
use ahash::AHashMap;
use kube::{api::PostParams, Api, Client};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;
use tunnel_broker_k8s_api::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};

/// Cached decisions never live longer than this.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(300);

/// An action on a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

#[async_trait::async_trait]
pub trait Authorize: Send + Sync + 'static {
    async fn authorize(&self, user: &UserInfo, access: &Access) -> Result<bool, Error>;
}

#[derive(Clone)]
pub struct AccessReviewer {
    api: Api<SubjectAccessReview>,
}

/// Remembers allow and deny decisions for a fixed TTL. Failed checks are not
/// cached.
#[derive(Debug)]
pub struct Cached<A> {
    inner: A,
    ttl: Duration,
    capacity: usize,
    entries: Mutex<AHashMap<(UserInfo, Access), Entry>>,
}

#[derive(Copy, Clone, Debug)]
struct Entry {
    allowed: bool,
    expires: Instant,
}

#[derive(Debug, thiserror::Error)]
#[error("authorization cache TTL {0:?} exceeds the maximum of {max:?}", max = MAX_CACHE_TTL)]
pub struct InvalidTtl(pub Duration);

// === impl Access ===

impl Access {
    /// Reading a managed cluster.
    pub fn get_managed_cluster(name: &str, namespace: Option<&str>) -> Self {
        Self {
            verb: "get".to_string(),
            group: "projectcalico.org".to_string(),
            resource: "managedclusters".to_string(),
            namespace: namespace.map(Into::into),
            name: Some(name.to_string()),
        }
    }
}

// === impl AccessReviewer ===

impl AccessReviewer {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl Authorize for AccessReviewer {
    async fn authorize(&self, user: &UserInfo, access: &Access) -> Result<bool, Error> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(user.name.clone()),
                groups: Some(user.groups.clone()),
                extra: Some(user.extra.clone()),
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(access.verb.clone()),
                    group: Some(access.group.clone()),
                    resource: Some(access.resource.clone()),
                    namespace: access.namespace.clone(),
                    name: access.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let status = self
            .api
            .create(&PostParams::default(), &review)
            .await?
            .status
            .ok_or(Error::InvalidResponse("missing status"))?;
        Ok(status.allowed && !status.denied.unwrap_or(false))
    }
}

impl std::fmt::Debug for AccessReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessReviewer").finish_non_exhaustive()
    }
}

// === impl Cached ===

impl<A> Cached<A> {
    pub fn new(inner: A, ttl: Duration, capacity: usize) -> Result<Self, InvalidTtl> {
        if ttl > MAX_CACHE_TTL {
            return Err(InvalidTtl(ttl));
        }
        Ok(Self {
            inner,
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(AHashMap::new()),
        })
    }

    fn lookup(&self, key: &(UserInfo, Access)) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = *entries.get(key)?;
        if entry.expires <= Instant::now() {
            entries.remove(key);
            return None;
        }
        Some(entry.allowed)
    }

    fn store(&self, key: (UserInfo, Access), allowed: bool) {
        if self.ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| e.expires > now);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                allowed,
                expires: now + self.ttl,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[async_trait::async_trait]
impl<A: Authorize> Authorize for Cached<A> {
    async fn authorize(&self, user: &UserInfo, access: &Access) -> Result<bool, Error> {
        let key = (user.clone(), access.clone());
        if let Some(allowed) = self.lookup(&key) {
            return Ok(allowed);
        }
        let allowed = self.inner.authorize(user, access).await?;
        debug!(user = %user.name, verb = %access.verb, resource = %access.resource, allowed, "Authorization checked");
        self.store(key, allowed);
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Authorize for Counting {
        async fn authorize(&self, user: &UserInfo, _: &Access) -> Result<bool, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidResponse("injected"));
            }
            Ok(user.name == "jane")
        }
    }

    fn user(name: &str) -> UserInfo {
        UserInfo {
            name: name.to_string(),
            groups: vec!["developers".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn rejects_long_ttls() {
        assert!(Cached::new(Counting::default(), Duration::from_secs(301), 10).is_err());
        assert!(Cached::new(Counting::default(), MAX_CACHE_TTL, 10).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn caches_decisions_until_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let authz = Cached::new(
            Counting {
                calls: calls.clone(),
                fail: false,
            },
            Duration::from_secs(20),
            10,
        )
        .unwrap();
        let access = Access::get_managed_cluster("mc-one", None);

        assert!(authz.authorize(&user("jane"), &access).await.unwrap());
        assert!(authz.authorize(&user("jane"), &access).await.unwrap());
        assert!(!authz.authorize(&user("bob"), &access).await.unwrap());
        assert!(!authz.authorize(&user("bob"), &access).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(authz.authorize(&user("jane"), &access).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_entries() {
        let authz = Cached::new(Counting::default(), Duration::from_secs(20), 2).unwrap();
        for name in ["a", "b", "c", "d"] {
            let access = Access::get_managed_cluster(name, None);
            authz.authorize(&user("jane"), &access).await.unwrap();
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(authz.len(), 2);
    }

    #[tokio::test]
    async fn does_not_cache_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let authz = Cached::new(
            Counting {
                calls: calls.clone(),
                fail: true,
            },
            Duration::from_secs(20),
            10,
        )
        .unwrap();
        let access = Access::get_managed_cluster("mc-one", None);
        assert!(authz.authorize(&user("jane"), &access).await.is_err());
        assert!(authz.authorize(&user("jane"), &access).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
