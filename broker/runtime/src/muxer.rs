use crate::{
    auth::{self, Authenticate, UserInfo},
    authz::{Access, Authorize},
};
use bytes::Bytes;
use futures::future;
use http::{
    header::{self, HeaderName},
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
};
use regex::Regex;
use std::{convert::Infallible, path::PathBuf, sync::Arc};
use tracing::{debug, info, trace, warn};
use tunnel_broker_k8s_index::Registry;
use tunnel_broker_proxy::{
    body::{self, BoxBody, BoxError},
    errors, ErrorCode, PathProxy,
};

/// Lists the registry's clusters as JSON.
pub const LIST_CLUSTERS_PATH: &str = "/broker/api/clusters";

pub const TENANT_HEADER: HeaderName = HeaderName::from_static("x-tenant-id");

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");
const IMPERSONATE_UID: HeaderName = HeaderName::from_static("impersonate-uid");
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

#[derive(Clone, Debug)]
pub struct Config {
    /// Paths served by the default proxy without authentication.
    pub unauthenticated_targets: Vec<Regex>,

    /// Paths of the Kubernetes API.
    pub k8s_targets: Vec<Regex>,

    /// Paths that go through a cluster's tunnel when a cluster is named.
    pub tunnel_targets: Vec<Regex>,

    pub cluster_header: HeaderName,
    pub tenant_id: Option<String>,
    pub tenant_namespace: Option<String>,
    pub management_cluster_id: String,
    pub service_account_token_path: PathBuf,
    pub impersonate_tunnel_requests: bool,
}

/// Routes each API request to the local default proxy, the local
/// Kubernetes API, or a managed cluster's tunnel.
#[derive(Clone)]
pub struct Muxer(Arc<Inner>);

struct Inner {
    config: Config,
    tenant: Option<HeaderValue>,
    registry: Arc<Registry>,
    default_proxy: PathProxy,
    authn: Arc<dyn Authenticate>,
    authz: Option<Arc<dyn Authorize>>,
}

/// Where an authenticated request goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// The default proxy, impersonating the caller.
    Local,

    /// The management cluster's Kubernetes API, with the broker's own token.
    Kubernetes,

    /// A managed cluster's tunnel.
    Tunnel { cluster: String, k8s: bool },
}

#[derive(Debug, thiserror::Error)]
#[error("tenant id {0:?} is not a valid header value")]
pub struct InvalidTenant(String);

// === impl Config ===

impl Config {
    fn is_unauthenticated(&self, path: &str) -> bool {
        self.unauthenticated_targets.iter().any(|re| re.is_match(path))
    }

    /// Classifies a request by its path and the cluster it names.
    pub fn route(&self, path: &str, cluster: Option<&str>) -> Route {
        let k8s = self.k8s_targets.iter().any(|re| re.is_match(path));
        let tunnel = cluster.is_some() && self.tunnel_targets.iter().any(|re| re.is_match(path));
        match cluster {
            _ if !k8s && !tunnel => Route::Local,
            None => Route::Kubernetes,
            Some(id) if k8s && id == self.management_cluster_id => Route::Kubernetes,
            Some(id) => Route::Tunnel {
                cluster: id.to_string(),
                k8s,
            },
        }
    }
}

// === impl Muxer ===

impl Muxer {
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        default_proxy: PathProxy,
        authn: Arc<dyn Authenticate>,
        authz: Option<Arc<dyn Authorize>>,
    ) -> Result<Self, InvalidTenant> {
        let tenant = config
            .tenant_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| HeaderValue::from_str(t).map_err(|_| InvalidTenant(t.to_string())))
            .transpose()?;
        Ok(Self(Arc::new(Inner {
            config,
            tenant,
            registry,
            default_proxy,
            authn,
            authz,
        })))
    }

    pub async fn handle(&self, mut req: Request<BoxBody>) -> Response<BoxBody> {
        trace!(method = %req.method(), uri = %req.uri());
        let config = &self.0.config;
        let path = req.uri().path().to_string();

        if config.is_unauthenticated(&path) {
            debug!(%path, "Unauthenticated target");
            self.stamp_tenant(req.headers_mut());
            return self.0.default_proxy.proxy(req).await;
        }

        let cluster = {
            let mut values = req.headers().get_all(&config.cluster_header).iter();
            let first = values.next();
            if values.next().is_some() {
                return ErrorCode::DuplicateClusterHeader
                    .response("cluster header must not be set more than once");
            }
            match first.map(|v| v.to_str()) {
                None => None,
                Some(Ok(id)) if id.is_empty() => None,
                Some(Ok(id)) => Some(id.to_string()),
                Some(Err(_)) => {
                    return errors::status(StatusCode::BAD_REQUEST, "Invalid cluster header")
                }
            }
        };

        if let Some(tenant) = req.headers().get(TENANT_HEADER) {
            if !tenant.is_empty() && Some(tenant) != self.0.tenant.as_ref() {
                return ErrorCode::UnexpectedTenant.response("unexpected tenant");
            }
        }

        let user = match self.authenticate(req.headers()).await {
            Ok(user) => user,
            Err(error) => return auth_failure(error),
        };

        if path == LIST_CLUSTERS_PATH && req.method() == Method::GET {
            return self.list_clusters();
        }

        self.stamp_tenant(req.headers_mut());
        let route = config.route(&path, cluster.as_deref());
        debug!(user = %user.name, ?route);
        match route {
            Route::Local => {
                impersonate(req.headers_mut(), &user, false);
                self.0.default_proxy.proxy(req).await
            }
            Route::Kubernetes => {
                impersonate(req.headers_mut(), &user, true);
                let token = match self.service_account_token().await {
                    Ok(token) => token,
                    Err(error) => {
                        warn!(%error, "Failed to read service account token");
                        return errors::status(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal server error",
                        );
                    }
                };
                req.headers_mut().insert(header::AUTHORIZATION, token);
                self.0.default_proxy.proxy(req).await
            }
            Route::Tunnel { cluster, k8s } => {
                if k8s || config.impersonate_tunnel_requests {
                    impersonate(req.headers_mut(), &user, true);
                } else {
                    strip_impersonation(req.headers_mut());
                }
                req.headers_mut().remove(header::AUTHORIZATION);
                self.proxy_tunnel(&cluster, &user, req).await
            }
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<UserInfo, auth::Error> {
        let token = auth::bearer_token(headers).ok_or(auth::Error::MissingToken)?;
        self.0.authn.authenticate(token).await
    }

    async fn proxy_tunnel(
        &self,
        id: &str,
        user: &UserInfo,
        req: Request<BoxBody>,
    ) -> Response<BoxBody> {
        let Some(cluster) = self.0.registry.get(id) else {
            return ErrorCode::ClusterNotFound.response(&format!("cluster {id} not found"));
        };
        let Some(proxy) = cluster.proxy() else {
            return ErrorCode::ClusterNotConnected
                .response(&format!("cluster {id} is not connected"));
        };

        if let Some(authz) = &self.0.authz {
            let access =
                Access::get_managed_cluster(id, self.0.config.tenant_namespace.as_deref());
            match authz.authorize(user, &access).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(user = %user.name, cluster = %id, "Access to cluster denied");
                    return auth_failure(auth::Error::Forbidden);
                }
                Err(error) => {
                    warn!(%error, cluster = %id, "Failed to authorize request");
                    return auth_failure(auth::Error::Forbidden);
                }
            }
        }

        proxy.proxy(req).await
    }

    fn list_clusters(&self) -> Response<BoxBody> {
        match serde_json::to_vec(&self.0.registry.list()) {
            Ok(json) => Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .body(body::full(json))
                .expect("cluster list response must be valid"),
            Err(error) => {
                warn!(%error, "Failed to encode cluster list");
                errors::status(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }

    async fn service_account_token(&self) -> std::io::Result<HeaderValue> {
        let token = tokio::fs::read_to_string(&self.0.config.service_account_token_path).await?;
        HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn stamp_tenant(&self, headers: &mut HeaderMap) {
        if let Some(tenant) = &self.0.tenant {
            headers.insert(TENANT_HEADER, tenant.clone());
        }
    }
}

impl<B> tower::Service<Request<B>> for Muxer
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<BoxBody>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let muxer = self.clone();
        Box::pin(async move { Ok(muxer.handle(req.map(body::boxed)).await) })
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("config", &self.0.config)
            .finish_non_exhaustive()
    }
}

fn auth_failure(error: auth::Error) -> Response<BoxBody> {
    let status = error.status();
    match status {
        StatusCode::UNAUTHORIZED => debug!(%error, "Authentication failed"),
        StatusCode::FORBIDDEN => debug!(%error, "Authorization failed"),
        _ => warn!(%error, "Failed to authenticate request"),
    }
    let message = status.canonical_reason().unwrap_or("Error");
    errors::status(status, message)
}

/// Sets the impersonation headers for `user`. Unless `overwrite` is set,
/// headers the caller already provided are kept.
fn impersonate(headers: &mut HeaderMap, user: &UserInfo, overwrite: bool) {
    if overwrite {
        strip_impersonation(headers);
    }

    if !headers.contains_key(&IMPERSONATE_USER) {
        match HeaderValue::from_str(&user.name) {
            Ok(name) => {
                headers.insert(IMPERSONATE_USER, name);
            }
            Err(_) => debug!(user = %user.name, "User name is not a valid header value"),
        }
    }

    if !headers.contains_key(&IMPERSONATE_GROUP) {
        for group in &user.groups {
            if let Ok(group) = HeaderValue::from_str(group) {
                headers.append(IMPERSONATE_GROUP, group);
            }
        }
    }

    for (key, values) in &user.extra {
        let Ok(name) = HeaderName::from_bytes(format!("{IMPERSONATE_EXTRA_PREFIX}{key}").as_bytes())
        else {
            debug!(%key, "Skipping extra that is not a valid header name");
            continue;
        };
        if headers.contains_key(&name) {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

fn strip_impersonation(headers: &mut HeaderMap) {
    let extras = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATE_EXTRA_PREFIX))
        .cloned()
        .collect::<Vec<_>>();
    for name in extras {
        headers.remove(name);
    }
    headers.remove(IMPERSONATE_USER);
    headers.remove(IMPERSONATE_GROUP);
    headers.remove(IMPERSONATE_UID);
}
