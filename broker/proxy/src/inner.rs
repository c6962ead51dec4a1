use crate::{body::BoxBody, errors::ErrorCode, Error, PathProxy};
use http::{header::HeaderName, HeaderValue, Request, Response};
use tracing::debug;

/// Handles HTTPS requests a managed cluster sends to the broker's own
/// services.
///
/// Each request is stamped with the cluster it came from (and the tenant,
/// if any) before being forwarded with the broker's own client identity.
#[derive(Debug)]
pub struct InnerHandler {
    proxy: PathProxy,
    cluster_header: HeaderName,
    tenant_header: HeaderName,
    tenant_id: Option<HeaderValue>,
}

impl InnerHandler {
    pub fn new(
        proxy: PathProxy,
        cluster_header: HeaderName,
        tenant_header: HeaderName,
        tenant_id: Option<&str>,
    ) -> Result<Self, Error> {
        let tenant_id = tenant_id
            .filter(|t| !t.is_empty())
            .map(|t| {
                HeaderValue::from_str(t).map_err(|_| Error::InvalidTarget {
                    path: String::new(),
                    reason: format!("tenant id {t:?} is not a valid header value"),
                })
            })
            .transpose()?;
        Ok(Self {
            proxy,
            cluster_header,
            tenant_header,
            tenant_id,
        })
    }

    pub async fn handle(&self, cluster: &str, mut req: Request<BoxBody>) -> Response<BoxBody> {
        let unexpected = req
            .headers()
            .get_all(&self.cluster_header)
            .iter()
            .any(|v| v.as_bytes() != cluster.as_bytes());
        if unexpected {
            debug!(%cluster, "Request claims a different cluster");
            return ErrorCode::UnexpectedCluster
                .response(&format!("request from cluster {cluster} names a different cluster"));
        }

        let Ok(value) = HeaderValue::from_str(cluster) else {
            return ErrorCode::UnexpectedCluster.response("invalid cluster name");
        };
        req.headers_mut().insert(self.cluster_header.clone(), value);
        if let Some(tenant) = &self.tenant_id {
            req.headers_mut()
                .insert(self.tenant_header.clone(), tenant.clone());
        }
        self.proxy.proxy(req).await
    }
}
