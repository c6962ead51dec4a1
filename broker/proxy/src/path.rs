use crate::{
    body::{self, BoxBody},
    errors, strip_hop_by_hop, Error,
};
use http::{header, uri, HeaderValue, Request, Response, StatusCode, Uri, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use regex::Regex;
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};
use tunnel_broker_tunnel::tls;

/// An upstream that serves every request path starting with `path`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub path: String,

    #[serde(rename = "destination")]
    pub dest: String,

    /// Rewrites the request path, with `path_replace` as the replacement.
    #[serde(default)]
    pub path_regexp: Option<String>,

    #[serde(default)]
    pub path_replace: Option<String>,

    /// A file holding a bearer token to send upstream.
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    #[serde(default, rename = "allowInsecureTLS")]
    pub allow_insecure_tls: bool,
}

/// Forwards requests to the target with the longest matching path prefix.
#[derive(Clone)]
pub struct PathProxy {
    routes: Vec<Route>,
}

#[derive(Clone)]
struct Route {
    path: String,
    scheme: uri::Scheme,
    authority: uri::Authority,
    base_path: String,
    rewrite: Option<(Regex, String)>,
    token: Option<HeaderValue>,
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

// === impl Target ===

impl Target {
    pub fn new(path: impl ToString, dest: impl ToString) -> Self {
        Self {
            path: path.to_string(),
            dest: dest.to_string(),
            ..Default::default()
        }
    }

    /// Parses a JSON list of targets.
    pub fn parse_list(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn invalid(&self, reason: impl ToString) -> Error {
        Error::InvalidTarget {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn compile(&self) -> Result<Route, Error> {
        if self.path.is_empty() {
            return Err(self.invalid("empty path"));
        }

        let dest = self
            .dest
            .parse::<Uri>()
            .map_err(|e| self.invalid(format!("invalid destination: {e}")))?;
        let scheme = dest
            .scheme()
            .cloned()
            .ok_or_else(|| self.invalid("destination has no scheme"))?;
        if scheme != uri::Scheme::HTTP && scheme != uri::Scheme::HTTPS {
            return Err(self.invalid(format!("unsupported scheme {scheme}")));
        }
        let authority = dest
            .authority()
            .cloned()
            .ok_or_else(|| self.invalid("destination has no host"))?;
        let base_path = dest.path().trim_end_matches('/').to_string();

        let rewrite = match &self.path_regexp {
            Some(re) => {
                let re = Regex::new(re).map_err(|source| Error::Regex {
                    path: self.path.clone(),
                    source,
                })?;
                Some((re, self.path_replace.clone().unwrap_or_default()))
            }
            None => None,
        };

        let token = match &self.token_path {
            Some(path) => {
                let token = read(path)?;
                let token = String::from_utf8_lossy(&token);
                let value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|_| self.invalid("token is not a valid header value"))?;
                Some(value)
            }
            None => None,
        };

        let client = Client::builder(TokioExecutor::new()).build(self.connector()?);
        Ok(Route {
            path: self.path.clone(),
            scheme,
            authority,
            base_path,
            rewrite,
            token,
            client,
        })
    }

    fn connector(&self) -> Result<HttpsConnector<HttpConnector>, Error> {
        let provider = tls::provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        let builder = if self.allow_insecure_tls {
            builder
                .dangerous()
                .with_custom_certificate_verifier(tls::insecure_verifier(provider))
        } else {
            let mut roots = RootCertStore::empty();
            match &self.ca_bundle_path {
                Some(path) => {
                    for ca in tls::load_certs(&read(path)?)? {
                        roots.add(ca)?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            builder.with_root_certificates(roots)
        };
        let config = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => {
                let certs = tls::load_certs(&read(cert)?)?;
                let key = tls::load_key(&read(key)?)?;
                builder.with_client_auth_cert(certs, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(self.invalid("client certificate and key must be set together")),
        };

        Ok(hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build())
    }
}

fn read(path: &PathBuf) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })
}

// === impl PathProxy ===

impl PathProxy {
    /// Validates and compiles every target.
    pub fn new(targets: Vec<Target>) -> Result<Self, Error> {
        let mut routes: Vec<Route> = Vec::with_capacity(targets.len());
        for target in &targets {
            if routes.iter().any(|r| r.path == target.path) {
                return Err(Error::DuplicatePath(target.path.clone()));
            }
            routes.push(target.compile()?);
        }
        routes.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Ok(Self { routes })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.route(path).is_some()
    }

    fn route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| path.starts_with(&r.path))
    }

    pub async fn proxy(&self, req: Request<BoxBody>) -> Response<BoxBody> {
        let Some(route) = self.route(req.uri().path()) else {
            debug!(path = %req.uri().path(), "No target");
            return errors::status(StatusCode::NOT_FOUND, "Not found");
        };

        let (mut parts, body) = req.into_parts();
        parts.uri = match route.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(error) => {
                warn!(%error, "Failed to build upstream URI");
                return errors::status(StatusCode::BAD_REQUEST, "Bad request");
            }
        };
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        if let Some(token) = &route.token {
            parts.headers.insert(header::AUTHORIZATION, token.clone());
        }

        debug!(uri = %parts.uri, "Forwarding");
        match route.client.request(Request::from_parts(parts, body)).await {
            Ok(rsp) => {
                let (mut parts, body) = rsp.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body::boxed(body))
            }
            Err(error) => {
                warn!(target = %route.authority, %error, "Upstream request failed");
                errors::status(StatusCode::BAD_GATEWAY, "Bad gateway")
            }
        }
    }
}

impl std::fmt::Debug for PathProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| &r.path))
            .finish()
    }
}

// === impl Route ===

impl Route {
    fn upstream_uri(&self, uri: &Uri) -> Result<Uri, http::Error> {
        let path = match &self.rewrite {
            Some((re, replace)) => re.replace_all(uri.path(), replace.as_str()).into_owned(),
            None => uri.path().to_string(),
        };
        let mut path_and_query = format!("{}{}", self.base_path, path);
        if !path_and_query.starts_with('/') {
            path_and_query.insert(0, '/');
        }
        if let Some(query) = uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::{body::Incoming, service::service_fn};
    use hyper_util::rt::TokioIo;
    use std::{convert::Infallible, net::SocketAddr};
    use tokio::net::TcpListener;

    /// Serves HTTP/1 and answers with the request's path, query and
    /// authorization header.
    async fn upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (io, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let svc = service_fn(|req: Request<Incoming>| async move {
                        let auth = req
                            .headers()
                            .get(header::AUTHORIZATION)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string();
                        let pq = req.uri().path_and_query().map(|p| p.to_string()).unwrap_or_default();
                        Ok::<_, Infallible>(Response::new(body::full(format!("{pq} {auth}"))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(io), svc)
                        .await;
                });
            }
        });
        addr
    }

    fn get(path: &str) -> Request<BoxBody> {
        Request::builder()
            .uri(format!("http://broker.example{path}"))
            .body(body::empty())
            .unwrap()
    }

    async fn text(rsp: Response<BoxBody>) -> (StatusCode, String) {
        let status = rsp.status();
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn rejects_bad_targets() {
        assert!(matches!(
            PathProxy::new(vec![Target::new("", "http://a")]),
            Err(Error::InvalidTarget { .. })
        ));
        assert!(matches!(
            PathProxy::new(vec![Target::new("/", "no-scheme")]),
            Err(Error::InvalidTarget { .. })
        ));
        assert!(matches!(
            PathProxy::new(vec![Target::new("/", "http://a"), Target::new("/", "http://b")]),
            Err(Error::DuplicatePath(_))
        ));
        assert!(matches!(
            PathProxy::new(vec![Target {
                path_regexp: Some("(".to_string()),
                ..Target::new("/", "http://a")
            }]),
            Err(Error::Regex { .. })
        ));
        assert!(matches!(
            PathProxy::new(vec![Target {
                token_path: Some("/nonexistent/token".into()),
                ..Target::new("/", "http://a")
            }]),
            Err(Error::Read { .. })
        ));
    }

    #[test]
    fn parses_target_lists() {
        let targets = Target::parse_list(
            r#"[{"path": "/api/", "destination": "https://kubernetes.default:443",
                 "tokenPath": "/var/run/secrets/token", "allowInsecureTLS": true}]"#,
        )
        .unwrap();
        assert_eq!(
            targets,
            vec![Target {
                token_path: Some("/var/run/secrets/token".into()),
                allow_insecure_tls: true,
                ..Target::new("/api/", "https://kubernetes.default:443")
            }]
        );
    }

    #[tokio::test]
    async fn forwards_by_longest_prefix() {
        let a = upstream().await;
        let b = upstream().await;

        let token = std::env::temp_dir().join(format!("path-proxy-token-{}", std::process::id()));
        std::fs::write(&token, "s3cr3t\n").unwrap();

        let proxy = PathProxy::new(vec![
            Target::new("/", format!("http://{a}")),
            Target {
                path_regexp: Some("^/tigera-elasticsearch/?".to_string()),
                path_replace: Some("/".to_string()),
                token_path: Some(token.clone()),
                ..Target::new("/tigera-elasticsearch/", format!("http://{b}"))
            },
        ])
        .unwrap();

        let (status, body) = text(proxy.proxy(get("/compliance/reports?x=1")).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "/compliance/reports?x=1 -");

        let (status, body) = text(proxy.proxy(get("/tigera-elasticsearch/_search")).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "/_search Bearer s3cr3t");

        let _ = std::fs::remove_file(token);
    }

    #[tokio::test]
    async fn unmatched_and_unreachable() {
        let proxy = PathProxy::new(vec![Target::new("/only/", "http://127.0.0.1:1")]).unwrap();
        let (status, _) = text(proxy.proxy(get("/elsewhere")).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = text(proxy.proxy(get("/only/here")).await).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
