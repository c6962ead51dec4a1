//! Client-visible error responses.

use crate::body::{self, BoxBody};
use http::{header, Response, StatusCode};
use serde::Serialize;

/// Well-known failures reported to API clients in a JSON body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    ClusterNotConnected,
    ClusterNotFound,
    UnexpectedCluster,
    UnexpectedTenant,
    DuplicateClusterHeader,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error_message: &'a str,
    error_code: &'a str,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterNotConnected => "error-cluster-not-connected",
            Self::ClusterNotFound => "error-cluster-not-found",
            Self::UnexpectedCluster => "error-unexpected-cluster",
            Self::UnexpectedTenant => "error-unexpected-tenant",
            Self::DuplicateClusterHeader => "error-duplicate-cluster-header",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClusterNotConnected | Self::ClusterNotFound | Self::DuplicateClusterHeader => {
                StatusCode::BAD_REQUEST
            }
            Self::UnexpectedCluster | Self::UnexpectedTenant => StatusCode::FORBIDDEN,
        }
    }

    pub fn response(&self, message: &str) -> Response<BoxBody> {
        let body = serde_json::to_vec(&ErrorBody {
            error_message: message,
            error_code: self.as_str(),
        })
        .unwrap_or_default();
        Response::builder()
            .status(self.status())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body::full(body))
            .expect("error response must be valid")
    }
}

/// A plain-text response for failures without a well-known code.
pub fn status(status: StatusCode, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body::full(message.to_string()))
        .expect("status response must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn renders_json_error() {
        let rsp = ErrorCode::ClusterNotFound.response("cluster unknown-cluster not found");
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "errorMessage": "cluster unknown-cluster not found",
                "errorCode": "error-cluster-not-found",
            })
        );
    }
}
