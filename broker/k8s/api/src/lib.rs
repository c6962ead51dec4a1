#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod managed_cluster;
mod store;

pub use self::{
    managed_cluster::{ManagedCluster, ManagedClusterSpec, ManagedClusterStatus},
    store::KubeStore,
};
pub use k8s_openapi::api::{
    authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus, UserInfo},
    authorization::v1::{
        ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
        SubjectAccessReviewStatus,
    },
};
pub use kube::api::{ObjectMeta, ResourceExt};
