//! Cloud Foundry platform integration module.
//!
//! This module provides all functionality for talking to the Cloud
//! Controller v3 API: the platform capability and its HTTP client, job
//! polling, bits upload, and observation of deployed applications.

mod client;
mod types;
mod platform;
mod jobs;
mod bits;
mod observer;

pub use client::CfClient;
pub use types::{
    App, AppRelationships, AppRunState, BindingCreated, BindingRelationships, Build, BuildState,
    CreateAppRequest, CreateBindingRequest, CreatePackageRequest, Destination, DestinationApp,
    Droplet, GuidRef, HealthCheckData, InstanceState, Job, JobState, LastOperation, Lifecycle,
    LifecycleData, LifecycleType, Metadata, MetadataPatch, Package, PackageState, PackageType,
    Process, ProcessHealthCheck, ProcessInstance, ProcessUpdate, Relationship, Route,
    ScaleRequest, ServiceCredentialBinding, UpdateAppRequest,
};
pub use platform::Platform;
#[cfg(test)]
pub use platform::MockPlatform;
pub use jobs::{poll_until, JobWaiter, DEFAULT_OPERATION_TIMEOUT, DEFAULT_POLL_INTERVAL};
pub use bits::BitsUploader;
pub use observer::AppObserver;
