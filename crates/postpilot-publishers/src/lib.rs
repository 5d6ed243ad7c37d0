//! `postpilot-publishers`: the capability interface platforms implement,
//! the registry the delivery daemon resolves adapters from, and a generic
//! HTTP relay adapter.

pub mod credentials;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod webhook;

pub use credentials::{CredentialSource, EnvCredentials, StaticCredentials};
pub use error::{PublishError, Result};
pub use publisher::{PublishReceipt, PublishRequest, Publisher};
pub use registry::PublisherRegistry;
pub use webhook::WebhookPublisher;
