#[macro_use]
extern crate tracing;

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod knative;
pub mod metadata;
pub mod projector;
pub mod retry;
pub mod revision;
pub mod secrets;

pub use error::Error;
