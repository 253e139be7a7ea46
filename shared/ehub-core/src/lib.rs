//! EnterpriseHub Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Standard service trait all microservices implement
//! - Common domain types (LocationId, EventId, Priority, etc.)
//! - Error handling utilities
//! - Configuration management

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::{env_list, env_or, ServiceConfig};
pub use domain::*;
pub use error::{EhubError, Result};
pub use service::{DependencyStatus, EhubService, HealthStatus, MicroserviceRuntime, ReadinessStatus};
