//! Deployment lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! seed.json (written when the slot is claimed)
//!     → driver.rs prepare: render pod.yml / configmap.yml → deployment.json
//!       → pre-start hooks
//!     → driver.rs start: ContainerEngine play → pod IP → post-start hooks
//!       → function sockets → deployment-config unit → READY
//!     → driver.rs caddy_register (run by the deployment-config unit)
//!       → render proxy-config → Reconciler
//!     → driver.rs stop: STOPPING → pre-stop hooks → config unit down → pod down
//!     → driver.rs cleanup: post-stop hooks
//! ```
//!
//! Names and slots come from naming.rs, template variables from env.rs.
//! function.rs serves a started deployment's functions over CGI.

pub mod driver;
pub mod env;
pub mod function;
pub mod hooks;
pub mod naming;
pub mod template;

pub use driver::{DeploymentDriver, Rendered};
pub use hooks::{HookError, HookRunner};
pub use template::TemplateError;
