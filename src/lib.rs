//! Isolated execution environments for running untrusted commands against a
//! mounted codebase.
//!
//! The [`runtime::Runtime`] trait is the contract; [`runtime::BwrapRuntime`]
//! is the real backend and [`runtime::MockRuntime`] the in-memory double.
//!
//! ```no_run
//! use sandbox_rls::config::RuntimeConfig;
//! use sandbox_rls::runtime::{BwrapRuntime, ExecRequest, Runtime, SandboxConfig};
//!
//! # async fn demo() -> sandbox_rls::runtime::Result<()> {
//! let runtime = BwrapRuntime::new(RuntimeConfig::default());
//! runtime.create(SandboxConfig::new("sb-1").codebase_path("/srv/repo")).await?;
//! runtime.start("sb-1").await?;
//! let result = runtime.exec("sb-1", ExecRequest::new("ls")).await?;
//! println!("{} (exit {})", result.stdout, result.exit_code);
//! runtime.destroy("sb-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod runtime;
