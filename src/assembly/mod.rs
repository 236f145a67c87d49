//! Host-served assemblies.
//!
//! The runtime asks the host for assembly images before probing on its own. The
//! [`AssemblyStore`] answers from a fixed list of [`AssemblyInfo`] entries configured at
//! startup, handing back [`AssemblyStream`]s over memory-mapped files.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hostrt::assembly::{AssemblyBindInfo, AssemblyInfo, AssemblyManager};
//! use hostrt::domain::DomainId;
//!
//! let manager = AssemblyManager::new(vec![
//!     AssemblyInfo::new("Sandbox.Lib, Version=1.0.0.0", "lib/Sandbox.Lib.dll")
//!         .with_debug_path("lib/Sandbox.Lib.pdb"),
//! ]);
//! let store = manager.assembly_store();
//! let provided =
//!     store.provide_assembly(&AssemblyBindInfo::new(DomainId(1), "Sandbox.Lib, Version=1.0.0.0"))?;
//! println!("image is {} bytes", provided.image.len());
//! # Ok::<(), hostrt::Error>(())
//! ```

mod store;
mod stream;

pub use store::{
    AssemblyBindInfo, AssemblyInfo, AssemblyManager, AssemblyStore, ModuleBindInfo, PolicyLevel,
    ProvidedAssembly,
};
pub use stream::{AssemblyStream, Backend, Memory, Physical};
