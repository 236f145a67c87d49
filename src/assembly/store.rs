//! The host assembly store.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use strum::Display;

use crate::{assembly::AssemblyStream, domain::DomainId, Error, Result};

/// An assembly the host serves itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyInfo {
    /// Full display name, e.g. `Sandbox.Lib, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null`.
    pub full_name: String,
    /// Image file. An empty path makes the entry unloadable.
    pub load_path: PathBuf,
    /// Debug symbol file, if any.
    pub debug_path: Option<PathBuf>,
}

impl AssemblyInfo {
    /// Creates an entry without debug symbols.
    pub fn new(full_name: impl Into<String>, load_path: impl Into<PathBuf>) -> Self {
        Self {
            full_name: full_name.into(),
            load_path: load_path.into(),
            debug_path: None,
        }
    }

    /// Adds a debug symbol file.
    #[must_use]
    pub fn with_debug_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }
}

/// Which version policy produced the identity being bound.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display)]
pub enum PolicyLevel {
    /// No policy applied.
    #[default]
    None,
    /// Application configuration policy.
    App,
    /// Publisher policy.
    Publisher,
    /// Machine administrator policy.
    Admin,
}

/// An assembly load request from the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyBindInfo {
    /// Domain the load happens in.
    pub domain: DomainId,
    /// Identity as referenced by the caller.
    pub referenced_identity: String,
    /// Identity after version policy was applied.
    pub post_policy_identity: String,
    /// Policy that produced `post_policy_identity`.
    pub policy_level: PolicyLevel,
}

impl AssemblyBindInfo {
    /// A request with no policy applied: both identities are `identity`.
    pub fn new(domain: DomainId, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            domain,
            referenced_identity: identity.clone(),
            post_policy_identity: identity,
            policy_level: PolicyLevel::None,
        }
    }
}

/// A module load request from the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleBindInfo {
    /// Domain the load happens in.
    pub domain: DomainId,
    /// Identity of the owning assembly.
    pub assembly_identity: String,
    /// Module file name.
    pub module_name: String,
}

/// The answer to a successful [`AssemblyStore::provide_assembly`].
#[derive(Debug)]
pub struct ProvidedAssembly {
    /// Stable id of the entry in the store.
    pub assembly_id: u64,
    /// Host context for the load. Always `0`.
    pub context: u64,
    /// The image.
    pub image: AssemblyStream,
    /// Debug symbols, when configured and readable.
    pub debug: Option<AssemblyStream>,
}

/// Serves the host's assemblies to the runtime.
///
/// Lookups match the post-policy identity against [`AssemblyInfo::full_name`] without regard
/// to case. Anything the store does not serve is reported as not found, which lets the runtime
/// fall back to its own probing.
#[derive(Debug)]
pub struct AssemblyStore {
    assemblies: Arc<Vec<AssemblyInfo>>,
}

impl AssemblyStore {
    /// Creates a store over `assemblies`. An entry's index is its assembly id.
    pub fn new(assemblies: Arc<Vec<AssemblyInfo>>) -> Self {
        Self { assemblies }
    }

    /// Opens the image, and debug symbols if any, for a bind request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssemblyNotFound`] when administrator policy redirected the request,
    /// the identity is unknown, the entry has no image path, or the image cannot be opened.
    /// A debug file that cannot be opened is logged and left out.
    pub fn provide_assembly(&self, bind: &AssemblyBindInfo) -> Result<ProvidedAssembly> {
        log::debug!(
            "provide_assembly '{}' in domain {}",
            bind.post_policy_identity,
            bind.domain
        );
        let not_found = || Error::AssemblyNotFound(bind.post_policy_identity.clone());

        if bind.policy_level == PolicyLevel::Admin {
            log::debug!(
                "administrator policy redirects {} to {}, stopping search",
                bind.referenced_identity,
                bind.post_policy_identity
            );
            return Err(not_found());
        }

        let (index, info) = self
            .assemblies
            .iter()
            .enumerate()
            .find(|(_, info)| {
                info.full_name
                    .eq_ignore_ascii_case(&bind.post_policy_identity)
            })
            .ok_or_else(not_found)?;

        if info.load_path.as_os_str().is_empty() {
            return Err(not_found());
        }
        let image = AssemblyStream::open(&info.load_path).map_err(|error| {
            log::warn!("cannot open {}: {}", info.load_path.display(), error);
            not_found()
        })?;
        let debug = info
            .debug_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
            .and_then(Self::open_debug);

        Ok(ProvidedAssembly {
            assembly_id: index as u64,
            context: 0,
            image,
            debug,
        })
    }

    fn open_debug(path: &Path) -> Option<AssemblyStream> {
        match AssemblyStream::open(path) {
            Ok(stream) => Some(stream),
            Err(error) => {
                log::error!("cannot load debug info from {}: {}", path.display(), error);
                None
            }
        }
    }

    /// The runtime loads every module itself.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::NotFound`].
    pub fn provide_module(&self, bind: &ModuleBindInfo) -> Result<AssemblyStream> {
        log::debug!(
            "provide_module '{}' of '{}' in domain {}",
            bind.module_name,
            bind.assembly_identity,
            bind.domain
        );
        Err(Error::NotFound(bind.module_name.clone()))
    }

    /// Entries served by this store.
    pub fn assemblies(&self) -> &[AssemblyInfo] {
        &self.assemblies
    }
}

/// Hands the runtime its assembly store.
#[derive(Debug)]
pub struct AssemblyManager {
    assemblies: Arc<Vec<AssemblyInfo>>,
    store: OnceLock<Arc<AssemblyStore>>,
}

impl AssemblyManager {
    /// Creates a manager serving `assemblies`.
    pub fn new(assemblies: Vec<AssemblyInfo>) -> Self {
        Self {
            assemblies: Arc::new(assemblies),
            store: OnceLock::new(),
        }
    }

    /// Identities the runtime should load on its own. The host lists none, so the runtime
    /// tries its global cache first and the host store second.
    pub fn non_host_store_assemblies(&self) -> Vec<String> {
        Vec::new()
    }

    /// The store, created on first request.
    pub fn assembly_store(&self) -> Arc<AssemblyStore> {
        self.store
            .get_or_init(|| Arc::new(AssemblyStore::new(self.assemblies.clone())))
            .clone()
    }
}
