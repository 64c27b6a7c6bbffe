//! Probes and actions against the local machine and the cluster.
//!
//! Everything that touches the outside world lives here: package managers,
//! systemd, the kernel swap table, files, `kubectl`, `helm` and HTTP.

mod actions;
mod command;
mod context;
mod probes;
mod stamp;

pub use actions::{
    ApplyManifest, EnsureClusterInstalled, EnsurePackages, EnsureRelease, EnsureService,
    EnsureSecret, EnvGenerator, RandomGenerator, RestartService, SecretGenerator, SetSwap,
    SetTaint, Verify, WriteFile,
};
pub use command::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use context::SystemContext;
pub use probes::{
    EndpointProbe, FileProbe, ManifestProbe, PackagesProbe, ReleaseProbe, SecretProbe,
    ServiceProbe, SwapProbe, TaintProbe, parse_swaps,
};
pub use stamp::{StampKind, StampStore};

#[cfg(test)]
pub(crate) use command::MockCommandRunner;

use std::path::Path;

use crate::error::ActionError;

/// Writes a file through a temporary sibling and a rename.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ActionError> {
    let io_error = |e: std::io::Error| ActionError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = std::path::PathBuf::from(temp);

    tokio::fs::write(&temp, content).await.map_err(io_error)?;
    tokio::fs::rename(&temp, path).await.map_err(io_error)?;
    Ok(())
}
