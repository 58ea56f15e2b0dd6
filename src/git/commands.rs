//! `git upload-pack` wrappers using [`tokio::process::Command`].
//!
//! The pack exchange itself is delegated to the system `git` binary running
//! in stateless-RPC mode, which is what smart HTTP needs: one process per
//! request, request body on stdin, response on stdout.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Ref advertisement
// ---------------------------------------------------------------------------

/// Run `git upload-pack --stateless-rpc --advertise-refs <repo_path>` and
/// return its stdout (the pkt-line encoded ref advertisement).
#[instrument(fields(repo = %repo_path.display()))]
pub async fn advertise_refs(repo_path: &Path) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .arg("upload-pack")
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git upload-pack --advertise-refs")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git upload-pack --advertise-refs failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!(bytes = output.stdout.len(), "ref advertisement generated");
    Ok(output.stdout)
}

// ---------------------------------------------------------------------------
// Upload-pack (streamed)
// ---------------------------------------------------------------------------

/// Spawn `git upload-pack --stateless-rpc <repo_path>` and return the
/// [`Child`] process handle.
///
/// The caller writes the negotiation request to `child.stdin` and streams
/// the pack from `child.stdout`, so large packs are never buffered in
/// memory.
#[instrument(fields(repo = %repo_path.display()))]
pub fn upload_pack_streamed(repo_path: &Path) -> Result<Child> {
    Command::new("git")
        .arg("upload-pack")
        .arg("--stateless-rpc")
        .arg(repo_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn git upload-pack")
}
