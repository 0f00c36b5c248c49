use std::{
    fs,
    os::unix::fs::{MetadataExt, PermissionsExt, chown},
    path::{Path, PathBuf},
};

use anyhow::Context;
use tempfile::TempDir;

/// Scoped directory holding one submission's source and build artefacts.
/// Removed on drop, including after a panic in the caller.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates the directory, writes the source file and hands ownership to
    /// `owner` so the prepare step can write build output next to it.
    pub async fn create(
        root: &Path,
        owner: Option<(u32, u32)>,
        file_name: &str,
        source: &str,
    ) -> anyhow::Result<Self> {
        let root = root.to_path_buf();
        let file_name = file_name.to_string();
        let source = source.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Self> {
            fs::create_dir_all(&root)
                .with_context(|| format!("failed to create sandbox root {}", root.display()))?;
            let dir = tempfile::Builder::new()
                .prefix("judge-ws-")
                .tempdir_in(&root)
                .context("failed to create workspace")?;
            let source_path = dir.path().join(&file_name);
            fs::write(&source_path, source).context("failed to write source file")?;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
            fs::set_permissions(&source_path, fs::Permissions::from_mode(0o644))?;
            if let Some((uid, gid)) = owner {
                chown(dir.path(), Some(uid), Some(gid)).context("failed to chown workspace")?;
                chown(&source_path, Some(uid), Some(gid))?;
            }
            Ok(Self { dir })
        })
        .await
        .context("workspace task panicked")?
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Takes the tree back from the sandbox identity and makes it read-only,
    /// so one test case cannot alter what the next one executes.
    pub async fn seal(&self) -> anyhow::Result<()> {
        let path = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || seal_tree(&path))
            .await
            .context("workspace task panicked")?
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // TempDir cannot unlink entries from a read-only directory.
        if let Err(err) = unseal_tree(self.dir.path()) {
            tracing::warn!(error = %err, path = %self.dir.path().display(), "failed to unseal workspace");
        }
    }
}

fn walk(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = vec![root.to_path_buf()];
    let mut index = 0;
    while index < entries.len() {
        let path = entries[index].clone();
        index += 1;
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            for entry in fs::read_dir(&path)? {
                entries.push(entry?.path());
            }
        }
    }
    Ok(entries)
}

fn seal_tree(root: &Path) -> anyhow::Result<()> {
    // SAFETY: geteuid/getegid have no preconditions.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    // Children first: a sealed directory no longer allows unlinking entries.
    for path in walk(root)?.into_iter().rev() {
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove symlink {}", path.display()))?;
            continue;
        }
        if meta.uid() != uid {
            chown(&path, Some(uid), Some(gid))
                .with_context(|| format!("failed to reclaim {}", path.display()))?;
        }
        let mode = if meta.is_dir() || meta.permissions().mode() & 0o111 != 0 {
            0o555
        } else {
            0o444
        };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn unseal_tree(root: &Path) -> std::io::Result<()> {
    for path in walk(root)? {
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::Workspace;

    #[tokio::test]
    async fn sealed_workspace_is_read_only_and_removed_on_drop() {
        let root = std::env::temp_dir().join("codeverse-judge-tests");
        let workspace = Workspace::create(&root, None, "main.py", "print(1)\n")
            .await
            .unwrap();
        let path = workspace.path().to_path_buf();
        fs::create_dir(path.join("out")).unwrap();
        fs::write(path.join("out/bin"), b"x").unwrap();
        fs::set_permissions(path.join("out/bin"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("/etc/passwd", path.join("link")).unwrap();

        workspace.seal().await.unwrap();
        let mode = |p: &str| fs::metadata(path.join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("main.py"), 0o444);
        assert_eq!(mode("out/bin"), 0o555);
        assert_eq!(mode("out"), 0o555);
        assert!(!path.join("link").exists());
        assert_eq!(fs::read_to_string(path.join("main.py")).unwrap(), "print(1)\n");

        drop(workspace);
        assert!(!path.exists());
    }
}
