use anyhow::{Context, Result, anyhow};
use safeagent_core::{Manifest, PipelineError, RetryDecision, RetryError, RetryPolicy, SnapshotConfig};
use safeagent_diff::sha256_hex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

/// Materializes a repository at a destination directory.
pub trait RepoSource {
    fn fetch(&self, repo_url: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct GitCloneSource;

impl RepoSource for GitCloneSource {
    fn fetch(&self, repo_url: &str, dest: &Path) -> Result<()> {
        let output = Command::new("git")
            .arg("clone")
            .arg("--depth=1")
            .arg(repo_url)
            .arg(dest)
            .stdin(Stdio::null())
            .output()
            .context("failed to execute git clone")?;
        if !output.status.success() {
            return Err(anyhow!(
                "git clone exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// A working copy exclusively owned by one run.
#[derive(Debug)]
pub struct WorkingCopy {
    root: PathBuf,
}

impl WorkingCopy {
    pub fn path(&self) -> &Path {
        &self.root
    }
}

pub struct SnapshotService {
    source: Box<dyn RepoSource + Send + Sync>,
    retry: RetryPolicy,
    skip_dirs: BTreeSet<String>,
}

impl SnapshotService {
    pub fn new(cfg: &SnapshotConfig, source: Box<dyn RepoSource + Send + Sync>) -> Self {
        Self {
            source,
            retry: RetryPolicy::new(cfg.clone_attempts, cfg.clone_backoff_ms),
            skip_dirs: cfg.skip_dirs.iter().cloned().collect(),
        }
    }

    /// Fetches `repo_url` into `dest`, retrying with backoff. A half-written
    /// destination is cleared before each attempt.
    pub fn acquire(&self, repo_url: &str, dest: &Path) -> Result<WorkingCopy, PipelineError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::Acquisition {
                repo_url: repo_url.to_string(),
                attempts: 0,
                detail: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let outcome = self.retry.run(
            |_| {
                if dest.exists() {
                    fs::remove_dir_all(dest)?;
                }
                self.source.fetch(repo_url, dest)
            },
            |_| RetryDecision::Retry,
        );
        match outcome {
            Ok(()) => Ok(WorkingCopy {
                root: dest.to_path_buf(),
            }),
            Err(err) => {
                let attempts = match &err {
                    RetryError::Exhausted { attempts, .. } => *attempts,
                    RetryError::Fatal { attempt, .. } => attempt + 1,
                };
                Err(PipelineError::Acquisition {
                    repo_url: repo_url.to_string(),
                    attempts,
                    detail: format!("{:#}", err.into_inner()),
                })
            }
        }
    }

    pub fn list_files(&self, wc: &WorkingCopy) -> Vec<String> {
        self.eligible_files(wc).map(|(rel, _)| rel).collect()
    }

    /// SHA-256 of every readable eligible file. Unreadable files are left out.
    pub fn manifest(&self, wc: &WorkingCopy) -> Manifest {
        self.eligible_files(wc)
            .filter_map(|(rel, full)| fs::read(full).ok().map(|bytes| (rel, sha256_hex(&bytes))))
            .collect()
    }

    /// Text of each requested file, cut at `max_bytes`. Files that are not
    /// UTF-8 or fail to read are skipped.
    pub fn read(
        &self,
        wc: &WorkingCopy,
        paths: &[String],
        max_bytes: usize,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for rel in paths {
            let Some(full) = resolve_inside(wc.path(), rel) else {
                continue;
            };
            if let Some(text) = read_text_capped(&full, max_bytes) {
                out.insert(rel.clone(), text);
            }
        }
        out
    }

    pub fn dispose(&self, wc: WorkingCopy) -> Result<()> {
        if wc.root.exists() {
            fs::remove_dir_all(&wc.root)
                .with_context(|| format!("failed to remove {}", wc.root.display()))?;
        }
        Ok(())
    }

    fn eligible_files<'a>(&'a self, wc: &'a WorkingCopy) -> impl Iterator<Item = (String, PathBuf)> + 'a {
        let root = wc.path();
        let mut files: Vec<(String, PathBuf)> = WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && entry.depth() > 0
                    && self
                        .skip_dirs
                        .contains(entry.file_name().to_string_lossy().as_ref()))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(root).ok()?;
                Some((relative_key(rel), entry.path().to_path_buf()))
            })
            .collect();
        files.sort();
        files.into_iter()
    }
}

fn relative_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn resolve_inside(root: &Path, rel: &str) -> Option<PathBuf> {
    let candidate = Path::new(rel);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return None;
    }
    Some(root.join(candidate))
}

fn read_text_capped(path: &Path, max_bytes: usize) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    let mut buf = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut buf).ok()?;
    match String::from_utf8(buf) {
        Ok(text) => Some(text),
        Err(err) => {
            let utf8 = err.utf8_error();
            // only a character split by the cap is tolerated
            if utf8.error_len().is_none() {
                let valid = utf8.valid_up_to();
                let mut bytes = err.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).ok()
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySource {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl RepoSource for FlakySource {
        fn fetch(&self, _repo_url: &str, dest: &Path) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(dest)?;
            if call < self.fail_first {
                fs::write(dest.join("partial"), "x")?;
                return Err(anyhow!("remote hung up"));
            }
            fs::write(dest.join("README.md"), "# hello\n")?;
            Ok(())
        }
    }

    fn service(source: Box<dyn RepoSource + Send + Sync>, attempts: u32) -> SnapshotService {
        let cfg = SnapshotConfig {
            clone_attempts: attempts,
            clone_backoff_ms: 0,
            ..SnapshotConfig::default()
        };
        SnapshotService::new(&cfg, source)
    }

    #[test]
    fn acquire_retries_and_clears_partial_copies() {
        let root = tempfile::tempdir().expect("tempdir");
        let dest = root.path().join("run");
        let svc = service(
            Box::new(FlakySource {
                fail_first: 2,
                calls: AtomicU32::new(0),
            }),
            3,
        );
        let wc = svc.acquire("https://example.invalid/r.git", &dest).expect("acquire");
        assert_eq!(svc.list_files(&wc), vec!["README.md".to_string()]);
        svc.dispose(wc).expect("dispose");
        assert!(!dest.exists());
    }

    #[test]
    fn acquire_exhaustion_is_an_acquisition_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let svc = service(
            Box::new(FlakySource {
                fail_first: 10,
                calls: AtomicU32::new(0),
            }),
            2,
        );
        let err = svc
            .acquire("https://example.invalid/r.git", &root.path().join("run"))
            .expect_err("must give up");
        match err {
            PipelineError::Acquisition {
                attempts, detail, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(detail.contains("remote hung up"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn manifest_skips_ineligible_dirs_and_hashes_bytes() {
        let root = tempfile::tempdir().expect("tempdir");
        let base = root.path();
        fs::create_dir_all(base.join("src/__pycache__")).expect("mkdir");
        fs::create_dir_all(base.join(".git")).expect("mkdir");
        fs::create_dir_all(base.join("node_modules/pkg")).expect("mkdir");
        fs::write(base.join("src/app.py"), "print('hi')\n").expect("write");
        fs::write(base.join("src/__pycache__/app.pyc"), [0_u8, 159, 146]).expect("write");
        fs::write(base.join(".git/HEAD"), "ref: refs/heads/main\n").expect("write");
        fs::write(base.join("node_modules/pkg/index.js"), "x").expect("write");
        fs::write(base.join("logo.bin"), [0_u8, 255, 254]).expect("write");

        let svc = service(Box::new(GitCloneSource), 1);
        let wc = WorkingCopy {
            root: base.to_path_buf(),
        };
        let manifest = svc.manifest(&wc);
        assert_eq!(
            manifest.keys().cloned().collect::<Vec<_>>(),
            vec!["logo.bin".to_string(), "src/app.py".to_string()]
        );
        assert_eq!(manifest["src/app.py"], sha256_hex(b"print('hi')\n"));
    }

    #[test]
    fn read_caps_bytes_and_skips_non_utf8() {
        let root = tempfile::tempdir().expect("tempdir");
        let base = root.path();
        fs::write(base.join("long.txt"), "abcdef").expect("write");
        fs::write(base.join("binary.dat"), [0xff_u8, 0xfe, 0x00]).expect("write");
        // 'é' is two bytes; a cap of 2 cuts it in half
        fs::write(base.join("accent.txt"), "aé").expect("write");

        let svc = service(Box::new(GitCloneSource), 1);
        let wc = WorkingCopy {
            root: base.to_path_buf(),
        };
        let paths = vec![
            "long.txt".to_string(),
            "binary.dat".to_string(),
            "accent.txt".to_string(),
            "../escape.txt".to_string(),
            "missing.txt".to_string(),
        ];
        let read = svc.read(&wc, &paths, 2);
        assert_eq!(read.get("long.txt").map(String::as_str), Some("ab"));
        assert_eq!(read.get("accent.txt").map(String::as_str), Some("a"));
        assert!(!read.contains_key("binary.dat"));
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn git_clone_source_clones_a_local_repository() {
        if !git_available() {
            return;
        }
        let origin = tempfile::tempdir().expect("origin");
        git(origin.path(), &["init", "-q"]);
        fs::write(origin.path().join("README.md"), "# origin\n").expect("write");
        git(origin.path(), &["add", "."]);
        git(
            origin.path(),
            &[
                "-c",
                "user.email=t@example.com",
                "-c",
                "user.name=t",
                "commit",
                "-q",
                "-m",
                "init",
            ],
        );

        let runs = tempfile::tempdir().expect("runs");
        let svc = service(Box::new(GitCloneSource), 1);
        let url = format!("file://{}", origin.path().display());
        let wc = svc
            .acquire(&url, &runs.path().join(uuid::Uuid::now_v7().to_string()))
            .expect("clone");
        let manifest = svc.manifest(&wc);
        assert_eq!(manifest.len(), 1);
        assert!(manifest.contains_key("README.md"));
    }

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }
}
