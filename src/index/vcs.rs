use crate::prelude::*;

use std::path::Path;
use std::process::Command;

/// The version-control client is a collaborator, not part of the core; this
/// is the whole interface the core needs from it. Resolution only ever turns
/// a symbolic ref into a commit id; materializing a checkout happens later,
/// on the install path.
pub trait VcsClient: Send + Sync {
    fn resolve_reference(&self, url: &Url, reference: &str) -> Result<String>;
    fn checkout(&self, url: &Url, commit: &str, dest: &Path) -> Result<()>;
}

/// Shells out to the git binary.
pub struct GitCli;

fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd.output().wrap_err("running git")?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8(output.stdout)?)
}

impl VcsClient for GitCli {
    fn resolve_reference(&self, url: &Url, reference: &str) -> Result<String> {
        context!("Resolving {reference} in {url}");
        // try as branch/tag first; a full hex string passes through as-is
        let listing = run_git(&["ls-remote", url.as_str(), reference], None)?;
        if let Some(line) = listing.lines().next() {
            if let Some((commit, _)) = line.split_once('\t') {
                return Ok(commit.to_owned());
            }
        }
        static HEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i-u)^[0-9a-f]{7,40}$").unwrap());
        if HEX_RE.is_match(reference) {
            return Ok(reference.to_ascii_lowercase());
        }
        bail!("couldn't resolve {:?} in {}", reference, url);
    }

    fn checkout(&self, url: &Url, commit: &str, dest: &Path) -> Result<()> {
        context!("Checking out {commit} from {url}");
        run_git(&["init", "--quiet"], Some(dest))?;
        run_git(&["remote", "add", "origin", url.as_str()], Some(dest))?;
        run_git(&["fetch", "--quiet", "--depth", "1", "origin", commit], Some(dest))?;
        run_git(&["checkout", "--quiet", commit], Some(dest))?;
        Ok(())
    }
}
