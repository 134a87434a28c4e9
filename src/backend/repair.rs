//! Rewrites build-machine paths inside an extracted bundle.
//!
//! Virtual environments record the interpreter home in `pyvenv.cfg` and bake absolute
//! interpreter paths into the shebang of their launcher scripts. Both are wrong once the
//! bundle lands in a different directory. Each file is repaired independently; a failure is
//! logged and the remaining files are still processed.

use super::locator::INSTALLATIONS;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const VENV_CONFIG: &str = "pyvenv.cfg";
#[cfg(unix)]
const LAUNCHERS: &[&str] = &["python", "python3", "pip", "pip3"];

#[derive(Debug, Default)]
pub struct RepairReport {
    pub fixed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Interpreter root every venv should point at after relocation.
pub fn interpreter_home(bundle_dir: &Path) -> PathBuf {
    bundle_dir.join("py_standalone").join("python")
}

pub fn repair(bundle_dir: &Path) -> RepairReport {
    let home = interpreter_home(bundle_dir);
    let mut report = RepairReport::default();

    for inst in INSTALLATIONS.iter().filter(|i| i.is_venv) {
        let venv = bundle_dir.join(inst.dir);
        if !venv.is_dir() {
            debug!(installation = inst.name, "installation not present, skipping repair");
            continue;
        }

        let cfg = venv.join(VENV_CONFIG);
        match rewrite_home(&cfg, &home) {
            Ok(false) => {
                warn!(file = %cfg.display(), "no home entry to repair");
                report
                    .failed
                    .push((cfg, "no home entry".to_string()));
            }
            other => record(&mut report, &cfg, other),
        }

        #[cfg(unix)]
        for name in LAUNCHERS {
            let script = venv.join("bin").join(name);
            match rewrite_shebang(&script, &home) {
                Ok(false) => {}
                other => record(&mut report, &script, other),
            }
        }
    }
    report
}

fn record(report: &mut RepairReport, path: &Path, res: std::io::Result<bool>) {
    match res {
        Ok(_) => {
            info!(file = %path.display(), "repaired relocated path");
            report.fixed.push(path.to_path_buf());
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "could not repair file");
            report.failed.push((path.to_path_buf(), e.to_string()));
        }
    }
}

/// Point the `home` key at `home`, leaving every other line byte-for-byte intact.
fn rewrite_home(cfg: &Path, home: &Path) -> std::io::Result<bool> {
    let text = std::fs::read_to_string(cfg)?;
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    for line in text.split_inclusive('\n') {
        let is_home = line
            .split_once('=')
            .is_some_and(|(key, _)| key.trim() == "home");
        if is_home {
            let ending = if line.ends_with("\r\n") {
                "\r\n"
            } else if line.ends_with('\n') {
                "\n"
            } else {
                ""
            };
            out.push_str(&format!("home = {}{ending}", home.display()));
            changed = true;
        } else {
            out.push_str(line);
        }
    }
    if changed {
        std::fs::write(cfg, out)?;
    }
    Ok(changed)
}

/// Replace the interpreter directive of a launcher script. Returns `Ok(false)` when the file
/// is absent, a symlink, or not a script.
#[cfg(unix)]
fn rewrite_shebang(script: &Path, home: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::symlink_metadata(script) else {
        return Ok(false);
    };
    if meta.file_type().is_symlink() || !meta.is_file() {
        return Ok(false);
    }
    let content = std::fs::read(script)?;
    if !content.starts_with(b"#!") {
        return Ok(false);
    }
    let rest = match content.iter().position(|&b| b == b'\n') {
        Some(pos) => &content[pos..],
        None => &[][..],
    };
    let mut out = format!("#!{}/bin/python3", home.display()).into_bytes();
    out.extend_from_slice(rest);
    std::fs::write(script, out)?;

    let mut perms = std::fs::metadata(script)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(script, perms)?;
    Ok(true)
}
