use std::path::{Path, PathBuf};

/// One interpreter installation inside the bundle.
#[derive(Debug, Clone, Copy)]
pub struct Installation {
    pub name: &'static str,
    /// Directory under the bundle root.
    pub dir: &'static str,
    /// Standalone interpreters have no venv layout and no generated config.
    pub is_venv: bool,
}

/// Priority order, newest first. `venv_v4` carries the server dependencies.
pub const INSTALLATIONS: &[Installation] = &[
    Installation {
        name: "v4",
        dir: "venv_v4",
        is_venv: true,
    },
    Installation {
        name: "v3",
        dir: "venv_v3",
        is_venv: true,
    },
    Installation {
        name: "standalone",
        dir: "py_standalone/python",
        is_venv: false,
    },
];

impl Installation {
    /// Candidate executables relative to the installation dir, preferred name first.
    fn candidates(&self) -> &'static [&'static str] {
        if cfg!(windows) {
            if self.is_venv {
                &["Scripts/python.exe", "Scripts/python3.exe"]
            } else {
                &["python.exe", "python3.exe"]
            }
        } else {
            &["bin/python3", "bin/python"]
        }
    }
}

/// First existing interpreter across all installations, or `None` once every candidate fails.
pub fn locate(root: &Path) -> Option<PathBuf> {
    INSTALLATIONS.iter().find_map(|inst| {
        inst.candidates()
            .iter()
            .map(|rel| root.join(inst.dir).join(rel))
            .find(|p| p.exists())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"").unwrap();
        p
    }

    fn exe(inst_dir: &str, name: &str) -> String {
        if cfg!(windows) {
            format!("{inst_dir}/Scripts/{name}.exe")
        } else {
            format!("{inst_dir}/bin/{name}")
        }
    }

    #[test]
    fn empty_bundle_has_no_runtime() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(locate(dir.path()), None);
    }

    #[test]
    fn newest_installation_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &exe("venv_v3", "python3"));
        let v4 = touch(dir.path(), &exe("venv_v4", "python3"));
        assert_eq!(locate(dir.path()), Some(v4));
    }

    #[test]
    fn alternate_name_is_tried_before_next_installation() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &exe("venv_v3", "python3"));
        let alt = if cfg!(windows) {
            touch(dir.path(), "venv_v4/Scripts/python3.exe")
        } else {
            touch(dir.path(), "venv_v4/bin/python")
        };
        assert_eq!(locate(dir.path()), Some(alt));
    }

    #[cfg(unix)]
    #[test]
    fn standalone_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let standalone = touch(dir.path(), "py_standalone/python/bin/python3");
        assert_eq!(locate(dir.path()), Some(standalone));
    }
}
