//! Locating the ONNX Runtime shared library for `ort`'s `load-dynamic` mode.

use std::env::{self, consts};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";

/// How the ONNX Runtime library was (or was not) found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLibrary {
    /// `ORT_DYLIB_PATH` was already set by the user.
    FromEnv(PathBuf),
    /// Found next to the binary or in a system dir; `ORT_DYLIB_PATH` now points at it.
    Discovered(PathBuf),
    NotFound { searched: Vec<PathBuf> },
}

impl OrtLibrary {
    /// Report the outcome once tracing is up.
    pub fn log(&self) {
        match self {
            Self::FromEnv(path) if path.is_file() => {
                info!(path = %path.display(), "Using ONNX Runtime from {ENV_ORT_DYLIB_PATH}")
            }
            Self::FromEnv(path) => warn!(
                path = %path.display(),
                "{ENV_ORT_DYLIB_PATH} does not point at a file; model loading will fail"
            ),
            Self::Discovered(path) => info!(path = %path.display(), "Using bundled ONNX Runtime"),
            Self::NotFound { searched } => warn!(
                searched = ?searched,
                "ONNX Runtime library not found; relying on the platform loader"
            ),
        }
    }
}

/// Resolve the runtime library and export `ORT_DYLIB_PATH` for `ort`.
///
/// Must run before the first model is loaded and before other threads start.
/// An existing `ORT_DYLIB_PATH` always wins.
pub fn locate_ort_library() -> OrtLibrary {
    if let Some(path) = env::var_os(ENV_ORT_DYLIB_PATH) {
        return OrtLibrary::FromEnv(PathBuf::from(path));
    }

    let exe = env::current_exe().and_then(|path| path.canonicalize()).ok();
    let cwd = env::current_dir().ok();
    let searched = search_dirs(exe.as_deref(), cwd.as_deref());

    match find_library(&searched, &library_file_name()) {
        Some(path) => {
            env::set_var(ENV_ORT_DYLIB_PATH, &path);
            OrtLibrary::Discovered(path)
        }
        None => OrtLibrary::NotFound { searched },
    }
}

/// `libonnxruntime.so`, `libonnxruntime.dylib` or `onnxruntime.dll`.
fn library_file_name() -> String {
    format!("{}onnxruntime{}", consts::DLL_PREFIX, consts::DLL_SUFFIX)
}

/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then the usual system dirs.
/// On Windows the exe dir itself comes first.
fn search_dirs(exe: Option<&Path>, cwd: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe.and_then(Path::parent) {
        if cfg!(windows) {
            dirs.push(exe_dir.to_path_buf());
        }
        dirs.push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("lib"));
        }
    }
    if let Some(cwd) = cwd {
        dirs.push(cwd.join("lib"));
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs.dedup();
    dirs
}

fn find_library(dirs: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_order_follows_the_binary_then_cwd() {
        let dirs = search_dirs(
            Some(Path::new("/opt/tilerestore/bin/tilerestore")),
            Some(Path::new("/work")),
        );
        let lib_dirs: Vec<&Path> = dirs
            .iter()
            .map(PathBuf::as_path)
            .filter(|dir| dir.ends_with("lib") && !dir.starts_with("/usr"))
            .collect();

        assert_eq!(
            lib_dirs,
            vec![
                Path::new("/opt/tilerestore/bin/lib"),
                Path::new("/opt/tilerestore/lib"),
                Path::new("/work/lib"),
            ]
        );
        if cfg!(unix) {
            assert_eq!(dirs.last(), Some(&PathBuf::from("/usr/lib")));
        }
    }

    #[test]
    fn library_name_matches_platform() {
        let name = library_file_name();
        assert!(name.contains("onnxruntime"));
        assert!(name.ends_with(consts::DLL_SUFFIX));
    }

    #[test]
    fn first_directory_with_the_library_wins() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let empty = temp.path().join("empty");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        for dir in [&empty, &first, &second] {
            std::fs::create_dir_all(dir).expect("search dir should be created");
        }
        let name = library_file_name();
        std::fs::write(first.join(&name), b"first").expect("first lib should exist");
        std::fs::write(second.join(&name), b"second").expect("second lib should exist");

        let resolved = find_library(&[empty, first.clone(), second], &name);
        assert_eq!(resolved, Some(first.join(&name)));
    }

    #[test]
    fn missing_library_resolves_to_none() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        assert_eq!(
            find_library(&[temp.path().to_path_buf()], &library_file_name()),
            None
        );
    }
}
