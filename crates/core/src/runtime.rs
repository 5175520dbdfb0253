//! Locating bundled native tools: the ONNX Runtime dylib and `ffmpeg`.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

#[cfg(all(unix, not(target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|path| path.canonicalize())
        .ok()
        .and_then(|path| path.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then system locations.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("bin"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

fn binary_file_name(binary: &str) -> String {
    if cfg!(windows) && Path::new(binary).extension().is_none() {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn find_in_dirs(file_name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// A `Command` for `binary`, preferring a copy shipped next to the executable
/// over whatever `PATH` resolves.
pub fn command_for(binary: &str) -> Command {
    match find_in_dirs(&binary_file_name(binary), &candidate_bin_dirs()) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime when the variable is unset.
///
/// Must run before the first `ort` session is built.
pub fn setup_runtime_libs() {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return;
    }
    if let Some(path) = find_in_dirs(ORT_LIB_NAME, &candidate_lib_dirs()) {
        env::set_var(ORT_DYLIB_ENV, &path);
    }
}

pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(path) if Path::new(&path).is_file() => info!(path = %path, "ONNX Runtime library"),
        Ok(path) => warn!(path = %path, "ORT_DYLIB_PATH is set but the file does not exist"),
        Err(_) => warn!("ORT_DYLIB_PATH not set, ONNX Runtime will use default search paths"),
    }
}

/// First line of `ffmpeg -version`, or an error when ffmpeg cannot run.
pub fn ffmpeg_version() -> Result<String> {
    let output = command_for("ffmpeg")
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .context("failed to run ffmpeg; is it installed?")?;
    if !output.status.success() {
        bail!("ffmpeg -version exited with {}", output.status);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}
