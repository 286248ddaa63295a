//! Stub executables standing in for yt-dlp in unit tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable bash script named `name` into `dir`.
pub(crate) fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env bash\nset -u\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Parses `-o`, `--audio-format` and `--merge-output-format`, records its
/// arguments next to itself, prints a few progress lines and writes the
/// output file. `$STUB_PRELUDE` runs first so tests can inject delays or
/// failures.
pub(crate) const DOWNLOAD_STUB: &str = r#"
script_dir="$(cd "$(dirname "$0")" && pwd)"
printf '%s\n' "$@" > "$script_dir/last-args.txt"
output=""
ext="webm"
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o)
      shift
      output="$1"
      ;;
    --audio-format|--merge-output-format)
      shift
      ext="$1"
      ;;
  esac
  shift
done

if [[ -f "$script_dir/prelude.sh" ]]; then
  source "$script_dir/prelude.sh"
fi

echo "[youtube] alpha: Downloading webpage"
echo "[download] Destination: ${output}"
echo "[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download]  55.5% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download] garbage% of 1.00MiB"
echo "[download] 100% of 1.00MiB in 00:00:01"
target="${output//%(ext)s/$ext}"
mkdir -p "$(dirname "$target")"
printf 'media-bytes' > "$target"
"#;

pub(crate) fn install_download_stub(dir: &Path) -> PathBuf {
    install_script(dir, "yt-dlp", DOWNLOAD_STUB)
}

/// Extra bash run by the download stub before it produces output.
pub(crate) fn set_stub_prelude(dir: &Path, body: &str) {
    fs::write(dir.join("prelude.sh"), body).unwrap();
}

pub(crate) fn recorded_args(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("last-args.txt"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
