#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_GRAB_PORT: u16 = 8080;
pub const DEFAULT_GRAB_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_JOBS: usize = 3;
/// Upper bound for `GRAB_MAX_JOBS`; every worker is a yt-dlp process.
pub const MAX_JOBS_LIMIT: usize = 64;
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_DELAY_SECS: u64 = 5;
pub const DEFAULT_JOB_TTL_SECS: u64 = 3600;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";

/// Everything the binaries need to know at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub download_dir: PathBuf,
    pub www_root: Option<PathBuf>,
    pub grab_port: u16,
    pub grab_host: String,
    pub max_jobs: usize,
    pub metadata_timeout: Duration,
    pub cleanup_delay: Duration,
    /// How long finished jobs that were never retrieved are kept around.
    pub job_ttl: Duration,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
}

impl RuntimeSettings {
    /// Defaults rooted at `download_dir`, ignoring the environment.
    pub fn with_download_dir(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            www_root: None,
            grab_port: DEFAULT_GRAB_PORT,
            grab_host: DEFAULT_GRAB_HOST.to_string(),
            max_jobs: DEFAULT_MAX_JOBS,
            metadata_timeout: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECS),
            cleanup_delay: Duration::from_secs(DEFAULT_CLEANUP_DELAY_SECS),
            job_ttl: Duration::from_secs(DEFAULT_JOB_TTL_SECS),
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            ffmpeg_bin: PathBuf::from(DEFAULT_FFMPEG_BIN),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub grab_port: Option<u16>,
    pub grab_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("GRAB_DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("GRAB_WWW_ROOT").map(PathBuf::from));
    // `PORT` is what most PaaS hosts inject; the explicit key wins.
    let grab_port = overrides
        .grab_port
        .or_else(|| lookup("GRAB_PORT").and_then(|value| value.parse::<u16>().ok()))
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_GRAB_PORT);
    let grab_host = overrides
        .grab_host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("GRAB_HOST"))
        .unwrap_or_else(|| DEFAULT_GRAB_HOST.to_string());
    let max_jobs = parsed("GRAB_MAX_JOBS")
        .map(|value| value.clamp(1, MAX_JOBS_LIMIT as u64) as usize)
        .unwrap_or(DEFAULT_MAX_JOBS);
    let metadata_timeout = Duration::from_secs(
        parsed("GRAB_METADATA_TIMEOUT_SECS").unwrap_or(DEFAULT_METADATA_TIMEOUT_SECS),
    );
    let cleanup_delay = Duration::from_secs(
        parsed("GRAB_CLEANUP_DELAY_SECS").unwrap_or(DEFAULT_CLEANUP_DELAY_SECS),
    );
    let job_ttl = Duration::from_secs(
        parsed("GRAB_JOB_TTL_SECS")
            .map(|value| value.max(1))
            .unwrap_or(DEFAULT_JOB_TTL_SECS),
    );
    let ytdlp_bin = lookup("GRAB_YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let ffmpeg_bin = lookup("GRAB_FFMPEG_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN));

    RuntimeSettings {
        download_dir,
        www_root,
        grab_port,
        grab_host,
        max_jobs,
        metadata_timeout,
        cleanup_delay,
        job_ttl,
        ytdlp_bin,
        ffmpeg_bin,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Process environment first, then the `.env` file. Blank values are treated
/// as unset in both sources.
fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let non_blank = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    env_lookup(key)
        .and_then(non_blank)
        .or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let settings = settings_from("");
        assert_eq!(settings.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(settings.www_root, None);
        assert_eq!(settings.grab_port, DEFAULT_GRAB_PORT);
        assert_eq!(settings.grab_host, DEFAULT_GRAB_HOST);
        assert_eq!(settings.max_jobs, DEFAULT_MAX_JOBS);
        assert_eq!(settings.metadata_timeout, Duration::from_secs(30));
        assert_eq!(settings.cleanup_delay, Duration::from_secs(5));
        assert_eq!(settings.ytdlp_bin, PathBuf::from("yt-dlp"));
        assert_eq!(settings.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn reads_every_key_from_file() {
        let settings = settings_from(
            "GRAB_DOWNLOAD_DIR=\"/tmp/dl\"\nGRAB_WWW_ROOT=/www\nGRAB_PORT=4242\n\
             GRAB_HOST=0.0.0.0\nGRAB_MAX_JOBS=8\nGRAB_METADATA_TIMEOUT_SECS=10\n\
             GRAB_CLEANUP_DELAY_SECS=60\nGRAB_YTDLP_BIN=/opt/yt-dlp\nGRAB_FFMPEG_BIN=/opt/ffmpeg\n",
        );
        assert_eq!(settings.download_dir, PathBuf::from("/tmp/dl"));
        assert_eq!(settings.www_root, Some(PathBuf::from("/www")));
        assert_eq!(settings.grab_port, 4242);
        assert_eq!(settings.grab_host, "0.0.0.0");
        assert_eq!(settings.max_jobs, 8);
        assert_eq!(settings.metadata_timeout, Duration::from_secs(10));
        assert_eq!(settings.cleanup_delay, Duration::from_secs(60));
        assert_eq!(settings.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(settings.ffmpeg_bin, PathBuf::from("/opt/ffmpeg"));
    }

    #[test]
    fn paas_port_used_when_grab_port_missing() {
        assert_eq!(settings_from("PORT=5000\n").grab_port, 5000);
        assert_eq!(settings_from("PORT=5000\nGRAB_PORT=6000\n").grab_port, 6000);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from("GRAB_PORT=\"nope\"\nGRAB_MAX_JOBS=lots\n");
        assert_eq!(settings.grab_port, DEFAULT_GRAB_PORT);
        assert_eq!(settings.max_jobs, DEFAULT_MAX_JOBS);
    }

    #[test]
    fn zero_workers_clamped_to_one() {
        assert_eq!(settings_from("GRAB_MAX_JOBS=0\n").max_jobs, 1);
    }

    #[test]
    fn huge_worker_counts_are_capped() {
        let settings = settings_from("GRAB_MAX_JOBS=4611686018427387904\n");
        assert_eq!(settings.max_jobs, MAX_JOBS_LIMIT);
        assert_eq!(settings_from("GRAB_MAX_JOBS=8\n").max_jobs, 8);
    }

    #[test]
    fn job_ttl_read_from_env() {
        assert_eq!(
            settings_from("").job_ttl,
            Duration::from_secs(DEFAULT_JOB_TTL_SECS)
        );
        assert_eq!(
            settings_from("GRAB_JOB_TTL_SECS=90\n").job_ttl,
            Duration::from_secs(90)
        );
        assert_eq!(
            settings_from("GRAB_JOB_TTL_SECS=0\n").job_ttl,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn env_preferred_over_file() {
        let vars = read_env_file(make_config("GRAB_DOWNLOAD_DIR=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "GRAB_DOWNLOAD_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        });
        assert_eq!(settings.download_dir, PathBuf::from("/env"));
    }

    #[test]
    fn blank_env_value_does_not_mask_file() {
        let vars = read_env_file(make_config("GRAB_HOST=10.0.0.1\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |_| Some("   ".to_string()));
        assert_eq!(settings.grab_host, "10.0.0.1");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export GRAB_DOWNLOAD_DIR="/media"
            GRAB_WWW_ROOT='/www'
            GRAB_HOST =  "0.0.0.0"
            GRAB_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("GRAB_DOWNLOAD_DIR").unwrap(), "/media");
        assert_eq!(vars.get("GRAB_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("GRAB_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("GRAB_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("GRAB_DOWNLOAD_DIR".to_string(), "/file-dl".to_string());
        vars.insert("GRAB_WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("GRAB_HOST".to_string(), "file-host".to_string());
        vars.insert("GRAB_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            download_dir: Some(PathBuf::from("/override-dl")),
            www_root: None,
            grab_port: Some(9000),
            grab_host: Some("override-host".into()),
            env_path: None,
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "GRAB_WWW_ROOT" {
                    Some("/env-www".to_string())
                } else if key == "GRAB_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(settings.download_dir, PathBuf::from("/override-dl"));
        assert_eq!(settings.www_root, Some(PathBuf::from("/env-www")));
        assert_eq!(settings.grab_port, 9000);
        assert_eq!(settings.grab_host, "override-host");
    }

    #[test]
    fn blank_host_override_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                grab_host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(settings.grab_host, DEFAULT_GRAB_HOST);
    }

    #[test]
    fn resolve_uses_custom_env_path() {
        let cfg = make_config("GRAB_MAX_JOBS=5\n");
        let settings = resolve_runtime_settings(RuntimeOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            ..RuntimeOverrides::default()
        })
        .unwrap();
        if std::env::var("GRAB_MAX_JOBS").is_err() {
            assert_eq!(settings.max_jobs, 5);
        }
    }
}
