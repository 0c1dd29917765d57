//! Turning model and adapter identifiers into local paths
//!
//! Identifiers are local paths, `file://` URIs, `http(s)://` URLs or Hugging
//! Face Hub repositories (`org/name` or `hf://org/name`). Packed `.tar` /
//! `.tar.gz` archives are extracted into the cache directory. `s3://`
//! identifiers are recognised but need an external fetcher.
//!
//! A bare `org/name` is a hub repository only when no such local path exists.

use flate2::read::GzDecoder;
use hf_hub::api::sync::{ApiBuilder, ApiError, ApiRepo};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{ServeError, ServeResult};

/// Timeout for downloading remote artifacts
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Where an identifier points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Local(PathBuf),
    Http(String),
    Hub { repo: String },
    S3 { bucket: String, key: String },
}

impl ArtifactLocation {
    pub fn parse(identifier: &str) -> Self {
        let identifier = identifier.trim();
        if let Some(path) = identifier.strip_prefix("file://") {
            ArtifactLocation::Local(PathBuf::from(path))
        } else if identifier.starts_with("http://") || identifier.starts_with("https://") {
            ArtifactLocation::Http(identifier.to_string())
        } else if let Some(repo) = identifier.strip_prefix("hf://") {
            ArtifactLocation::Hub {
                repo: repo.trim_matches('/').to_string(),
            }
        } else if let Some(rest) = identifier.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            ArtifactLocation::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else if is_hub_repo(identifier) && !Path::new(identifier).exists() {
            ArtifactLocation::Hub {
                repo: identifier.to_string(),
            }
        } else {
            ArtifactLocation::Local(PathBuf::from(identifier))
        }
    }
}

/// `org/name` with hub-legal characters
fn is_hub_repo(identifier: &str) -> bool {
    let legal = |part: &str| {
        !part.is_empty()
            && !part.starts_with('.')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match identifier.split_once('/') {
        Some((org, name)) => legal(org) && legal(name),
        None => false,
    }
}

/// Sub-model directories of a diffusers repository
const MODEL_COMPONENTS: [&str; 3] = ["text_encoder", "unet", "vae"];
/// Scheduler configuration inside a diffusers repository
const HUB_SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";
/// File name diffusers uses for saved LoRA weights
const DIFFUSERS_LORA_FILE: &str = "pytorch_lora_weights.safetensors";

/// Repository files a model download needs: per component the plain
/// `.safetensors` shards, or the precision variants when there are none,
/// plus the scheduler configuration
fn select_model_files(files: &[String]) -> Vec<String> {
    let mut selected = Vec::new();
    for component in MODEL_COMPONENTS {
        let weights: Vec<&String> = files
            .iter()
            .filter(|f| {
                Path::new(f.as_str()).parent() == Some(Path::new(component))
                    && f.ends_with(".safetensors")
            })
            .collect();
        let is_variant = |f: &&String| {
            Path::new(f.as_str())
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem.contains('.'))
        };
        let plain: Vec<&String> = weights.iter().copied().filter(|f| !is_variant(f)).collect();
        let chosen = if plain.is_empty() { weights } else { plain };
        selected.extend(chosen.into_iter().cloned());
    }
    if files.iter().any(|f| f == HUB_SCHEDULER_CONFIG) {
        selected.push(HUB_SCHEDULER_CONFIG.to_string());
    }
    selected.sort();
    selected
}

/// The adapter file of a repository: the diffusers default name, or the only
/// top-level `.safetensors` file
fn select_adapter_file(files: &[String]) -> Option<String> {
    let top_level: Vec<&String> = files
        .iter()
        .filter(|f| !f.contains('/') && f.ends_with(".safetensors"))
        .collect();
    if let Some(default) = top_level.iter().find(|f| f.as_str() == DIFFUSERS_LORA_FILE) {
        return Some(default.to_string());
    }
    match top_level.as_slice() {
        [single] => Some(single.to_string()),
        _ => None,
    }
}

fn hub_error(repo: &str, err: ApiError) -> ServeError {
    ServeError::remote_fetch(format!("hub repository {}: {}", repo, err))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Tar,
    TarGz,
}

impl ArchiveKind {
    fn detect(path: &Path) -> Option<(Self, String)> {
        let name = path.file_name()?.to_str()?;
        if let Some(stem) = name
            .strip_suffix(".tar.gz")
            .or_else(|| name.strip_suffix(".tgz"))
        {
            Some((ArchiveKind::TarGz, stem.to_string()))
        } else {
            name.strip_suffix(".tar")
                .map(|stem| (ArchiveKind::Tar, stem.to_string()))
        }
    }
}

/// Resolves identifiers to local files or directories
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    cache_dir: PathBuf,
    timeout: Duration,
}

impl ArtifactFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            timeout: DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Local path of the artifact, downloading and extracting as needed
    #[instrument(skip(self))]
    pub fn fetch(&self, identifier: &str) -> ServeResult<PathBuf> {
        let local = match ArtifactLocation::parse(identifier) {
            ArtifactLocation::Local(path) => {
                if !path.exists() {
                    return Err(ServeError::remote_fetch(format!(
                        "{} does not exist",
                        path.display()
                    )));
                }
                path
            }
            ArtifactLocation::Http(url) => self.download(&url)?,
            ArtifactLocation::Hub { repo } => return self.fetch_hub_model(&repo),
            ArtifactLocation::S3 { bucket, key } => {
                return Err(ServeError::remote_fetch(format!(
                    "s3://{}/{} needs an external fetcher; download it and pass a local path",
                    bucket, key
                )))
            }
        };

        match ArchiveKind::detect(&local) {
            Some((kind, stem)) if local.is_file() => self.extract(&local, kind, &stem),
            _ => Ok(local),
        }
    }

    /// Like [`ArtifactFetcher::fetch`], then pick the `.safetensors` file of a
    /// directory artifact
    pub fn fetch_adapter(&self, identifier: &str) -> ServeResult<PathBuf> {
        if let ArtifactLocation::Hub { repo } = ArtifactLocation::parse(identifier) {
            return self.fetch_hub_adapter(&repo);
        }

        let path = self.fetch(identifier)?;
        if path.is_file() {
            return Ok(path);
        }

        let mut candidates: Vec<PathBuf> = fs::read_dir(&path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("safetensors"))
            .collect();
        candidates.sort();
        match candidates.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(ServeError::remote_fetch(format!(
                "no .safetensors adapter in {}",
                path.display()
            ))),
            _ => Err(ServeError::remote_fetch(format!(
                "{} holds {} .safetensors files; name the adapter file directly",
                path.display(),
                candidates.len()
            ))),
        }
    }

    fn hub_repo(&self, repo: &str) -> ServeResult<(ApiRepo, Vec<String>)> {
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.join("hub"))
            .with_progress(false)
            .build()
            .map_err(|e| hub_error(repo, e))?;
        let handle = api.model(repo.to_string());
        let files = handle
            .info()
            .map_err(|e| hub_error(repo, e))?
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .collect();
        Ok((handle, files))
    }

    /// Download the weights and scheduler configuration of a diffusers
    /// repository; returns the snapshot directory
    fn fetch_hub_model(&self, repo: &str) -> ServeResult<PathBuf> {
        let (handle, files) = self.hub_repo(repo)?;
        let selected = select_model_files(&files);
        if selected.is_empty() {
            return Err(ServeError::remote_fetch(format!(
                "hub repository {} has no diffusers .safetensors weights",
                repo
            )));
        }

        info!("Fetching {} files of {} from the hub", selected.len(), repo);
        let mut root = None;
        for file in &selected {
            let local = handle.get(file).map_err(|e| hub_error(repo, e))?;
            debug!("{} -> {}", file, local.display());
            if root.is_none() {
                root = local
                    .ancestors()
                    .nth(Path::new(file).components().count())
                    .map(Path::to_path_buf);
            }
        }
        root.ok_or_else(|| {
            ServeError::remote_fetch(format!("cannot locate the snapshot of {}", repo))
        })
    }

    fn fetch_hub_adapter(&self, repo: &str) -> ServeResult<PathBuf> {
        let (handle, files) = self.hub_repo(repo)?;
        let file = select_adapter_file(&files).ok_or_else(|| {
            ServeError::remote_fetch(format!(
                "hub repository {} has no single top-level .safetensors adapter",
                repo
            ))
        })?;
        info!("Fetching adapter {} from {}", file, repo);
        handle.get(&file).map_err(|e| hub_error(repo, e))
    }

    fn download(&self, url: &str) -> ServeResult<PathBuf> {
        let name = url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|n| !n.is_empty())
            .unwrap_or("artifact");
        let dest = self.cache_dir.join("downloads").join(name);
        if dest.exists() {
            debug!("Using cached download {}", dest.display());
            return Ok(dest);
        }

        fs::create_dir_all(self.cache_dir.join("downloads"))?;
        info!("Downloading {}", url);
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let mut response = client.get(url).send()?.error_for_status()?;

        let partial = dest.with_file_name(format!("{}.partial", name));
        let mut file = File::create(&partial)?;
        let bytes = io::copy(&mut response, &mut file)?;
        fs::rename(&partial, &dest)?;
        info!("Downloaded {} bytes to {}", bytes, dest.display());
        Ok(dest)
    }

    fn extract(&self, archive: &Path, kind: ArchiveKind, stem: &str) -> ServeResult<PathBuf> {
        let dest = self.cache_dir.join("extracted").join(stem);
        if !dest.exists() {
            let file = File::open(archive)?;
            let reader: Box<dyn Read> = match kind {
                ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
                ArchiveKind::Tar => Box::new(file),
            };
            let staging = dest.with_file_name(format!("{}.partial", stem));
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            fs::create_dir_all(&staging)?;
            tar::Archive::new(reader).unpack(&staging)?;
            fs::rename(&staging, &dest)?;
            info!("Extracted {} into {}", archive.display(), dest.display());
        }
        Ok(artifact_root(dest))
    }
}

/// Descend through a lone top-level directory, as produced by `tar czf x.tar.gz dir/`
fn artifact_root(dir: PathBuf) -> PathBuf {
    let entries: Vec<PathBuf> = match fs::read_dir(&dir) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => return dir,
    };
    match entries.as_slice() {
        [only] if only.is_dir() => only.clone(),
        _ => dir,
    }
}
