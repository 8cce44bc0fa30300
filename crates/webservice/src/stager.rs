use std::path::{Component, Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use levseq_protocol::Scalar;

#[derive(Debug)]
pub enum StagerError {
    BadParams(String),
    Decode(String),
    Io { path: PathBuf, source: std::io::Error },
    Missing(String),
}

impl std::fmt::Display for StagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagerError::BadParams(message) => write!(f, "{}", message),
            StagerError::Decode(message) => {
                write!(f, "file payload is not valid base64: {}", message)
            }
            StagerError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            StagerError::Missing(file_spec) => write!(f, "no staged file '{}'", file_spec),
        }
    }
}

impl std::error::Error for StagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StagerError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// Stages uploaded blobs under one root directory. Each staged file carries a
// `<file_spec>.status` sidecar holding "in progress", "completed" or
// "failed: <msg>"; concurrent loads of the same spec are last-writer-wins.
#[derive(Clone)]
pub struct FileStager {
    root: PathBuf,
}

impl FileStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn load_from_params(&self, params: &[Scalar]) -> Result<i64, StagerError> {
        let [Scalar::Text(file_spec), Scalar::Text(payload)] = params else {
            return Err(StagerError::BadParams(
                "load expects (file_spec, base64_payload) text parameters".to_string(),
            ));
        };
        self.load(file_spec, payload)
    }

    pub fn load(&self, file_spec: &str, payload_b64: &str) -> Result<i64, StagerError> {
        let target = self.staged_path(file_spec)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StagerError::Io {
                path: parent.to_path_buf(),
                source: err,
            })?;
        }

        self.write_status(file_spec, "in progress")?;

        let bytes = match BASE64_STANDARD.decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = self.write_status(file_spec, &format!("failed: {}", err));
                return Err(StagerError::Decode(err.to_string()));
            }
        };

        if let Err(err) = std::fs::write(&target, &bytes) {
            let _ = self.write_status(file_spec, &format!("failed: {}", err));
            return Err(StagerError::Io {
                path: target,
                source: err,
            });
        }

        self.write_status(file_spec, "completed")?;
        Ok(bytes.len() as i64)
    }

    pub fn unload_from_params(&self, params: &[Scalar]) -> Result<(), StagerError> {
        let [Scalar::Text(file_spec)] = params else {
            return Err(StagerError::BadParams(
                "unload expects a single file_spec text parameter".to_string(),
            ));
        };
        self.unload(file_spec)
    }

    pub fn unload(&self, file_spec: &str) -> Result<(), StagerError> {
        let target = self.staged_path(file_spec)?;

        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StagerError::Missing(file_spec.to_string()));
            }
            Err(err) => {
                return Err(StagerError::Io {
                    path: target,
                    source: err,
                });
            }
        }

        let _ = std::fs::remove_file(self.status_path(file_spec)?);
        Ok(())
    }

    pub fn status(&self, file_spec: &str) -> String {
        let text = self
            .status_path(file_spec)
            .ok()
            .and_then(|path| std::fs::read_to_string(path).ok());

        match text {
            Some(text) => text.trim().to_string(),
            None => "none".to_string(),
        }
    }

    fn staged_path(&self, file_spec: &str) -> Result<PathBuf, StagerError> {
        Ok(self.root.join(sanitized_file_spec(file_spec)?))
    }

    fn status_path(&self, file_spec: &str) -> Result<PathBuf, StagerError> {
        let mut os = self.staged_path(file_spec)?.into_os_string();
        os.push(".status");
        Ok(PathBuf::from(os))
    }

    fn write_status(&self, file_spec: &str, status: &str) -> Result<(), StagerError> {
        let path = self.status_path(file_spec)?;
        std::fs::write(&path, status).map_err(|err| StagerError::Io { path, source: err })
    }
}

// A file spec must stay inside the upload root: relative, and built from
// plain path segments only.
fn sanitized_file_spec(file_spec: &str) -> Result<&Path, StagerError> {
    let path = Path::new(file_spec);
    let safe = !file_spec.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

    if !safe {
        return Err(StagerError::BadParams(format!(
            "unsafe file spec '{}'",
            file_spec
        )));
    }
    Ok(path)
}
