//! Tracing setup and the size-rotated log file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use jobd_types::Settings;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. Foreground mode logs to
/// stderr, otherwise to the rotating log file.
pub fn init_logging(settings: &Settings, foreground: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    if foreground {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to set tracing subscriber")?;
    } else {
        let file = RotatingFile::open(settings.log_file_path(), settings.max_log_size_bytes)
            .context("Failed to open log file")?;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(file)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to set tracing subscriber")?;
    }
    Ok(())
}

struct RotatingState {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
}

impl RotatingState {
    /// Move the current file to `<name>.<YYYYMMDD-HHMMSS>` and start a new one.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let rotated = rotated_path(&self.path);
        fs::rename(&self.path, &rotated)?;
        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }
}

/// Append-only log file that rotates once it exceeds `max_bytes`.
#[derive(Clone)]
pub struct RotatingFile {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState {
                path,
                file,
                size,
                max_bytes,
            })),
        })
    }
}

/// Writer handed out per event by [`RotatingFile`].
pub struct RotatingWriter {
    state: Arc<Mutex<RotatingState>>,
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        state.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        state.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriter {
            state: Arc::clone(&self.state),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `<path>.<YYYYMMDD-HHMMSS>`, with a counter appended if that name is taken.
fn rotated_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let base = format!("{}.{}", path.display(), stamp);
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}.{}", base, n));
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rotated_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("jobd.log."))
            .collect()
    }

    #[test]
    fn test_rotates_past_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobd.log");
        let file = RotatingFile::open(&path, 32).unwrap();

        let mut writer = file.make_writer();
        writer.write_all(&[b'a'; 20]).unwrap();
        assert!(rotated_files(dir.path()).is_empty());

        writer.write_all(&[b'b'; 20]).unwrap();
        let rotated = rotated_files(dir.path());
        assert_eq!(rotated.len(), 1);
        assert_eq!(fs::read(&rotated[0]).unwrap(), vec![b'a'; 20]);
        assert_eq!(fs::read(&path).unwrap(), vec![b'b'; 20]);
    }

    #[test]
    fn test_oversized_write_goes_to_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobd.log");
        let file = RotatingFile::open(&path, 8).unwrap();

        file.make_writer().write_all(&[b'x'; 16]).unwrap();
        assert!(rotated_files(dir.path()).is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 16);
    }

    #[test]
    fn test_existing_size_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobd.log");
        fs::write(&path, [b'o'; 30]).unwrap();

        let file = RotatingFile::open(&path, 32).unwrap();
        file.make_writer().write_all(b"new line\n").unwrap();
        assert_eq!(rotated_files(dir.path()).len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "new line\n");
    }
}
