use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

#[cfg(not(unix))]
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::FileExt;

use thiserror::Error;

/// Writable handle to one changelog file. Writes are positional so a
/// preallocated tail never shifts the append cursor.
pub trait DiskFile: Send {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
}

/// Seam between the changelog and the filesystem. The changelog never
/// touches files directly, so a virtualized or fault-injecting disk can be
/// swapped in underneath it.
pub trait LogDisk: Send + Sync {
    /// File names (not paths) present on this disk.
    fn list(&self) -> Result<Vec<String>, DiskError>;
    fn exists(&self, name: &str) -> Result<bool, DiskError>;
    fn file_size(&self, name: &str) -> Result<u64, DiskError>;
    fn read_all(&self, name: &str) -> Result<Vec<u8>, DiskError>;
    fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>, DiskError>;
    /// Opens (creating if needed) a file for positional appends. When
    /// `truncate_to` is set, the file is cut to that length first.
    fn open_for_append(
        &self,
        name: &str,
        truncate_to: Option<u64>,
    ) -> Result<Box<dyn DiskFile>, DiskError>;
    fn remove(&self, name: &str) -> Result<(), DiskError>;
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("file not found: {name}")]
    NotFound { name: String },
}

impl DiskError {
    pub fn is_not_found(&self) -> bool {
        match self {
            DiskError::NotFound { .. } => true,
            DiskError::Io(err) => err.kind() == io::ErrorKind::NotFound,
        }
    }
}

/// `LogDisk` over a local directory.
#[derive(Debug)]
pub struct LocalDisk {
    root: PathBuf,
}

impl LocalDisk {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DiskError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl LogDisk for LocalDisk {
    fn list(&self) -> Result<Vec<String>, DiskError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> Result<bool, DiskError> {
        Ok(self.path_for(name).is_file())
    }

    fn file_size(&self, name: &str) -> Result<u64, DiskError> {
        match fs::metadata(self.path_for(name)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(DiskError::NotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(DiskError::Io(err)),
        }
    }

    fn read_all(&self, name: &str) -> Result<Vec<u8>, DiskError> {
        match fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(DiskError::NotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(DiskError::Io(err)),
        }
    }

    fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>, DiskError> {
        let mut file = match File::open(self.path_for(name)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(DiskError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(err) => return Err(DiskError::Io(err)),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn open_for_append(
        &self,
        name: &str,
        truncate_to: Option<u64>,
    ) -> Result<Box<dyn DiskFile>, DiskError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.path_for(name))?;
        if let Some(len) = truncate_to {
            file.set_len(len)?;
        }
        Ok(Box::new(LocalDiskFile { file }))
    }

    fn remove(&self, name: &str) -> Result<(), DiskError> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(DiskError::NotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(DiskError::Io(err)),
        }
    }
}

struct LocalDiskFile {
    file: File,
}

impl DiskFile for LocalDiskFile {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.file.write_all_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(buf)
        }
    }

    fn sync_data(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
