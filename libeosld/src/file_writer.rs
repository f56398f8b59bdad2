//! The sized output buffer.
//!
//! Section offsets are fixed before the file is opened, so the whole output
//! is created at its final size up front and sections write into disjoint
//! ranges. We memory-map the file when we can and fall back to an in-memory
//! buffer that gets flushed on commit.

use crate::error::Context as _;
use crate::error::Result;
use memmap2::MmapOptions;
use std::io::Write;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;

pub struct SizedOutput {
    file: std::fs::File,
    pub out: OutputBuffer,
    path: PathBuf,
}

pub enum OutputBuffer {
    Mmap(memmap2::MmapMut),
    InMemory(Vec<u8>),
}

impl OutputBuffer {
    fn new(file: &std::fs::File, file_size: u64) -> Self {
        Self::new_mmapped(file, file_size)
            .unwrap_or_else(|| Self::InMemory(vec![0; file_size as usize]))
    }

    fn new_mmapped(file: &std::fs::File, file_size: u64) -> Option<Self> {
        file.set_len(file_size).ok()?;
        let mmap = unsafe { MmapOptions::new().map_mut(file) }.ok()?;
        Some(Self::Mmap(mmap))
    }
}

impl Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref(),
            OutputBuffer::InMemory(vec) => vec.deref(),
        }
    }
}

impl DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref_mut(),
            OutputBuffer::InMemory(vec) => vec.deref_mut(),
        }
    }
}

impl SizedOutput {
    #[tracing::instrument(skip_all, name = "Open output file")]
    pub fn new(path: &Path, file_size: u64) -> Result<SizedOutput> {
        // Replace rather than reuse any previous output; reusing would error
        // if the old file is currently being executed.
        let _ = std::fs::remove_file(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let out = OutputBuffer::new(&file, file_size);
        Ok(SizedOutput {
            file,
            out,
            path: path.to_path_buf(),
        })
    }

    /// Flushes the buffer to disk and marks the output executable.
    #[tracing::instrument(skip_all, name = "Commit output file")]
    pub fn commit(mut self) -> Result {
        match &self.out {
            OutputBuffer::Mmap(mmap) => mmap
                .flush()
                .with_context(|| format!("failed to write the output file {}", self.path.display()))?,
            OutputBuffer::InMemory(bytes) => self
                .file
                .write_all(bytes)
                .with_context(|| format!("failed to write the output file {}", self.path.display()))?,
        }
        // Best-effort only; writing to a pipe or an exotic filesystem may
        // not support it.
        let _ = make_executable(&self.file);
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let mut permissions = file.metadata()?.permissions();
    let mut mode = permissions.mode();
    // Set exec for each of user/group/other that has read.
    mode |= (mode & 0o444) >> 2;
    permissions.set_mode(mode);
    file.set_permissions(permissions)
}

#[cfg(not(unix))]
fn make_executable(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
