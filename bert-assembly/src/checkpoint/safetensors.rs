use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{Device, Tensor};
use snafu::{OptionExt, ResultExt, Snafu};

use super::{CheckpointReader, CheckpointWriter};
use crate::error::BoxedError;

/// Memory-mapped safetensors checkpoint, possibly sharded.
pub struct SafeTensorsCheckpoint {
    names: HashSet<String>,
    tensors: MmapedSafetensors,
}

impl SafeTensorsCheckpoint {
    /// Open the checkpoint files.
    ///
    /// * `paths` - Checkpoint files, one per shard.
    pub fn open(paths: &[impl AsRef<Path>]) -> Result<Self, candle_core::Error> {
        // The files must not be modified while they are mapped.
        let tensors = unsafe { MmapedSafetensors::multi(paths)? };
        let names = tensors
            .tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Ok(SafeTensorsCheckpoint { names, tensors })
    }
}

impl CheckpointReader for SafeTensorsCheckpoint {
    fn contains_variable(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn load_variable(&self, name: &str, device: &Device) -> Result<Tensor, BoxedError> {
        Ok(self.tensors.load(name, device)?)
    }

    fn variable_names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}

#[derive(Debug, Snafu)]
pub enum SafeTensorsWriterError {
    #[snafu(display("Checkpoint path has no file name: {}", path.to_string_lossy()))]
    InvalidPath { path: PathBuf },

    #[snafu(display("Cannot move checkpoint into place: {}", path.to_string_lossy()))]
    Rename { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot serialize checkpoint"))]
    Serialize { source: candle_core::Error },
}

/// Scratch file that is removed unless it was committed.
struct PartialFile {
    committed: bool,
    partial: PathBuf,
    target: PathBuf,
}

impl PartialFile {
    fn new(target: &Path) -> Result<Self, SafeTensorsWriterError> {
        let mut file_name: OsString = target
            .file_name()
            .context(InvalidPathSnafu { path: target })?
            .to_owned();
        file_name.push(".partial");

        Ok(PartialFile {
            committed: false,
            partial: target.with_file_name(file_name),
            target: target.to_owned(),
        })
    }

    fn path(&self) -> &Path {
        &self.partial
    }

    fn commit(mut self) -> Result<(), SafeTensorsWriterError> {
        fs::rename(&self.partial, &self.target).context(RenameSnafu {
            path: self.target.clone(),
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.partial);
        }
    }
}

/// Writes variables to a single safetensors file.
///
/// Variables are first written to `<path>.partial`, which is moved to
/// `path` once it is complete. An existing checkpoint at `path` is never
/// left half-written.
#[derive(Clone, Debug)]
pub struct SafeTensorsWriter {
    path: PathBuf,
}

impl SafeTensorsWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        SafeTensorsWriter {
            path: path.as_ref().to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointWriter for SafeTensorsWriter {
    fn write_variables(&mut self, variables: HashMap<String, Tensor>) -> Result<(), BoxedError> {
        let partial = PartialFile::new(&self.path)?;
        candle_core::safetensors::save(&variables, partial.path()).context(SerializeSnafu)?;
        partial.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use candle_core::{Device, Tensor};
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::{PartialFile, SafeTensorsCheckpoint, SafeTensorsWriter};
    use crate::checkpoint::{CheckpointReader, CheckpointWriter};

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    #[report]
    fn written_checkpoint_can_be_read() -> Result<(), Whatever> {
        let dir = scratch_dir("safetensors-writer");
        let path = dir.join("model.safetensors");
        let device = Device::Cpu;

        let value = Tensor::new(&[[1f32, 2.], [3., 4.]], &device)
            .whatever_context("Cannot create value")?;
        let mut writer = SafeTensorsWriter::new(&path);
        writer
            .write_variables(HashMap::from([(
                "bert/pooler/dense/kernel".to_string(),
                value.clone(),
            )]))
            .map_err(|e| Whatever::with_source(e, "Cannot write checkpoint".into()))?;
        assert!(path.exists());
        assert!(!dir.join("model.safetensors.partial").exists());

        let checkpoint =
            SafeTensorsCheckpoint::open(&[&path]).whatever_context("Cannot open checkpoint")?;
        assert!(checkpoint.contains_variable("bert/pooler/dense/kernel"));
        assert!(!checkpoint.contains_variable("bert/pooler/dense/bias"));
        let loaded = checkpoint
            .load_variable("bert/pooler/dense/kernel", &device)
            .map_err(|e| Whatever::with_source(e, "Cannot load variable".into()))?;
        assert_eq!(
            loaded.to_vec2::<f32>().whatever_context("Cannot convert")?,
            value.to_vec2::<f32>().whatever_context("Cannot convert")?
        );

        drop(checkpoint);
        fs::remove_dir_all(&dir).whatever_context("Cannot remove scratch directory")?;
        Ok(())
    }

    #[test]
    fn uncommitted_partial_file_is_removed() {
        let dir = scratch_dir("partial-file");
        let target = dir.join("model.safetensors");
        {
            let partial = PartialFile::new(&target).unwrap();
            fs::write(partial.path(), b"incomplete").unwrap();
            assert!(partial.path().exists());
        }
        assert!(!dir.join("model.safetensors.partial").exists());
        assert!(!target.exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
