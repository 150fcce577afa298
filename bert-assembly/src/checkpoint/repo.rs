use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{CheckpointReader, SafeTensorsCheckpoint};
use crate::error::BoxedError;
use crate::repository::Repo;

static SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
static SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Checkpoint discovery errors.
#[derive(Debug, Snafu)]
pub enum OpenCheckpointError {
    #[snafu(display("Cannot fetch checkpoint file: {name}"))]
    FetchFile { source: BoxedError, name: String },

    #[snafu(display("Cannot open or load checkpoint"))]
    LoadCheckpoint { source: candle_core::Error },

    #[snafu(display("Checkpoint does not exist: {name}"))]
    NonExistentCheckpoint { name: String },

    #[snafu(display("Shard does not exist: {name}"))]
    NonExistentShard { name: String },

    #[snafu(display("Cannot open index file: {}", path.to_string_lossy()))]
    OpenCheckpointIndex { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse index file: {}", path.to_string_lossy()))]
    ParseCheckpointIndex {
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// Open the safetensors checkpoint of a repository.
///
/// A shard index is used when present, otherwise a single-file checkpoint
/// is opened.
pub fn open_checkpoint(repo: &dyn Repo) -> Result<Box<dyn CheckpointReader>, OpenCheckpointError> {
    let paths = checkpoint_paths(repo, SAFETENSORS_INDEX, SAFETENSORS_SINGLE)?;
    tracing::info!(shards = paths.len(), "opening safetensors checkpoint");
    Ok(Box::new(
        SafeTensorsCheckpoint::open(&paths).context(LoadCheckpointSnafu)?,
    ))
}

fn checkpoint_paths(
    repo: &dyn Repo,
    index: &str,
    single: &str,
) -> Result<Vec<PathBuf>, OpenCheckpointError> {
    if !repo.exists(Path::new(index)) {
        let path = repo
            .file(Path::new(single))
            .context(FetchFileSnafu { name: single })?
            .context(NonExistentCheckpointSnafu { name: single })?;
        return Ok(vec![path]);
    }

    let path = repo
        .file(Path::new(index))
        .context(FetchFileSnafu { name: index })?
        .context(NonExistentCheckpointSnafu { name: index })?;

    // Parse the shard index.
    let index_file =
        BufReader::new(File::open(&path).context(OpenCheckpointIndexSnafu { path: path.clone() })?);
    let index: CheckpointIndex = serde_json::from_reader(index_file)
        .context(ParseCheckpointIndexSnafu { path: path.clone() })?;

    index
        .shards()
        .into_iter()
        .map(|shard_name| {
            repo.file(Path::new(&shard_name))
                .context(FetchFileSnafu {
                    name: shard_name.clone(),
                })?
                .context(NonExistentShardSnafu { name: shard_name })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CheckpointIndex {
    weight_map: HashMap<String, String>,
}

impl CheckpointIndex {
    /// Get the names of the shards, sorted.
    fn shards(&self) -> BTreeSet<String> {
        self.weight_map.values().cloned().collect()
    }
}
