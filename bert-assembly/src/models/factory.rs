use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::architectures::{
    build_model, BuildModelError, BuildPhases, Conditioning, FinalHeads, TransformerModel,
    WithAttentionMask,
};
use crate::checkpoint::{open_checkpoint, CheckpointError, CheckpointReader, OpenCheckpointError};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::models::albert::{Albert, AlbertUnshared};
use crate::models::bert::Bert;
use crate::models::nezha::Nezha;
use crate::models::{SpecError, TransformerConfig, TransformerSpec};
use crate::repository::Repo;

static CONFIG_FILE: &str = "config.json";

#[derive(Debug, Snafu)]
pub enum BuildTransformerError {
    #[snafu(display("Cannot build model"))]
    BuildModel { source: BuildModelError },

    #[snafu(display("Model configuration file does not exist"))]
    ConfigPath,

    #[snafu(display("Cannot get model configuration from repository"))]
    FetchConfig { source: BoxedError },

    #[snafu(display("Cannot load checkpoint"))]
    LoadCheckpoint { source: CheckpointError },

    #[snafu(display("Cannot open file for reading: {path:?}"))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot open checkpoint"))]
    OpenCheckpoint { source: OpenCheckpointError },

    #[snafu(display("Cannot deserialize model configuration"))]
    ParseConfig { source: serde_json::Error },

    #[snafu(display("Invalid model configuration"))]
    Spec { source: SpecError },

    #[snafu(display("Unknown application: {name}"))]
    UnknownApplication { name: String },

    #[snafu(display("Unknown model: {name}"))]
    UnknownModel { name: String },
}

/// Model architectures.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ModelKind {
    Albert,
    AlbertUnshared,
    #[default]
    Bert,
    Nezha,
}

impl FromStr for ModelKind {
    type Err = BuildTransformerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "albert" => Ok(ModelKind::Albert),
            "albert_unshared" => Ok(ModelKind::AlbertUnshared),
            "bert" => Ok(ModelKind::Bert),
            "nezha" => Ok(ModelKind::Nezha),
            _ => UnknownModelSnafu { name: s }.fail(),
        }
    }
}

/// Applications of a model, an application determines the attention mask.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Application {
    /// Bidirectional attention.
    #[default]
    Encoder,

    /// Causal language model.
    LanguageModel,

    /// Unified language model, bidirectional attention within segment `0`,
    /// causal attention within segment `1`.
    UnifiedLanguageModel,
}

impl FromStr for Application {
    type Err = BuildTransformerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "encoder" => Ok(Application::Encoder),
            "lm" => Ok(Application::LanguageModel),
            "unilm" => Ok(Application::UnifiedLanguageModel),
            "seq2seq" => {
                tracing::warn!("application 'seq2seq' is deprecated, use 'unilm'");
                Ok(Application::UnifiedLanguageModel)
            }
            _ => UnknownApplicationSnafu { name: s }.fail(),
        }
    }
}

/// Options for building a transformer model.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    application: Application,
    conditioning: Option<Conditioning>,
    dtype: DType,
    heads: FinalHeads,
    keep_tokens: Option<Vec<u32>>,
    model: ModelKind,
}

impl BuildOptions {
    /// Application of the model.
    ///
    /// Default: `Application::Encoder`
    pub fn application(mut self, application: Application) -> Self {
        self.application = application;
        self
    }

    /// Condition the layer normalizations on an additional input.
    ///
    /// Default: `None`
    pub fn conditioning(mut self, conditioning: Option<Conditioning>) -> Self {
        self.conditioning = conditioning;
        self
    }

    /// Data type of the parameters.
    ///
    /// Default: `DType::F32`
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Only keep these pieces of the vocabulary.
    ///
    /// Default: `None`
    pub fn keep_tokens(mut self, keep_tokens: Option<Vec<u32>>) -> Self {
        self.keep_tokens = keep_tokens;
        self
    }

    /// Model architecture.
    ///
    /// Default: `ModelKind::Bert`
    pub fn model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    /// Add a masked language modeling head with the given activation.
    ///
    /// Default: `None`
    pub fn with_mlm(mut self, mlm: Option<Activation>) -> Self {
        self.heads = self.heads.with_mlm(mlm);
        self
    }

    /// Add a next sentence prediction head.
    ///
    /// Default: `false`
    pub fn with_nsp(mut self, nsp: bool) -> Self {
        self.heads = self.heads.with_nsp(nsp);
        self
    }

    /// Add a pooler with the given activation.
    ///
    /// Default: `None`
    pub fn with_pool(mut self, pool: Option<Activation>) -> Self {
        self.heads = self.heads.with_pool(pool);
        self
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            application: Application::default(),
            conditioning: None,
            dtype: DType::F32,
            heads: FinalHeads::default(),
            keep_tokens: None,
            model: ModelKind::default(),
        }
    }
}

fn build_phases(
    spec: TransformerSpec,
    model: ModelKind,
    application: Application,
    heads: FinalHeads,
) -> Result<Box<dyn BuildPhases>, SpecError> {
    let phases: Box<dyn BuildPhases> = match model {
        ModelKind::Albert => Box::new(Albert::new(spec, heads)?),
        ModelKind::AlbertUnshared => Box::new(AlbertUnshared::new(spec, heads)?),
        ModelKind::Bert => Box::new(Bert::new(spec, heads)?),
        ModelKind::Nezha => Box::new(Nezha::new(spec, heads)),
    };

    Ok(match application {
        Application::Encoder => phases,
        Application::LanguageModel => Box::new(WithAttentionMask::language_model(phases)),
        Application::UnifiedLanguageModel => {
            Box::new(WithAttentionMask::unified_language_model(phases))
        }
    })
}

/// Build a transformer model.
///
/// * `config` - Model configuration.
/// * `checkpoint` - Checkpoint to load the parameters from. When absent,
///   the parameters are randomly initialized.
/// * `options` - Build options.
/// * `device` - Device to place the model on.
pub fn build_transformer_model(
    config: &TransformerConfig,
    checkpoint: Option<&dyn CheckpointReader>,
    options: BuildOptions,
    device: &Device,
) -> Result<TransformerModel, BuildTransformerError> {
    let BuildOptions {
        application,
        conditioning,
        dtype,
        heads,
        keep_tokens,
        model,
    } = options;

    let spec = TransformerSpec::new(config, keep_tokens).context(SpecSnafu)?;
    let phases = build_phases(spec, model, application, heads).context(SpecSnafu)?;
    let model = build_model(phases, conditioning, dtype, device).context(BuildModelSnafu)?;

    if let Some(checkpoint) = checkpoint {
        model
            .load_weights_from_checkpoint(checkpoint)
            .context(LoadCheckpointSnafu)?;
    }

    Ok(model)
}

/// Build a transformer model from the configuration and checkpoint in a
/// repository.
///
/// * `repo` - Repository with `config.json` and a checkpoint.
/// * `options` - Build options.
/// * `device` - Device to place the model on.
pub fn build_transformer_model_from_repo(
    repo: &dyn Repo,
    options: BuildOptions,
    device: &Device,
) -> Result<TransformerModel, BuildTransformerError> {
    let config_path = repo
        .file(Path::new(CONFIG_FILE))
        .context(FetchConfigSnafu)?
        .context(ConfigPathSnafu)?;
    let config_file = File::open(&config_path).context(OpenSnafu { path: &config_path })?;
    let config: TransformerConfig =
        serde_json::from_reader(BufReader::new(config_file)).context(ParseConfigSnafu)?;

    let checkpoint = open_checkpoint(repo).context(OpenCheckpointSnafu)?;

    build_transformer_model(&config, Some(checkpoint.as_ref()), options, device)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use candle_core::{DType, Device, IndexOp, Tensor};
    use ndarray::ArrayD;
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::{
        build_transformer_model, build_transformer_model_from_repo, Application, BuildOptions,
        BuildTransformerError, ModelKind,
    };
    use crate::checkpoint::SafeTensorsWriter;
    use crate::layers::activation::Activation;
    use crate::models::tests::tiny_config;
    use crate::models::TransformerConfig;
    use crate::repository::LocalRepo;
    use crate::util::tests::{assert_tensor_eq, IntoArrayD};

    #[rstest]
    #[case("bert", ModelKind::Bert)]
    #[case("ALBERT", ModelKind::Albert)]
    #[case("Albert_Unshared", ModelKind::AlbertUnshared)]
    #[case("nezha", ModelKind::Nezha)]
    fn model_kinds_are_case_insensitive(#[case] name: &str, #[case] kind: ModelKind) {
        assert_eq!(name.parse::<ModelKind>().unwrap(), kind);
    }

    #[rstest]
    #[case("encoder", Application::Encoder)]
    #[case("LM", Application::LanguageModel)]
    #[case("unilm", Application::UnifiedLanguageModel)]
    #[case("seq2seq", Application::UnifiedLanguageModel)]
    fn applications_are_case_insensitive(#[case] name: &str, #[case] application: Application) {
        assert_eq!(name.parse::<Application>().unwrap(), application);
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(matches!(
            "gpt".parse::<ModelKind>(),
            Err(BuildTransformerError::UnknownModel { name }) if name == "gpt"
        ));
        assert!(matches!(
            "t5".parse::<Application>(),
            Err(BuildTransformerError::UnknownApplication { .. })
        ));
    }

    #[test]
    #[report]
    fn language_model_shares_one_causal_mask() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let model = build_transformer_model(
            &tiny_config(),
            None,
            BuildOptions::default().application(Application::LanguageModel),
            &device,
        )
        .whatever_context("Cannot build model")?;

        // The MLM head is added for language models.
        assert!(model.layer("MLM-Proba").is_some());
        assert_eq!(model.n_outputs(), 1);
        assert_eq!(
            model
                .registry()
                .names()
                .filter(|name| name.starts_with("Attention-"))
                .collect::<Vec<_>>(),
            vec!["Attention-LM-Mask"]
        );

        // Predictions for a prefix do not depend on later pieces.
        let prefix = Tensor::new(&[[2u32, 7, 4]], &device).whatever_context("pieces")?;
        let continued = Tensor::new(&[[2u32, 7, 4, 9, 11]], &device).whatever_context("pieces")?;
        let prefix_output = model
            .forward_t(
                &[prefix.clone(), prefix.zeros_like().whatever_context("segments")?],
                false,
            )
            .whatever_context("Cannot apply model")?;
        let continued_output = model
            .forward_t(
                &[
                    continued.clone(),
                    continued.zeros_like().whatever_context("segments")?,
                ],
                false,
            )
            .whatever_context("Cannot apply model")?;
        let expected: ArrayD<f32> = (&prefix_output[0])
            .into_arrayd()
            .whatever_context("Cannot convert output")?;
        assert_tensor_eq!(
            continued_output[0]
                .i((.., ..3, ..))
                .whatever_context("Cannot slice output")?,
            expected,
            epsilon = 1e-5f32
        );

        Ok(())
    }

    #[test]
    #[report]
    fn unified_language_model_targets_are_causal() -> Result<(), Whatever> {
        let device = Device::Cpu;
        // A single block, in deeper models target pieces also see later
        // pieces through the hidden representations of the context.
        let config = TransformerConfig {
            num_hidden_layers: 1,
            ..tiny_config()
        };
        let model = build_transformer_model(
            &config,
            None,
            BuildOptions::default()
                .model(ModelKind::Albert)
                .application(Application::UnifiedLanguageModel)
                .with_mlm(Some(Activation::Linear)),
            &device,
        )
        .whatever_context("Cannot build model")?;
        assert!(model.layer("Attention-UniLM-Mask").is_some());

        let pieces = Tensor::new(&[[2u32, 7, 4, 9, 3]], &device).whatever_context("pieces")?;
        let segments = Tensor::new(&[[0u32, 0, 1, 1, 1]], &device).whatever_context("segments")?;
        let changed_last =
            Tensor::new(&[[2u32, 7, 4, 9, 12]], &device).whatever_context("pieces")?;

        let output = model
            .forward_t(&[pieces, segments.clone()], false)
            .whatever_context("Cannot apply model")?;
        let changed_output = model
            .forward_t(&[changed_last, segments], false)
            .whatever_context("Cannot apply model")?;

        let expected: ArrayD<f32> = output[0]
            .i((.., 2..4, ..))
            .whatever_context("Cannot slice output")?
            .into_arrayd()
            .whatever_context("Cannot convert output")?;
        assert_tensor_eq!(
            changed_output[0]
                .i((.., 2..4, ..))
                .whatever_context("Cannot slice output")?,
            expected,
            epsilon = 1e-5f32
        );

        Ok(())
    }

    #[test]
    #[report]
    fn model_can_be_built_from_local_repo() -> Result<(), Whatever> {
        let dir = std::env::temp_dir().join(format!("local-model-{}", std::process::id()));
        fs::create_dir_all(&dir).whatever_context("Cannot create model directory")?;
        let device = Device::Cpu;

        let config = tiny_config();
        fs::write(
            dir.join("config.json"),
            serde_json::to_string(&config).whatever_context("Cannot serialize config")?,
        )
        .whatever_context("Cannot write config")?;

        let options = BuildOptions::default().with_pool(Some(Activation::Tanh));
        let source = build_transformer_model(&config, None, options.clone(), &device)
            .whatever_context("Cannot build model")?;
        source
            .save_weights_as_checkpoint(&mut SafeTensorsWriter::new(dir.join("model.safetensors")))
            .whatever_context("Cannot save checkpoint")?;

        let loaded = build_transformer_model_from_repo(&LocalRepo::new(&dir), options, &device)
            .whatever_context("Cannot build model from repository")?;

        let pieces = Tensor::new(&[[2u32, 7, 4, 0]], &device).whatever_context("pieces")?;
        let segments = Tensor::zeros((1, 4), DType::U32, &device).whatever_context("segments")?;
        let source_output = source
            .forward_t(&[pieces.clone(), segments.clone()], false)
            .whatever_context("Cannot apply model")?;
        let loaded_output = loaded
            .forward_t(&[pieces, segments], false)
            .whatever_context("Cannot apply model")?;
        assert_eq!(loaded_output[0].dims(), &[1, config.hidden_size]);
        let expected: ArrayD<f32> = (&source_output[0])
            .into_arrayd()
            .whatever_context("Cannot convert output")?;
        assert_tensor_eq!(loaded_output[0].clone(), expected, epsilon = 1e-6f32);

        drop(loaded);
        fs::remove_dir_all(&dir).whatever_context("Cannot remove model directory")?;
        Ok(())
    }
}
