mod encoder;
pub use encoder::{Bert, BertError};
pub(crate) use encoder::{
    block, block_layout_mapping, block_mapping, declare_inputs, embedding_mapping, embeddings, final_layers,
    head_mapping, BlockLayout, BlockNames,
};
