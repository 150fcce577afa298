pub mod activation;

pub mod attention;

pub mod build_layer;

pub mod dense;

pub mod dropout;

pub mod embeddings;

pub mod feedforward;

pub mod lambda;

pub mod layer_norm;

pub mod merge;
