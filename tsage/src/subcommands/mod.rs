/// Coalescent with recombination simulator
pub mod simulate;

/// Sequencing and ancestral state error injection
pub mod add_errors;

/// Genealogy and sample data to VCF, flat genetic maps
pub mod convert;

/// Running and timing external inference programs
pub mod tools;

/// Mutation ages and their alignment across methods
pub mod compare;

/// Kendall-Colijn distances and pairwise TMRCAs
pub mod kc;

/// Experiment registry, setup and inference
pub mod experiments;
