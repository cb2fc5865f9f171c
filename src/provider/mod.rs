/// Pluggable external providers: embedding and summarization. Both follow
/// the strategy-enum design note from spec §9 rather than a trait object
/// registry, since the set of providers is small and fixed at compile time.
pub mod embedding;
pub mod summarizer;
